//! Bookkeeping for reliable mails that have been sent but not yet acknowledged.
//!

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::{
    mail::{FragmentKey, MachineAddress, Mail, MessageId},
    PostError,
};

/// Where a pending fragment is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingState {
    /// Registered, never transmitted.
    Queued,

    /// Transmitted at least once, waiting for the acknowledgement.
    Sent,
}

/// A fragment waiting for its acknowledgement.
#[derive(Debug)]
pub struct PendingMail {
    pub mail: Mail,

    /// Number of times the fragment has been transmitted.
    pub attempts: u32,

    pub state: PendingState,

    /// Fired once when the acknowledgement arrives.
    acked: Arc<Notify>,
}

/// The pending-outgoing list of a post office.
///
/// Entries are keyed by [`FragmentKey`], so acknowledgements for unrelated
/// messages, even from the same mailbox, never retire each other's fragments.
/// The lock is never held across an `.await`.
#[derive(Debug, Default)]
pub struct PendingSendTracker {
    entries: Mutex<FxHashMap<FragmentKey, PendingMail>>,

    /// Fired whenever the tracker becomes empty.
    idle: Notify,
}

impl PendingSendTracker {
    /// Create a new, empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, FxHashMap<FragmentKey, PendingMail>> {
        self.entries.lock().unwrap_or_else(|poison| {
            logger::warn!("Poisoned pending list recovered, some attempt counts may be stale.");
            poison.into_inner()
        })
    }

    /// Register the fragments of one message, none of them transmitted yet.
    pub fn register(&self, fragments: Vec<Mail>) {
        let mut entries = self.entries();

        for mail in fragments {
            let key = mail.header.fragment_key();
            logger::trace!("Registering pending fragment {:?}.", key);

            if entries
                .insert(
                    key,
                    PendingMail {
                        mail,
                        attempts: 0,
                        state: PendingState::Queued,
                        acked: Arc::new(Notify::new()),
                    },
                )
                .is_some()
            {
                logger::warn!("Fragment {:?} was already pending, replaced.", key);
            }
        }
    }

    /// Claim the next transmission of a pending fragment.
    ///
    /// Returns the mail to transmit, and a [`Notify`] that fires when the fragment
    /// is acknowledged. Returns [`None`] if the fragment is no longer pending,
    /// meaning it has been acknowledged already.
    ///
    /// At most `max_attempts` transmissions are handed out; asking for one more
    /// is a [`PostError::RetriesExhausted`].
    pub fn next_attempt(
        &self,
        key: FragmentKey,
        max_attempts: u32,
    ) -> Result<Option<(Mail, Arc<Notify>)>, PostError> {
        let mut entries = self.entries();

        let Some(entry) = entries.get_mut(&key) else {
            return Ok(None);
        };

        if entry.attempts >= max_attempts {
            return Err(PostError::RetriesExhausted {
                message_id: key.0,
                remaining_parts: key.1,
                attempts: entry.attempts,
            });
        }

        entry.attempts += 1;
        entry.state = PendingState::Sent;

        Ok(Some((entry.mail.clone(), Arc::clone(&entry.acked))))
    }

    /// Retire the fragment an acknowledgement from machine `from` refers to.
    ///
    /// Returns `false` if nothing was pending under that key, which happens for
    /// duplicate acknowledgements, or if the fragment was sent to another machine.
    pub fn ack_received(&self, key: FragmentKey, from: MachineAddress) -> bool {
        let mut entries = self.entries();

        if let Some(entry) = entries.get(&key).filter(|entry| entry.mail.packet.to != from) {
            logger::warn!(
                "Machine {} acknowledged fragment {:?}, which was sent to machine {}.",
                from,
                key,
                entry.mail.packet.to
            );
            return false;
        }

        match entries.remove(&key) {
            Some(entry) => {
                logger::debug!(
                    "Fragment {:?} acknowledged after {} attempts.",
                    key,
                    entry.attempts
                );
                // `notify_one` keeps a permit, in case the sender is not waiting yet.
                entry.acked.notify_one();

                if entries.is_empty() {
                    self.idle.notify_waiters();
                }
                true
            }
            None => false,
        }
    }

    /// Drop every fragment of a message, returning how many were still pending.
    pub fn cancel(&self, message_id: MessageId) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(id, _), _| *id != message_id);
        let removed = before - entries.len();

        if removed > 0 && entries.is_empty() {
            self.idle.notify_waiters();
        }
        removed
    }

    /// Check if the fragment is still waiting for its acknowledgement.
    pub fn is_pending(&self, key: &FragmentKey) -> bool {
        self.entries().contains_key(key)
    }

    /// Number of transmissions of a pending fragment so far.
    pub fn attempts(&self, key: &FragmentKey) -> Option<u32> {
        self.entries().get(key).map(|entry| entry.attempts)
    }

    /// State of a pending fragment.
    pub fn state(&self, key: &FragmentKey) -> Option<PendingState> {
        self.entries().get(key).map(|entry| entry.state)
    }

    /// Number of fragments waiting for acknowledgements.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Check if nothing is waiting for acknowledgement.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until nothing is waiting for acknowledgement.
    pub async fn wait_idle(&self) {
        loop {
            // Created before the check, so an emptying in between is not missed.
            let notified = self.idle.notified();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mail::{MailHeader, PacketHeader};

    fn fragments(message_id: MessageId, size: usize) -> Vec<Mail> {
        Mail::fragments(
            PacketHeader::to(1),
            MailHeader::new(1, 3, 0),
            &vec![0_u8; size],
            message_id,
        )
        .expect("Failed to fragment.")
    }

    #[test]
    fn attempt_ceiling() {
        let tracker = PendingSendTracker::new();
        tracker.register(fragments(5, 10));

        let key = (5, 0);
        assert_eq!(tracker.state(&key), Some(PendingState::Queued));

        for attempt in 1..=3 {
            assert!(tracker.next_attempt(key, 3).unwrap().is_some());
            assert_eq!(tracker.attempts(&key), Some(attempt));
            assert_eq!(tracker.state(&key), Some(PendingState::Sent));
        }

        assert!(matches!(
            tracker.next_attempt(key, 3),
            Err(PostError::RetriesExhausted {
                message_id: 5,
                remaining_parts: 0,
                attempts: 3
            })
        ));
    }

    #[test]
    fn ack_retires_only_its_fragment() {
        let tracker = PendingSendTracker::new();
        tracker.register(fragments(1, 10));
        tracker.register(fragments(2, 10));

        assert!(tracker.ack_received((2, 0), 1));
        assert!(!tracker.ack_received((2, 0), 1));
        assert!(tracker.is_pending(&(1, 0)));
        assert!(!tracker.is_pending(&(2, 0)));

        assert!(tracker.next_attempt((2, 0), 3).unwrap().is_none());
    }

    #[test]
    fn ack_from_another_machine_is_ignored() {
        let tracker = PendingSendTracker::new();
        tracker.register(fragments(3, 10));

        assert!(!tracker.ack_received((3, 0), 2));
        assert!(tracker.is_pending(&(3, 0)));

        assert!(tracker.ack_received((3, 0), 1));
        assert!(tracker.is_empty());
    }

    #[test]
    fn cancel_removes_whole_message() {
        let tracker = PendingSendTracker::new();
        tracker.register(fragments(1, 3000));
        tracker.register(fragments(2, 10));
        assert_eq!(tracker.len(), 4);

        assert_eq!(tracker.cancel(1), 3);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.cancel(1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_before_wait_is_kept() {
        let tracker = PendingSendTracker::new();
        tracker.register(fragments(1, 10));

        let (_mail, acked) = tracker.next_attempt((1, 0), 3).unwrap().unwrap();
        tracker.ack_received((1, 0), 1);

        tokio::time::timeout(tokio::time::Duration::from_millis(10), acked.notified())
            .await
            .expect("Acknowledgement received before waiting was lost.");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_resolves_when_empty() {
        let tracker = Arc::new(PendingSendTracker::new());
        tracker.register(fragments(1, 3000));

        let waiter = tokio::spawn({
            let tracker = Arc::clone(&tracker);
            async move { tracker.wait_idle().await }
        });

        for remaining_parts in [2, 1] {
            tracker.ack_received((1, remaining_parts), 1);
            tokio::task::yield_now().await;
            assert!(!waiter.is_finished());
        }

        tracker.ack_received((1, 0), 1);
        tokio::time::timeout(tokio::time::Duration::from_millis(10), waiter)
            .await
            .expect("Waiter was not released when the tracker emptied.")
            .expect("Waiter task panicked.");
    }
}
