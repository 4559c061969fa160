//! Reliable delivery on top of the lossy send path.
//!
//! A reliable message is split into fragments of at most [`FRAGMENT_SIZE`]
//! bytes. The sender transmits them one at a time, waiting up to the configured
//! tempo for each acknowledgement and retransmitting otherwise; the receiver
//! acknowledges every fragment it takes out of the mailbox and glues the
//! payloads back together.

use fxhash::FxHashMap;
use std::{
    cmp::Ordering,
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use super::PostOffice;
use crate::{
    mail::{
        FragmentKey, MachineAddress, Mail, MailHeader, MailboxId, MessageId, PacketHeader,
        ReassembledMessage, ACK_PAYLOAD, FRAGMENT_SIZE, MAX_FRAGMENTS,
    },
    PostError,
};

/// How many fully received messages are remembered for duplicate detection.
pub const RECENTLY_COMPLETED: usize = 64;

/// How many messages may be partly reassembled at the same time.
pub const IN_PROGRESS_LIMIT: usize = 64;

/// A message as seen by the receiver: the mailbox it arrives in, the machine
/// that sent it, and its identifier on that machine.
type ReassemblyKey = (MailboxId, MachineAddress, MessageId);

/// A message of which some, but not all, fragments have arrived.
#[derive(Debug)]
struct PartialMessage {
    body: Vec<u8>,
    fragments: usize,

    /// `remaining_parts` of the next fragment to accept.
    expected: u16,

    /// Evictions go oldest first.
    started: u64,
}

/// What became of a fragment handed to [`Reassemblies::accept`].
#[derive(Debug, PartialEq, Eq)]
enum Progress {
    /// Already accepted before; acknowledge again, keep nothing.
    Duplicate,
    Incomplete,
    Complete { body: Vec<u8>, fragments: usize },
}

#[derive(Debug, Default)]
struct ReassemblyState {
    partial: FxHashMap<ReassemblyKey, PartialMessage>,
    completed: VecDeque<ReassemblyKey>,
    abandoned: VecDeque<ReassemblyKey>,
    next_start: u64,
}

/// Push onto a queue holding at most `limit` keys, forgetting the oldest.
fn remember(queue: &mut VecDeque<ReassemblyKey>, key: ReassemblyKey, limit: usize) {
    if queue.len() == limit {
        queue.pop_front();
    }
    queue.push_back(key);
}

impl ReassemblyState {
    /// Begin a message with the first fragment seen of it.
    fn start(&mut self, key: ReassemblyKey, mail: &Mail) -> Result<Progress, PostError> {
        let remaining = mail.header.remaining_parts;

        if usize::from(remaining) >= MAX_FRAGMENTS {
            return Err(PostError::TooManyFragments {
                length: (usize::from(remaining) + 1) * FRAGMENT_SIZE,
                pieces: usize::from(remaining) + 1,
                max: MAX_FRAGMENTS,
            });
        }

        if remaining == 0 {
            self.complete(key);
            return Ok(Progress::Complete {
                body: mail.payload.clone(),
                fragments: 1,
            });
        }

        if self.partial.len() >= IN_PROGRESS_LIMIT {
            self.evict_oldest();
        }

        self.partial.insert(
            key,
            PartialMessage {
                body: mail.payload.clone(),
                fragments: 1,
                expected: remaining - 1,
                started: self.next_start,
            },
        );
        self.next_start += 1;

        Ok(Progress::Incomplete)
    }

    fn complete(&mut self, key: ReassemblyKey) {
        // Plain traffic has no identity to remember.
        if key.2 != 0 {
            remember(&mut self.completed, key, RECENTLY_COMPLETED);
        }
    }

    fn evict_oldest(&mut self) {
        let Some(oldest) = self
            .partial
            .iter()
            .min_by_key(|(_, partial)| partial.started)
            .map(|(key, _)| *key)
        else {
            return;
        };

        if let Some(partial) = self.partial.remove(&oldest) {
            logger::warn!(
                "Abandoning message {} from machine {} in mailbox {} after {} fragments, \
                too many messages are incomplete.",
                oldest.2,
                oldest.1,
                oldest.0,
                partial.fragments
            );
        }
        remember(&mut self.abandoned, oldest, RECENTLY_COMPLETED);
    }
}

/// The messages a post office is reassembling, kept across calls to
/// [`PostOffice::reliable_receive`].
///
/// Fragments of different messages may arrive interleaved in the same mailbox;
/// each message is glued together on its own. A message evicted to make room
/// for newer ones is remembered as abandoned, and its later fragments are
/// refused, so a tail is never mistaken for a whole message.
#[derive(Debug, Default)]
pub(crate) struct Reassemblies {
    state: Mutex<ReassemblyState>,
}

impl Reassemblies {
    fn state(&self) -> MutexGuard<'_, ReassemblyState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Take a fragment taken out of mailbox `id` into its message.
    fn accept(&self, id: MailboxId, mail: &Mail) -> Result<Progress, PostError> {
        let key = (id, mail.packet.from, mail.header.message_id);
        let remaining = mail.header.remaining_parts;
        let mut guard = self.state();
        let state = &mut *guard;

        if state.completed.contains(&key) {
            return Ok(Progress::Duplicate);
        }

        if state.abandoned.contains(&key) {
            return Err(PostError::FragmentOutOfSequence(format!(
                "Message {} from machine {} was abandoned before this fragment arrived.",
                key.2, key.1
            )));
        }

        let Some(mut partial) = state.partial.remove(&key) else {
            return state.start(key, mail);
        };

        match remaining.cmp(&partial.expected) {
            Ordering::Greater => {
                state.partial.insert(key, partial);
                Ok(Progress::Duplicate)
            }
            Ordering::Less => {
                let expected = partial.expected;
                state.partial.insert(key, partial);
                Err(PostError::FragmentOutOfSequence(format!(
                    "Message {} from machine {} skipped from {} to {} remaining parts.",
                    key.2, key.1, expected, remaining
                )))
            }
            Ordering::Equal => {
                partial.body.extend_from_slice(&mail.payload);
                partial.fragments += 1;

                if remaining == 0 {
                    state.complete(key);
                    Ok(Progress::Complete {
                        body: partial.body,
                        fragments: partial.fragments,
                    })
                } else {
                    partial.expected = remaining - 1;
                    state.partial.insert(key, partial);
                    Ok(Progress::Incomplete)
                }
            }
        }
    }

    /// Number of messages partly reassembled.
    #[cfg(test)]
    fn in_progress(&self) -> usize {
        self.state().partial.len()
    }
}

impl PostOffice {
    /// Send a message of any size, retransmitting until every fragment has been
    /// acknowledged.
    ///
    /// `header.length` is ignored; each fragment's length is set from `data`.
    /// Fragments are sent in order, each one only after the previous one was
    /// acknowledged. A fragment is transmitted at most
    /// [`PostOfficeConfig::max_reemissions`] times; if it is still not
    /// acknowledged after that, the rest of the message is abandoned and
    /// [`PostError::RetriesExhausted`] is returned.
    ///
    /// [`PostOfficeConfig::max_reemissions`]: crate::PostOfficeConfig::max_reemissions
    pub async fn reliable_send(
        &self,
        packet: PacketHeader,
        header: MailHeader,
        data: &[u8],
    ) -> Result<(), PostError> {
        self.check_mailbox(header.to)?;
        self.check_mailbox(header.from)?;

        let message_id = self.message_ids.next_id();
        let fragments = Mail::fragments(packet, header, data, message_id)?;
        let keys: Vec<FragmentKey> = fragments
            .iter()
            .map(|mail| mail.header.fragment_key())
            .collect();

        logger::debug!(
            "Reliably sending message {} of {} bytes in {} fragments to ({}, {}).",
            message_id,
            data.len(),
            keys.len(),
            packet.to,
            header.to
        );
        self.pending.register(fragments);

        let result = async {
            for key in keys {
                self.transmit_until_acked(key).await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = &result {
            let abandoned = self.pending.cancel(message_id);
            logger::warn!(
                "Abandoning message {} with {} fragments unacknowledged: {}",
                message_id,
                abandoned,
                err
            );
        }

        result
    }

    /// Transmit one pending fragment until its acknowledgement arrives.
    async fn transmit_until_acked(&self, key: FragmentKey) -> Result<(), PostError> {
        loop {
            let Some((mail, acked)) = self
                .pending
                .next_attempt(key, self.config.max_reemissions)?
            else {
                // Acknowledged while we were not looking.
                return Ok(());
            };

            self.send(mail.packet, mail.header, &mail.payload).await?;

            match tokio::time::timeout(self.config.tempo, acked.notified()).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    logger::debug!(
                        "No acknowledgement for fragment {:?} after {:?}, trying again.",
                        key,
                        self.config.tempo
                    );
                }
            }
        }
    }

    /// Receive one complete message from a mailbox, acknowledging every fragment.
    ///
    /// Returns whichever message arriving in the mailbox is completed first.
    /// Fragments of other messages taken out along the way are kept, and picked up
    /// again by later calls. Retransmitted fragments are acknowledged again but
    /// only kept once.
    ///
    /// A fragment that skips ahead in its message, belongs to an abandoned
    /// message, or announces more than [`MAX_FRAGMENTS`] parts is discarded
    /// without acknowledgement, and returned as an error.
    pub async fn reliable_receive(&self, id: MailboxId) -> Result<ReassembledMessage, PostError> {
        self.check_mailbox(id)?;

        loop {
            let mail = self.receive(id).await?;

            match self.reassemblies.accept(id, &mail)? {
                Progress::Duplicate => {
                    logger::debug!(
                        "Duplicate fragment {:?} from machine {}, acknowledging again.",
                        mail.header.fragment_key(),
                        mail.packet.from
                    );
                    self.acknowledge(&mail).await?;
                }
                Progress::Incomplete => self.acknowledge(&mail).await?,
                Progress::Complete { body, fragments } => {
                    // The message is whole; a lost acknowledgement only costs a
                    // retransmission, which is answered as a duplicate.
                    if let Err(err) = self.acknowledge(&mail).await {
                        logger::warn!(
                            "Failed to acknowledge the last fragment of message {}: {}",
                            mail.header.message_id,
                            err
                        );
                    }

                    logger::info!(
                        "Received message {} of {} bytes in {} fragments from machine {}.",
                        mail.header.message_id,
                        body.len(),
                        fragments,
                        mail.packet.from
                    );

                    return Ok(ReassembledMessage {
                        packet: mail.packet,
                        header: mail.header,
                        body,
                        fragments,
                    });
                }
            }
        }
    }

    /// Send the acknowledgement for a fragment back where it came from.
    async fn acknowledge(&self, mail: &Mail) -> Result<(), PostError> {
        self.send(mail.packet.reply(), mail.header.ack(), ACK_PAYLOAD)
            .await
    }
}
