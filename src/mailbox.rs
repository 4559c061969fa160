//! A blocking FIFO of received mails, one per mailbox id.
//!

use deadqueue::unlimited::Queue;

use crate::mail::Mail;

/// A single mailbox within a post office.
///
/// The delivery dispatcher is the only producer; any number of tasks may be
/// waiting on [`Self::get`] at the same time. Each [`Self::put`] wakes at most
/// one of them, and mails come out in exactly the order they went in.
pub struct Mailbox {
    queue: Queue<Mail>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    /// Create a new, empty mailbox.
    pub fn new() -> Self {
        Self {
            queue: Queue::new(),
        }
    }

    /// Append a mail to the end of the mailbox, waking one waiting receiver.
    pub fn put(&self, mail: Mail) {
        logger::trace!(
            "Putting mail from ({}, {}) into mailbox {}.",
            mail.packet.from,
            mail.header.from,
            mail.header.to
        );
        self.queue.push(mail);
    }

    /// Take the mail at the head of the mailbox.
    ///
    /// If the mailbox is empty, this waits until a mail is put into it.
    pub async fn get(&self) -> Mail {
        self.queue.pop().await
    }

    /// Take the mail at the head of the mailbox, if there is one.
    pub fn try_get(&self) -> Option<Mail> {
        self.queue.try_pop()
    }

    /// Number of mails currently waiting.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the mailbox is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mail::{MailHeader, PacketHeader};
    use std::sync::Arc;

    fn mail(index: u8) -> Mail {
        Mail::new(PacketHeader::to(0), MailHeader::new(2, 5, 1), vec![index])
            .expect("Failed to build mail.")
    }

    #[tokio::test]
    async fn first_in_first_out() {
        let mailbox = Mailbox::new();

        for index in 0..10 {
            mailbox.put(mail(index));
        }
        assert_eq!(mailbox.len(), 10);

        for index in 0..10 {
            assert_eq!(mailbox.get().await.payload, vec![index]);
        }
        assert!(mailbox.is_empty());
        assert!(mailbox.try_get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn get_waits_for_put() {
        let mailbox = Arc::new(Mailbox::new());

        let receiver = tokio::spawn({
            let mailbox = Arc::clone(&mailbox);
            async move { mailbox.get().await }
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(!receiver.is_finished());

        mailbox.put(mail(42));

        let received = tokio::time::timeout(tokio::time::Duration::from_secs(1), receiver)
            .await
            .expect("Receiver was not woken up by the put.")
            .expect("Receiver task panicked.");
        assert_eq!(received.payload, vec![42]);
        assert!(mailbox.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn each_put_wakes_one_receiver() {
        let mailbox = Arc::new(Mailbox::new());

        let receivers = (0..4)
            .map(|_| {
                let mailbox = Arc::clone(&mailbox);
                tokio::spawn(async move { mailbox.get().await.payload[0] })
            })
            .collect::<Vec<_>>();

        for index in 0..4 {
            mailbox.put(mail(index));
        }

        let mut received = futures::future::join_all(receivers)
            .await
            .into_iter()
            .map(|result| result.expect("Receiver task panicked."))
            .collect::<Vec<_>>();
        received.sort();

        assert_eq!(received, vec![0, 1, 2, 3]);
        assert!(mailbox.is_empty());
    }
}
