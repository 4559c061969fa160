//! Generation of message identifiers for reliable sends.
//!

use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::mail::MessageId;

/// Hands out [`MessageId`]s for one post office.
///
/// The counter starts at a random point, so a machine that comes back up does
/// not immediately reuse the identifiers its previous incarnation handed out.
/// `0` is reserved for plain, unreliable mails and is never returned.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: AtomicU32,
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdGenerator {
    /// Create a generator starting at a random identifier.
    pub fn new() -> Self {
        Self::starting_at(generate_token())
    }

    /// Create a generator starting at a given identifier.
    pub fn starting_at(start: MessageId) -> Self {
        Self {
            next: AtomicU32::new(start),
        }
    }

    /// Get the next identifier.
    pub fn next_id(&self) -> MessageId {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

/// Generate a random, non-zero message token.
pub fn generate_token() -> MessageId {
    rand::thread_rng().gen_range(1..MessageId::MAX)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identifiers_are_sequential() {
        let generator = MessageIdGenerator::starting_at(7);
        assert_eq!(
            (0..3).map(|_| generator.next_id()).collect::<Vec<_>>(),
            vec![7, 8, 9]
        );
    }

    #[test]
    fn zero_is_skipped() {
        let generator = MessageIdGenerator::starting_at(MessageId::MAX);
        assert_eq!(generator.next_id(), MessageId::MAX);
        assert_eq!(generator.next_id(), 1);
    }

    #[test]
    fn random_start_is_not_zero() {
        assert!((0..100).all(|_| generate_token() != 0));
    }
}
