//! The mail itself, and the splitting of large payloads into fragments.

use super::{
    MailHeader, MessageId, PacketHeader, FRAGMENT_SIZE, MAIL_HEADER_SIZE, MAX_FRAGMENTS,
    MAX_MAIL_SIZE,
};
use crate::PostError;

/// A single mail, either sitting in a mailbox or waiting in the pending list.
///
/// A mail is owned by exactly one container at a time; taking it out of a
/// mailbox hands ownership of the payload to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub packet: PacketHeader,
    pub header: MailHeader,
    pub payload: Vec<u8>,
}

impl Mail {
    /// Create a new mail, checking the payload against the header.
    pub fn new(
        packet: PacketHeader,
        header: MailHeader,
        payload: Vec<u8>,
    ) -> Result<Self, PostError> {
        if payload.len() > MAX_MAIL_SIZE {
            return Err(PostError::MailTooLarge {
                length: payload.len(),
                max: MAX_MAIL_SIZE,
            });
        }

        if payload.len() != header.len() {
            return Err(PostError::LengthMismatch {
                declared: header.len(),
                actual: payload.len(),
            });
        }

        Ok(Self {
            packet,
            header,
            payload,
        })
    }

    /// Split `data` into the fragments of one reliable message.
    ///
    /// Every fragment carries at most [`FRAGMENT_SIZE`] bytes and shares the given
    /// `message_id`; `remaining_parts` counts down to `0` on the last fragment.
    /// An empty payload still produces a single, empty fragment.
    pub fn fragments(
        packet: PacketHeader,
        header: MailHeader,
        data: &[u8],
        message_id: MessageId,
    ) -> Result<Vec<Self>, PostError> {
        let pieces = data.len().div_ceil(FRAGMENT_SIZE).max(1);

        if pieces > MAX_FRAGMENTS {
            return Err(PostError::TooManyFragments {
                length: data.len(),
                pieces,
                max: MAX_FRAGMENTS,
            });
        }

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(FRAGMENT_SIZE).collect()
        };

        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let header = MailHeader {
                    length: chunk.len() as u16,
                    remaining_parts: (pieces - 1 - index) as u16,
                    message_id,
                    ..header
                };
                let packet = PacketHeader {
                    length: MAIL_HEADER_SIZE + chunk.len(),
                    ..packet
                };

                Self::new(packet, header, chunk.to_vec())
            })
            .collect()
    }
}

/// A logical message rebuilt from all of its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    /// The packet header of the last fragment received.
    pub packet: PacketHeader,

    /// The mail header of the last fragment received.
    pub header: MailHeader,

    /// Every fragment's payload, in order.
    pub body: Vec<u8>,

    /// Number of distinct fragments the message arrived in.
    pub fragments: usize,
}
