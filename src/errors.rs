//! Error types.
//!

use thiserror::Error;

use crate::mail::{MachineAddress, MailboxId, MessageId};

#[derive(Error, Debug)]
pub enum PostError {
    #[error("Mailbox {id} is out of range, this post office has {num_boxes} mailboxes.")]
    MailboxOutOfRange { id: MailboxId, num_boxes: u16 },
    #[error("Mail of {length} bytes exceeds the maximum mail size of {max} bytes.")]
    MailTooLarge { length: usize, max: usize },
    #[error("Mail header declares {declared} bytes but {actual} bytes were supplied.")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    #[error("Fragment out of sequence: {0}")]
    FragmentOutOfSequence(String),
    #[error("Message of {length} bytes needs {pieces} fragments, at most {max} are allowed.")]
    TooManyFragments {
        length: usize,
        pieces: usize,
        max: usize,
    },
    #[error(
        "Message {message_id} fragment with {remaining_parts} remaining parts was not \
        acknowledged after {attempts} attempts."
    )]
    RetriesExhausted {
        message_id: MessageId,
        remaining_parts: u16,
        attempts: u32,
    },
    #[error("Network device of machine {0} is still transmitting another packet.")]
    DeviceBusy(MachineAddress),
    #[error("Packet of {length} bytes exceeds the maximum packet size of {max} bytes.")]
    PacketTooLarge { length: usize, max: usize },
    #[error("Machine {0} is already attached to the network.")]
    DuplicateAddress(MachineAddress),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Post office has terminated: {0}")]
    Terminated(String),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PostError {
    /// Whether this error indicates a corrupted or malformed mail, or a caller
    /// addressing a mailbox that does not exist.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::MailboxOutOfRange { .. }
                | Self::MailTooLarge { .. }
                | Self::LengthMismatch { .. }
                | Self::MalformedPacket(_)
                | Self::FragmentOutOfSequence(_)
                | Self::TooManyFragments { .. }
        )
    }

    /// Whether this error means a reliable send ran out of retransmissions.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}
