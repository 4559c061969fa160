//! Envelopes for packets and mails, and the wire framing of a mail header.
//!

use serde::{Deserialize, Serialize};

use crate::PostError;

/// Identifies a machine on the network.
pub type MachineAddress = u32;

/// Identifies a mailbox within one post office, in `[0, num_boxes)`.
pub type MailboxId = u16;

/// Identifies one logical reliable message within the sending post office.
pub type MessageId = u32;

/// Identifies one fragment of a logical message: the message and the number of
/// fragments that follow it.
pub type FragmentKey = (MessageId, u16);

/// Size of an encoded [`MailHeader`] on the wire.
pub const MAIL_HEADER_SIZE: usize = 16;

/// The largest payload a single mail can carry.
pub const MAX_MAIL_SIZE: usize = 1024;

/// The largest packet the network device accepts.
pub const MAX_PACKET_SIZE: usize = MAX_MAIL_SIZE + MAIL_HEADER_SIZE;

/// Payload bytes carried by each fragment of a reliable message.
pub const FRAGMENT_SIZE: usize = MAX_MAIL_SIZE - 1;

/// Upper bound on the number of fragments of one logical message.
pub const MAX_FRAGMENTS: usize = 4096;

/// The conventional mailbox that reliable senders send from, and therefore the
/// mailbox acknowledgements are addressed to.
pub const ACK_MAILBOX: MailboxId = 1;

/// Body of every acknowledgement mail.
pub const ACK_PAYLOAD: &[u8] = b"Got it!";

/// Machine level envelope, owned by the network layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketHeader {
    pub from: MachineAddress,
    pub to: MachineAddress,

    /// Size of the packet payload, which is the encoded [`MailHeader`] followed by
    /// the mail payload.
    pub length: usize,
}

impl PacketHeader {
    /// Create a header addressed to `to`.
    ///
    /// `from` and `length` are filled in by the post office on send.
    pub fn to(to: MachineAddress) -> Self {
        Self {
            from: 0,
            to,
            length: 0,
        }
    }

    /// The header for a packet travelling back to the sender of this one.
    pub fn reply(&self) -> Self {
        Self {
            from: self.to,
            to: self.from,
            length: 0,
        }
    }
}

/// Whether a mail carries application data or acknowledges a fragment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MailKind {
    #[default]
    Data = 0,
    Ack = 1,
}

impl TryFrom<u8> for MailKind {
    type Error = PostError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Ack),
            _ => Err(PostError::MalformedPacket(format!(
                "Unknown mail kind {value}."
            ))),
        }
    }
}

/// Application level envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailHeader {
    pub from: MailboxId,
    pub to: MailboxId,

    /// Size of the mail payload, at most [`MAX_MAIL_SIZE`].
    pub length: u16,

    /// How many fragments of the same message follow this one; `0` for the last
    /// or only fragment.
    pub remaining_parts: u16,

    /// The logical message this mail belongs to. Plain sends leave this at `0`.
    pub message_id: MessageId,

    pub kind: MailKind,
}

impl MailHeader {
    /// Create a data header for a single mail of `length` bytes.
    pub fn new(from: MailboxId, to: MailboxId, length: u16) -> Self {
        Self {
            from,
            to,
            length,
            ..Default::default()
        }
    }

    /// The acknowledgement for the fragment carried under this header.
    ///
    /// Source and destination are swapped, and the fragment key is kept so the
    /// sender can retire the matching pending entry.
    pub fn ack(&self) -> Self {
        Self {
            from: self.to,
            to: self.from,
            length: ACK_PAYLOAD.len() as u16,
            remaining_parts: self.remaining_parts,
            message_id: self.message_id,
            kind: MailKind::Ack,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind == MailKind::Ack
    }

    /// The fragment this header belongs to.
    pub fn fragment_key(&self) -> FragmentKey {
        (self.message_id, self.remaining_parts)
    }

    /// Payload length as a [`usize`].
    pub fn len(&self) -> usize {
        usize::from(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Encode the header into its fixed little-endian wire layout.
    pub fn encode(&self) -> [u8; MAIL_HEADER_SIZE] {
        let mut bytes = [0_u8; MAIL_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.from.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.to.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.remaining_parts.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.message_id.to_le_bytes());
        bytes[12] = self.kind as u8;
        bytes
    }

    /// Decode a header from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, PostError> {
        if bytes.len() < MAIL_HEADER_SIZE {
            return Err(PostError::MalformedPacket(format!(
                "{} bytes is too short for a mail header of {MAIL_HEADER_SIZE} bytes.",
                bytes.len()
            )));
        }

        let u16_at = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);

        Ok(Self {
            from: u16_at(0),
            to: u16_at(2),
            length: u16_at(4),
            remaining_parts: u16_at(6),
            message_id: MessageId::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            kind: MailKind::try_from(bytes[12])?,
        })
    }
}

/// Frame a mail for the network: the encoded header followed by the payload.
pub fn encode_packet(header: &MailHeader, payload: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(MAIL_HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.encode());
    buffer.extend_from_slice(payload);
    buffer
}

/// Split a packet payload back into its mail header and mail payload.
///
/// The payload size must agree with the header's declared length, and may not
/// exceed [`MAX_MAIL_SIZE`].
pub fn decode_packet(bytes: &[u8]) -> Result<(MailHeader, Vec<u8>), PostError> {
    let header = MailHeader::decode(bytes)?;
    let payload = &bytes[MAIL_HEADER_SIZE..];

    if header.len() > MAX_MAIL_SIZE {
        return Err(PostError::MailTooLarge {
            length: header.len(),
            max: MAX_MAIL_SIZE,
        });
    }

    if payload.len() != header.len() {
        return Err(PostError::LengthMismatch {
            declared: header.len(),
            actual: payload.len(),
        });
    }

    Ok((header, payload.to_vec()))
}
