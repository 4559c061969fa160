//! Mails and their envelopes.
//!
//! A mail travels inside a packet: the [`PacketHeader`] addresses the machine,
//! the [`MailHeader`] addresses the mailbox on that machine. On the wire the
//! mail header is encoded in front of the payload, so to the network device the
//! pair simply looks like data.

mod header;
pub use header::*;

mod model;
pub use model::*;
