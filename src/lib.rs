//! Postal library.
//!
//! Mailbox-addressed message delivery between machines over a lossy network, with
//! an optional reliable transport that fragments, retransmits and acknowledges.

mod config;
pub use config::{CliArgs, PostOfficeConfig, DEFAULT_NUM_BOXES, MAX_REEMISSIONS, TEMPO};

mod errors;
pub use errors::PostError;

pub mod mail;

mod mailbox;
pub use mailbox::Mailbox;

pub mod network;

mod postoffice;
pub use postoffice::*;

mod token;
pub use token::{generate_token, MessageIdGenerator};

#[cfg(feature = "example")]
pub mod example;

#[cfg(test)]
mod _tests;
