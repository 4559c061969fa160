//! Configuration of a post office, and the CLI arguments that build one.
//!
use crate::{
    mail::{MachineAddress, ACK_MAILBOX},
    PostError,
};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Default number of mailboxes in a post office.
pub const DEFAULT_NUM_BOXES: u16 = 10;

/// Default number of transmissions of one fragment before a reliable send gives up.
pub const MAX_REEMISSIONS: u32 = 5;

/// Default time to wait for an acknowledgement before retransmitting.
pub const TEMPO: tokio::time::Duration = tokio::time::Duration::from_millis(100);

/// How a single post office is set up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostOfficeConfig {
    /// The network address of this machine.
    pub address: MachineAddress,

    /// Number of mailboxes, ids run from `0` to `num_boxes - 1`.
    pub num_boxes: u16,

    /// Time to wait for an acknowledgement before retransmitting a fragment.
    pub tempo: tokio::time::Duration,

    /// Maximum number of transmissions of any one fragment.
    pub max_reemissions: u32,
}

impl PostOfficeConfig {
    /// Create the default configuration for the given machine.
    pub fn new(address: MachineAddress) -> Self {
        Self {
            address,
            num_boxes: DEFAULT_NUM_BOXES,
            tempo: TEMPO,
            max_reemissions: MAX_REEMISSIONS,
        }
    }

    /// Sets the number of mailboxes.
    pub fn with_num_boxes(mut self, num_boxes: u16) -> Self {
        self.num_boxes = num_boxes;
        self
    }

    /// Sets the retransmission delay.
    pub fn with_tempo(mut self, tempo: tokio::time::Duration) -> Self {
        self.tempo = tempo;
        self
    }

    /// Sets the maximum number of transmissions of one fragment.
    pub fn with_max_reemissions(mut self, max_reemissions: u32) -> Self {
        self.max_reemissions = max_reemissions;
        self
    }

    /// Check the configuration can run the reliable protocol.
    pub fn validate(&self) -> Result<(), PostError> {
        if self.num_boxes <= ACK_MAILBOX {
            return Err(PostError::InvalidConfig(format!(
                "At least {} mailboxes are needed to hold the acknowledgement mailbox, got {}.",
                ACK_MAILBOX + 1,
                self.num_boxes
            )));
        }

        if self.tempo.is_zero() {
            return Err(PostError::InvalidConfig(
                "Retransmission delay must not be zero.".to_owned(),
            ));
        }

        if self.max_reemissions == 0 {
            return Err(PostError::InvalidConfig(
                "At least one transmission must be allowed.".to_owned(),
            ));
        }

        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
pub struct CliArgs {
    /// Probability that a packet gets through the network.
    #[clap(short, long, default_value_t = 0.8)]
    pub reliability: f64,
    /// Seed for the network's loss model.
    #[clap(long)]
    pub seed: Option<u64>,
    #[clap(long, default_value_t = DEFAULT_NUM_BOXES)]
    pub num_boxes: u16,
    /// Retransmission delay in milliseconds.
    #[clap(long, default_value_t = 100)]
    pub tempo_ms: u64,
    #[clap(long, default_value_t = MAX_REEMISSIONS)]
    pub max_reemissions: u32,
    /// Size of the message to transfer, in bytes.
    #[clap(short, long, default_value_t = 3000)]
    pub size: usize,
    /// Destination mailbox on the receiving machine.
    #[clap(long, default_value_t = 2)]
    pub mailbox: u16,
}

impl CliArgs {
    /// Return the [`PostOfficeConfig`] for the machine at `address`.
    pub fn post_office_config(&self, address: MachineAddress) -> PostOfficeConfig {
        PostOfficeConfig::new(address)
            .with_num_boxes(self.num_boxes)
            .with_tempo(tokio::time::Duration::from_millis(self.tempo_ms))
            .with_max_reemissions(self.max_reemissions)
    }
}
