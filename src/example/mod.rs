//! Structs and data classes that are only useful in the `postal` demonstration.
//!
use serde::{Deserialize, Serialize};

use crate::{mail::MachineAddress, network::DeviceStats, PostOfficeConfig};

/// What one machine saw during the transfer.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MachineReport {
    pub address: MachineAddress,
    pub stats: DeviceStats,
    pub violations: usize,
}

/// The outcome of one reliable transfer between two machines.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransferReport {
    pub success: bool,
    pub reliability: f64,
    pub config: PostOfficeConfig,
    pub bytes_sent: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragments: Option<usize>,
    pub elapsed_ms: u128,
    pub machines: Vec<MachineReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
