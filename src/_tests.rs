//! Shared testing helpers.
//!
//! Simulated machines for the unit tests of the whole [`postal`](crate) library.

use std::sync::Arc;

use crate::{
    network::{NetworkDevice, SimulatedDevice, SimulatedNetwork},
    PostOffice, PostOfficeConfig,
};

/// The seed of every test network, so that losses are reproducible.
pub const SEED: u64 = 42;

/// A network that never loses a packet.
pub fn quiet_network() -> Arc<SimulatedNetwork> {
    network(1.0)
}

/// A seeded network with the given reliability.
pub fn network(reliability: f64) -> Arc<SimulatedNetwork> {
    Arc::new(
        SimulatedNetwork::new(reliability)
            .expect("Failed to create network.")
            .with_seed(SEED),
    )
}

/// Machines `0..count` on one network, each with its device and post office.
///
/// `configure` adjusts the default configuration of every machine.
pub fn machines_with(
    count: u32,
    reliability: f64,
    configure: impl Fn(PostOfficeConfig) -> PostOfficeConfig,
) -> (
    Arc<SimulatedNetwork>,
    Vec<Arc<SimulatedDevice>>,
    Vec<Arc<PostOffice>>,
) {
    let network = network(reliability);

    let (devices, offices) = (0..count)
        .map(|address| {
            let device = network.attach(address).expect("Failed to attach device.");
            let office = PostOffice::new(
                Arc::clone(&device) as Arc<dyn NetworkDevice>,
                configure(PostOfficeConfig::new(address)),
            )
            .expect("Failed to open post office.");

            (device, office)
        })
        .unzip();

    (network, devices, offices)
}

/// Machines `0..count` on one network with the default configuration.
pub fn machines(count: u32, reliability: f64) -> (Arc<SimulatedNetwork>, Vec<Arc<PostOffice>>) {
    let (network, _devices, offices) = machines_with(count, reliability, |config| config);
    (network, offices)
}

/// A payload of `size` bytes that is not the same byte repeated.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|index| (index % 251) as u8).collect()
}
