//! An in-process network that connects simulated machines, losing packets at a
//! configurable rate.
//!

use fxhash::FxHashMap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use super::{NetworkDevice, NetworkHandler};
use crate::{
    mail::{MachineAddress, PacketHeader, MAX_PACKET_SIZE},
    PostError,
};

/// Time a packet spends on the wire before it arrives.
pub const DEFAULT_LATENCY: tokio::time::Duration = tokio::time::Duration::from_millis(1);

/// Counters kept by every [`SimulatedDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Packets accepted for transmission.
    pub submitted: usize,

    /// Transmitted packets that reached their destination.
    pub delivered: usize,

    /// Transmitted packets that were lost, including those for unknown machines.
    pub dropped: usize,

    /// Packets that arrived at this device.
    pub received: usize,

    /// Submissions rejected because another packet was still in transmission.
    pub overlapping: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    delivered: AtomicUsize,
    dropped: AtomicUsize,
    received: AtomicUsize,
    overlapping: AtomicUsize,
}

/// The medium shared by all the simulated machines.
///
/// `reliability` is the probability that a packet gets through: `1.0` never
/// loses anything, `0.0` never delivers anything.
pub struct SimulatedNetwork {
    devices: RwLock<FxHashMap<MachineAddress, Weak<SimulatedDevice>>>,
    reliability: f64,
    latency: tokio::time::Duration,
    rng: Mutex<StdRng>,
    forced_drops: AtomicUsize,
}

impl SimulatedNetwork {
    /// Create a new network with the given delivery probability.
    pub fn new(reliability: f64) -> Result<Self, PostError> {
        if !(0.0..=1.0).contains(&reliability) {
            return Err(PostError::InvalidConfig(format!(
                "Reliability must be between 0 and 1, got {reliability}."
            )));
        }

        Ok(Self {
            devices: RwLock::new(FxHashMap::default()),
            reliability,
            latency: DEFAULT_LATENCY,
            rng: Mutex::new(StdRng::from_entropy()),
            forced_drops: AtomicUsize::new(0),
        })
    }

    /// Seed the loss model, making the sequence of losses reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Sets the time a packet spends on the wire.
    pub fn with_latency(mut self, latency: tokio::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The configured delivery probability.
    pub fn reliability(&self) -> f64 {
        self.reliability
    }

    /// Connect a new machine to the network.
    pub fn attach(
        self: &Arc<Self>,
        address: MachineAddress,
    ) -> Result<Arc<SimulatedDevice>, PostError> {
        let mut devices = self
            .devices
            .write()
            .unwrap_or_else(|poison| poison.into_inner());

        if devices.get(&address).and_then(Weak::upgrade).is_some() {
            return Err(PostError::DuplicateAddress(address));
        }

        let device = Arc::new_cyclic(|this| SimulatedDevice {
            address,
            network: Arc::clone(self),
            this: this.clone(),
            handler: RwLock::new(None),
            inbox: Mutex::new(VecDeque::new()),
            in_flight: AtomicBool::new(false),
            counters: Counters::default(),
        });

        devices.insert(address, Arc::downgrade(&device));
        logger::debug!("Machine {} attached to the network.", address);

        Ok(device)
    }

    /// Lose the next `count` packets transmitted on this network, regardless of
    /// the reliability.
    pub fn drop_next(&self, count: usize) {
        self.forced_drops.fetch_add(count, Ordering::SeqCst);
    }

    /// Decide the fate of one transmitted packet.
    fn should_deliver(&self) -> bool {
        let forced = self
            .forced_drops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok();

        !forced
            && self
                .rng
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .gen_bool(self.reliability)
    }

    fn device(&self, address: MachineAddress) -> Option<Arc<SimulatedDevice>> {
        self.devices
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(&address)
            .and_then(Weak::upgrade)
    }
}

/// The network interface of one simulated machine.
pub struct SimulatedDevice {
    address: MachineAddress,
    network: Arc<SimulatedNetwork>,
    this: Weak<SimulatedDevice>,
    handler: RwLock<Option<Arc<dyn NetworkHandler>>>,
    inbox: Mutex<VecDeque<(PacketHeader, Vec<u8>)>>,
    in_flight: AtomicBool,
    counters: Counters,
}

impl SimulatedDevice {
    /// A snapshot of this device's counters.
    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            dropped: self.counters.dropped.load(Ordering::SeqCst),
            received: self.counters.received.load(Ordering::SeqCst),
            overlapping: self.counters.overlapping.load(Ordering::SeqCst),
        }
    }

    /// Whether a packet is currently in transmission.
    pub fn is_transmitting(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn handler(&self) -> Option<Arc<dyn NetworkHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    /// Place an arriving packet into the inbox and signal the handler.
    fn arrive(&self, packet: PacketHeader, bytes: Vec<u8>) {
        self.inbox
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push_back((packet, bytes));
        self.counters.received.fetch_add(1, Ordering::SeqCst);

        if let Some(handler) = self.handler() {
            handler.on_packet_arrived();
        }
    }

    /// Finish the transmission of a packet, after it has spent its time on the wire.
    fn complete(&self, packet: PacketHeader, bytes: Vec<u8>, deliver: bool) {
        match (deliver, self.network.device(packet.to)) {
            (true, Some(destination)) => {
                logger::trace!(
                    "Packet of {} bytes delivered from machine {} to {}.",
                    packet.length,
                    packet.from,
                    packet.to
                );
                self.counters.delivered.fetch_add(1, Ordering::SeqCst);
                destination.arrive(packet, bytes);
            }
            (true, None) => {
                logger::debug!(
                    "Machine {} is not on the network; packet from {} lost.",
                    packet.to,
                    packet.from
                );
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            }
            (false, _) => {
                logger::debug!(
                    "Network lost a packet of {} bytes from machine {} to {}.",
                    packet.length,
                    packet.from,
                    packet.to
                );
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            }
        }

        self.in_flight.store(false, Ordering::SeqCst);

        if let Some(handler) = self.handler() {
            handler.on_send_complete();
        }
    }
}

impl NetworkDevice for SimulatedDevice {
    fn address(&self) -> MachineAddress {
        self.address
    }

    fn attach(&self, handler: Arc<dyn NetworkHandler>) {
        *self
            .handler
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(handler);
    }

    fn submit(&self, packet: PacketHeader, bytes: Vec<u8>) -> Result<(), PostError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PostError::PacketTooLarge {
                length: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            PostError::Terminated(format!("No runtime to transmit packets on: {err}"))
        })?;

        let this = self.this.upgrade().ok_or_else(|| {
            PostError::Terminated(format!("Device of machine {} was dropped.", self.address))
        })?;

        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.counters.overlapping.fetch_add(1, Ordering::SeqCst);
            logger::warn!(
                "Machine {} submitted a packet while another was in transmission.",
                self.address
            );
            return Err(PostError::DeviceBusy(self.address));
        }

        self.counters.submitted.fetch_add(1, Ordering::SeqCst);

        let deliver = self.network.should_deliver();
        let latency = self.network.latency;

        runtime.spawn(async move {
            tokio::time::sleep(latency).await;
            this.complete(packet, bytes, deliver);
        });

        Ok(())
    }

    fn take_arrived(&self) -> Option<(PacketHeader, Vec<u8>)> {
        self.inbox
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .pop_front()
    }
}
