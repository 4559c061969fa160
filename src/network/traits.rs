//! The contract between a post office and the network device beneath it.

use std::sync::Arc;

use crate::{
    mail::{MachineAddress, PacketHeader},
    PostError,
};

/// Receives the asynchronous signals of a [`NetworkDevice`].
///
/// Both methods may be called from any task, and must not block.
pub trait NetworkHandler: Send + Sync {
    /// The packet handed to [`NetworkDevice::submit`] has left the device, and the
    /// next packet may be submitted.
    ///
    /// This says nothing about whether the packet will arrive.
    fn on_send_complete(&self);

    /// A packet has arrived and can be taken with [`NetworkDevice::take_arrived`].
    fn on_packet_arrived(&self);
}

/// A packet oriented network interface, which may silently lose packets.
pub trait NetworkDevice: Send + Sync {
    /// The address of the machine this device belongs to.
    fn address(&self) -> MachineAddress;

    /// Register the handler to be signalled on send completion and packet arrival.
    ///
    /// Attaching again replaces the previous handler.
    fn attach(&self, handler: Arc<dyn NetworkHandler>);

    /// Start transmitting one packet.
    ///
    /// Only one packet may be in transmission at any time; a second submission
    /// before [`NetworkHandler::on_send_complete`] has fired is rejected with
    /// [`PostError::DeviceBusy`].
    fn submit(&self, packet: PacketHeader, bytes: Vec<u8>) -> Result<(), PostError>;

    /// Take the oldest arrived packet, if any.
    fn take_arrived(&self) -> Option<(PacketHeader, Vec<u8>)>;
}
