//! The post office of one machine: its mailboxes, and the single path from
//! them to the network device.
//!

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, OnceLock,
};
use tokio::sync::{Mutex, Notify, Semaphore};

use super::{reliable::Reassemblies, PendingSendTracker};
use crate::{
    config::PostOfficeConfig,
    mail::{
        encode_packet, MachineAddress, Mail, MailHeader, MailboxId, PacketHeader,
        MAIL_HEADER_SIZE, MAX_MAIL_SIZE,
    },
    mailbox::Mailbox,
    network::{NetworkDevice, NetworkHandler},
    token::MessageIdGenerator,
    PostError,
};

/// The signals raised by the network device.
///
/// Semaphores rather than [`Notify`], so that every completion and every arrival
/// is counted even when nobody is waiting at the time.
pub(crate) struct DeviceSignals {
    pub(crate) sent: Semaphore,
    pub(crate) arrived: Semaphore,
}

impl DeviceSignals {
    fn new() -> Self {
        Self {
            sent: Semaphore::new(0),
            arrived: Semaphore::new(0),
        }
    }
}

impl NetworkHandler for DeviceSignals {
    fn on_send_complete(&self) {
        self.sent.add_permits(1);
    }

    fn on_packet_arrived(&self) {
        self.arrived.add_permits(1);
    }
}

/// A collection of mailboxes on one machine, connected to the network.
///
/// To create a new [`PostOffice`], use [`Self::new`] from within a tokio runtime.
/// This attaches the post office to the device and spawns the delivery dispatcher,
/// which moves arriving packets into their mailboxes. The post office is returned
/// in an [`Arc`] to be handed to every task that sends or receives mail.
///
/// The dispatcher only holds a weak reference: once the last [`Arc`] is dropped,
/// or [`Self::stop`] is called, it terminates.
pub struct PostOffice {
    pub(crate) config: PostOfficeConfig,

    pub(crate) device: Arc<dyn NetworkDevice>,

    pub(crate) mailboxes: Vec<Mailbox>,

    /// Held from submitting a packet until the device reports completion.
    ///
    /// The flag records a completion that is still owed by the device, left
    /// behind if a send was cancelled mid-transmission.
    send_lock: Mutex<bool>,

    pub(crate) signals: Arc<DeviceSignals>,

    /// Reliable fragments sent but not yet acknowledged.
    pub(crate) pending: PendingSendTracker,

    pub(crate) message_ids: MessageIdGenerator,

    /// Reliable messages partly received, and those received in full recently.
    pub(crate) reassemblies: Reassemblies,

    /// Packets the dispatcher had to discard.
    pub(crate) violations: AtomicUsize,

    /// The handle of the delivery dispatcher.
    pub(crate) dispatcher_handle: OnceLock<tokio::task::JoinHandle<()>>,

    /// A flag to indicate if the dispatcher should terminate.
    pub(crate) _terminate_flag: Arc<Notify>,
}

impl PostOffice {
    /// Creates a new [`PostOffice`] on the given device, and starts delivering mail.
    pub fn new(
        device: Arc<dyn NetworkDevice>,
        config: PostOfficeConfig,
    ) -> Result<Arc<Self>, PostError> {
        config.validate()?;

        if device.address() != config.address {
            return Err(PostError::InvalidConfig(format!(
                "Post office configured for machine {} but the device belongs to machine {}.",
                config.address,
                device.address()
            )));
        }

        tokio::runtime::Handle::try_current().map_err(|err| {
            PostError::Terminated(format!("No runtime to run the delivery dispatcher on: {err}"))
        })?;

        let signals = Arc::new(DeviceSignals::new());
        device.attach(Arc::clone(&signals) as Arc<dyn NetworkHandler>);

        let post_office = Arc::new(Self {
            mailboxes: (0..config.num_boxes).map(|_| Mailbox::new()).collect(),
            config,
            device,
            send_lock: Mutex::new(false),
            signals,
            pending: PendingSendTracker::new(),
            message_ids: MessageIdGenerator::new(),
            reassemblies: Reassemblies::default(),
            violations: AtomicUsize::new(0),
            dispatcher_handle: OnceLock::new(),
            _terminate_flag: Arc::new(Notify::new()),
        });

        post_office.start();
        logger::info!(
            "Post office of machine {} open with {} mailboxes.",
            post_office.address(),
            post_office.num_boxes()
        );

        Ok(post_office)
    }

    /// The network address of this machine.
    pub fn address(&self) -> MachineAddress {
        self.config.address
    }

    /// Number of mailboxes in this post office.
    pub fn num_boxes(&self) -> u16 {
        self.config.num_boxes
    }

    pub fn config(&self) -> &PostOfficeConfig {
        &self.config
    }

    /// The reliable fragments still waiting for acknowledgement.
    pub fn pending(&self) -> &PendingSendTracker {
        &self.pending
    }

    /// Number of arrived packets discarded as malformed or misaddressed.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    /// Check that `id` names a mailbox in this post office.
    pub fn check_mailbox(&self, id: MailboxId) -> Result<(), PostError> {
        if id < self.num_boxes() {
            Ok(())
        } else {
            Err(PostError::MailboxOutOfRange {
                id,
                num_boxes: self.num_boxes(),
            })
        }
    }

    /// Get a mailbox by its id.
    pub fn mailbox(&self, id: MailboxId) -> Result<&Mailbox, PostError> {
        self.check_mailbox(id)?;
        Ok(&self.mailboxes[usize::from(id)])
    }

    /// Put a mail straight into its destination mailbox on this machine.
    ///
    /// The source mailbox must be in range as well, as replies are addressed to it.
    pub fn deliver(&self, mail: Mail) -> Result<(), PostError> {
        if mail.header.len() > MAX_MAIL_SIZE {
            return Err(PostError::MailTooLarge {
                length: mail.header.len(),
                max: MAX_MAIL_SIZE,
            });
        }

        self.check_mailbox(mail.header.from)?;
        self.mailbox(mail.header.to)?.put(mail);
        Ok(())
    }

    /// Send a mail to a mailbox on another machine.
    ///
    /// The packet's `from` and `length` are filled in here. This returns once the
    /// device has finished transmitting, which does not mean the mail arrived:
    /// the network may still have lost it.
    ///
    /// Only one mail is ever in transmission; concurrent senders queue up on the
    /// send lock.
    pub async fn send(
        &self,
        packet: PacketHeader,
        header: MailHeader,
        data: &[u8],
    ) -> Result<(), PostError> {
        if data.len() > MAX_MAIL_SIZE {
            return Err(PostError::MailTooLarge {
                length: data.len(),
                max: MAX_MAIL_SIZE,
            });
        }

        if header.len() != data.len() {
            return Err(PostError::LengthMismatch {
                declared: header.len(),
                actual: data.len(),
            });
        }

        self.check_mailbox(header.to)?;
        self.check_mailbox(header.from)?;

        let packet = PacketHeader {
            from: self.address(),
            length: MAIL_HEADER_SIZE + data.len(),
            ..packet
        };
        let buffer = encode_packet(&header, data);

        logger::debug!(
            "Sending {} bytes from ({}, {}) to ({}, {}).",
            header.length,
            packet.from,
            header.from,
            packet.to,
            header.to
        );

        let mut owed = self.send_lock.lock().await;

        if *owed {
            self.await_send_complete().await?;
            *owed = false;
        }

        self.device.submit(packet, buffer)?;
        *owed = true;
        self.await_send_complete().await?;
        *owed = false;

        Ok(())
    }

    async fn await_send_complete(&self) -> Result<(), PostError> {
        self.signals
            .sent
            .acquire()
            .await
            .map(|permit| permit.forget())
            .map_err(|_| PostError::Terminated("Send completion signal closed.".to_owned()))
    }

    /// Take the next mail from a mailbox, waiting for one if it is empty.
    pub async fn receive(&self, id: MailboxId) -> Result<Mail, PostError> {
        let mail = self.mailbox(id)?.get().await;
        logger::debug!(
            "Got mail from ({}, {}) in mailbox {}, {} bytes, {} remaining parts.",
            mail.packet.from,
            mail.header.from,
            id,
            mail.header.length,
            mail.header.remaining_parts
        );

        Ok(mail)
    }

    /// Wait until every reliable fragment sent from here has been acknowledged or
    /// given up on.
    pub async fn wait_idle(&self) {
        self.pending.wait_idle().await
    }

    /// Check if the delivery dispatcher has been started.
    pub fn is_dispatching(&self) -> bool {
        self.dispatcher_handle
            .get()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops delivering arriving packets to the mailboxes.
    pub fn stop(&self) {
        logger::debug!("Stopping delivery dispatcher of machine {}...", self.address());
        self._terminate_flag.notify_one();
    }
}

impl Drop for PostOffice {
    fn drop(&mut self) {
        logger::info!("Drop triggered on PostOffice of machine {}.", self.address());
        self.stop()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::_tests::{machines, quiet_network};
    use futures::FutureExt;

    #[tokio::test(start_paused = true)]
    async fn rejects_mismatched_address() {
        let network = quiet_network();
        let device = network.attach(3).unwrap();

        assert!(matches!(
            PostOffice::new(device, PostOfficeConfig::new(4)),
            Err(PostError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_and_receive() {
        let (_network, offices) = machines(2, 1.0);
        let (a, b) = (&offices[0], &offices[1]);

        let receiver = tokio::spawn({
            let b = Arc::clone(b);
            async move { b.receive(5).await }
        });

        a.send(PacketHeader::to(1), MailHeader::new(2, 5, 5), b"hello")
            .await
            .expect("Failed to send.");

        let mail = receiver
            .await
            .expect("Receiver panicked.")
            .expect("Failed to receive.");

        assert_eq!(mail.header, MailHeader::new(2, 5, 5));
        assert_eq!(mail.payload, b"hello");
        assert_eq!(
            mail.packet,
            PacketHeader {
                from: 0,
                to: 1,
                length: MAIL_HEADER_SIZE + 5
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_are_checked_before_anything_happens() {
        let (_network, offices) = machines(2, 1.0);
        let a = &offices[0];

        let err = a
            .send(PacketHeader::to(1), MailHeader::new(2, 10, 1), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, PostError::MailboxOutOfRange { id: 10, .. }));

        let err = a
            .send(PacketHeader::to(1), MailHeader::new(11, 2, 1), b"x")
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());

        assert!(a.receive(10).await.is_err());

        let mail = Mail::new(PacketHeader::to(0), MailHeader::new(0, 12, 0), vec![]).unwrap();
        assert!(a.deliver(mail).is_err());

        let mail = Mail::new(PacketHeader::to(0), MailHeader::new(12, 0, 0), vec![]).unwrap();
        assert!(matches!(
            a.deliver(mail),
            Err(PostError::MailboxOutOfRange { id: 12, .. })
        ));
        assert!(a.mailboxes.iter().all(Mailbox::is_empty));
    }

    #[tokio::test(start_paused = true)]
    async fn send_rejects_bad_lengths() {
        let (_network, offices) = machines(2, 1.0);
        let a = &offices[0];

        assert!(matches!(
            a.send(PacketHeader::to(1), MailHeader::new(0, 1, 4), b"hello")
                .await,
            Err(PostError::LengthMismatch { .. })
        ));

        let data = vec![0_u8; MAX_MAIL_SIZE + 1];
        let header = MailHeader::new(0, 1, data.len() as u16);
        assert!(matches!(
            a.send(PacketHeader::to(1), header, &data).await,
            Err(PostError::MailTooLarge { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_send_does_not_break_the_next() {
        let (_network, offices) = machines(2, 1.0);
        let (a, b) = (&offices[0], &offices[1]);

        // Polled once: submitted, then dropped while waiting for completion.
        let cancelled = a
            .send(PacketHeader::to(1), MailHeader::new(0, 3, 1), b"1")
            .now_or_never();
        assert!(cancelled.is_none());

        a.send(PacketHeader::to(1), MailHeader::new(0, 3, 1), b"2")
            .await
            .expect("Send after a cancelled send failed.");

        assert_eq!(b.receive(3).await.unwrap().payload, b"1");
        assert_eq!(b.receive(3).await.unwrap().payload, b"2");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_terminates_dispatcher() {
        let (_network, offices) = machines(1, 1.0);
        let a = &offices[0];

        assert!(a.is_dispatching());
        a.stop();
        tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
        assert!(!a.is_dispatching());
    }
}
