//! The delivery dispatcher: the one task that moves arriving packets into
//! mailboxes.
//!

use std::sync::{atomic::Ordering, Arc};

use super::PostOffice;
use crate::{
    mail::{decode_packet, Mail, PacketHeader},
    PostError,
};

impl PostOffice {
    /// Starts the delivery dispatcher.
    ///
    /// Calling this again once the dispatcher runs has no effect.
    pub(crate) fn start(self: &Arc<Self>) {
        let weak_self = Arc::downgrade(self);
        let signals = Arc::clone(&self.signals);
        let arc_notify = Arc::clone(&self._terminate_flag);

        self.dispatcher_handle.get_or_init(|| {
            tokio::spawn(async move {
                // Only a weak reference is kept between packets, so that the
                // dispatcher stops once the post office is dropped.
                let deliveries = async move {
                    loop {
                        match signals.arrived.acquire().await {
                            Ok(permit) => permit.forget(),
                            Err(_) => {
                                logger::info!("Terminating delivery dispatcher due to closed signal.");
                                break;
                            }
                        }

                        if let Some(arc_self) = weak_self.upgrade() {
                            arc_self.dispatch_arrived();
                        } else {
                            logger::info!("Terminating delivery dispatcher due to dropped reference.");
                            break;
                        }
                    }
                };

                tokio::select! {
                    _ = arc_notify.notified() => {
                        logger::info!("Terminating delivery dispatcher due to termination notification.");
                    },
                    _ = deliveries => {},
                }
            })
        });
    }

    /// Take one arrived packet off the device and deliver it.
    fn dispatch_arrived(&self) {
        let Some((packet, bytes)) = self.device.take_arrived() else {
            logger::warn!(
                "Machine {} was told a packet arrived, but none was waiting.",
                self.address()
            );
            return;
        };

        if let Err(err) = self.accept_packet(packet, &bytes) {
            self.violations.fetch_add(1, Ordering::SeqCst);
            logger::error!(
                "Discarding packet of {} bytes from machine {}: {}",
                bytes.len(),
                packet.from,
                err
            );
        }
    }

    /// Parse a packet into a mail and route it.
    ///
    /// Acknowledgements retire the matching pending fragment and go no further;
    /// everything else lands in the addressed mailbox.
    pub(crate) fn accept_packet(
        &self,
        packet: PacketHeader,
        bytes: &[u8],
    ) -> Result<(), PostError> {
        let (header, payload) = decode_packet(bytes)?;
        self.check_mailbox(header.to)?;

        if header.is_ack() {
            if !self.pending.ack_received(header.fragment_key(), packet.from) {
                logger::debug!(
                    "Ignoring acknowledgement for {:?} from machine {}, nothing pending.",
                    header.fragment_key(),
                    packet.from
                );
            }
            return Ok(());
        }

        self.deliver(Mail::new(packet, header, payload)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        _tests::{machines, quiet_network},
        mail::{encode_packet, MailHeader, MailKind, MAIL_HEADER_SIZE, MAX_MAIL_SIZE},
        network::NetworkDevice,
        PostOfficeConfig,
    };

    #[tokio::test(start_paused = true)]
    async fn routes_data_into_mailboxes() {
        let (_network, offices) = machines(1, 1.0);
        let office = &offices[0];

        for (to, payload) in [(3, b"abc"), (4, b"def"), (3, b"ghi")] {
            let header = MailHeader::new(0, to, 3);
            office
                .accept_packet(PacketHeader::to(0), &encode_packet(&header, payload))
                .expect("Failed to accept packet.");
        }

        assert_eq!(office.mailbox(3).unwrap().len(), 2);
        assert_eq!(office.receive(3).await.unwrap().payload, b"abc");
        assert_eq!(office.receive(3).await.unwrap().payload, b"ghi");
        assert_eq!(office.receive(4).await.unwrap().payload, b"def");
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_violations() {
        let (_network, offices) = machines(1, 1.0);
        let office = &offices[0];

        let out_of_range = encode_packet(&MailHeader::new(0, 10, 1), b"x");
        assert!(matches!(
            office.accept_packet(PacketHeader::to(0), &out_of_range),
            Err(PostError::MailboxOutOfRange { id: 10, .. })
        ));

        let unknown_sender = encode_packet(&MailHeader::new(15, 3, 2), b"hi");
        assert!(matches!(
            office.accept_packet(PacketHeader::to(0), &unknown_sender),
            Err(PostError::MailboxOutOfRange { id: 15, .. })
        ));

        let oversize = vec![0_u8; MAX_MAIL_SIZE + 1];
        let too_large = encode_packet(&MailHeader::new(0, 3, oversize.len() as u16), &oversize);
        assert!(office
            .accept_packet(PacketHeader::to(0), &too_large)
            .unwrap_err()
            .is_protocol_violation());

        assert!(office
            .accept_packet(PacketHeader::to(0), &[0_u8; MAIL_HEADER_SIZE - 2])
            .is_err());

        assert!(office.mailboxes.iter().all(|mailbox| mailbox.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgements_do_not_reach_mailboxes() {
        let (_network, offices) = machines(1, 1.0);
        let office = &offices[0];

        let ack = MailHeader {
            kind: MailKind::Ack,
            message_id: 77,
            ..MailHeader::new(3, 1, 1)
        };
        office
            .accept_packet(PacketHeader::to(0), &encode_packet(&ack, b"!"))
            .expect("Stale acknowledgements should be ignored, not rejected.");

        assert!(office.mailbox(1).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_packets_are_counted_and_survived() {
        let (network, offices) = machines(2, 1.0);
        let (a, b) = (&offices[0], &offices[1]);

        // Hand-deliver a garbage packet through the network.
        let rogue = network.attach(9).unwrap();
        rogue
            .submit(
                PacketHeader {
                    from: 9,
                    to: 1,
                    length: 3,
                },
                vec![1, 2, 3],
            )
            .unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        assert_eq!(b.violations(), 1);

        a.send(PacketHeader::to(1), MailHeader::new(0, 2, 2), b"ok")
            .await
            .unwrap();
        assert_eq!(b.receive(2).await.unwrap().payload, b"ok");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_source_mailbox_is_discarded() {
        let network = quiet_network();
        let large = PostOffice::new(
            network.attach(0).unwrap(),
            PostOfficeConfig::new(0).with_num_boxes(20),
        )
        .unwrap();
        let small = PostOffice::new(network.attach(1).unwrap(), PostOfficeConfig::new(1)).unwrap();

        large
            .send(PacketHeader::to(1), MailHeader::new(15, 3, 2), b"hi")
            .await
            .unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;

        assert!(small.mailbox(3).unwrap().is_empty());
        assert_eq!(small.violations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgement_from_another_machine_is_ignored() {
        let (_network, offices) = machines(3, 1.0);
        let office = &offices[0];
        office.pending.register(
            Mail::fragments(PacketHeader::to(1), MailHeader::new(1, 4, 0), b"x", 77).unwrap(),
        );

        let ack = MailHeader {
            kind: MailKind::Ack,
            message_id: 77,
            ..MailHeader::new(4, 1, 1)
        };
        let from = |machine| PacketHeader {
            from: machine,
            to: 0,
            length: 0,
        };

        office
            .accept_packet(from(2), &encode_packet(&ack, b"!"))
            .unwrap();
        assert!(office.pending().is_pending(&(77, 0)));

        office
            .accept_packet(from(1), &encode_packet(&ack, b"!"))
            .unwrap();
        assert!(office.pending().is_empty());
    }
}
