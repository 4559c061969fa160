//! Transfer one message reliably between two machines on a lossy network.
//!
//! This is a simple example to demonstrate how to use the [`postal`] library.

use clap::Parser;
use std::sync::Arc;

use postal::{
    example::{MachineReport, TransferReport},
    mail::{MailHeader, PacketHeader, ACK_MAILBOX},
    network::{NetworkDevice, SimulatedDevice, SimulatedNetwork},
    CliArgs, PostError, PostOffice,
};

const SENDER: u32 = 0;
const RECEIVER: u32 = 1;

/// The message to send, which is not the same byte repeated.
fn message(size: usize) -> Vec<u8> {
    (0..size).map(|index| (index % 251) as u8).collect()
}

fn machine_report(device: &SimulatedDevice, office: &PostOffice) -> MachineReport {
    MachineReport {
        address: device.address(),
        stats: device.stats(),
        violations: office.violations(),
    }
}

/// Run the transfer, returning the size and fragment count of what arrived.
async fn transfer(
    sender: &PostOffice,
    receiver: Arc<PostOffice>,
    mailbox: u16,
    data: &[u8],
) -> Result<(usize, usize), PostError> {
    let receiving = tokio::spawn(async move { receiver.reliable_receive(mailbox).await });

    sender
        .reliable_send(
            PacketHeader::to(RECEIVER),
            MailHeader::new(ACK_MAILBOX, mailbox, 0),
            data,
        )
        .await?;

    let message = receiving
        .await
        .map_err(|err| PostError::Terminated(format!("Receiving task failed: {err}")))??;

    if message.body != data {
        return Err(PostError::MalformedPacket(
            "Reassembled message differs from what was sent.".to_owned(),
        ));
    }

    Ok((message.body.len(), message.fragments))
}

#[tokio::main]
async fn main() -> Result<(), PostError> {
    let args = CliArgs::parse();

    let network = SimulatedNetwork::new(args.reliability)?;
    let network = Arc::new(match args.seed {
        Some(seed) => network.with_seed(seed),
        None => network,
    });

    let (sender_device, receiver_device) = (network.attach(SENDER)?, network.attach(RECEIVER)?);
    let sender = PostOffice::new(
        Arc::clone(&sender_device) as Arc<dyn NetworkDevice>,
        args.post_office_config(SENDER),
    )?;
    let receiver = PostOffice::new(
        Arc::clone(&receiver_device) as Arc<dyn NetworkDevice>,
        args.post_office_config(RECEIVER),
    )?;

    let data = message(args.size);
    let started = tokio::time::Instant::now();

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("SIGTERM received, gracefully shutting down.");
            return Ok(());
        },
        outcome = transfer(&sender, Arc::clone(&receiver), args.mailbox, &data) => outcome,
    };

    let (received, error) = match outcome {
        Ok(received) => (Some(received), None),
        Err(err) => (None, Some(err.to_string())),
    };

    let report = TransferReport {
        success: error.is_none(),
        reliability: network.reliability(),
        config: sender.config().clone(),
        bytes_sent: data.len(),
        bytes_received: received.map(|(bytes, _)| bytes),
        fragments: received.map(|(_, fragments)| fragments),
        elapsed_ms: started.elapsed().as_millis(),
        machines: vec![
            machine_report(&sender_device, &sender),
            machine_report(&receiver_device, &receiver),
        ],
        error,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
