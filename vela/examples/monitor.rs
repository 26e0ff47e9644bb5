//! Watches the local network for devices and streams points from each one
//! that connects.
//!
//! Run with `RUST_LOG=vela=debug cargo run --example monitor` on a network
//! with at least one announcing device.

use std::error::Error;
use std::sync::mpsc;

use vela::{Config, DeviceEvent, Sdk, State};

fn main() -> Result<(), Box<dyn Error>> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish(),
    )?;

    let mut sdk = Sdk::init(Config::default())?;
    // Callbacks run on the I/O thread, so forward them here rather than
    // calling back into the SDK from inside one
    let (events, inbox) = mpsc::channel();
    sdk.set_event_handler(move |event| {
        let _ = events.send(event);
    })?;
    sdk.start()?;
    println!("listening for announcements on {}", sdk.announce_addr());

    while let Ok(event) = inbox.recv() {
        match event {
            DeviceEvent::Found { summary, .. } => {
                println!(
                    "found {} ({:?}) at {}",
                    summary.serial, summary.model, summary.address
                );
            }
            DeviceEvent::StateChanged {
                handle,
                new: State::Connected,
                ..
            } => {
                sdk.start_sampling(handle, move |frame| {
                    println!(
                        "[{handle:?}] frame seq {} at {}us: {} points",
                        frame.seq,
                        frame.timestamp_us,
                        frame.points.len()
                    );
                })?;
            }
            DeviceEvent::StateChanged { handle, old, new } => {
                println!("[{handle:?}] {old:?} -> {new:?}");
            }
            DeviceEvent::Lost { handle, reason } => {
                println!("[{handle:?}] lost: {reason:?}");
            }
            DeviceEvent::Removed { .. } => {}
            DeviceEvent::SamplingRejected { handle, error } => {
                println!("[{handle:?}] device refused to stream: {error}");
            }
        }
    }
    Ok(())
}
