//! Push Image - connect to a display and send a three-color image.
//!
//! This demo demonstrates:
//! - Building an `EpdClient` with the fluent builder
//! - Watching client events (config snapshot, status lines, progress)
//! - Selecting a driver, syncing the clock and pushing an image
//!
//! It runs against the in-process `MemoryTransport`; swap in a real BLE
//! transport to drive hardware.
//!
//! ```text
//! RUST_LOG=epd_link=debug cargo run --example push_image
//! ```

use std::sync::Arc;

use bytes::Bytes;
use epd_link::transport::PeripheralScript;
use epd_link::{ClientEvent, ClockMode, ColorMode, EpdClient, MemoryTransport, TimeSync};
use tracing_subscriber::EnvFilter;

/// 400x300 panel, one bit per pixel per plane.
const PLANE_LEN: usize = 400 * 300 / 8;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Pins 0..7, driver 0x03 (UC8176 BWR)
    let transport = MemoryTransport::with_script(PeripheralScript {
        config_snapshot: Some(vec![0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x03]),
        ..PeripheralScript::default()
    });

    let client = EpdClient::builder(Arc::new(transport.clone()))
        .interleave_budget(50)
        .build()?;

    let mut events = client.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::ConfigSnapshot(snapshot) => {
                    println!("config: pins={} driver={:?}", snapshot.pins_hex(), snapshot.driver_hex());
                }
                ClientEvent::Status(line) => println!("device: {}", line),
                ClientEvent::Progress(p) if p.chunk == p.total => {
                    println!("{:?} plane: {} chunks in {:?}", p.plane, p.total, p.elapsed);
                }
                ClientEvent::Disconnected => break,
                _ => {}
            }
        }
    });

    client.connect().await?;
    transport.notify(Bytes::from_static(b"mtu=247"));
    tokio::task::yield_now().await;

    client.set_driver("090a0b0c0d0e0f", "03").await?;
    client.sync_time(&TimeSync::now(8, ClockMode::Calendar)).await?;

    println!("fit: {:?}", client.check_image_fit(ColorMode::ThreeColor));
    let mut image = vec![0xFF; PLANE_LEN];
    image.extend(std::iter::repeat(0x00).take(PLANE_LEN));
    let report = client.send_image(ColorMode::ThreeColor, Bytes::from(image)).await?;
    println!(
        "sent {} planes in {:?} ({} writes recorded)",
        report.planes.len(),
        report.elapsed,
        transport.writes().len()
    );

    client.disconnect().await?;
    watcher.await?;
    Ok(())
}
