//! Basic example: scan for nearby BLE devices and print a ranked list.
//!
//! Run with: cargo run --example scan_devices

use ble_central::{BtleplugTransport, Central, Result, ScanOptions};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_central=debug".parse().unwrap()),
        )
        .init();

    println!("Starting BLE discovery...\n");

    let (transport, events) = BtleplugTransport::new().await?;
    let central = Central::new(transport, events);

    let (tx, rx) = tokio::sync::oneshot::channel();
    central.start_scan_with_updates(
        ScanOptions {
            duration: Some(Duration::from_secs(10)),
            ..Default::default()
        },
        |device| {
            println!(
                "  seen: {} {} ({} dBm)",
                device.id,
                device.name.as_deref().unwrap_or("<unnamed>"),
                device
                    .rssi
                    .map(|rssi| rssi.to_string())
                    .unwrap_or_else(|| "?".to_string()),
            );
        },
        move |result| {
            let _ = tx.send(result);
        },
    );

    println!("Scanning for 10 seconds...\n");
    let devices = rx.await.expect("scan session dropped")?;

    println!("\n--- Scan Complete ---");
    println!("Devices by signal strength:");
    for device in devices {
        println!(
            "  {} {} ({:?} dBm)",
            device.id,
            device.name.as_deref().unwrap_or("<unnamed>"),
            device.rssi
        );
    }

    central.shutdown().await;
    println!("\nDone!");

    Ok(())
}
