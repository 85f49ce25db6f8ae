//! Subscribe to battery-level notifications from the strongest nearby
//! device that exposes the Battery Service.
//!
//! Run with: cargo run --example notify_stream

use ble_central::{BtleplugTransport, Central, Result, ScanOptions};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb);
const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);

fn completion<T: Send + 'static>() -> (
    impl FnOnce(Result<T>) + Send + 'static,
    oneshot::Receiver<Result<T>>,
) {
    let (tx, rx) = oneshot::channel();
    (
        move |result| {
            let _ = tx.send(result);
        },
        rx,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_central=info".parse().unwrap()),
        )
        .init();

    let (transport, events) = BtleplugTransport::new().await?;
    let central = Central::new(transport, events);

    println!("Scanning for devices advertising the Battery Service...");
    let (on_complete, scan_rx) = completion();
    central.start_scan(
        ScanOptions {
            service_filter: vec![BATTERY_SERVICE],
            duration: Some(Duration::from_secs(5)),
            ..Default::default()
        },
        on_complete,
    );
    let devices = scan_rx.await.expect("scan session dropped")?;

    let Some(nearest) = devices.into_iter().next() else {
        println!("No devices found.");
        central.shutdown().await;
        return Ok(());
    };
    println!("Connecting to {}...", nearest.id);

    let (on_complete, connect_rx) = completion();
    central.connect_with_timeout(nearest.id.clone(), Duration::from_secs(10), on_complete);
    connect_rx.await.expect("connect dropped")?;

    let (on_complete, services_rx) = completion();
    central.discover_services(nearest.id.clone(), vec![BATTERY_SERVICE], on_complete);
    services_rx.await.expect("discovery dropped")?;

    let (on_complete, chars_rx) = completion();
    central.discover_characteristics(
        nearest.id.clone(),
        BATTERY_SERVICE,
        vec![BATTERY_LEVEL],
        on_complete,
    );
    chars_rx.await.expect("discovery dropped")?;

    let (on_complete, notify_rx) = completion();
    central.set_notify_with_updates(
        nearest.id.clone(),
        BATTERY_LEVEL,
        on_complete,
        |update| match update {
            Ok(value) => println!("  battery: {}%", value.first().copied().unwrap_or(0)),
            Err(e) => println!("  update error: {e}"),
        },
    );
    notify_rx.await.expect("notify dropped")?;
    println!("Subscribed. Streaming for 30 seconds (Ctrl+C to stop)...");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    let (on_complete, off_rx) = completion();
    central.set_notify(nearest.id.clone(), BATTERY_LEVEL, false, on_complete);
    let _ = off_rx.await.expect("notify dropped");

    let (on_complete, disconnect_rx) = completion();
    central.disconnect(nearest.id, on_complete);
    let _ = disconnect_rx.await.expect("disconnect dropped");

    central.shutdown().await;
    println!("Done!");
    Ok(())
}
