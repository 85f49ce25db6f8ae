//! Connect to the strongest nearby device, walk its GATT table, and read
//! the GAP device name.
//!
//! Run with: cargo run --example read_device_info

use ble_central::{BtleplugTransport, Central, Error, Result, ScanOptions};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

const GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_00805f9b34fb);
const DEVICE_NAME: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_00805f9b34fb);

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

    println!("Scanning for 5 seconds...");
    let (on_complete, scan_rx) = completion();
    central.start_scan(
        ScanOptions {
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
    println!(
        "Connecting to {} ({:?} dBm)...",
        nearest.id, nearest.rssi
    );

    let (on_complete, connect_rx) = completion();
    central.connect_with_timeout(nearest.id.clone(), Duration::from_secs(10), on_complete);
    connect_rx.await.expect("connect dropped")?;
    println!("Connected.");

    let (on_complete, services_rx) = completion();
    central.discover_services(nearest.id.clone(), Vec::new(), on_complete);
    let services = services_rx.await.expect("discovery dropped")?;
    println!("Discovered {} services:", services.len());
    for service in &services {
        println!("  {}", service.uuid);
    }

    if services.iter().any(|s| s.uuid == GENERIC_ACCESS_SERVICE) {
        let (on_complete, chars_rx) = completion();
        central.discover_characteristics(
            nearest.id.clone(),
            GENERIC_ACCESS_SERVICE,
            Vec::new(),
            on_complete,
        );
        let characteristics = chars_rx.await.expect("discovery dropped")?;

        if characteristics.iter().any(|c| c.uuid == DEVICE_NAME) {
            let (on_complete, read_rx) = completion();
            central.read(nearest.id.clone(), DEVICE_NAME, on_complete);
            match read_rx.await.expect("read dropped") {
                Ok(value) => {
                    println!("Device name: {}", String::from_utf8_lossy(&value));
                }
                Err(Error::TransportFailure { reason }) => {
                    println!("Device name not readable: {reason}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    let (on_complete, disconnect_rx) = completion();
    central.disconnect(nearest.id, on_complete);
    let _ = disconnect_rx.await.expect("disconnect dropped");

    central.shutdown().await;
    Ok(())
}
