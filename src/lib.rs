// Allow holding locks across await points - we use parking_lot and release
// guards before awaiting in the event loop
#![allow(clippy::await_holding_lock)]
// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]

//! # ble-central
//!
//! A cross-platform Rust library implementing the Bluetooth Low Energy
//! **central role** as deterministic, callback-addressed sessions: bounded
//! scan sessions with ranked results, watchdog-supervised connections, and
//! single-flight characteristic operations.
//!
//! The coordinator consumes a radio's asynchronous completion events and
//! correlates them with the caller requests that triggered them — under
//! timeout, cancellation, and device loss — without leaking or
//! double-invoking a pending callback.
//!
//! ## Features
//!
//! - **Scan sessions**: time- or count-bounded discovery with live
//!   incremental updates and results ranked by signal strength
//! - **Watchdog connects**: connection attempts with enforced timeouts;
//!   late transport responses are ignored, never double-delivered
//! - **Single-flight GATT**: at most one read/write/notify-set in flight
//!   per characteristic, with fail-fast admission
//! - **Notify streams**: persistent per-characteristic update listeners
//!   alongside one-shot reads
//! - **Pluggable transport**: the coordinator drives any [`Transport`];
//!   a btleplug-backed implementation ships in the crate
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_central::{BtleplugTransport, Central, ScanOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ble_central::Result<()> {
//!     let (transport, events) = BtleplugTransport::new().await?;
//!     let central = Central::new(transport, events);
//!
//!     let (tx, rx) = tokio::sync::oneshot::channel();
//!     central.start_scan(
//!         ScanOptions {
//!             duration: Some(Duration::from_secs(10)),
//!             ..Default::default()
//!         },
//!         move |result| {
//!             let _ = tx.send(result);
//!         },
//!     );
//!
//!     for device in rx.await.unwrap()? {
//!         println!("{} ({:?} dBm)", device.id, device.rssi);
//!     }
//!
//!     central.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for snapshot and option
//!   types

// Public modules
pub mod callback;
pub mod central;
pub mod connection;
pub mod device;
pub mod error;
pub mod scan;
pub mod transport;

// Internal state machines
mod gatt;

// Re-exports for convenience
pub use callback::CallbackHandle;
pub use central::{Central, CentralEvent};
pub use connection::ConnectionState;
pub use device::{Characteristic, DeviceId, DeviceSnapshot, Service};
pub use error::{Error, Result};
pub use scan::{ScanOptions, SessionId};
pub use transport::{
    BtleplugTransport, ConnectOptions, DiscoveryOptions, Transport, TransportEvent,
};
