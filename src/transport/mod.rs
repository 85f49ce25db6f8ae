//! The radio transport boundary.
//!
//! The coordinator never talks to a radio directly; it submits requests
//! through [`Transport`] and consumes completions from the
//! [`TransportEvent`] stream. Outbound calls return the submission outcome
//! only — the operation's real result always arrives later as an event.
//!
//! A real implementation over btleplug ships in [`btleplug`]; tests drive
//! the coordinator with a mock.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::device::DeviceId;
use crate::error::Result;

pub mod btleplug;

pub use self::btleplug::BtleplugTransport;

/// Options for a transport discovery request.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveryOptions {
    /// Report repeat sightings of an already-seen device.
    pub allow_duplicates: bool,
}

/// Options for a transport connect request.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectOptions {
    /// Hint for the platform's connection supervision timeout. The
    /// coordinator's own watchdog is independent of this.
    pub supervision_timeout: Option<Duration>,
}

/// Outbound primitives of the radio driver.
///
/// Methods take owned arguments so implementations can hand them to spawned
/// tasks; all completions are delivered as [`TransportEvent`]s.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the discovery event stream.
    async fn start_discovery(&self, filter: Vec<Uuid>, options: DiscoveryOptions) -> Result<()>;

    /// Stop the discovery event stream.
    async fn stop_discovery(&self) -> Result<()>;

    /// Open a connection; completes with [`TransportEvent::Connected`].
    async fn connect(&self, device: DeviceId, options: ConnectOptions) -> Result<()>;

    /// Close a connection; completes with [`TransportEvent::Disconnected`].
    async fn disconnect(&self, device: DeviceId) -> Result<()>;

    /// Discover services; completes with
    /// [`TransportEvent::ServicesDiscovered`].
    async fn discover_services(&self, device: DeviceId, filter: Vec<Uuid>) -> Result<()>;

    /// Discover a service's characteristics; completes with
    /// [`TransportEvent::CharacteristicsDiscovered`].
    async fn discover_characteristics(
        &self,
        device: DeviceId,
        service: Uuid,
        filter: Vec<Uuid>,
    ) -> Result<()>;

    /// Read a characteristic; completes with
    /// [`TransportEvent::ValueUpdated`].
    async fn read_characteristic(&self, device: DeviceId, characteristic: Uuid) -> Result<()>;

    /// Write a characteristic; completes with
    /// [`TransportEvent::ValueWritten`].
    async fn write_characteristic(
        &self,
        device: DeviceId,
        characteristic: Uuid,
        value: Bytes,
    ) -> Result<()>;

    /// Enable or disable notifications; completes with
    /// [`TransportEvent::NotifyStateChanged`].
    async fn set_notify(&self, device: DeviceId, characteristic: Uuid, enabled: bool)
        -> Result<()>;

    /// Read the current signal strength; completes with
    /// [`TransportEvent::RssiUpdated`].
    async fn read_rssi(&self, device: DeviceId) -> Result<()>;
}

/// Asynchronous completion events emitted by the radio driver.
///
/// `error` fields carry the transport's failure reason; the coordinator maps
/// them to [`crate::Error::TransportFailure`] on delivery.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A device was discovered or re-sighted.
    DeviceDiscovered {
        /// Stable identifier of the peer.
        id: DeviceId,
        /// Advertised display name, if any.
        name: Option<String>,
        /// Signal strength in dBm.
        rssi: Option<i16>,
        /// Raw advertising payload entries.
        advertising: HashMap<String, Bytes>,
    },
    /// A connect request completed.
    Connected {
        /// The device the attempt was for.
        id: DeviceId,
        /// Failure reason, `None` on success.
        error: Option<String>,
    },
    /// The link to a device closed, solicited or not.
    Disconnected {
        /// The device that disconnected.
        id: DeviceId,
        /// Failure reason for abnormal loss, if reported.
        error: Option<String>,
    },
    /// A service discovery completed.
    ServicesDiscovered {
        /// The device the discovery ran on.
        id: DeviceId,
        /// Discovered service identities.
        services: Vec<Uuid>,
        /// Failure reason, `None` on success.
        error: Option<String>,
    },
    /// A characteristic discovery completed.
    CharacteristicsDiscovered {
        /// The service the discovery ran on.
        service: Uuid,
        /// Discovered characteristic identities.
        characteristics: Vec<Uuid>,
        /// Failure reason, `None` on success.
        error: Option<String>,
    },
    /// A characteristic value arrived: the response to a read, or a
    /// notification push.
    ValueUpdated {
        /// The originating characteristic.
        characteristic: Uuid,
        /// The value bytes.
        value: Bytes,
        /// Failure reason, `None` on success.
        error: Option<String>,
    },
    /// A write request was acknowledged.
    ValueWritten {
        /// The characteristic that was written.
        characteristic: Uuid,
        /// Failure reason, `None` on success.
        error: Option<String>,
    },
    /// A subscribe/unsubscribe request completed.
    NotifyStateChanged {
        /// The characteristic whose subscription changed.
        characteristic: Uuid,
        /// The resulting subscription state.
        enabled: bool,
        /// Failure reason, `None` on success.
        error: Option<String>,
    },
    /// A signal-strength read completed.
    RssiUpdated {
        /// The device the read ran on.
        id: DeviceId,
        /// Signal strength in dBm.
        rssi: i16,
        /// Failure reason, `None` on success.
        error: Option<String>,
    },
    /// The platform adapter became usable or unusable.
    AdapterStateChanged {
        /// Whether central-role operations are possible.
        ready: bool,
        /// Human-readable reason when not ready.
        reason: Option<String>,
    },
}
