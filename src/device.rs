//! Device registry entries and their snapshot views.
//!
//! The registry owns one [`Device`] per discovered identifier for its
//! discovery lifetime. Ownership runs Device -> Service -> Characteristic;
//! the characteristic's `service` field is a non-owning back-reference.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::callback::{defer, Completion, Deferred};
use crate::connection::{ConnectionLifecycle, ConnectionState};
use crate::error::Error;
use crate::gatt::CharacteristicOps;

/// Opaque stable identifier of a radio peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A GATT service discovered on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Service {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics discovered for this service.
    ///
    /// Empty until characteristic discovery runs for the service.
    pub characteristics: Vec<Characteristic>,
}

/// A GATT characteristic discovered within a service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Characteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the owning service (back-reference, lookup only).
    pub service: Uuid,
}

/// Cloneable view of a device's data fields.
///
/// Snapshots are what queries return and what callbacks receive; they never
/// borrow registry state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSnapshot {
    /// Stable identifier.
    pub id: DeviceId,
    /// Display name, if the peer advertised one.
    pub name: Option<String>,
    /// Last-known signal strength in dBm (more negative = weaker).
    pub rssi: Option<i16>,
    /// Raw advertising payload, last-seen value per key.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub advertising: HashMap<String, Bytes>,
    /// Discovered services; empty until explicit discovery.
    pub services: Vec<Service>,
    /// Current connection state.
    pub connection_state: ConnectionState,
    /// True iff the most recent disconnect was raised by the watchdog.
    pub watchdog_raised: bool,
}

/// One registry entry: identity, advertising state, service arena, and the
/// per-device state machines.
pub(crate) struct Device {
    id: DeviceId,
    name: Option<String>,
    rssi: Option<i16>,
    advertising: HashMap<String, Bytes>,
    services: Vec<Service>,
    /// Creation order; the stable tie-break for equal signal strength.
    discovery_seq: u64,
    pub(crate) connection: ConnectionLifecycle,
    pub(crate) ops: CharacteristicOps,
    pub(crate) pending_discover_services: Option<Completion<Vec<Service>>>,
    pub(crate) pending_discover_characteristics: HashMap<Uuid, Completion<Vec<Characteristic>>>,
    pub(crate) pending_rssi: Option<Completion<i16>>,
}

impl Device {
    pub(crate) fn new(id: DeviceId, discovery_seq: u64) -> Self {
        Self {
            id,
            name: None,
            rssi: None,
            advertising: HashMap::new(),
            services: Vec::new(),
            discovery_seq,
            connection: ConnectionLifecycle::new(),
            ops: CharacteristicOps::new(),
            pending_discover_services: None,
            pending_discover_characteristics: HashMap::new(),
            pending_rssi: None,
        }
    }

    pub(crate) fn id(&self) -> &DeviceId {
        &self.id
    }

    pub(crate) fn discovery_seq(&self) -> u64 {
        self.discovery_seq
    }

    pub(crate) fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    pub(crate) fn set_rssi(&mut self, rssi: i16) {
        self.rssi = Some(rssi);
    }

    pub(crate) fn services(&self) -> &[Service] {
        &self.services
    }

    /// Merge a sighting into this entry. Advertising keys are upserted,
    /// last-seen wins; absent keys keep their previous value.
    pub(crate) fn update_from_advertising(
        &mut self,
        name: Option<String>,
        rssi: Option<i16>,
        advertising: HashMap<String, Bytes>,
    ) {
        if name.is_some() {
            self.name = name;
        }
        if rssi.is_some() {
            self.rssi = rssi;
        }
        for (key, value) in advertising {
            self.advertising.insert(key, value);
        }
    }

    /// Replace the service arena wholesale after a service discovery.
    pub(crate) fn replace_services(&mut self, uuids: Vec<Uuid>) -> &[Service] {
        self.services = uuids
            .into_iter()
            .map(|uuid| Service {
                uuid,
                characteristics: Vec::new(),
            })
            .collect();
        &self.services
    }

    /// Replace one service's characteristics after a characteristic
    /// discovery. Returns `None` if the service is not in the arena.
    pub(crate) fn replace_characteristics(
        &mut self,
        service: Uuid,
        uuids: Vec<Uuid>,
    ) -> Option<&[Characteristic]> {
        let entry = self.services.iter_mut().find(|s| s.uuid == service)?;
        entry.characteristics = uuids
            .into_iter()
            .map(|uuid| Characteristic { uuid, service })
            .collect();
        Some(&entry.characteristics)
    }

    pub(crate) fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
            advertising: self.advertising.clone(),
            services: self.services.clone(),
            connection_state: self.connection.state(),
            watchdog_raised: self.connection.watchdog_raised(),
        }
    }

    /// Fail every pending operation on this device, the multiplexer slots
    /// included, with an error produced per callback.
    pub(crate) fn fail_all_pending(&mut self, mk: &dyn Fn() -> Error, out: &mut Vec<Deferred>) {
        if let Some(cb) = self.pending_discover_services.take() {
            out.push(defer(cb, Err(mk())));
        }
        for (_, cb) in self.pending_discover_characteristics.drain() {
            out.push(defer(cb, Err(mk())));
        }
        if let Some(cb) = self.pending_rssi.take() {
            out.push(defer(cb, Err(mk())));
        }
        self.ops.fail_all(mk, out);
    }
}
