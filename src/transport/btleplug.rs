//! Real transport over btleplug.
//!
//! Bridges btleplug's adapter event stream and peripheral operations onto
//! the [`Transport`] boundary: outbound calls spawn the btleplug operation
//! and synthesize the corresponding completion event; a bridge task maps
//! adapter events to discovery/disconnect/adapter-state events; one
//! notification pump per connected peripheral feeds value updates.

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::transport::{ConnectOptions, DiscoveryOptions, Transport, TransportEvent};

/// Advertising payload key for a manufacturer-data entry.
fn manufacturer_key(id: u16) -> String {
    format!("mfr:{id:04x}")
}

/// Advertising payload key for a service-data entry.
fn service_key(uuid: Uuid) -> String {
    format!("svc:{uuid}")
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::from(id.to_string())
}

/// [`Transport`] implementation backed by the platform's btleplug adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Peripheral handles cached at discovery time.
    peripherals: Arc<RwLock<HashMap<DeviceId, Peripheral>>>,
    /// Characteristic handles cached at service discovery time.
    characteristics: Arc<RwLock<HashMap<Uuid, (DeviceId, btleplug::api::Characteristic)>>>,
    /// One notification pump per connected peripheral.
    notify_pumps: Arc<RwLock<HashMap<DeviceId, tokio::task::JoinHandle<()>>>>,
    bridge_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Acquire the first Bluetooth adapter and start the event bridge.
    ///
    /// Returns the transport together with the event stream to hand to
    /// [`crate::Central::new`].
    pub async fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(Error::AdapterNotReady {
            reason: "no Bluetooth adapters found".to_string(),
        })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            adapter,
            events_tx: events_tx.clone(),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            notify_pumps: Arc::new(RwLock::new(HashMap::new())),
            bridge_handle: RwLock::new(None),
        });

        let handle = tokio::spawn(Self::bridge(
            transport.adapter.clone(),
            transport.peripherals.clone(),
            transport.notify_pumps.clone(),
            events_tx.clone(),
        ));
        *transport.bridge_handle.write() = Some(handle);

        // An adapter handle only exists for a usable radio; later
        // StateUpdate events recompute readiness.
        let _ = events_tx.send(TransportEvent::AdapterStateChanged {
            ready: true,
            reason: None,
        });

        Ok((transport, events_rx))
    }

    /// Map adapter events onto the transport boundary.
    async fn bridge(
        adapter: Adapter,
        peripherals: Arc<RwLock<HashMap<DeviceId, Peripheral>>>,
        notify_pumps: Arc<RwLock<HashMap<DeviceId, tokio::task::JoinHandle<()>>>>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("failed to get adapter events: {e}");
                return;
            }
        };

        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                | CentralEvent::ServiceDataAdvertisement { id, .. }
                | CentralEvent::ServicesAdvertisement { id, .. } => {
                    Self::process_peripheral(&adapter, id, &peripherals, &events_tx).await;
                }
                CentralEvent::DeviceConnected(id) => {
                    // Connect completions are synthesized by the connect
                    // call itself; the adapter-level event would duplicate
                    // them.
                    trace!("device connected: {id:?}");
                }
                CentralEvent::DeviceDisconnected(id) => {
                    let device = device_id(&id);
                    debug!(%device, "device disconnected");
                    if let Some(pump) = notify_pumps.write().remove(&device) {
                        pump.abort();
                    }
                    let _ = events_tx.send(TransportEvent::Disconnected {
                        id: device,
                        error: None,
                    });
                }
                CentralEvent::StateUpdate(state) => {
                    let (ready, reason) = match state {
                        CentralState::PoweredOn => (true, None),
                        CentralState::PoweredOff => {
                            (false, Some("adapter powered off".to_string()))
                        }
                        _ => (false, Some("adapter state unknown".to_string())),
                    };
                    let _ = events_tx.send(TransportEvent::AdapterStateChanged { ready, reason });
                }
            }
        }

        debug!("adapter event bridge ended");
    }

    /// Resolve a peripheral sighting into a discovery event.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &Arc<RwLock<HashMap<DeviceId, Peripheral>>>,
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("failed to get peripheral: {e}");
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let device = device_id(&id);
        peripherals.write().insert(device.clone(), peripheral);

        let mut advertising = HashMap::new();
        for (manufacturer, data) in properties.manufacturer_data {
            advertising.insert(manufacturer_key(manufacturer), Bytes::from(data));
        }
        for (uuid, data) in properties.service_data {
            advertising.insert(service_key(uuid), Bytes::from(data));
        }

        let _ = events_tx.send(TransportEvent::DeviceDiscovered {
            id: device,
            name: properties.local_name,
            rssi: properties.rssi,
            advertising,
        });
    }

    fn peripheral(&self, device: &DeviceId) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(device)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: device.to_string(),
            })
    }

    fn characteristic(
        &self,
        characteristic: Uuid,
    ) -> Result<(DeviceId, btleplug::api::Characteristic)> {
        self.characteristics
            .read()
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })
    }

    /// Start the notification pump for a connected peripheral.
    async fn start_notify_pump(
        device: DeviceId,
        peripheral: &Peripheral,
        notify_pumps: &Arc<RwLock<HashMap<DeviceId, tokio::task::JoinHandle<()>>>>,
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%device, "failed to get notifications stream: {e}");
                return;
            }
        };

        let events_tx = events_tx.clone();
        let pump_device = device.clone();
        let handle = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(notification) = stream.next().await {
                trace!(
                    %pump_device,
                    characteristic = %notification.uuid,
                    len = notification.value.len(),
                    "notification"
                );
                let _ = events_tx.send(TransportEvent::ValueUpdated {
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                    error: None,
                });
            }
        });

        if let Some(previous) = notify_pumps.write().insert(device, handle) {
            previous.abort();
        }
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn start_discovery(&self, filter: Vec<Uuid>, _options: DiscoveryOptions) -> Result<()> {
        info!("starting BLE discovery");
        self.adapter
            .start_scan(ScanFilter { services: filter })
            .await?;
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        info!("stopping BLE discovery");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device: DeviceId, _options: ConnectOptions) -> Result<()> {
        let peripheral = self.peripheral(&device)?;
        let events_tx = self.events_tx.clone();
        let notify_pumps = self.notify_pumps.clone();

        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    Self::start_notify_pump(device.clone(), &peripheral, &notify_pumps, &events_tx)
                        .await;
                    let _ = events_tx.send(TransportEvent::Connected {
                        id: device,
                        error: None,
                    });
                }
                Err(e) => {
                    let _ = events_tx.send(TransportEvent::Connected {
                        id: device,
                        error: Some(e.to_string()),
                    });
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, device: DeviceId) -> Result<()> {
        let peripheral = self.peripheral(&device)?;
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                let _ = events_tx.send(TransportEvent::Disconnected {
                    id: device,
                    error: Some(e.to_string()),
                });
            }
            // The success event arrives through the adapter bridge.
        });
        Ok(())
    }

    async fn discover_services(&self, device: DeviceId, filter: Vec<Uuid>) -> Result<()> {
        let peripheral = self.peripheral(&device)?;
        let events_tx = self.events_tx.clone();
        let characteristics = self.characteristics.clone();

        tokio::spawn(async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    let mut services = Vec::new();
                    {
                        let mut cache = characteristics.write();
                        for service in peripheral.services() {
                            if !filter.is_empty() && !filter.contains(&service.uuid) {
                                continue;
                            }
                            services.push(service.uuid);
                            for characteristic in service.characteristics {
                                cache.insert(
                                    characteristic.uuid,
                                    (device.clone(), characteristic),
                                );
                            }
                        }
                    }
                    debug!(%device, count = services.len(), "services discovered");
                    let _ = events_tx.send(TransportEvent::ServicesDiscovered {
                        id: device,
                        services,
                        error: None,
                    });
                }
                Err(e) => {
                    let _ = events_tx.send(TransportEvent::ServicesDiscovered {
                        id: device,
                        services: Vec::new(),
                        error: Some(e.to_string()),
                    });
                }
            }
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        device: DeviceId,
        service: Uuid,
        filter: Vec<Uuid>,
    ) -> Result<()> {
        let peripheral = self.peripheral(&device)?;

        // btleplug discovers the whole GATT table up front; answer from the
        // peripheral's cache.
        let event = match peripheral.services().into_iter().find(|s| s.uuid == service) {
            Some(found) => {
                let mut uuids = Vec::new();
                let mut cache = self.characteristics.write();
                for characteristic in found.characteristics {
                    if !filter.is_empty() && !filter.contains(&characteristic.uuid) {
                        continue;
                    }
                    uuids.push(characteristic.uuid);
                    cache.insert(characteristic.uuid, (device.clone(), characteristic));
                }
                TransportEvent::CharacteristicsDiscovered {
                    service,
                    characteristics: uuids,
                    error: None,
                }
            }
            None => TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics: Vec::new(),
                error: Some(format!("service {service} not discovered")),
            },
        };
        let _ = self.events_tx.send(event);
        Ok(())
    }

    async fn read_characteristic(&self, device: DeviceId, characteristic: Uuid) -> Result<()> {
        let peripheral = self.peripheral(&device)?;
        let (_, handle) = self.characteristic(characteristic)?;
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let event = match peripheral.read(&handle).await {
                Ok(value) => TransportEvent::ValueUpdated {
                    characteristic,
                    value: Bytes::from(value),
                    error: None,
                },
                Err(e) => TransportEvent::ValueUpdated {
                    characteristic,
                    value: Bytes::new(),
                    error: Some(e.to_string()),
                },
            };
            let _ = events_tx.send(event);
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        device: DeviceId,
        characteristic: Uuid,
        value: Bytes,
    ) -> Result<()> {
        let peripheral = self.peripheral(&device)?;
        let (_, handle) = self.characteristic(characteristic)?;
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let error = peripheral
                .write(&handle, &value, WriteType::WithResponse)
                .await
                .err()
                .map(|e| e.to_string());
            let _ = events_tx.send(TransportEvent::ValueWritten {
                characteristic,
                error,
            });
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        device: DeviceId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        let peripheral = self.peripheral(&device)?;
        let (_, handle) = self.characteristic(characteristic)?;
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&handle).await
            } else {
                peripheral.unsubscribe(&handle).await
            };
            let _ = events_tx.send(TransportEvent::NotifyStateChanged {
                characteristic,
                enabled,
                error: result.err().map(|e| e.to_string()),
            });
        });
        Ok(())
    }

    async fn read_rssi(&self, device: DeviceId) -> Result<()> {
        let peripheral = self.peripheral(&device)?;
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            let event = match peripheral.properties().await {
                Ok(Some(properties)) => match properties.rssi {
                    Some(rssi) => TransportEvent::RssiUpdated {
                        id: device,
                        rssi,
                        error: None,
                    },
                    None => TransportEvent::RssiUpdated {
                        id: device,
                        rssi: 0,
                        error: Some("rssi unavailable".to_string()),
                    },
                },
                Ok(None) => TransportEvent::RssiUpdated {
                    id: device,
                    rssi: 0,
                    error: Some("peripheral properties unavailable".to_string()),
                },
                Err(e) => TransportEvent::RssiUpdated {
                    id: device,
                    rssi: 0,
                    error: Some(e.to_string()),
                },
            };
            let _ = events_tx.send(event);
        });
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.bridge_handle.write().take() {
            handle.abort();
        }
        for (_, pump) in self.notify_pumps.write().drain() {
            pump.abort();
        }
    }
}
