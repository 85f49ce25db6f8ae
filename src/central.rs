//! The central coordinator.
//!
//! [`Central`] owns the adapter-ready state and the device registry, and
//! routes every inbound transport event to the matching device's connection
//! lifecycle or characteristic multiplexer. All mutation happens on one
//! event-loop task: caller commands and transport events drain through a
//! single `select!`, so no two events for the same device are ever processed
//! concurrently. Timers funnel back into the same loop as commands carrying
//! the attempt counter or session id captured at arm time.
//!
//! Caller-facing operations are non-blocking: they enqueue a command with a
//! boxed completion callback and return immediately. Callbacks are always
//! invoked with no internal lock held.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callback::{defer, CallbackHandle, Completion, Deferred, ValueListener};
use crate::connection::{Directive, DisconnectOutcome};
use crate::device::{Characteristic, Device, DeviceId, DeviceSnapshot, Service};
use crate::error::{Error, Result};
use crate::scan::{rank_by_signal, ScanOptions, ScanSession, ScanUpdateListener, SessionId};
use crate::transport::{ConnectOptions, DiscoveryOptions, Transport, TransportEvent};

/// Event emitted on the coordinator's broadcast channel.
#[derive(Debug, Clone)]
pub enum CentralEvent {
    /// The adapter-ready state was recomputed.
    AdapterStateChanged {
        /// Whether central-role operations are possible.
        ready: bool,
        /// Human-readable reason when not ready.
        reason: Option<String>,
    },
    /// A device was discovered or re-sighted.
    DeviceDiscovered {
        /// Snapshot of the changed device.
        device: DeviceSnapshot,
    },
    /// A connection was lost without a caller-initiated disconnect.
    DeviceLost {
        /// The device whose link dropped.
        id: DeviceId,
        /// Failure reason reported by the transport, if any.
        reason: Option<String>,
    },
}

/// Adapter-ready state, recomputed on every adapter-state event.
#[derive(Debug, Clone)]
struct AdapterStatus {
    ready: bool,
    reason: Option<String>,
}

impl AdapterStatus {
    fn unknown() -> Self {
        Self {
            ready: false,
            reason: Some("adapter state not yet known".to_string()),
        }
    }
}

/// The device registry plus the routing indices for events that carry a
/// service or characteristic identity instead of a device identity.
struct Registry {
    devices: HashMap<DeviceId, Device>,
    /// Creation-order counter; the stable tie-break for signal ranking.
    discovery_counter: u64,
    service_index: HashMap<Uuid, DeviceId>,
    characteristic_index: HashMap<Uuid, DeviceId>,
}

impl Registry {
    fn new() -> Self {
        Self {
            devices: HashMap::new(),
            discovery_counter: 0,
            service_index: HashMap::new(),
            characteristic_index: HashMap::new(),
        }
    }

    /// Create-or-get semantics: one entry per identifier, updated in place
    /// on later sightings.
    fn upsert(&mut self, id: &DeviceId) -> &mut Device {
        if !self.devices.contains_key(id) {
            self.discovery_counter += 1;
            self.devices
                .insert(id.clone(), Device::new(id.clone(), self.discovery_counter));
        }
        self.devices.get_mut(id).expect("just inserted")
    }

    /// All devices ranked descending by signal strength, discovery order as
    /// the tie-break.
    fn ranked_snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut items: Vec<(u64, Option<i16>, DeviceSnapshot)> = self
            .devices
            .values()
            .map(|dev| (dev.discovery_seq(), dev.rssi(), dev.snapshot()))
            .collect();
        items.sort_by_key(|(seq, _, _)| *seq);
        rank_by_signal(items.into_iter().map(|(_, rssi, snap)| (rssi, snap)).collect())
    }
}

/// Caller commands and timer firings, serialized into the event loop.
enum Command {
    StartScan {
        id: SessionId,
        options: ScanOptions,
        on_update: Option<ScanUpdateListener>,
        on_complete: Completion<Vec<DeviceSnapshot>>,
    },
    StopScan {
        id: SessionId,
    },
    ScanDeadline {
        id: SessionId,
    },
    Connect {
        device: DeviceId,
        timeout: Option<Duration>,
        on_complete: Completion<()>,
    },
    Watchdog {
        device: DeviceId,
        attempt: u64,
    },
    Disconnect {
        device: DeviceId,
        on_complete: Completion<()>,
    },
    DiscoverServices {
        device: DeviceId,
        filter: Vec<Uuid>,
        on_complete: Completion<Vec<Service>>,
    },
    DiscoverCharacteristics {
        device: DeviceId,
        service: Uuid,
        filter: Vec<Uuid>,
        on_complete: Completion<Vec<Characteristic>>,
    },
    Read {
        device: DeviceId,
        characteristic: Uuid,
        on_complete: Completion<Bytes>,
    },
    Write {
        device: DeviceId,
        characteristic: Uuid,
        value: Bytes,
        on_complete: Completion<()>,
    },
    SetNotify {
        device: DeviceId,
        characteristic: Uuid,
        enabled: bool,
        on_complete: Completion<()>,
        on_update: Option<ValueListener>,
    },
    ReadRssi {
        device: DeviceId,
        on_complete: Completion<i16>,
    },
    Shutdown {
        ack: Option<oneshot::Sender<()>>,
    },
}

/// Fail the completion embedded in a command that can no longer be
/// delivered to the event loop.
fn fail_command(command: Command) {
    match command {
        Command::StartScan { on_complete, .. } => on_complete(Err(Error::Shutdown)),
        Command::Connect { on_complete, .. } => on_complete(Err(Error::Shutdown)),
        Command::Disconnect { on_complete, .. } => on_complete(Err(Error::Shutdown)),
        Command::DiscoverServices { on_complete, .. } => on_complete(Err(Error::Shutdown)),
        Command::DiscoverCharacteristics { on_complete, .. } => on_complete(Err(Error::Shutdown)),
        Command::Read { on_complete, .. } => on_complete(Err(Error::Shutdown)),
        Command::Write { on_complete, .. } => on_complete(Err(Error::Shutdown)),
        Command::SetNotify { on_complete, .. } => on_complete(Err(Error::Shutdown)),
        Command::ReadRssi { on_complete, .. } => on_complete(Err(Error::Shutdown)),
        Command::Shutdown { ack } => {
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        Command::StopScan { .. } | Command::ScanDeadline { .. } | Command::Watchdog { .. } => {}
    }
}

fn run_deferred(out: Vec<Deferred>) {
    for deferred in out {
        deferred();
    }
}

/// Central-role session coordinator.
///
/// Explicitly constructed and explicitly torn down with [`Central::shutdown`];
/// there is no process-wide singleton.
pub struct Central {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<RwLock<Registry>>,
    adapter: Arc<RwLock<AdapterStatus>>,
    events_tx: broadcast::Sender<CentralEvent>,
    scanning: Arc<AtomicBool>,
    session_counter: AtomicU64,
    callback_counter: AtomicU64,
    loop_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl Central {
    /// Create a coordinator over a transport and its event stream.
    ///
    /// Spawns the event-loop task; requires a running tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(Registry::new()));
        let adapter = Arc::new(RwLock::new(AdapterStatus::unknown()));
        let (events_tx, _) = broadcast::channel(64);
        let scanning = Arc::new(AtomicBool::new(false));

        let event_loop = EventLoop {
            transport,
            commands: cmd_rx,
            transport_events,
            cmd_tx: cmd_tx.clone(),
            registry: registry.clone(),
            adapter: adapter.clone(),
            events_tx: events_tx.clone(),
            scanning: scanning.clone(),
            session: None,
        };
        let handle = tokio::spawn(event_loop.run());

        Self {
            commands: cmd_tx,
            registry,
            adapter,
            events_tx,
            scanning,
            session_counter: AtomicU64::new(0),
            callback_counter: AtomicU64::new(0),
            loop_handle: RwLock::new(Some(handle)),
        }
    }

    // === Adapter state ===

    /// Whether the adapter is ready for central-role operations.
    pub fn adapter_ready(&self) -> bool {
        self.adapter.read().ready
    }

    /// Human-readable reason the adapter is not ready, if it is not.
    pub fn adapter_not_ready_reason(&self) -> Option<String> {
        let status = self.adapter.read();
        if status.ready {
            None
        } else {
            status.reason.clone()
        }
    }

    // === Scanning ===

    /// Start a scan session. The completion receives the session's devices
    /// ranked descending by signal strength.
    ///
    /// At most one session is active: starting a new one completes the
    /// previous session with [`Error::ScanSuperseded`] first.
    pub fn start_scan<F>(&self, options: ScanOptions, on_complete: F) -> SessionId
    where
        F: FnOnce(Result<Vec<DeviceSnapshot>>) + Send + Sync + 'static,
    {
        self.submit_scan(options, None, Box::new(on_complete))
    }

    /// Start a scan session with an incremental-update callback, invoked
    /// with the single changed device on every discovery event.
    pub fn start_scan_with_updates<F, U>(
        &self,
        options: ScanOptions,
        on_update: U,
        on_complete: F,
    ) -> SessionId
    where
        F: FnOnce(Result<Vec<DeviceSnapshot>>) + Send + Sync + 'static,
        U: Fn(DeviceSnapshot) + Send + Sync + 'static,
    {
        self.submit_scan(options, Some(Arc::new(on_update)), Box::new(on_complete))
    }

    fn submit_scan(
        &self,
        options: ScanOptions,
        on_update: Option<ScanUpdateListener>,
        on_complete: Completion<Vec<DeviceSnapshot>>,
    ) -> SessionId {
        let id = SessionId(self.session_counter.fetch_add(1, Ordering::SeqCst) + 1);
        self.send(Command::StartScan {
            id,
            options,
            on_update,
            on_complete,
        });
        id
    }

    /// Stop a scan session. The session's completion receives the result
    /// list; stopping an inactive session is a no-op.
    pub fn stop_scan(&self, id: SessionId) {
        self.send(Command::StopScan { id });
    }

    /// Whether a scan session is currently active.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    // === Connection ===

    /// Connect to a device, waiting indefinitely for the transport.
    pub fn connect<F>(&self, device: DeviceId, on_complete: F)
    where
        F: FnOnce(Result<()>) + Send + Sync + 'static,
    {
        self.send(Command::Connect {
            device,
            timeout: None,
            on_complete: Box::new(on_complete),
        });
    }

    /// Connect to a device with a watchdog timeout. If the transport has
    /// not resolved the attempt when the watchdog fires, the attempt is
    /// torn down and the completion receives [`Error::ConnectionTimeout`].
    pub fn connect_with_timeout<F>(&self, device: DeviceId, timeout: Duration, on_complete: F)
    where
        F: FnOnce(Result<()>) + Send + Sync + 'static,
    {
        self.send(Command::Connect {
            device,
            timeout: Some(timeout),
            on_complete: Box::new(on_complete),
        });
    }

    /// Disconnect from a device.
    pub fn disconnect<F>(&self, device: DeviceId, on_complete: F)
    where
        F: FnOnce(Result<()>) + Send + Sync + 'static,
    {
        self.send(Command::Disconnect {
            device,
            on_complete: Box::new(on_complete),
        });
    }

    // === Discovery ===

    /// Discover a device's services. An empty filter discovers all.
    pub fn discover_services<F>(&self, device: DeviceId, filter: Vec<Uuid>, on_complete: F)
    where
        F: FnOnce(Result<Vec<Service>>) + Send + Sync + 'static,
    {
        self.send(Command::DiscoverServices {
            device,
            filter,
            on_complete: Box::new(on_complete),
        });
    }

    /// Discover a service's characteristics. An empty filter discovers all.
    pub fn discover_characteristics<F>(
        &self,
        device: DeviceId,
        service: Uuid,
        filter: Vec<Uuid>,
        on_complete: F,
    ) where
        F: FnOnce(Result<Vec<Characteristic>>) + Send + Sync + 'static,
    {
        self.send(Command::DiscoverCharacteristics {
            device,
            service,
            filter,
            on_complete: Box::new(on_complete),
        });
    }

    // === Characteristic operations ===

    /// Read a characteristic value.
    pub fn read<F>(&self, device: DeviceId, characteristic: Uuid, on_complete: F)
    where
        F: FnOnce(Result<Bytes>) + Send + Sync + 'static,
    {
        self.send(Command::Read {
            device,
            characteristic,
            on_complete: Box::new(on_complete),
        });
    }

    /// Write a characteristic value.
    pub fn write<F>(&self, device: DeviceId, characteristic: Uuid, value: Bytes, on_complete: F)
    where
        F: FnOnce(Result<()>) + Send + Sync + 'static,
    {
        self.send(Command::Write {
            device,
            characteristic,
            value,
            on_complete: Box::new(on_complete),
        });
    }

    /// Write a single octet to a characteristic.
    pub fn write_byte<F>(&self, device: DeviceId, characteristic: Uuid, byte: u8, on_complete: F)
    where
        F: FnOnce(Result<()>) + Send + Sync + 'static,
    {
        self.write(
            device,
            characteristic,
            Bytes::copy_from_slice(&[byte]),
            on_complete,
        );
    }

    /// Enable or disable notifications for a characteristic.
    pub fn set_notify<F>(
        &self,
        device: DeviceId,
        characteristic: Uuid,
        enabled: bool,
        on_complete: F,
    ) where
        F: FnOnce(Result<()>) + Send + Sync + 'static,
    {
        self.send(Command::SetNotify {
            device,
            characteristic,
            enabled,
            on_complete: Box::new(on_complete),
            on_update: None,
        });
    }

    /// Enable notifications with a persistent update listener, invoked on
    /// every pushed value until notifications are disabled or the device
    /// disconnects. Re-registering replaces the previous listener once the
    /// transport confirms.
    pub fn set_notify_with_updates<F, U>(
        &self,
        device: DeviceId,
        characteristic: Uuid,
        on_complete: F,
        on_update: U,
    ) where
        F: FnOnce(Result<()>) + Send + Sync + 'static,
        U: Fn(Result<Bytes>) + Send + Sync + 'static,
    {
        self.send(Command::SetNotify {
            device,
            characteristic,
            enabled: true,
            on_complete: Box::new(on_complete),
            on_update: Some(Arc::new(on_update)),
        });
    }

    /// Read a device's current signal strength (requires a connection).
    pub fn read_rssi<F>(&self, device: DeviceId, on_complete: F)
    where
        F: FnOnce(Result<i16>) + Send + Sync + 'static,
    {
        self.send(Command::ReadRssi {
            device,
            on_complete: Box::new(on_complete),
        });
    }

    // === Registry queries (no transport I/O) ===

    /// All known devices ranked descending by signal strength, ties broken
    /// by discovery order.
    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.registry.read().ranked_snapshots()
    }

    /// Look up one device.
    pub fn device(&self, id: &DeviceId) -> Option<DeviceSnapshot> {
        self.registry.read().devices.get(id).map(Device::snapshot)
    }

    /// Look up known devices by identifier, in the order given.
    pub fn retrieve_by_identifiers(&self, ids: &[DeviceId]) -> Vec<DeviceSnapshot> {
        let registry = self.registry.read();
        ids.iter()
            .filter_map(|id| registry.devices.get(id).map(Device::snapshot))
            .collect()
    }

    /// Connected devices whose discovered services include any of the given
    /// UUIDs (all connected devices when the list is empty).
    pub fn retrieve_connected_with_services(&self, services: &[Uuid]) -> Vec<DeviceSnapshot> {
        self.registry
            .read()
            .ranked_snapshots()
            .into_iter()
            .filter(|snap| snap.connection_state.is_connected())
            .filter(|snap| {
                services.is_empty()
                    || snap
                        .services
                        .iter()
                        .any(|service| services.contains(&service.uuid))
            })
            .collect()
    }

    // === Events ===

    /// Subscribe to coordinator events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CentralEvent> {
        self.events_tx.subscribe()
    }

    /// Register a callback for coordinator events.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(CentralEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.events_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    // === Teardown ===

    /// Tear the coordinator down: stops any active scan, fails every
    /// pending operation with [`Error::Shutdown`], and joins the event loop.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Shutdown { ack: Some(ack_tx) });
        let _ = ack_rx.await;

        let handle = self.loop_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn send(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            // Loop is gone; settle the embedded completion rather than
            // leaking it.
            fail_command(command);
        }
    }
}

impl Drop for Central {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown { ack: None });
    }
}

impl std::fmt::Debug for Central {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Central")
            .field("adapter_ready", &self.adapter_ready())
            .field("is_scanning", &self.is_scanning())
            .field("devices", &self.registry.read().devices.len())
            .finish()
    }
}

/// The single serialized event-processing task.
struct EventLoop {
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    registry: Arc<RwLock<Registry>>,
    adapter: Arc<RwLock<AdapterStatus>>,
    events_tx: broadcast::Sender<CentralEvent>,
    scanning: Arc<AtomicBool>,
    session: Option<ScanSession>,
}

impl EventLoop {
    async fn run(mut self) {
        debug!("central event loop started");
        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = self.transport_events.recv() => {
                    self.handle_transport_event(event).await;
                }
                else => {
                    self.teardown(None).await;
                    break;
                }
            }
        }
        debug!("central event loop ended");
    }

    /// Returns true when the loop should exit.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartScan {
                id,
                options,
                on_update,
                on_complete,
            } => self.handle_start_scan(id, options, on_update, on_complete).await,
            Command::StopScan { id } => self.handle_stop_scan(id).await,
            Command::ScanDeadline { id } => {
                if self.session.as_ref().map(ScanSession::id) == Some(id) {
                    debug!(session = ?id, "scan deadline reached");
                    let mut out = Vec::new();
                    self.finish_active_session(&mut out).await;
                    run_deferred(out);
                }
            }
            Command::Connect {
                device,
                timeout,
                on_complete,
            } => self.handle_connect(device, timeout, on_complete).await,
            Command::Watchdog { device, attempt } => self.handle_watchdog(device, attempt).await,
            Command::Disconnect {
                device,
                on_complete,
            } => self.handle_disconnect(device, on_complete).await,
            Command::DiscoverServices {
                device,
                filter,
                on_complete,
            } => self.handle_discover_services(device, filter, on_complete).await,
            Command::DiscoverCharacteristics {
                device,
                service,
                filter,
                on_complete,
            } => {
                self.handle_discover_characteristics(device, service, filter, on_complete)
                    .await
            }
            Command::Read {
                device,
                characteristic,
                on_complete,
            } => self.handle_read(device, characteristic, on_complete).await,
            Command::Write {
                device,
                characteristic,
                value,
                on_complete,
            } => {
                self.handle_write(device, characteristic, value, on_complete)
                    .await
            }
            Command::SetNotify {
                device,
                characteristic,
                enabled,
                on_complete,
                on_update,
            } => {
                self.handle_set_notify(device, characteristic, enabled, on_complete, on_update)
                    .await
            }
            Command::ReadRssi {
                device,
                on_complete,
            } => self.handle_read_rssi(device, on_complete).await,
            Command::Shutdown { ack } => {
                self.teardown(ack).await;
                return true;
            }
        }
        false
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceDiscovered {
                id,
                name,
                rssi,
                advertising,
            } => self.handle_device_discovered(id, name, rssi, advertising).await,
            TransportEvent::Connected { id, error } => self.handle_connected(id, error),
            TransportEvent::Disconnected { id, error } => self.handle_disconnected(id, error),
            TransportEvent::ServicesDiscovered {
                id,
                services,
                error,
            } => self.handle_services_discovered(id, services, error),
            TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                error,
            } => self.handle_characteristics_discovered(service, characteristics, error),
            TransportEvent::ValueUpdated {
                characteristic,
                value,
                error,
            } => self.handle_value_updated(characteristic, value, error),
            TransportEvent::ValueWritten {
                characteristic,
                error,
            } => self.handle_value_written(characteristic, error),
            TransportEvent::NotifyStateChanged {
                characteristic,
                error,
                ..
            } => self.handle_notify_state_changed(characteristic, error),
            TransportEvent::RssiUpdated { id, rssi, error } => {
                self.handle_rssi_updated(id, rssi, error)
            }
            TransportEvent::AdapterStateChanged { ready, reason } => {
                self.handle_adapter_state_changed(ready, reason)
            }
        }
    }

    // === Scanning ===

    async fn handle_start_scan(
        &mut self,
        id: SessionId,
        options: ScanOptions,
        on_update: Option<ScanUpdateListener>,
        on_complete: Completion<Vec<DeviceSnapshot>>,
    ) {
        let mut out = Vec::new();

        // At most one concurrent session: the previous one is settled as
        // superseded before the new one begins.
        if let Some(previous) = self.session.take() {
            debug!(superseded = ?previous.id(), "scan session superseded");
            self.scanning.store(false, Ordering::SeqCst);
            previous.complete(Err(Error::ScanSuperseded), &mut out);
            if let Err(e) = self.transport.stop_discovery().await {
                debug!("stop_discovery for superseded session failed: {e}");
            }
        }

        let status = self.adapter.read().clone();
        if !status.ready {
            let reason = status.reason.unwrap_or_else(|| "adapter unavailable".to_string());
            out.push(defer(on_complete, Err(Error::AdapterNotReady { reason })));
            run_deferred(out);
            return;
        }

        let discovery = DiscoveryOptions {
            allow_duplicates: true,
        };
        match self
            .transport
            .start_discovery(options.service_filter.clone(), discovery)
            .await
        {
            Ok(()) => {
                info!(session = ?id, "scan session started");
                self.session = Some(ScanSession::new(
                    id,
                    options.count_threshold,
                    on_update,
                    on_complete,
                ));
                self.scanning.store(true, Ordering::SeqCst);
                if let Some(duration) = options.duration {
                    self.arm_timer(duration, Command::ScanDeadline { id });
                }
            }
            Err(e) => {
                warn!("failed to start discovery: {e}");
                out.push(defer(on_complete, Err(e)));
            }
        }
        run_deferred(out);
    }

    async fn handle_stop_scan(&mut self, id: SessionId) {
        if self.session.as_ref().map(ScanSession::id) != Some(id) {
            debug!(session = ?id, "stop for inactive scan session, ignoring");
            return;
        }
        let mut out = Vec::new();
        self.finish_active_session(&mut out).await;
        run_deferred(out);
    }

    /// Stop discovery and settle the active session with its ranked result.
    async fn finish_active_session(&mut self, out: &mut Vec<Deferred>) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.scanning.store(false, Ordering::SeqCst);
        if let Err(e) = self.transport.stop_discovery().await {
            debug!("stop_discovery failed: {e}");
        }

        let result = {
            let registry = self.registry.read();
            let items: Vec<(Option<i16>, DeviceSnapshot)> = session
                .seen()
                .iter()
                .filter_map(|id| registry.devices.get(id))
                .map(|dev| (dev.rssi(), dev.snapshot()))
                .collect();
            rank_by_signal(items)
        };
        session.complete(Ok(result), out);
    }

    async fn handle_device_discovered(
        &mut self,
        id: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
        advertising: HashMap<String, Bytes>,
    ) {
        let mut out = Vec::new();
        let snapshot = {
            let mut registry = self.registry.write();
            let device = registry.upsert(&id);
            device.update_from_advertising(name, rssi, advertising);
            device.snapshot()
        };

        let _ = self.events_tx.send(CentralEvent::DeviceDiscovered {
            device: snapshot.clone(),
        });

        let mut threshold_reached = false;
        if let Some(session) = self.session.as_mut() {
            threshold_reached = session.note_discovered(&id);
            session.push_update(snapshot, &mut out);
        }
        if threshold_reached {
            debug!(%id, "device count threshold reached, stopping scan early");
            self.finish_active_session(&mut out).await;
        }
        run_deferred(out);
    }

    // === Connection ===

    async fn handle_connect(
        &mut self,
        id: DeviceId,
        timeout: Option<Duration>,
        on_complete: Completion<()>,
    ) {
        let mut out = Vec::new();

        let status = self.adapter.read().clone();
        if !status.ready {
            let reason = status.reason.unwrap_or_else(|| "adapter unavailable".to_string());
            out.push(defer(on_complete, Err(Error::AdapterNotReady { reason })));
            run_deferred(out);
            return;
        }

        let directive = {
            let mut registry = self.registry.write();
            match registry.devices.get_mut(&id) {
                Some(device) => device.connection.begin_connect(on_complete, &mut out),
                None => {
                    out.push(defer(
                        on_complete,
                        Err(Error::DeviceNotFound {
                            identifier: id.to_string(),
                        }),
                    ));
                    Directive::Settled
                }
            }
        };

        if let Directive::Issue { attempt } = directive {
            match self
                .transport
                .connect(id.clone(), ConnectOptions::default())
                .await
            {
                Ok(()) => {
                    info!(%id, attempt, "connect issued");
                    if let Some(timeout) = timeout {
                        self.arm_timer(
                            timeout,
                            Command::Watchdog {
                                device: id,
                                attempt,
                            },
                        );
                    }
                }
                Err(e) => {
                    let mut registry = self.registry.write();
                    if let Some(device) = registry.devices.get_mut(&id) {
                        device.connection.abort_connect(e, &mut out);
                    }
                }
            }
        }
        run_deferred(out);
    }

    async fn handle_watchdog(&mut self, id: DeviceId, attempt: u64) {
        let mut out = Vec::new();
        let teardown = {
            let mut registry = self.registry.write();
            registry
                .devices
                .get_mut(&id)
                .map(|device| device.connection.watchdog_fired(attempt, &mut out))
                .unwrap_or(false)
        };

        if teardown {
            warn!(%id, attempt, "connect watchdog fired, tearing attempt down");
            // Best effort; correctness does not depend on this landing.
            if let Err(e) = self.transport.disconnect(id).await {
                debug!("watchdog disconnect failed: {e}");
            }
        }
        run_deferred(out);
    }

    async fn handle_disconnect(&mut self, id: DeviceId, on_complete: Completion<()>) {
        let mut out = Vec::new();
        let directive = {
            let mut registry = self.registry.write();
            match registry.devices.get_mut(&id) {
                Some(device) => device.connection.begin_disconnect(on_complete, &mut out),
                None => {
                    out.push(defer(
                        on_complete,
                        Err(Error::DeviceNotFound {
                            identifier: id.to_string(),
                        }),
                    ));
                    Directive::Settled
                }
            }
        };

        if matches!(directive, Directive::Issue { .. }) {
            if let Err(e) = self.transport.disconnect(id.clone()).await {
                let mut registry = self.registry.write();
                if let Some(device) = registry.devices.get_mut(&id) {
                    device.connection.abort_disconnect(e, &mut out);
                }
            }
        }
        run_deferred(out);
    }

    fn handle_connected(&mut self, id: DeviceId, error: Option<String>) {
        let mut out = Vec::new();
        {
            let mut registry = self.registry.write();
            match registry.devices.get_mut(&id) {
                Some(device) => {
                    if !device.connection.handle_connected(error, &mut out) {
                        debug!(%id, "connected event with no attempt outstanding, dropping");
                    }
                }
                None => debug!(%id, "connected event for unknown device, dropping"),
            }
        }
        run_deferred(out);
    }

    fn handle_disconnected(&mut self, id: DeviceId, error: Option<String>) {
        let mut out = Vec::new();
        let outcome = {
            let mut registry = self.registry.write();
            let Some(device) = registry.devices.get_mut(&id) else {
                debug!(%id, "disconnected event for unknown device, dropping");
                return;
            };
            // Outstanding characteristic operations settle before the
            // device is fully disconnected.
            device.fail_all_pending(&|| Error::ConnectionLost, &mut out);
            device.connection.handle_disconnected(error.clone(), &mut out)
        };

        match outcome {
            DisconnectOutcome::Unsolicited => {
                info!(%id, "connection lost");
                let _ = self.events_tx.send(CentralEvent::DeviceLost { id, reason: error });
            }
            DisconnectOutcome::Stale => {
                debug!(%id, "disconnected event while already disconnected");
            }
            DisconnectOutcome::Requested | DisconnectOutcome::ConnectFailed => {}
        }
        run_deferred(out);
    }

    // === Discovery ===

    async fn handle_discover_services(
        &mut self,
        id: DeviceId,
        filter: Vec<Uuid>,
        on_complete: Completion<Vec<Service>>,
    ) {
        let mut out = Vec::new();
        let issue = {
            let mut registry = self.registry.write();
            match registry.devices.get_mut(&id) {
                None => {
                    out.push(defer(
                        on_complete,
                        Err(Error::DeviceNotFound {
                            identifier: id.to_string(),
                        }),
                    ));
                    false
                }
                Some(device) if !device.connection.state().is_connected() => {
                    out.push(defer(on_complete, Err(Error::usage("device not connected"))));
                    false
                }
                Some(device) if device.pending_discover_services.is_some() => {
                    out.push(defer(on_complete, Err(Error::in_flight("service discovery"))));
                    false
                }
                Some(device) => {
                    device.pending_discover_services = Some(on_complete);
                    true
                }
            }
        };

        if issue {
            if let Err(e) = self.transport.discover_services(id.clone(), filter).await {
                let mut registry = self.registry.write();
                if let Some(cb) = registry
                    .devices
                    .get_mut(&id)
                    .and_then(|device| device.pending_discover_services.take())
                {
                    out.push(defer(cb, Err(e)));
                }
            }
        }
        run_deferred(out);
    }

    async fn handle_discover_characteristics(
        &mut self,
        id: DeviceId,
        service: Uuid,
        filter: Vec<Uuid>,
        on_complete: Completion<Vec<Characteristic>>,
    ) {
        let mut out = Vec::new();
        let issue = {
            let mut registry = self.registry.write();
            match registry.devices.get_mut(&id) {
                None => {
                    out.push(defer(
                        on_complete,
                        Err(Error::DeviceNotFound {
                            identifier: id.to_string(),
                        }),
                    ));
                    false
                }
                Some(device) if !device.connection.state().is_connected() => {
                    out.push(defer(on_complete, Err(Error::usage("device not connected"))));
                    false
                }
                Some(device) if !device.services().iter().any(|s| s.uuid == service) => {
                    out.push(defer(
                        on_complete,
                        Err(Error::ServiceNotFound {
                            uuid: service.to_string(),
                        }),
                    ));
                    false
                }
                Some(device) if device.pending_discover_characteristics.contains_key(&service) => {
                    out.push(defer(
                        on_complete,
                        Err(Error::in_flight(format!(
                            "characteristic discovery on {service}"
                        ))),
                    ));
                    false
                }
                Some(device) => {
                    device
                        .pending_discover_characteristics
                        .insert(service, on_complete);
                    registry.service_index.insert(service, id.clone());
                    true
                }
            }
        };

        if issue {
            if let Err(e) = self
                .transport
                .discover_characteristics(id.clone(), service, filter)
                .await
            {
                let mut registry = self.registry.write();
                if let Some(cb) = registry
                    .devices
                    .get_mut(&id)
                    .and_then(|device| device.pending_discover_characteristics.remove(&service))
                {
                    out.push(defer(cb, Err(e)));
                }
            }
        }
        run_deferred(out);
    }

    fn handle_services_discovered(
        &mut self,
        id: DeviceId,
        services: Vec<Uuid>,
        error: Option<String>,
    ) {
        let mut out = Vec::new();
        {
            let mut registry = self.registry.write();
            let registry = &mut *registry;
            let Some(device) = registry.devices.get_mut(&id) else {
                debug!(%id, "services event for unknown device, dropping");
                return;
            };

            match error {
                Some(reason) => {
                    if let Some(cb) = device.pending_discover_services.take() {
                        out.push(defer(cb, Err(Error::transport(reason))));
                    }
                }
                None => {
                    registry.service_index.retain(|_, owner| owner != &id);
                    let discovered = device.replace_services(services).to_vec();
                    for service in &discovered {
                        registry.service_index.insert(service.uuid, id.clone());
                    }
                    match device.pending_discover_services.take() {
                        Some(cb) => out.push(defer(cb, Ok(discovered))),
                        None => debug!(%id, "unsolicited services update applied"),
                    }
                }
            }
        }
        run_deferred(out);
    }

    fn handle_characteristics_discovered(
        &mut self,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    ) {
        let mut out = Vec::new();
        {
            let mut registry = self.registry.write();
            let registry = &mut *registry;
            let Some(id) = registry.service_index.get(&service).cloned() else {
                debug!(%service, "characteristics event for unknown service, dropping");
                return;
            };
            let Some(device) = registry.devices.get_mut(&id) else {
                debug!(%service, "characteristics event for evicted device, dropping");
                return;
            };

            match error {
                Some(reason) => {
                    if let Some(cb) = device.pending_discover_characteristics.remove(&service) {
                        out.push(defer(cb, Err(Error::transport(reason))));
                    }
                }
                None => match device.replace_characteristics(service, characteristics) {
                    Some(discovered) => {
                        let discovered = discovered.to_vec();
                        for characteristic in &discovered {
                            registry
                                .characteristic_index
                                .insert(characteristic.uuid, id.clone());
                        }
                        if let Some(cb) = device.pending_discover_characteristics.remove(&service) {
                            out.push(defer(cb, Ok(discovered)));
                        }
                    }
                    None => {
                        if let Some(cb) = device.pending_discover_characteristics.remove(&service) {
                            out.push(defer(
                                cb,
                                Err(Error::ServiceNotFound {
                                    uuid: service.to_string(),
                                }),
                            ));
                        }
                    }
                },
            }
        }
        run_deferred(out);
    }

    // === Characteristic operations ===

    async fn handle_read(
        &mut self,
        id: DeviceId,
        characteristic: Uuid,
        on_complete: Completion<Bytes>,
    ) {
        let mut out = Vec::new();
        let issue = {
            let mut registry = self.registry.write();
            let registry = &mut *registry;
            match Self::admit_target(registry, &id, on_complete, &mut out) {
                Some((device, on_complete)) => {
                    let admitted = device.ops.begin_read(characteristic, on_complete, &mut out);
                    if admitted {
                        registry
                            .characteristic_index
                            .insert(characteristic, id.clone());
                    }
                    admitted
                }
                None => false,
            }
        };

        if issue {
            if let Err(e) = self
                .transport
                .read_characteristic(id.clone(), characteristic)
                .await
            {
                let mut registry = self.registry.write();
                if let Some(device) = registry.devices.get_mut(&id) {
                    device.ops.abort_read(characteristic, e, &mut out);
                }
            }
        }
        run_deferred(out);
    }

    async fn handle_write(
        &mut self,
        id: DeviceId,
        characteristic: Uuid,
        value: Bytes,
        on_complete: Completion<()>,
    ) {
        let mut out = Vec::new();
        let issue = {
            let mut registry = self.registry.write();
            let registry = &mut *registry;
            match Self::admit_target(registry, &id, on_complete, &mut out) {
                Some((device, on_complete)) => {
                    let admitted = device.ops.begin_write(characteristic, on_complete, &mut out);
                    if admitted {
                        registry
                            .characteristic_index
                            .insert(characteristic, id.clone());
                    }
                    admitted
                }
                None => false,
            }
        };

        if issue {
            if let Err(e) = self
                .transport
                .write_characteristic(id.clone(), characteristic, value)
                .await
            {
                let mut registry = self.registry.write();
                if let Some(device) = registry.devices.get_mut(&id) {
                    device.ops.abort_write(characteristic, e, &mut out);
                }
            }
        }
        run_deferred(out);
    }

    async fn handle_set_notify(
        &mut self,
        id: DeviceId,
        characteristic: Uuid,
        enabled: bool,
        on_complete: Completion<()>,
        on_update: Option<ValueListener>,
    ) {
        let mut out = Vec::new();
        let issue = {
            let mut registry = self.registry.write();
            let registry = &mut *registry;
            match Self::admit_target(registry, &id, on_complete, &mut out) {
                Some((device, on_complete)) => {
                    let admitted = device.ops.begin_notify(
                        characteristic,
                        enabled,
                        on_complete,
                        on_update,
                        &mut out,
                    );
                    if admitted {
                        registry
                            .characteristic_index
                            .insert(characteristic, id.clone());
                    }
                    admitted
                }
                None => false,
            }
        };

        if issue {
            if let Err(e) = self
                .transport
                .set_notify(id.clone(), characteristic, enabled)
                .await
            {
                let mut registry = self.registry.write();
                if let Some(device) = registry.devices.get_mut(&id) {
                    device.ops.abort_notify(characteristic, e, &mut out);
                }
            }
        }
        run_deferred(out);
    }

    /// Common admission for characteristic operations: the device must be
    /// known and connected. Returns the device together with the completion
    /// when admitted; otherwise the completion is settled with the failure.
    fn admit_target<'a, T: Send + 'static>(
        registry: &'a mut Registry,
        id: &DeviceId,
        on_complete: Completion<T>,
        out: &mut Vec<Deferred>,
    ) -> Option<(&'a mut Device, Completion<T>)> {
        match registry.devices.get_mut(id) {
            None => {
                out.push(defer(
                    on_complete,
                    Err(Error::DeviceNotFound {
                        identifier: id.to_string(),
                    }),
                ));
                None
            }
            Some(device) if !device.connection.state().is_connected() => {
                out.push(defer(on_complete, Err(Error::usage("device not connected"))));
                None
            }
            Some(device) => Some((device, on_complete)),
        }
    }

    fn handle_value_updated(&mut self, characteristic: Uuid, value: Bytes, error: Option<String>) {
        let mut out = Vec::new();
        {
            let mut registry = self.registry.write();
            let registry = &mut *registry;
            let Some(id) = registry.characteristic_index.get(&characteristic).cloned() else {
                debug!(%characteristic, "value update for unrouted characteristic, dropping");
                return;
            };
            let Some(device) = registry.devices.get_mut(&id) else {
                debug!(%characteristic, "value update for evicted device, dropping");
                return;
            };
            if !device
                .ops
                .handle_value_updated(characteristic, value, error, &mut out)
            {
                debug!(%characteristic, "value update with no pending read or listener, dropping");
            }
        }
        run_deferred(out);
    }

    fn handle_value_written(&mut self, characteristic: Uuid, error: Option<String>) {
        let mut out = Vec::new();
        {
            let mut registry = self.registry.write();
            let registry = &mut *registry;
            let Some(id) = registry.characteristic_index.get(&characteristic).cloned() else {
                debug!(%characteristic, "write ack for unrouted characteristic, dropping");
                return;
            };
            let Some(device) = registry.devices.get_mut(&id) else {
                return;
            };
            if !device.ops.handle_value_written(characteristic, error, &mut out) {
                debug!(%characteristic, "write ack with no pending write, dropping");
            }
        }
        run_deferred(out);
    }

    fn handle_notify_state_changed(&mut self, characteristic: Uuid, error: Option<String>) {
        let mut out = Vec::new();
        {
            let mut registry = self.registry.write();
            let registry = &mut *registry;
            let Some(id) = registry.characteristic_index.get(&characteristic).cloned() else {
                debug!(%characteristic, "notify state for unrouted characteristic, dropping");
                return;
            };
            let Some(device) = registry.devices.get_mut(&id) else {
                return;
            };
            if !device.ops.handle_notify_state(characteristic, error, &mut out) {
                debug!(%characteristic, "notify state with no pending notify-set, dropping");
            }
        }
        run_deferred(out);
    }

    async fn handle_read_rssi(&mut self, id: DeviceId, on_complete: Completion<i16>) {
        let mut out = Vec::new();
        let issue = {
            let mut registry = self.registry.write();
            match registry.devices.get_mut(&id) {
                None => {
                    out.push(defer(
                        on_complete,
                        Err(Error::DeviceNotFound {
                            identifier: id.to_string(),
                        }),
                    ));
                    false
                }
                Some(device) if !device.connection.state().is_connected() => {
                    out.push(defer(on_complete, Err(Error::usage("device not connected"))));
                    false
                }
                Some(device) if device.pending_rssi.is_some() => {
                    out.push(defer(on_complete, Err(Error::in_flight("rssi read"))));
                    false
                }
                Some(device) => {
                    device.pending_rssi = Some(on_complete);
                    true
                }
            }
        };

        if issue {
            if let Err(e) = self.transport.read_rssi(id.clone()).await {
                let mut registry = self.registry.write();
                if let Some(cb) = registry
                    .devices
                    .get_mut(&id)
                    .and_then(|device| device.pending_rssi.take())
                {
                    out.push(defer(cb, Err(e)));
                }
            }
        }
        run_deferred(out);
    }

    fn handle_rssi_updated(&mut self, id: DeviceId, rssi: i16, error: Option<String>) {
        let mut out = Vec::new();
        {
            let mut registry = self.registry.write();
            let Some(device) = registry.devices.get_mut(&id) else {
                debug!(%id, "rssi event for unknown device, dropping");
                return;
            };
            match error {
                Some(reason) => {
                    if let Some(cb) = device.pending_rssi.take() {
                        out.push(defer(cb, Err(Error::transport(reason))));
                    }
                }
                None => {
                    device.set_rssi(rssi);
                    if let Some(cb) = device.pending_rssi.take() {
                        out.push(defer(cb, Ok(rssi)));
                    }
                }
            }
        }
        run_deferred(out);
    }

    // === Adapter state ===

    fn handle_adapter_state_changed(&mut self, ready: bool, reason: Option<String>) {
        info!(ready, ?reason, "adapter state changed");
        *self.adapter.write() = AdapterStatus {
            ready,
            reason: reason.clone(),
        };
        let _ = self.events_tx.send(CentralEvent::AdapterStateChanged {
            ready,
            reason: reason.clone(),
        });

        if !ready {
            // The active session cannot make progress; settle it. Dropped
            // links surface through the transport's own disconnect events.
            if let Some(session) = self.session.take() {
                self.scanning.store(false, Ordering::SeqCst);
                let mut out = Vec::new();
                session.complete(
                    Err(Error::AdapterNotReady {
                        reason: reason.unwrap_or_else(|| "adapter unavailable".to_string()),
                    }),
                    &mut out,
                );
                run_deferred(out);
            }
        }
    }

    // === Teardown ===

    async fn teardown(&mut self, ack: Option<oneshot::Sender<()>>) {
        info!("shutting down central coordinator");
        let mut out = Vec::new();

        if let Some(session) = self.session.take() {
            self.scanning.store(false, Ordering::SeqCst);
            session.complete(Err(Error::Shutdown), &mut out);
            if let Err(e) = self.transport.stop_discovery().await {
                debug!("stop_discovery during shutdown failed: {e}");
            }
        }

        let connected: Vec<DeviceId> = {
            let mut registry = self.registry.write();
            let mut connected = Vec::new();
            for device in registry.devices.values_mut() {
                if device.connection.state().is_connected() {
                    connected.push(device.id().clone());
                }
                device.fail_all_pending(&|| Error::Shutdown, &mut out);
                device.connection.fail_pending(&|| Error::Shutdown, &mut out);
            }
            connected
        };
        run_deferred(out);

        for id in connected {
            if let Err(e) = self.transport.disconnect(id.clone()).await {
                warn!(%id, "disconnect during shutdown failed: {e}");
            }
        }

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn arm_timer(&self, delay: Duration, command: Command) {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Firing after the loop is gone (or stale) is a no-op.
            let _ = tx.send(command);
        });
    }
}
