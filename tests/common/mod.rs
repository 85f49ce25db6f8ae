//! Shared harness for integration tests: a mock transport that records
//! outbound calls, plus callback-capture helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use mockall::mock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use ble_central::{
    Central, ConnectOptions, DeviceId, DiscoveryOptions, Result, Transport, TransportEvent,
};

/// One recorded outbound transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartDiscovery(Vec<Uuid>),
    StopDiscovery,
    Connect(DeviceId),
    Disconnect(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId, Uuid),
    Read(Uuid),
    Write(Uuid, Bytes),
    SetNotify(Uuid, bool),
    ReadRssi(DeviceId),
}

mock! {
    pub Radio {}

    #[async_trait]
    impl Transport for Radio {
        async fn start_discovery(&self, filter: Vec<Uuid>, options: DiscoveryOptions) -> Result<()>;
        async fn stop_discovery(&self) -> Result<()>;
        async fn connect(&self, device: DeviceId, options: ConnectOptions) -> Result<()>;
        async fn disconnect(&self, device: DeviceId) -> Result<()>;
        async fn discover_services(&self, device: DeviceId, filter: Vec<Uuid>) -> Result<()>;
        async fn discover_characteristics(
            &self,
            device: DeviceId,
            service: Uuid,
            filter: Vec<Uuid>,
        ) -> Result<()>;
        async fn read_characteristic(&self, device: DeviceId, characteristic: Uuid) -> Result<()>;
        async fn write_characteristic(
            &self,
            device: DeviceId,
            characteristic: Uuid,
            value: Bytes,
        ) -> Result<()>;
        async fn set_notify(&self, device: DeviceId, characteristic: Uuid, enabled: bool) -> Result<()>;
        async fn read_rssi(&self, device: DeviceId) -> Result<()>;
    }
}

/// Coordinator under test, wired to a recording mock transport.
pub struct Harness {
    pub central: Central,
    events: mpsc::UnboundedSender<TransportEvent>,
    calls: mpsc::UnboundedReceiver<Call>,
}

impl Harness {
    /// Build the harness. The mock accepts every call, records it, and
    /// returns submission success; completions are injected by the test
    /// through [`Harness::send`].
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let mut mock = MockRadio::new();

        let tx = calls_tx.clone();
        mock.expect_start_discovery().returning(move |filter, _| {
            let _ = tx.send(Call::StartDiscovery(filter));
            Ok(())
        });
        let tx = calls_tx.clone();
        mock.expect_stop_discovery().returning(move || {
            let _ = tx.send(Call::StopDiscovery);
            Ok(())
        });
        let tx = calls_tx.clone();
        mock.expect_connect().returning(move |device, _| {
            let _ = tx.send(Call::Connect(device));
            Ok(())
        });
        let tx = calls_tx.clone();
        mock.expect_disconnect().returning(move |device| {
            let _ = tx.send(Call::Disconnect(device));
            Ok(())
        });
        let tx = calls_tx.clone();
        mock.expect_discover_services().returning(move |device, _| {
            let _ = tx.send(Call::DiscoverServices(device));
            Ok(())
        });
        let tx = calls_tx.clone();
        mock.expect_discover_characteristics()
            .returning(move |device, service, _| {
                let _ = tx.send(Call::DiscoverCharacteristics(device, service));
                Ok(())
            });
        let tx = calls_tx.clone();
        mock.expect_read_characteristic()
            .returning(move |_, characteristic| {
                let _ = tx.send(Call::Read(characteristic));
                Ok(())
            });
        let tx = calls_tx.clone();
        mock.expect_write_characteristic()
            .returning(move |_, characteristic, value| {
                let _ = tx.send(Call::Write(characteristic, value));
                Ok(())
            });
        let tx = calls_tx.clone();
        mock.expect_set_notify()
            .returning(move |_, characteristic, enabled| {
                let _ = tx.send(Call::SetNotify(characteristic, enabled));
                Ok(())
            });
        let tx = calls_tx.clone();
        mock.expect_read_rssi().returning(move |device| {
            let _ = tx.send(Call::ReadRssi(device));
            Ok(())
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let central = Central::new(Arc::new(mock), events_rx);

        Self {
            central,
            events: events_tx,
            calls: calls_rx,
        }
    }

    /// Inject a transport event.
    pub fn send(&self, event: TransportEvent) {
        self.events.send(event).expect("event loop gone");
    }

    /// Report the adapter as ready.
    pub fn power_on(&self) {
        self.send(TransportEvent::AdapterStateChanged {
            ready: true,
            reason: None,
        });
    }

    /// Inject a discovery sighting.
    pub fn discover(&self, id: &str, rssi: i16) {
        self.send(TransportEvent::DeviceDiscovered {
            id: DeviceId::from(id),
            name: None,
            rssi: Some(rssi),
            advertising: HashMap::new(),
        });
    }

    /// Await the next recorded outbound call.
    pub async fn expect_call(&mut self) -> Call {
        tokio::time::timeout(Duration::from_secs(1), self.calls.recv())
            .await
            .expect("timed out waiting for a transport call")
            .expect("transport call channel closed")
    }

    /// Assert that no outbound call is pending once the loop has settled.
    pub async fn expect_no_call(&mut self) {
        self.settle().await;
        if let Ok(call) = self.calls.try_recv() {
            panic!("unexpected transport call: {call:?}");
        }
    }

    /// Let the event loop drain everything already enqueued.
    ///
    /// Commands and events ride separate channels, so an event-channel
    /// sentinel alone is not a full barrier; the yield loop lets the
    /// single-threaded loop task run until it is idle.
    pub async fn settle(&self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    /// Wait until a registry-visible condition holds.
    pub async fn wait_until(&self, what: &str, condition: impl Fn(&Central) -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !condition(&self.central) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("condition not reached: {what}"));
    }
}

/// Discover and connect a device, leaving it `Connected`.
pub async fn bring_up(harness: &mut Harness, id: &str) -> DeviceId {
    let device = DeviceId::from(id);
    harness.power_on();
    harness.discover(id, -50);
    harness
        .wait_until("device registered", |central| {
            central.device(&device).is_some()
        })
        .await;

    let (on_complete, rx) = completion();
    harness.central.connect(device.clone(), on_complete);
    assert_eq!(harness.expect_call().await, Call::Connect(device.clone()));
    harness.send(TransportEvent::Connected {
        id: device.clone(),
        error: None,
    });
    resolved(rx).await.expect("connect failed");
    device
}

/// Build a one-shot completion callback and the receiver for its result.
pub fn completion<T: Send + 'static>() -> (
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

/// Await a completion result, failing the test on timeout.
pub async fn resolved<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("timed out waiting for completion")
        .expect("completion dropped without being invoked")
}

/// Build a persistent update listener recording everything it receives.
pub fn collector() -> (
    impl Fn(Result<Bytes>) + Send + Sync + 'static,
    Arc<Mutex<Vec<Result<Bytes>>>>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (
        move |result| {
            sink.lock().unwrap().push(result);
        },
        seen,
    )
}
