//! Characteristic multiplexer: single-flight admission, demultiplexing,
//! notify streams, error propagation.

mod common;

use bytes::Bytes;
use common::{bring_up, collector, completion, resolved, Call, Harness};
use pretty_assertions::assert_eq;
use uuid::Uuid;

use ble_central::{DeviceId, Error, TransportEvent};

const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x2a19);
const HEART_RATE: Uuid = Uuid::from_u128(0x2a37);

#[tokio::test]
async fn read_resolves_with_the_value_update() {
    let mut harness = Harness::new();
    let device = bring_up(&mut harness, "a").await;

    let (on_complete, rx) = completion();
    harness.central.read(device, BATTERY_LEVEL, on_complete);
    assert_eq!(harness.expect_call().await, Call::Read(BATTERY_LEVEL));

    harness.send(TransportEvent::ValueUpdated {
        characteristic: BATTERY_LEVEL,
        value: Bytes::from_static(&[87]),
        error: None,
    });

    assert_eq!(resolved(rx).await.unwrap(), Bytes::from_static(&[87]));
}

#[tokio::test]
async fn second_read_fails_fast_and_first_is_unaffected() {
    let mut harness = Harness::new();
    let device = bring_up(&mut harness, "a").await;

    let (first_complete, first_rx) = completion();
    harness
        .central
        .read(device.clone(), BATTERY_LEVEL, first_complete);
    assert_eq!(harness.expect_call().await, Call::Read(BATTERY_LEVEL));

    let (second_complete, second_rx) = completion();
    harness
        .central
        .read(device.clone(), BATTERY_LEVEL, second_complete);
    assert!(matches!(
        resolved(second_rx).await,
        Err(Error::OperationAlreadyInFlight { .. })
    ));
    // No second transport read was issued.
    harness.expect_no_call().await;

    harness.send(TransportEvent::ValueUpdated {
        characteristic: BATTERY_LEVEL,
        value: Bytes::from_static(&[42]),
        error: None,
    });
    assert_eq!(resolved(first_rx).await.unwrap(), Bytes::from_static(&[42]));
}

#[tokio::test]
async fn write_round_trip_and_byte_variant() {
    let mut harness = Harness::new();
    let device = bring_up(&mut harness, "a").await;

    let (on_complete, rx) = completion();
    harness.central.write(
        device.clone(),
        BATTERY_LEVEL,
        Bytes::from_static(&[1, 2, 3]),
        on_complete,
    );
    assert_eq!(
        harness.expect_call().await,
        Call::Write(BATTERY_LEVEL, Bytes::from_static(&[1, 2, 3]))
    );
    harness.send(TransportEvent::ValueWritten {
        characteristic: BATTERY_LEVEL,
        error: None,
    });
    assert!(resolved(rx).await.is_ok());

    // The single-octet convenience is the same write path.
    let (on_complete, rx) = completion();
    harness
        .central
        .write_byte(device, BATTERY_LEVEL, 0x2a, on_complete);
    assert_eq!(
        harness.expect_call().await,
        Call::Write(BATTERY_LEVEL, Bytes::from_static(&[0x2a]))
    );
    harness.send(TransportEvent::ValueWritten {
        characteristic: BATTERY_LEVEL,
        error: None,
    });
    assert!(resolved(rx).await.is_ok());
}

#[tokio::test]
async fn notify_completes_once_and_streams_every_update() {
    let mut harness = Harness::new();
    let device = bring_up(&mut harness, "a").await;

    let (on_update, seen) = collector();
    let (on_complete, rx) = completion();
    harness
        .central
        .set_notify_with_updates(device, HEART_RATE, on_complete, on_update);
    assert_eq!(
        harness.expect_call().await,
        Call::SetNotify(HEART_RATE, true)
    );

    harness.send(TransportEvent::NotifyStateChanged {
        characteristic: HEART_RATE,
        enabled: true,
        error: None,
    });
    assert!(resolved(rx).await.is_ok());

    for beat in [60u8, 61, 62] {
        harness.send(TransportEvent::ValueUpdated {
            characteristic: HEART_RATE,
            value: Bytes::copy_from_slice(&[beat]),
            error: None,
        });
    }
    harness
        .wait_until("three updates", |_| seen.lock().unwrap().len() == 3)
        .await;

    let beats: Vec<u8> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.as_ref().unwrap()[0])
        .collect();
    assert_eq!(beats, vec![60, 61, 62]);
}

#[tokio::test]
async fn pending_read_and_notify_listener_both_receive_one_event() {
    let mut harness = Harness::new();
    let device = bring_up(&mut harness, "a").await;

    let (on_update, seen) = collector();
    let (notify_complete, notify_rx) = completion();
    harness.central.set_notify_with_updates(
        device.clone(),
        HEART_RATE,
        notify_complete,
        on_update,
    );
    assert_eq!(
        harness.expect_call().await,
        Call::SetNotify(HEART_RATE, true)
    );
    harness.send(TransportEvent::NotifyStateChanged {
        characteristic: HEART_RATE,
        enabled: true,
        error: None,
    });
    assert!(resolved(notify_rx).await.is_ok());

    let (read_complete, read_rx) = completion();
    harness.central.read(device, HEART_RATE, read_complete);
    assert_eq!(harness.expect_call().await, Call::Read(HEART_RATE));

    harness.send(TransportEvent::ValueUpdated {
        characteristic: HEART_RATE,
        value: Bytes::from_static(&[99]),
        error: None,
    });

    // One event, two registrations: the one-shot read resolves and the
    // persistent listener also sees the value.
    assert_eq!(resolved(read_rx).await.unwrap(), Bytes::from_static(&[99]));
    harness
        .wait_until("listener saw the value", |_| seen.lock().unwrap().len() == 1)
        .await;

    // Subsequent pushes reach only the listener.
    harness.send(TransportEvent::ValueUpdated {
        characteristic: HEART_RATE,
        value: Bytes::from_static(&[100]),
        error: None,
    });
    harness
        .wait_until("listener saw the push", |_| seen.lock().unwrap().len() == 2)
        .await;
}

#[tokio::test]
async fn disabling_notifications_clears_the_listener() {
    let mut harness = Harness::new();
    let device = bring_up(&mut harness, "a").await;

    let (on_update, seen) = collector();
    let (enable_complete, enable_rx) = completion();
    harness.central.set_notify_with_updates(
        device.clone(),
        HEART_RATE,
        enable_complete,
        on_update,
    );
    harness.expect_call().await;
    harness.send(TransportEvent::NotifyStateChanged {
        characteristic: HEART_RATE,
        enabled: true,
        error: None,
    });
    assert!(resolved(enable_rx).await.is_ok());

    let (disable_complete, disable_rx) = completion();
    harness
        .central
        .set_notify(device, HEART_RATE, false, disable_complete);
    assert_eq!(
        harness.expect_call().await,
        Call::SetNotify(HEART_RATE, false)
    );
    harness.send(TransportEvent::NotifyStateChanged {
        characteristic: HEART_RATE,
        enabled: false,
        error: None,
    });
    assert!(resolved(disable_rx).await.is_ok());

    // Pushes after disable are dropped with a diagnostic, not delivered.
    harness.send(TransportEvent::ValueUpdated {
        characteristic: HEART_RATE,
        value: Bytes::from_static(&[1]),
        error: None,
    });
    harness.settle().await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn second_notify_set_while_pending_fails_fast() {
    let mut harness = Harness::new();
    let device = bring_up(&mut harness, "a").await;

    let (first_complete, first_rx) = completion();
    harness
        .central
        .set_notify(device.clone(), HEART_RATE, true, first_complete);
    harness.expect_call().await;

    let (second_complete, second_rx) = completion();
    harness
        .central
        .set_notify(device, HEART_RATE, true, second_complete);
    assert!(matches!(
        resolved(second_rx).await,
        Err(Error::OperationAlreadyInFlight { .. })
    ));

    harness.send(TransportEvent::NotifyStateChanged {
        characteristic: HEART_RATE,
        enabled: true,
        error: None,
    });
    assert!(resolved(first_rx).await.is_ok());
}

#[tokio::test]
async fn transport_failures_arrive_through_the_same_callbacks() {
    let mut harness = Harness::new();
    let device = bring_up(&mut harness, "a").await;

    let (read_complete, read_rx) = completion();
    harness
        .central
        .read(device.clone(), BATTERY_LEVEL, read_complete);
    harness.expect_call().await;
    harness.send(TransportEvent::ValueUpdated {
        characteristic: BATTERY_LEVEL,
        value: Bytes::new(),
        error: Some("attribute not readable".to_string()),
    });
    match resolved(read_rx).await {
        Err(Error::TransportFailure { reason }) => assert_eq!(reason, "attribute not readable"),
        other => panic!("expected TransportFailure, got {other:?}"),
    }

    let (write_complete, write_rx) = completion();
    harness.central.write(
        device.clone(),
        BATTERY_LEVEL,
        Bytes::from_static(&[0]),
        write_complete,
    );
    harness.expect_call().await;
    harness.send(TransportEvent::ValueWritten {
        characteristic: BATTERY_LEVEL,
        error: Some("attribute not writable".to_string()),
    });
    assert!(matches!(
        resolved(write_rx).await,
        Err(Error::TransportFailure { .. })
    ));

    // A rejected subscription installs no listener.
    let (on_update, seen) = collector();
    let (notify_complete, notify_rx) = completion();
    harness
        .central
        .set_notify_with_updates(device, HEART_RATE, notify_complete, on_update);
    harness.expect_call().await;
    harness.send(TransportEvent::NotifyStateChanged {
        characteristic: HEART_RATE,
        enabled: true,
        error: Some("cccd write rejected".to_string()),
    });
    assert!(matches!(
        resolved(notify_rx).await,
        Err(Error::TransportFailure { .. })
    ));

    harness.send(TransportEvent::ValueUpdated {
        characteristic: HEART_RATE,
        value: Bytes::from_static(&[1]),
        error: None,
    });
    harness.settle().await;
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn operations_require_a_connected_device() {
    let mut harness = Harness::new();
    harness.power_on();
    harness.discover("a", -50);
    let device = DeviceId::from("a");
    harness
        .wait_until("device registered", |central| {
            central.device(&device).is_some()
        })
        .await;

    let (on_complete, rx) = completion();
    harness.central.read(device, BATTERY_LEVEL, on_complete);
    assert!(matches!(resolved(rx).await, Err(Error::UsageError { .. })));
    harness.expect_no_call().await;

    let (on_complete, rx) = completion();
    harness
        .central
        .read(DeviceId::from("ghost"), BATTERY_LEVEL, on_complete);
    assert!(matches!(
        resolved(rx).await,
        Err(Error::DeviceNotFound { .. })
    ));
}

#[tokio::test]
async fn event_for_unrouted_characteristic_is_dropped() {
    let mut harness = Harness::new();
    let _device = bring_up(&mut harness, "a").await;

    // No pending operation, no subscription, not even an indexed
    // characteristic: dropped with a diagnostic, the loop keeps running.
    harness.send(TransportEvent::ValueUpdated {
        characteristic: Uuid::from_u128(0xdead),
        value: Bytes::from_static(&[1]),
        error: None,
    });

    harness.discover("sentinel", -80);
    harness
        .wait_until("loop still alive", |central| {
            central.device(&DeviceId::from("sentinel")).is_some()
        })
        .await;
}
