//! Characteristic operation multiplexer.
//!
//! One instance per device. Pending operations live in an explicit slot map
//! keyed by characteristic UUID — one slot per operation kind — enforcing the
//! single-flight discipline: a second request of a kind already outstanding
//! fails fast and never overwrites the earlier callback. Inbound value
//! events are demultiplexed to whichever registrations are active: a pending
//! one-shot read, a persistent notify listener, or both.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::callback::{defer, Completion, Deferred, ValueListener};
use crate::error::Error;

/// A pending notify-set operation, carried until the transport confirms the
/// subscription state change.
struct PendingNotify {
    enable: bool,
    on_complete: Completion<()>,
    on_update: Option<ValueListener>,
}

/// Per-characteristic pending-operation slots.
#[derive(Default)]
struct Slots {
    read: Option<Completion<Bytes>>,
    write: Option<Completion<()>>,
    notify: Option<PendingNotify>,
    /// Persistent listener; survives until notifications are disabled or the
    /// device disconnects.
    listener: Option<ValueListener>,
}

impl Slots {
    fn is_empty(&self) -> bool {
        self.read.is_none()
            && self.write.is_none()
            && self.notify.is_none()
            && self.listener.is_none()
    }
}

/// The multiplexer: slot map plus admission and demultiplexing rules.
pub(crate) struct CharacteristicOps {
    slots: HashMap<Uuid, Slots>,
}

impl CharacteristicOps {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Admit a read. Returns false if a read is already pending on this
    /// characteristic (the completion settles with a failure).
    pub(crate) fn begin_read(
        &mut self,
        characteristic: Uuid,
        on_complete: Completion<Bytes>,
        out: &mut Vec<Deferred>,
    ) -> bool {
        let slot = self.slots.entry(characteristic).or_default();
        if slot.read.is_some() {
            out.push(defer(
                on_complete,
                Err(Error::in_flight(format!("read on {characteristic}"))),
            ));
            return false;
        }
        slot.read = Some(on_complete);
        true
    }

    /// Admit a write, same single-flight discipline keyed by
    /// write-on-this-characteristic.
    pub(crate) fn begin_write(
        &mut self,
        characteristic: Uuid,
        on_complete: Completion<()>,
        out: &mut Vec<Deferred>,
    ) -> bool {
        let slot = self.slots.entry(characteristic).or_default();
        if slot.write.is_some() {
            out.push(defer(
                on_complete,
                Err(Error::in_flight(format!("write on {characteristic}"))),
            ));
            return false;
        }
        slot.write = Some(on_complete);
        true
    }

    /// Admit a notify-set. A second request while one is pending fails fast;
    /// re-registering while notifications are already enabled is accepted and
    /// replaces the listener once the transport confirms.
    pub(crate) fn begin_notify(
        &mut self,
        characteristic: Uuid,
        enable: bool,
        on_complete: Completion<()>,
        on_update: Option<ValueListener>,
        out: &mut Vec<Deferred>,
    ) -> bool {
        let slot = self.slots.entry(characteristic).or_default();
        if slot.notify.is_some() {
            out.push(defer(
                on_complete,
                Err(Error::in_flight(format!("notify-set on {characteristic}"))),
            ));
            return false;
        }
        slot.notify = Some(PendingNotify {
            enable,
            on_complete,
            on_update,
        });
        true
    }

    /// Route a value-updated event. Resolves a pending read (one-shot) and
    /// feeds the persistent listener, both when both are active. Returns
    /// false if nothing was registered for the characteristic.
    pub(crate) fn handle_value_updated(
        &mut self,
        characteristic: Uuid,
        value: Bytes,
        error: Option<String>,
        out: &mut Vec<Deferred>,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(&characteristic) else {
            return false;
        };

        let mut handled = false;

        if let Some(cb) = slot.read.take() {
            let result = match &error {
                None => Ok(value.clone()),
                Some(reason) => Err(Error::transport(reason.clone())),
            };
            out.push(defer(cb, result));
            handled = true;
        }

        if let Some(listener) = slot.listener.clone() {
            let result = match &error {
                None => Ok(value),
                Some(reason) => Err(Error::transport(reason.clone())),
            };
            out.push(Box::new(move || listener(result)));
            handled = true;
        }

        self.prune(characteristic);
        handled
    }

    /// Route a value-written event. Returns false if no write was pending.
    pub(crate) fn handle_value_written(
        &mut self,
        characteristic: Uuid,
        error: Option<String>,
        out: &mut Vec<Deferred>,
    ) -> bool {
        let Some(cb) = self
            .slots
            .get_mut(&characteristic)
            .and_then(|slot| slot.write.take())
        else {
            return false;
        };
        let result = match error {
            None => Ok(()),
            Some(reason) => Err(Error::transport(reason)),
        };
        out.push(defer(cb, result));
        self.prune(characteristic);
        true
    }

    /// Route a subscription-state-changed event. On success the pending
    /// listener is installed (or the active one cleared when disabling).
    /// Returns false if no notify-set was pending.
    pub(crate) fn handle_notify_state(
        &mut self,
        characteristic: Uuid,
        error: Option<String>,
        out: &mut Vec<Deferred>,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(&characteristic) else {
            return false;
        };
        let Some(pending) = slot.notify.take() else {
            return false;
        };

        match error {
            None => {
                slot.listener = if pending.enable {
                    pending.on_update
                } else {
                    None
                };
                out.push(defer(pending.on_complete, Ok(())));
            }
            Some(reason) => {
                out.push(defer(pending.on_complete, Err(Error::transport(reason))));
            }
        }
        self.prune(characteristic);
        true
    }

    /// Roll back a pending read after a transport submission failure.
    pub(crate) fn abort_read(&mut self, characteristic: Uuid, error: Error, out: &mut Vec<Deferred>) {
        if let Some(cb) = self
            .slots
            .get_mut(&characteristic)
            .and_then(|slot| slot.read.take())
        {
            out.push(defer(cb, Err(error)));
        }
        self.prune(characteristic);
    }

    /// Roll back a pending write after a transport submission failure.
    pub(crate) fn abort_write(&mut self, characteristic: Uuid, error: Error, out: &mut Vec<Deferred>) {
        if let Some(cb) = self
            .slots
            .get_mut(&characteristic)
            .and_then(|slot| slot.write.take())
        {
            out.push(defer(cb, Err(error)));
        }
        self.prune(characteristic);
    }

    /// Roll back a pending notify-set after a transport submission failure.
    pub(crate) fn abort_notify(
        &mut self,
        characteristic: Uuid,
        error: Error,
        out: &mut Vec<Deferred>,
    ) {
        if let Some(pending) = self
            .slots
            .get_mut(&characteristic)
            .and_then(|slot| slot.notify.take())
        {
            out.push(defer(pending.on_complete, Err(error)));
        }
        self.prune(characteristic);
    }

    /// Fail every pending completion and drop every listener. Called when
    /// the device transitions to `Disconnected` and on coordinator teardown.
    pub(crate) fn fail_all(&mut self, mk: &dyn Fn() -> Error, out: &mut Vec<Deferred>) {
        let count = self.slots.len();
        for (_, slot) in self.slots.drain() {
            if let Some(cb) = slot.read {
                out.push(defer(cb, Err(mk())));
            }
            if let Some(cb) = slot.write {
                out.push(defer(cb, Err(mk())));
            }
            if let Some(pending) = slot.notify {
                out.push(defer(pending.on_complete, Err(mk())));
            }
            // Listeners are dropped, not failed: their registration ends
            // with the connection.
        }
        if count > 0 {
            debug!(slots = count, "cleared characteristic operation slots");
        }
    }

    fn prune(&mut self, characteristic: Uuid) {
        if self
            .slots
            .get(&characteristic)
            .map(Slots::is_empty)
            .unwrap_or(false)
        {
            self.slots.remove(&characteristic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    fn completion<T: Send + 'static>() -> (Completion<T>, mpsc::Receiver<Result<T>>) {
        let (tx, rx) = mpsc::channel();
        (
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
            rx,
        )
    }

    fn listener() -> (ValueListener, Arc<Mutex<Vec<Result<Bytes>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        (
            Arc::new(move |result| {
                seen_clone.lock().unwrap().push(result);
            }),
            seen,
        )
    }

    fn drain(out: &mut Vec<Deferred>) {
        for deferred in std::mem::take(out) {
            deferred();
        }
    }

    const CHAR: Uuid = Uuid::from_u128(0x2a00);
    const OTHER: Uuid = Uuid::from_u128(0x2a01);

    #[test]
    fn test_second_read_fails_fast_first_unaffected() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (first, first_rx) = completion::<Bytes>();
        assert!(ops.begin_read(CHAR, first, &mut out));

        let (second, second_rx) = completion::<Bytes>();
        assert!(!ops.begin_read(CHAR, second, &mut out));
        drain(&mut out);
        assert!(matches!(
            second_rx.recv().unwrap(),
            Err(Error::OperationAlreadyInFlight { .. })
        ));

        assert!(ops.handle_value_updated(CHAR, Bytes::from_static(&[1]), None, &mut out));
        drain(&mut out);
        assert_eq!(first_rx.recv().unwrap().unwrap(), Bytes::from_static(&[1]));
    }

    #[test]
    fn test_read_and_write_slots_are_independent() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (read_cb, read_rx) = completion::<Bytes>();
        let (write_cb, write_rx) = completion::<()>();
        assert!(ops.begin_read(CHAR, read_cb, &mut out));
        assert!(ops.begin_write(CHAR, write_cb, &mut out));

        assert!(ops.handle_value_written(CHAR, None, &mut out));
        drain(&mut out);
        assert!(write_rx.recv().unwrap().is_ok());
        assert!(read_rx.try_recv().is_err());
    }

    #[test]
    fn test_value_routed_to_read_and_listener() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (notify_cb, notify_rx) = completion::<()>();
        let (update, seen) = listener();
        assert!(ops.begin_notify(CHAR, true, notify_cb, Some(update), &mut out));
        assert!(ops.handle_notify_state(CHAR, None, &mut out));
        drain(&mut out);
        assert!(notify_rx.recv().unwrap().is_ok());

        let (read_cb, read_rx) = completion::<Bytes>();
        assert!(ops.begin_read(CHAR, read_cb, &mut out));

        assert!(ops.handle_value_updated(CHAR, Bytes::from_static(&[7]), None, &mut out));
        drain(&mut out);

        // One event, both registrations: the one-shot read is consumed, the
        // listener stays.
        assert_eq!(read_rx.recv().unwrap().unwrap(), Bytes::from_static(&[7]));
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(ops.handle_value_updated(CHAR, Bytes::from_static(&[8]), None, &mut out));
        drain(&mut out);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(read_rx.try_recv().is_err());
    }

    #[test]
    fn test_notify_complete_once_updates_per_event() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (notify_cb, notify_rx) = completion::<()>();
        let (update, seen) = listener();
        ops.begin_notify(CHAR, true, notify_cb, Some(update), &mut out);
        ops.handle_notify_state(CHAR, None, &mut out);
        drain(&mut out);

        for byte in [1u8, 2, 3] {
            ops.handle_value_updated(CHAR, Bytes::copy_from_slice(&[byte]), None, &mut out);
            drain(&mut out);
        }

        assert!(notify_rx.recv().unwrap().is_ok());
        assert!(notify_rx.try_recv().is_err());
        let values: Vec<u8> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.as_ref().unwrap()[0])
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_listener_not_installed_before_confirmation() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (notify_cb, _notify_rx) = completion::<()>();
        let (update, seen) = listener();
        ops.begin_notify(CHAR, true, notify_cb, Some(update), &mut out);

        // Value arrives before the subscription is confirmed.
        assert!(!ops.handle_value_updated(CHAR, Bytes::from_static(&[1]), None, &mut out));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disable_clears_listener() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (cb, _rx) = completion::<()>();
        let (update, seen) = listener();
        ops.begin_notify(CHAR, true, cb, Some(update), &mut out);
        ops.handle_notify_state(CHAR, None, &mut out);
        drain(&mut out);

        let (cb, rx) = completion::<()>();
        ops.begin_notify(CHAR, false, cb, None, &mut out);
        ops.handle_notify_state(CHAR, None, &mut out);
        drain(&mut out);
        assert!(rx.recv().unwrap().is_ok());

        assert!(!ops.handle_value_updated(CHAR, Bytes::from_static(&[1]), None, &mut out));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_re_registration_replaces_listener() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (cb, _rx) = completion::<()>();
        let (old, old_seen) = listener();
        ops.begin_notify(CHAR, true, cb, Some(old), &mut out);
        ops.handle_notify_state(CHAR, None, &mut out);
        drain(&mut out);

        let (cb, _rx) = completion::<()>();
        let (new, new_seen) = listener();
        ops.begin_notify(CHAR, true, cb, Some(new), &mut out);
        ops.handle_notify_state(CHAR, None, &mut out);
        drain(&mut out);

        ops.handle_value_updated(CHAR, Bytes::from_static(&[5]), None, &mut out);
        drain(&mut out);
        assert!(old_seen.lock().unwrap().is_empty());
        assert_eq!(new_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_transport_error_propagates_through_callbacks() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (cb, rx) = completion::<Bytes>();
        ops.begin_read(CHAR, cb, &mut out);
        ops.handle_value_updated(CHAR, Bytes::new(), Some("not readable".into()), &mut out);
        drain(&mut out);
        assert!(matches!(
            rx.recv().unwrap(),
            Err(Error::TransportFailure { .. })
        ));

        let (cb, rx) = completion::<()>();
        ops.begin_write(OTHER, cb, &mut out);
        ops.handle_value_written(OTHER, Some("not writable".into()), &mut out);
        drain(&mut out);
        assert!(matches!(
            rx.recv().unwrap(),
            Err(Error::TransportFailure { .. })
        ));
    }

    #[test]
    fn test_failed_notify_does_not_install_listener() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (cb, rx) = completion::<()>();
        let (update, seen) = listener();
        ops.begin_notify(CHAR, true, cb, Some(update), &mut out);
        ops.handle_notify_state(CHAR, Some("subscribe rejected".into()), &mut out);
        drain(&mut out);
        assert!(matches!(
            rx.recv().unwrap(),
            Err(Error::TransportFailure { .. })
        ));

        assert!(!ops.handle_value_updated(CHAR, Bytes::from_static(&[1]), None, &mut out));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_event_with_no_registration_is_unhandled() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();
        assert!(!ops.handle_value_updated(CHAR, Bytes::from_static(&[0]), None, &mut out));
        assert!(!ops.handle_value_written(CHAR, None, &mut out));
        assert!(!ops.handle_notify_state(CHAR, None, &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn test_fail_all_settles_every_pending_operation() {
        let mut ops = CharacteristicOps::new();
        let mut out = Vec::new();

        let (read_cb, read_rx) = completion::<Bytes>();
        let (write_cb, write_rx) = completion::<()>();
        ops.begin_read(CHAR, read_cb, &mut out);
        ops.begin_write(OTHER, write_cb, &mut out);

        ops.fail_all(&|| Error::ConnectionLost, &mut out);
        drain(&mut out);

        assert!(matches!(
            read_rx.recv().unwrap(),
            Err(Error::ConnectionLost)
        ));
        assert!(matches!(
            write_rx.recv().unwrap(),
            Err(Error::ConnectionLost)
        ));
    }
}
