//! Scan session state machine and signal-strength ranking.
//!
//! A session is transient: created when scanning starts, destroyed when it
//! completes by duration, count threshold, explicit stop, or supersession.
//! Results are ranked descending by signal strength with first-discovered
//! order as the stable tie-break.

use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::callback::{defer, Completion, Deferred};
use crate::device::{DeviceId, DeviceSnapshot};
use crate::error::Result;

/// Identifier of one scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionId(pub(crate) u64);

/// Options for a scan session.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanOptions {
    /// Only report devices advertising one of these services. Empty means
    /// no filtering.
    pub service_filter: Vec<Uuid>,
    /// Stop after this much time. `None` scans until an explicit stop.
    pub duration: Option<Duration>,
    /// Stop early once this many distinct devices have been seen.
    pub count_threshold: Option<usize>,
}

/// Incremental-update listener: receives the single changed device.
pub(crate) type ScanUpdateListener = std::sync::Arc<dyn Fn(DeviceSnapshot) + Send + Sync + 'static>;

/// One active scan session.
pub(crate) struct ScanSession {
    id: SessionId,
    count_threshold: Option<usize>,
    /// Distinct devices seen during this session, in discovery order.
    seen: Vec<DeviceId>,
    on_update: Option<ScanUpdateListener>,
    on_complete: Option<Completion<Vec<DeviceSnapshot>>>,
}

impl ScanSession {
    pub(crate) fn new(
        id: SessionId,
        count_threshold: Option<usize>,
        on_update: Option<ScanUpdateListener>,
        on_complete: Completion<Vec<DeviceSnapshot>>,
    ) -> Self {
        Self {
            id,
            count_threshold,
            seen: Vec::new(),
            on_update,
            on_complete: Some(on_complete),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn seen(&self) -> &[DeviceId] {
        &self.seen
    }

    /// Record a discovery event. Returns true when the count threshold has
    /// just been reached and the session must stop early.
    pub(crate) fn note_discovered(&mut self, id: &DeviceId) -> bool {
        if !self.seen.contains(id) {
            match self.count_threshold {
                // The result list never exceeds the threshold.
                Some(threshold) if self.seen.len() >= threshold => return true,
                _ => {}
            }
            self.seen.push(id.clone());
        }
        matches!(self.count_threshold, Some(threshold) if self.seen.len() >= threshold)
    }

    /// Defer the incremental-update callback for one changed device.
    pub(crate) fn push_update(&self, snapshot: DeviceSnapshot, out: &mut Vec<Deferred>) {
        if let Some(on_update) = self.on_update.clone() {
            out.push(Box::new(move || on_update(snapshot)));
        }
    }

    /// Settle the session with its final result (or failure), consuming it.
    pub(crate) fn complete(mut self, result: Result<Vec<DeviceSnapshot>>, out: &mut Vec<Deferred>) {
        debug!(session = self.id.0, seen = self.seen.len(), "scan session complete");
        if let Some(cb) = self.on_complete.take() {
            out.push(defer(cb, result));
        }
    }
}

/// Order items descending by signal strength, preserving input order for
/// equal strength (stable). Unknown strength sorts last.
pub(crate) fn rank_by_signal<T>(items: Vec<(Option<i16>, T)>) -> Vec<T> {
    let mut items = items;
    items.sort_by_key(|(rssi, _)| std::cmp::Reverse(rssi.unwrap_or(i16::MIN)));
    items.into_iter().map(|(_, item)| item).collect()
}
