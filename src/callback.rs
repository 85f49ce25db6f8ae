//! Callback plumbing shared across the crate.
//!
//! Operations register either a one-shot completion callback or a persistent
//! value listener. Completions are consumed exactly once; listeners stay
//! registered until notifications are disabled or the device disconnects.

use bytes::Bytes;
use std::sync::Arc;

use crate::error::Result;

/// One-shot completion callback for a pending operation.
pub(crate) type Completion<T> = Box<dyn FnOnce(Result<T>) + Send + Sync + 'static>;

/// Persistent listener invoked on every pushed value update.
pub(crate) type ValueListener = Arc<dyn Fn(Result<Bytes>) + Send + Sync + 'static>;

/// A callback invocation deferred until no internal locks are held.
pub(crate) type Deferred = Box<dyn FnOnce() + Send + 'static>;

/// Package a completion and its result into a deferred invocation.
pub(crate) fn defer<T: Send + 'static>(callback: Completion<T>, result: Result<T>) -> Deferred {
    Box::new(move || callback(result))
}

/// Handle for unregistering callbacks registered with `on_*` methods.
///
/// Dropping the handle unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}
