//! Error types for the ble-central crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Every failure is delivered through the completion callback of the
/// operation it applies to; nothing in the core raises a process-wide fault
/// or retries on its own.
#[derive(Error, Debug)]
pub enum Error {
    /// The adapter is not ready for central-role operations.
    #[error("Adapter not ready: {reason}")]
    AdapterNotReady {
        /// Human-readable reason reported by the platform.
        reason: String,
    },

    /// An operation of the same kind is already outstanding on this target.
    #[error("Operation already in flight: {operation}")]
    OperationAlreadyInFlight {
        /// Description of the conflicting operation.
        operation: String,
    },

    /// A connection attempt exceeded its watchdog timeout.
    #[error("Connection attempt timed out")]
    ConnectionTimeout,

    /// The connection to the device was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// The specified device is not in the registry.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was looked up.
        identifier: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The transport reported a failure for this operation.
    #[error("Transport failure: {reason}")]
    TransportFailure {
        /// The failure reason reported by the transport.
        reason: String,
    },

    /// The operation is invalid in the current state.
    #[error("Usage error: {message}")]
    UsageError {
        /// Description of what was invalid.
        message: String,
    },

    /// The scan session was superseded by a newer one.
    #[error("Scan session superseded by a newer session")]
    ScanSuperseded,

    /// The coordinator has been shut down.
    #[error("Coordinator is shut down")]
    Shutdown,

    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

impl Error {
    /// Build a [`Error::TransportFailure`] from a transport-reported reason.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::TransportFailure {
            reason: reason.into(),
        }
    }

    /// Build a [`Error::UsageError`].
    pub fn usage(message: impl Into<String>) -> Self {
        Self::UsageError {
            message: message.into(),
        }
    }

    /// Build a [`Error::OperationAlreadyInFlight`].
    pub fn in_flight(operation: impl Into<String>) -> Self {
        Self::OperationAlreadyInFlight {
            operation: operation.into(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
