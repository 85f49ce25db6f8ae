//! Per-device connection lifecycle.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Disconnecting
//! -> Disconnected`, with `Connecting -> Disconnected` on watchdog timeout or
//! transport failure. The watchdog race ("timer fires but the transport
//! responds late") is settled by a monotonically increasing attempt counter:
//! a timer carries the counter value captured at arm time and firing stale is
//! a no-op.

use tracing::debug;

use crate::callback::{defer, Completion, Deferred};
use crate::error::Error;

/// Connection state for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the device.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the device.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// What the caller of [`ConnectionLifecycle::begin_connect`] or
/// [`ConnectionLifecycle::begin_disconnect`] must do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Directive {
    /// Issue the transport call; `attempt` is the counter value a watchdog
    /// timer for this attempt must capture.
    Issue { attempt: u64 },
    /// The operation resolved immediately; a completion was deferred.
    Settled,
}

/// How a transport `Disconnected` event was classified.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DisconnectOutcome {
    /// A caller-initiated disconnect completed.
    Requested,
    /// A connect attempt failed at the transport.
    ConnectFailed,
    /// Link loss with no pending operation to resolve.
    Unsolicited,
    /// Already disconnected; nothing to resolve (e.g. the echo of a
    /// watchdog-issued teardown).
    Stale,
}

/// Connect/disconnect state machine for one device.
pub(crate) struct ConnectionLifecycle {
    state: ConnectionState,
    attempt: u64,
    watchdog_raised: bool,
    pending_connect: Option<Completion<()>>,
    pending_disconnect: Option<Completion<()>>,
}

impl ConnectionLifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            watchdog_raised: false,
            pending_connect: None,
            pending_disconnect: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn watchdog_raised(&self) -> bool {
        self.watchdog_raised
    }

    /// Admit a connect request.
    ///
    /// Connect while `Connected` is an idempotent fast path: the completion
    /// settles with success and no transport call is made. Connect while
    /// transitioning is a usage error.
    pub(crate) fn begin_connect(
        &mut self,
        on_complete: Completion<()>,
        out: &mut Vec<Deferred>,
    ) -> Directive {
        match self.state {
            ConnectionState::Connected => {
                out.push(defer(on_complete, Ok(())));
                Directive::Settled
            }
            ConnectionState::Connecting => {
                out.push(defer(
                    on_complete,
                    Err(Error::usage("connect already in progress")),
                ));
                Directive::Settled
            }
            ConnectionState::Disconnecting => {
                out.push(defer(
                    on_complete,
                    Err(Error::usage("disconnect in progress")),
                ));
                Directive::Settled
            }
            ConnectionState::Disconnected => {
                self.attempt += 1;
                self.state = ConnectionState::Connecting;
                self.pending_connect = Some(on_complete);
                Directive::Issue {
                    attempt: self.attempt,
                }
            }
        }
    }

    /// Admit a disconnect request.
    ///
    /// Disconnecting while `Connecting` cancels the attempt: the pending
    /// connect settles with a failure before the disconnect is issued.
    pub(crate) fn begin_disconnect(
        &mut self,
        on_complete: Completion<()>,
        out: &mut Vec<Deferred>,
    ) -> Directive {
        match self.state {
            ConnectionState::Disconnected => {
                out.push(defer(on_complete, Ok(())));
                Directive::Settled
            }
            ConnectionState::Disconnecting => {
                out.push(defer(on_complete, Err(Error::in_flight("disconnect"))));
                Directive::Settled
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                if let Some(cb) = self.pending_connect.take() {
                    out.push(defer(
                        cb,
                        Err(Error::transport("connection attempt cancelled")),
                    ));
                }
                self.state = ConnectionState::Disconnecting;
                self.pending_disconnect = Some(on_complete);
                Directive::Issue {
                    attempt: self.attempt,
                }
            }
        }
    }

    /// Resolve a transport connected event. Returns false if the event was
    /// stale (no attempt outstanding).
    pub(crate) fn handle_connected(
        &mut self,
        error: Option<String>,
        out: &mut Vec<Deferred>,
    ) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        let Some(cb) = self.pending_connect.take() else {
            return false;
        };

        match error {
            None => {
                self.state = ConnectionState::Connected;
                self.watchdog_raised = false;
                out.push(defer(cb, Ok(())));
            }
            Some(reason) => {
                self.state = ConnectionState::Disconnected;
                self.watchdog_raised = false;
                out.push(defer(cb, Err(Error::transport(reason))));
            }
        }
        true
    }

    /// The watchdog timer for `attempt` fired. Returns true if the timeout
    /// was applied, in which case the caller issues a best-effort transport
    /// disconnect (not awaited for correctness).
    pub(crate) fn watchdog_fired(&mut self, attempt: u64, out: &mut Vec<Deferred>) -> bool {
        if self.state != ConnectionState::Connecting || self.attempt != attempt {
            debug!(attempt, "watchdog fired stale, ignoring");
            return false;
        }
        let Some(cb) = self.pending_connect.take() else {
            return false;
        };

        self.watchdog_raised = true;
        self.state = ConnectionState::Disconnected;
        out.push(defer(cb, Err(Error::ConnectionTimeout)));
        true
    }

    /// Classify and resolve a transport disconnected event.
    ///
    /// The caller fails outstanding characteristic operations before calling
    /// this, so they are settled before the device is fully `Disconnected`.
    pub(crate) fn handle_disconnected(
        &mut self,
        error: Option<String>,
        out: &mut Vec<Deferred>,
    ) -> DisconnectOutcome {
        if let Some(cb) = self.pending_disconnect.take() {
            self.state = ConnectionState::Disconnected;
            self.watchdog_raised = false;
            self.pending_connect = None;
            out.push(defer(cb, Ok(())));
            return DisconnectOutcome::Requested;
        }

        if self.state == ConnectionState::Connecting {
            if let Some(cb) = self.pending_connect.take() {
                self.state = ConnectionState::Disconnected;
                self.watchdog_raised = false;
                let reason = error.unwrap_or_else(|| "connection attempt failed".to_string());
                out.push(defer(cb, Err(Error::transport(reason))));
                return DisconnectOutcome::ConnectFailed;
            }
        }

        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            self.watchdog_raised = false;
            return DisconnectOutcome::Unsolicited;
        }

        // Already disconnected: the echo of a watchdog teardown or a
        // duplicate event. Leave the watchdog flag untouched.
        self.state = ConnectionState::Disconnected;
        DisconnectOutcome::Stale
    }

    /// Roll back after a transport submission failure for connect.
    pub(crate) fn abort_connect(&mut self, error: Error, out: &mut Vec<Deferred>) {
        if let Some(cb) = self.pending_connect.take() {
            self.state = ConnectionState::Disconnected;
            out.push(defer(cb, Err(error)));
        }
    }

    /// Roll back after a transport submission failure for disconnect.
    pub(crate) fn abort_disconnect(&mut self, error: Error, out: &mut Vec<Deferred>) {
        if let Some(cb) = self.pending_disconnect.take() {
            self.state = ConnectionState::Disconnected;
            out.push(defer(cb, Err(error)));
        }
    }

    /// Fail whatever is pending (coordinator teardown).
    pub(crate) fn fail_pending(&mut self, mk: &dyn Fn() -> Error, out: &mut Vec<Deferred>) {
        if let Some(cb) = self.pending_connect.take() {
            out.push(defer(cb, Err(mk())));
        }
        if let Some(cb) = self.pending_disconnect.take() {
            out.push(defer(cb, Err(mk())));
        }
        self.state = ConnectionState::Disconnected;
    }
}
