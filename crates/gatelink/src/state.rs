//! Connection state snapshots and state-change observers.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::{ErrorKind, GatewayError};
use crate::quality::{QualityLevel, QualityScore};

/// Lifecycle phase of the gateway connection.
///
/// A single enum makes "connected and connecting at once" unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No transport and no attempt in progress.
    #[default]
    Disconnected,
    /// Fetching a credential or performing the handshake.
    Connecting,
    /// Transport open.
    Connected,
    /// Waiting for the reconnection delay to elapse.
    Backoff,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// The most recent failure, kept in state snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// Error class.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl From<&GatewayError> for LastError {
    fn from(err: &GatewayError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Snapshot of the connection published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Reconnections scheduled since the last successful open.
    pub reconnect_attempts: u32,
    /// When the transport last opened.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Most recent failure; cleared on a successful open.
    pub last_error: Option<LastError>,
    /// Identifier assigned by the gateway for the current connection.
    pub connection_id: Option<String>,
    /// Automatic reconnection is suppressed until `connect()` is called.
    pub manually_disconnected: bool,
}

impl ConnectionState {
    /// Check if the transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    /// Check if an attempt is in progress.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.phase == ConnectionPhase::Connecting
    }

    /// Check if a reconnection is pending.
    #[must_use]
    pub fn is_backoff(&self) -> bool {
        self.phase == ConnectionPhase::Backoff
    }
}

/// Point-in-time counters and health figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Reconnections scheduled since the last successful open.
    pub reconnect_attempts: u32,
    /// Sends waiting for a transport.
    pub queue_depth: usize,
    /// Latest quality score.
    pub quality_score: QualityScore,
    /// Classification of the latest score.
    pub quality_level: QualityLevel,
    /// Consecutive unacknowledged heartbeats.
    pub missed_heartbeats: u32,
    /// Round trip of the most recently acknowledged heartbeat.
    pub last_rtt: Option<Duration>,
    /// Server timestamp from the most recent acknowledgement.
    pub last_server_timestamp: Option<i64>,
    /// Frames written to a transport.
    pub messages_sent: u64,
    /// Sends that had to be queued.
    pub messages_queued: u64,
    /// Queued sends dropped by staleness or overflow.
    pub messages_dropped: u64,
    /// Valid frames received.
    pub frames_received: u64,
    /// Inbound frames rejected as malformed.
    pub frames_rejected: u64,
    /// Identifier assigned by the gateway for the current connection.
    pub connection_id: Option<String>,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        let quality_score = QualityScore::MAX;
        Self {
            phase: ConnectionPhase::Disconnected,
            reconnect_attempts: 0,
            queue_depth: 0,
            quality_score,
            quality_level: quality_score.level(),
            missed_heartbeats: 0,
            last_rtt: None,
            last_server_timestamp: None,
            messages_sent: 0,
            messages_queued: 0,
            messages_dropped: 0,
            frames_received: 0,
            frames_rejected: 0,
            connection_id: None,
        }
    }
}

type Listener = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

/// Listeners notified on every state change.
#[derive(Default)]
pub struct StateObservers {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for StateObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateObservers")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl StateObservers {
    /// Create an empty observer list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Dropping the returned subscription keeps the listener;
    /// call [`StateSubscription::unsubscribe`] to remove it.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> StateSubscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        StateSubscription {
            id,
            observers: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Check if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Call every listener with `state`. A panicking listener is logged and skipped.
    pub fn notify(&self, state: &ConnectionState) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                warn!(phase = %state.phase, "State listener panicked");
            }
        }
    }
}

/// Handle returned by `on_connection_state_change`.
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct StateSubscription {
    id: u64,
    observers: Weak<StateObservers>,
}

impl StateSubscription {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.observers
            .upgrade()
            .is_some_and(|observers| observers.remove(self.id))
    }
}
