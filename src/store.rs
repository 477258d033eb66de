//! Explicit, shareable state container with subscribe/notify.
//!
//! ## Design
//! - `StateStore`: `Arc<Mutex<StoreState>>` plus a `tokio::sync::broadcast`
//!   sender. Clones share state.
//! - Every mutation that a view cares about is followed by a [`StoreEvent`].
//!   Subscribers read the new state through the store's getters.
//! - Slow subscribers see `RecvError::Lagged` rather than blocking writers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::latency::LatencyStats;
use crate::model::{Session, SessionStatus};

/// Broadcast channel capacity (events in flight per subscriber).
pub const STORE_CHANNEL_CAP: usize = 256;

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Automatic retries exhausted; only a manual reconnect leaves this state.
    Offline,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting   => "connecting",
            ConnectionState::Connected    => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Offline      => "offline",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_connected_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state == ConnectionState::Reconnecting
    }

    pub fn is_offline(&self) -> bool {
        self.state == ConnectionState::Offline
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Change notifications pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Connection(ConnectionStatus),
    SessionCreated { session_id: String },
    SessionDeleted { session_id: String },
    SessionStatus { session_id: String, status: SessionStatus },
    MessageUpdated { session_id: String, message_id: String },
    Typing { session_id: String, active: bool },
    /// Payload-carrying server notices (`optimization_result`, `template_opportunity`).
    Notice { session_id: String, kind: String, data: serde_json::Value },
    /// Protocol-level error not tied to a streaming message.
    ServerError { session_id: String, message: String },
    Latency(LatencyStats),
    Reset,
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<String, Session>,
    connection: ConnectionStatus,
    typing: HashMap<String, bool>,
    latency: LatencyStats,
}

#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<StoreState>>,
    tx: broadcast::Sender<StoreEvent>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STORE_CHANNEL_CAP);
        Self {
            inner: Arc::new(Mutex::new(StoreState::default())),
            tx,
        }
    }

    /// Subscribe to change notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn notify(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }

    // --- sessions ---

    /// Return the session with `id`, creating it if absent.
    pub fn ensure_session(&self, id: &str) -> Session {
        let (session, created) = {
            let Ok(mut guard) = self.inner.lock() else {
                return Session::new(id);
            };
            let created = !guard.sessions.contains_key(id);
            let session = guard
                .sessions
                .entry(id.to_string())
                .or_insert_with(|| Session::new(id))
                .clone();
            (session, created)
        };
        if created {
            self.notify(StoreEvent::SessionCreated { session_id: id.to_string() });
        }
        session
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.inner.lock().ok()?.sessions.get(id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|g| g.sessions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `f` against the session under the lock. `None` if it does not exist.
    ///
    /// Does not publish anything; callers decide which event describes the change.
    pub fn update_session<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut guard = self.inner.lock().ok()?;
        guard.sessions.get_mut(id).map(f)
    }

    pub fn set_session_status(&self, id: &str, status: SessionStatus) {
        let changed = self
            .update_session(id, |s| {
                let changed = s.status != status;
                s.status = status;
                s.touch();
                changed
            })
            .unwrap_or(false);
        if changed {
            self.notify(StoreEvent::SessionStatus { session_id: id.to_string(), status });
        }
    }

    pub fn delete_session(&self, id: &str) -> Option<Session> {
        let removed = {
            let mut guard = self.inner.lock().ok()?;
            guard.typing.remove(id);
            guard.sessions.remove(id)
        };
        if removed.is_some() {
            self.notify(StoreEvent::SessionDeleted { session_id: id.to_string() });
        }
        removed
    }

    /// Drop every session and reset derived state.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = StoreState::default();
        }
        self.notify(StoreEvent::Reset);
    }

    // --- connection / typing / latency ---

    pub fn connection(&self) -> ConnectionStatus {
        self.inner
            .lock()
            .map(|g| g.connection.clone())
            .unwrap_or_default()
    }

    pub fn set_connection(&self, status: ConnectionStatus) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.connection = status.clone();
        }
        self.notify(StoreEvent::Connection(status));
    }

    pub fn is_typing(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .ok()
            .and_then(|g| g.typing.get(session_id).copied())
            .unwrap_or(false)
    }

    pub fn set_typing(&self, session_id: &str, active: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.typing.insert(session_id.to_string(), active);
        }
        self.notify(StoreEvent::Typing { session_id: session_id.to_string(), active });
    }

    pub fn latency(&self) -> LatencyStats {
        self.inner.lock().map(|g| g.latency).unwrap_or_default()
    }

    pub fn set_latency(&self, stats: LatencyStats) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.latency = stats;
        }
        self.notify(StoreEvent::Latency(stats));
    }
}
