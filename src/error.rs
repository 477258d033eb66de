//! Crate-level error type.
//!
//! Transport failures are usually recovered by the reconnection loop and only
//! reach callers through [`crate::store::ConnectionStatus::last_error`]. The
//! variants here are what public functions return directly.

use thiserror::Error;

/// Errors surfaced by the streaming client.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A transport could not be established.
    #[error("connection failed to {url}: {detail}")]
    Connect { url: String, detail: String },

    /// The remote server replied with a non-2xx HTTP status code.
    #[error("HTTP {status} from {url}: {body}")]
    Http { status: u16, url: String, body: String },

    /// Lower-level HTTP client failure (DNS, TLS, body read).
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// A frame could not be serialized or parsed.
    #[error("invalid frame: {0}")]
    Frame(#[from] serde_json::Error),

    /// A configured URL is malformed.
    #[error("invalid URL '{url}': {detail}")]
    InvalidUrl { url: String, detail: String },

    /// Config file could not be parsed.
    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The link to the peer is gone; the frame was not delivered.
    #[error("transport link closed")]
    LinkClosed,

    /// `Transport::open` did not finish within the configured connect timeout.
    #[error("connect timed out after {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },

    /// Reconnect attempts are exhausted; only a manual reconnect recovers.
    #[error("session {session_id} is offline: {reason}")]
    Offline { session_id: String, reason: String },

    /// The connection manager's dispatch loop has exited.
    #[error("connection manager stopped")]
    ManagerStopped,
}

pub type Result<T> = std::result::Result<T, StreamError>;
