//! Streaming chat client.
//!
//! A [`manager::ConnectionManager`] owns one session's link to the server
//! (WebSocket or SSE behind the [`transport::Transport`] trait), assembles
//! streamed tokens into messages, measures round-trip latency, and reconnects
//! with exponential backoff when the link drops unexpectedly. All observable
//! state lives in a [`store::StateStore`] that consumers subscribe to.

pub mod assembler;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod decoder;
pub mod error;
pub mod latency;
pub mod manager;
pub mod model;
pub mod protocol;
pub mod store;
pub mod transport;

pub use config::ClientConfig;
pub use error::{Result, StreamError};
pub use manager::{ConnectionManager, ManagerOptions};
pub use store::{ConnectionState, ConnectionStatus, StateStore, StoreEvent};
