//! # Transports
//!
//! One [`Transport`] strategy per wire flavor, all driven by the same
//! [`crate::manager::ConnectionManager`]:
//!
//! - [`websocket::WebSocketTransport`]: full-duplex JSON frames.
//! - [`sse::SseTransport`]: one streaming `POST` per chat turn.
//! - [`memory::MemoryTransport`]: in-process peer, for tests and bridges.
//!
//! `open` yields a [`Link`]: a command sender for outbound frames plus a
//! receiver of [`TransportEvent`]s in the order the wire delivered them.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Result, StreamError};
use crate::protocol::{InboundEvent, OutboundFrame};

pub mod memory;
pub mod sse;
pub mod websocket;

pub use memory::{MemoryPeer, MemoryTransport};
pub use sse::{SseClient, SseTransport};
pub use websocket::WebSocketTransport;

/// Close code for an intentional shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported when the peer vanished without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// What a transport reports back to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(InboundEvent),
    Closed { code: u16, reason: String },
}

/// Instructions from the manager to the transport's I/O task.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    Send(OutboundFrame),
    Close { code: u16 },
}

/// A live connection handed out by [`Transport::open`].
#[derive(Debug)]
pub struct Link {
    commands: mpsc::UnboundedSender<LinkCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Link {
    pub fn new(
        commands: mpsc::UnboundedSender<LinkCommand>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { commands, events }
    }

    /// Queue `frame` for transmission.
    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.commands
            .send(LinkCommand::Send(frame))
            .map_err(|_| StreamError::LinkClosed)
    }

    /// Ask the I/O task to close with `code`. Consumes the link.
    pub fn close(self, code: u16) {
        let _ = self.commands.send(LinkCommand::Close { code });
    }

    /// Next event from the wire. A vanished I/O task reads as an abnormal close.
    pub async fn next_event(&mut self) -> TransportEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => TransportEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "transport task ended".to_string(),
            },
        }
    }
}

/// A connection strategy.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short label for logs (`"websocket"`, `"sse"`, ...).
    fn name(&self) -> &'static str;

    /// Establish a new link. Errors are retried by the manager's backoff loop.
    async fn open(&self) -> Result<Link>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_reports_abnormal_close_when_task_gone() {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel::<TransportEvent>();
        drop(evt_tx);
        let mut link = Link::new(cmd_tx, evt_rx);
        assert_eq!(
            link.next_event().await,
            TransportEvent::Closed { code: CLOSE_ABNORMAL, reason: "transport task ended".into() }
        );
    }

    #[test]
    fn test_send_after_task_gone_is_link_closed() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (_evt_tx, evt_rx) = mpsc::unbounded_channel();
        drop(cmd_rx);
        let link = Link::new(cmd_tx, evt_rx);
        let err = link.send(OutboundFrame::Ping { timestamp: 1 }).unwrap_err();
        assert!(matches!(err, StreamError::LinkClosed));
    }
}
