//! In-process transport.
//!
//! Every successful `open` hands the peer side of the new link to whoever
//! holds the [`MemoryTransport`]'s accept receiver. Failures can be scripted
//! with [`MemoryTransport::fail_next`].

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Link, LinkCommand, Transport, TransportEvent};
use crate::error::{Result, StreamError};
use crate::protocol::{InboundEvent, OutboundFrame};

/// Server side of an in-memory link.
#[derive(Debug)]
pub struct MemoryPeer {
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// Deliver a frame to the client.
    pub fn push(&self, event: InboundEvent) -> bool {
        self.events.send(TransportEvent::Frame(event)).is_ok()
    }

    /// Deliver raw JSON as if it came off a WebSocket; malformed input is dropped.
    pub fn push_raw(&self, text: &str) -> bool {
        match crate::decoder::decode_ws_frame(text) {
            Some(event) => self.push(event),
            None => false,
        }
    }

    /// Close the link from the server side.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.events
            .send(TransportEvent::Closed { code, reason: reason.to_string() })
            .is_ok()
    }

    /// Next command the client issued, or `None` once the client dropped the link.
    pub async fn recv(&mut self) -> Option<LinkCommand> {
        self.commands.recv().await
    }

    /// Next outbound frame, skipping anything else. `None` on close.
    pub async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        loop {
            match self.commands.recv().await? {
                LinkCommand::Send(frame) => return Some(frame),
                LinkCommand::Close { .. } => return None,
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    accept: mpsc::UnboundedSender<MemoryPeer>,
    fail_next: AtomicU32,
    opens: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Create a transport and the receiver on which each new peer arrives.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (accept, peers) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            accept,
            fail_next: AtomicU32::new(0),
            opens: AtomicUsize::new(0),
        });
        (Self { shared }, peers)
    }

    /// Make the next `n` calls to `open` fail.
    pub fn fail_next(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of `open` calls so far, including failed ones.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self) -> Result<Link> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .shared
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StreamError::Connect {
                url: "memory://".to_string(),
                detail: "scripted failure".to_string(),
            });
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer { commands: cmd_rx, events: evt_tx };
        self.shared.accept.send(peer).map_err(|_| StreamError::Connect {
            url: "memory://".to_string(),
            detail: "no acceptor".to_string(),
        })?;
        Ok(Link::new(cmd_tx, evt_rx))
    }
}
