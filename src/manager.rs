//! # Connection Manager
//!
//! ## Responsibility
//! Keeps at most one live [`Link`] per session, mediates every outbound send,
//! and turns inbound frames into [`StateStore`] updates.
//!
//! ## Design
//! - [`ConnectionManager`] is a cheap handle. All state lives in a single
//!   spawned dispatch loop that owns the link, the pending queue, the
//!   [`MessageAssembler`], the [`LatencyTracker`], the heartbeat interval
//!   and the reconnect timer.
//! - The loop handles one input at a time (`tokio::select!`), so frames are
//!   applied strictly in the order the transport delivered them. The select
//!   is biased toward the link, so a command observes every frame that
//!   arrived before it.
//! - A connect attempt is a future owned by the loop and polled as one more
//!   `select!` branch, so `disconnect()` can drop it mid-handshake. Each
//!   attempt is bounded by `connect_timeout`.
//!
//! ## Reconnection
//! `connected -> (unexpected close) -> reconnecting -> connected`, or
//! `reconnecting -> (attempts exhausted) -> offline`. Only a close code other
//! than 1000 schedules a retry; [`ConnectionManager::disconnect`] never does.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::assembler::{Applied, MessageAssembler};
use crate::backoff::ReconnectPolicy;
use crate::config::ClientConfig;
use crate::error::{Result, StreamError};
use crate::latency::{LatencyStats, LatencyTracker};
use crate::model::{now_ms, Message, Role, SessionStatus};
use crate::protocol::{InboundEvent, OutboundFrame};
use crate::store::{ConnectionState, ConnectionStatus, StateStore, StoreEvent};
use crate::transport::{Link, Transport, TransportEvent, CLOSE_NORMAL};

/// Latency key for heartbeat round trips.
const PING_KEY: &str = "ping";
/// Latency key prefix for chat turns (send -> first response).
const TURN_KEY_PREFIX: &str = "turn:";
/// Error attached to messages that were streaming when the link dropped.
pub const CONNECTION_LOST: &str = "connection lost";
/// Error attached to messages that were streaming when the client closed the link.
pub const CONNECTION_CLOSED: &str = "connection closed by client";

type OpenFuture = Pin<Box<dyn Future<Output = Result<Link>> + Send>>;

/// Manager timing and budget.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub latency_window: usize,
    pub policy: ReconnectPolicy,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ManagerOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            connect_timeout: config.connect_timeout(),
            latency_window: config.latency_window,
            policy: config.reconnect.clone(),
        }
    }
}

enum Command {
    Connect,
    Send(OutboundFrame),
    SendChat { text: String, reply: oneshot::Sender<String> },
    Disconnect,
    Reconnect,
    ResumeIfIdle,
    Latency(oneshot::Sender<LatencyStats>),
    Shutdown,
}

/// Handle to one session's connection. Clone freely.
#[derive(Clone)]
pub struct ConnectionManager {
    session_id: Arc<str>,
    store: StateStore,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionManager {
    /// Spawn the dispatch loop for `session_id`. Does not connect yet.
    pub fn spawn(
        session_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        store: StateStore,
        options: ManagerOptions,
    ) -> Self {
        let session_id: String = session_id.into();
        store.ensure_session(&session_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            session_id: session_id.clone(),
            transport,
            store: store.clone(),
            link: None,
            connecting: None,
            pending: VecDeque::new(),
            assembler: MessageAssembler::new(),
            latency: LatencyTracker::new(options.latency_window),
            policy: options.policy,
            heartbeat_interval: options.heartbeat_interval,
            connect_timeout: options.connect_timeout,
            attempts: 0,
            retry_at: None,
            status: ConnectionStatus::default(),
        };
        tokio::spawn(dispatcher.run(rx));
        Self {
            session_id: session_id.into(),
            store,
            commands: tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn status(&self) -> ConnectionStatus {
        self.store.connection()
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).map_err(|_| StreamError::ManagerStopped)
    }

    /// Open the transport. Failures are retried per the reconnect policy.
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Transmit now if connected, otherwise queue until the next connect.
    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.command(Command::Send(frame))
    }

    /// Record a user turn, mark the session processing, and send it.
    /// Returns the id of the new user message.
    pub async fn send_chat_message(&self, text: impl Into<String>) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendChat { text: text.into(), reply })?;
        rx.await.map_err(|_| StreamError::ManagerStopped)
    }

    /// Close with a normal-closure code. Never triggers a reconnect.
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    /// Reset the attempt counter and connect again.
    pub fn reconnect(&self) -> Result<()> {
        self.command(Command::Reconnect)
    }

    /// Reconnect only when neither connected nor already reconnecting.
    ///
    /// Hook for host-environment triggers such as a page becoming visible.
    pub fn resume_if_idle(&self) -> Result<()> {
        self.command(Command::ResumeIfIdle)
    }

    pub async fn latency(&self) -> Result<LatencyStats> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Latency(tx))?;
        rx.await.map_err(|_| StreamError::ManagerStopped)
    }

    /// Disconnect and stop the dispatch loop.
    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

struct Dispatcher {
    session_id: String,
    transport: Arc<dyn Transport>,
    store: StateStore,
    link: Option<Link>,
    connecting: Option<OpenFuture>,
    pending: VecDeque<OutboundFrame>,
    assembler: MessageAssembler,
    latency: LatencyTracker,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    attempts: u32,
    retry_at: Option<Instant>,
    status: ConnectionStatus,
}

async fn next_link_event(link: &mut Option<Link>) -> TransportEvent {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

async fn next_open(connecting: &mut Option<OpenFuture>) -> Result<Link> {
    match connecting {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // frames already delivered are applied before the next command
                biased;

                event = next_link_event(&mut self.link) => self.on_transport_event(event),

                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Connect => {
                            if self.link.is_none() && self.connecting.is_none() {
                                self.retry_at = None;
                                self.begin_open();
                            }
                        }
                        Command::Send(frame) => self.send(frame),
                        Command::SendChat { text, reply } => {
                            let id = self.send_chat(text);
                            let _ = reply.send(id);
                        }
                        Command::Disconnect => self.disconnect(),
                        Command::Reconnect => self.reconnect(),
                        Command::ResumeIfIdle => {
                            let idle = !self.status.is_connected()
                                && !self.status.is_reconnecting()
                                && self.connecting.is_none();
                            if idle {
                                self.reconnect();
                            }
                        }
                        Command::Latency(reply) => {
                            let _ = reply.send(self.latency.stats());
                        }
                        Command::Shutdown => {
                            self.disconnect();
                            break;
                        }
                    }
                }

                result = next_open(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_opened(result, &mut heartbeat);
                }

                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.begin_open();
                }

                _ = heartbeat.tick(), if self.link.is_some() => self.ping(),
            }
        }
        debug!(session_id = %self.session_id, "dispatch loop stopped");
    }

    fn publish_status(&mut self, state: ConnectionState, last_error: Option<String>) {
        self.status.state = state;
        self.status.reconnect_attempts = self.attempts;
        if state == ConnectionState::Connected {
            self.status.last_connected_ms = Some(now_ms());
        }
        self.status.last_error = last_error;
        self.store.set_connection(self.status.clone());
    }

    // --- lifecycle ---

    /// Start a connect attempt; its outcome arrives through [`Self::on_opened`].
    fn begin_open(&mut self) {
        if self.status.state != ConnectionState::Reconnecting {
            self.publish_status(ConnectionState::Connecting, None);
        }
        let transport = Arc::clone(&self.transport);
        let limit = self.connect_timeout;
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(limit, transport.open()).await {
                Ok(result) => result,
                Err(_) => Err(StreamError::ConnectTimeout {
                    timeout_ms: limit.as_millis() as u64,
                }),
            }
        }));
    }

    fn on_opened(&mut self, result: Result<Link>, heartbeat: &mut tokio::time::Interval) {
        match result {
            Ok(link) => {
                info!(
                    session_id = %self.session_id,
                    transport = self.transport.name(),
                    after_attempts = self.attempts,
                    "connected"
                );
                self.link = Some(link);
                self.attempts = 0;
                self.retry_at = None;
                self.latency.reset();
                self.publish_status(ConnectionState::Connected, None);
                heartbeat.reset();
                self.flush_pending();
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "connect failed");
                self.schedule_retry(e.to_string());
            }
        }
    }

    fn schedule_retry(&mut self, reason: String) {
        if self.policy.exhausted(self.attempts) {
            error!(
                session_id = %self.session_id,
                attempts = self.attempts,
                "reconnect attempts exhausted; going offline"
            );
            self.retry_at = None;
            let message = format!(
                "unable to reconnect after {} attempts: {reason}",
                self.attempts
            );
            self.publish_status(ConnectionState::Offline, Some(message));
            return;
        }
        let delay = self.policy.delay(self.attempts);
        self.attempts += 1;
        self.retry_at = Some(Instant::now() + delay);
        info!(
            session_id = %self.session_id,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.publish_status(ConnectionState::Reconnecting, Some(reason));
    }

    fn disconnect(&mut self) {
        self.retry_at = None;
        self.attempts = 0;
        if self.connecting.take().is_some() {
            debug!(session_id = %self.session_id, "cancelled in-flight connect");
        }
        self.fail_streaming(CONNECTION_CLOSED);
        if let Some(link) = self.link.take() {
            link.close(CLOSE_NORMAL);
            info!(session_id = %self.session_id, "disconnected");
        }
        self.publish_status(ConnectionState::Disconnected, None);
    }

    fn reconnect(&mut self) {
        self.connecting = None;
        self.fail_streaming(CONNECTION_CLOSED);
        if let Some(link) = self.link.take() {
            link.close(CLOSE_NORMAL);
        }
        self.retry_at = None;
        self.attempts = 0;
        self.status.state = ConnectionState::Disconnected;
        self.begin_open();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.on_frame(frame),
            TransportEvent::Closed { code, reason } => {
                self.link = None;
                self.fail_streaming(CONNECTION_LOST);
                if code == CLOSE_NORMAL {
                    info!(session_id = %self.session_id, reason, "server closed connection normally");
                    self.attempts = 0;
                    self.publish_status(ConnectionState::Disconnected, None);
                } else {
                    warn!(session_id = %self.session_id, code, reason, "connection closed unexpectedly");
                    self.schedule_retry(format!("closed with code {code}"));
                }
            }
        }
    }

    // --- outbound ---

    fn send(&mut self, frame: OutboundFrame) {
        let Some(link) = &self.link else {
            debug!(kind = frame.kind(), queued = self.pending.len() + 1, "not connected; queueing frame");
            self.pending.push_back(frame);
            return;
        };
        if let Err(e) = link.send(frame.clone()) {
            debug!(error = %e, "link gone; queueing frame");
            self.pending.push_back(frame);
        }
    }

    fn flush_pending(&mut self) {
        let queued = std::mem::take(&mut self.pending);
        if !queued.is_empty() {
            debug!(count = queued.len(), "flushing queued frames");
        }
        for frame in queued {
            self.send(frame);
        }
    }

    fn send_chat(&mut self, text: String) -> String {
        let message = Message::new(uuid::Uuid::new_v4().to_string(), Role::User, text.clone());
        let id = message.id.clone();
        self.store.update_session(&self.session_id, |s| s.push(message));
        self.store.notify(StoreEvent::MessageUpdated {
            session_id: self.session_id.clone(),
            message_id: id.clone(),
        });
        self.store.set_session_status(&self.session_id, SessionStatus::Processing);
        self.latency.begin(format!("{TURN_KEY_PREFIX}{}", self.session_id));
        self.send(OutboundFrame::ChatMessage { message: text });
        id
    }

    fn ping(&mut self) {
        let Some(link) = &self.link else { return };
        if link.send(OutboundFrame::Ping { timestamp: now_ms() }).is_ok() {
            self.latency.begin(PING_KEY);
        }
    }

    // --- inbound ---

    fn turn_key(&self) -> String {
        format!("{TURN_KEY_PREFIX}{}", self.session_id)
    }

    fn complete_timer(&mut self, key: &str) {
        if self.latency.complete(key).is_some() {
            self.store.set_latency(self.latency.stats());
        }
    }

    fn message_updated(&self, applied: Option<Applied>) {
        if let Some(Applied::Updated(message_id)) = applied {
            self.store.notify(StoreEvent::MessageUpdated {
                session_id: self.session_id.clone(),
                message_id,
            });
        }
    }

    fn on_frame(&mut self, frame: InboundEvent) {
        let sid = self.session_id.clone();
        match frame {
            InboundEvent::ConnectionAck { session_id, .. } => {
                debug!(session_id = %sid, server_session = ?session_id, "connection acknowledged");
            }
            InboundEvent::TypingStart => self.store.set_typing(&sid, true),
            InboundEvent::TypingStop => self.store.set_typing(&sid, false),
            InboundEvent::StreamStart { message_id } => {
                let key = self.turn_key();
                self.complete_timer(&key);
                let applied = self
                    .store
                    .update_session(&sid, |s| self.assembler.start(s, message_id));
                self.message_updated(applied);
            }
            InboundEvent::StreamToken { message_id, token } => {
                let key = self.turn_key();
                self.complete_timer(&key);
                let id = message_id.unwrap_or_else(|| self.latest_streaming_id());
                let applied = self
                    .store
                    .update_session(&sid, |s| self.assembler.push_token(s, &id, &token));
                self.message_updated(applied);
            }
            InboundEvent::StreamComplete { message_id, final_content } => {
                let id = message_id.unwrap_or_else(|| self.latest_streaming_id());
                let applied = self
                    .store
                    .update_session(&sid, |s| self.assembler.complete(s, &id, final_content));
                if matches!(applied, Some(Applied::Updated(_))) && self.assembler.active() == 0 {
                    self.store.set_session_status(&sid, SessionStatus::Completed);
                }
                self.message_updated(applied);
            }
            InboundEvent::Message { message_id, role, content } => {
                let key = self.turn_key();
                self.complete_timer(&key);
                let id = message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let message = Message::new(id.clone(), role.unwrap_or(Role::Assistant), content);
                let added = self
                    .store
                    .update_session(&sid, |s| {
                        if s.message(&id).is_some() {
                            return false;
                        }
                        s.push(message);
                        true
                    })
                    .unwrap_or(false);
                if added {
                    self.message_updated(Some(Applied::Updated(id)));
                    if self.assembler.active() == 0 {
                        self.store.set_session_status(&sid, SessionStatus::Completed);
                    }
                }
            }
            InboundEvent::OptimizationResult { data } => {
                self.store.notify(StoreEvent::Notice { session_id: sid, kind: "optimization_result".into(), data });
            }
            InboundEvent::TemplateOpportunity { data } => {
                self.store.notify(StoreEvent::Notice { session_id: sid, kind: "template_opportunity".into(), data });
            }
            InboundEvent::Error { message, message_id } => {
                warn!(session_id = %sid, message_id = ?message_id, error = %message, "server error frame");
                let target = message_id
                    .or_else(|| (self.assembler.active() > 0).then(|| self.latest_streaming_id()));
                let applied = target.and_then(|id| {
                    self.store
                        .update_session(&sid, |s| self.assembler.fail(s, &id, &message))
                });
                let key = self.turn_key();
                match applied {
                    Some(Applied::Updated(_)) => {
                        self.message_updated(applied);
                        // a newer turn may still be waiting for its first response
                        if self.assembler.active() == 0 && !self.latency.is_pending(&key) {
                            self.store.set_session_status(&sid, SessionStatus::Error);
                        }
                    }
                    _ => {
                        self.latency.cancel(&key);
                        self.store.notify(StoreEvent::ServerError { session_id: sid.clone(), message });
                        self.store.set_session_status(&sid, SessionStatus::Error);
                    }
                }
            }
            InboundEvent::Heartbeat { .. } => debug!(session_id = %sid, "server heartbeat"),
            InboundEvent::Pong { .. } => self.complete_timer(PING_KEY),
            InboundEvent::Unknown => debug!(session_id = %sid, "ignoring frame of unknown type"),
        }
    }

    /// Id of the newest message still streaming, for frames that omit one.
    fn latest_streaming_id(&self) -> String {
        self.store
            .session(&self.session_id)
            .and_then(|s| s.messages.iter().rev().find(|m| m.partial).map(|m| m.id.clone()))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    fn fail_streaming(&mut self, reason: &str) {
        let sid = self.session_id.clone();
        let failed = self
            .store
            .update_session(&sid, |s| self.assembler.fail_all(s, reason))
            .unwrap_or_default();
        self.assembler.clear();
        let key = self.turn_key();
        self.latency.cancel(&key);
        if failed.is_empty() {
            return;
        }
        for message_id in failed {
            self.store.notify(StoreEvent::MessageUpdated { session_id: sid.clone(), message_id });
        }
        self.store.set_session_status(&sid, SessionStatus::Error);
    }
}
