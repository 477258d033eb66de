//! Server-Sent-Events transport.
//!
//! Half-duplex: the link holds the conversation history and issues one
//! streaming `POST /api/v2/chat/completions/` per `chat_message` frame.
//! A newer request aborts the one still in flight.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{Link, LinkCommand, Transport, TransportEvent};
use crate::config::ClientConfig;
use crate::decoder::{sse_item_to_event, SseDecoder};
use crate::error::{Result, StreamError};
use crate::model::Role;
use crate::protocol::{ChatCompletionRequest, ChatTurn, InboundEvent, OutboundFrame};

// ---------------------------------------------------------------------------
// SseClient: one streaming completion request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SseClient {
    client: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl SseClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            url: config.completions_url()?,
            token: config.token.clone(),
        })
    }

    pub fn with_url(url: Url, token: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), url, token }
    }

    /// POST `request` and feed every decoded event to `on_event`, in order.
    ///
    /// `message_id` names the assistant turn; it is announced with a
    /// `stream_start` once the server accepts the request. Returns the
    /// assembled assistant text.
    ///
    /// # Errors
    /// - [`StreamError::Http`] when the server replies with a non-2xx status.
    /// - [`StreamError::Request`] when the connection or body read fails.
    pub async fn stream_chat(
        &self,
        request: &ChatCompletionRequest,
        message_id: &str,
        mut on_event: impl FnMut(InboundEvent),
    ) -> Result<String> {
        let mut builder = self
            .client
            .post(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Http { status, url: self.url.to_string(), body });
        }

        on_event(InboundEvent::StreamStart { message_id: Some(message_id.to_string()) });

        let mut text = String::new();
        let mut final_text: Option<String> = None;
        let mut observe = |event: InboundEvent, on_event: &mut dyn FnMut(InboundEvent)| {
            match &event {
                InboundEvent::StreamToken { message_id: Some(id), token } if id == message_id => {
                    text.push_str(token)
                }
                InboundEvent::StreamComplete { message_id: Some(id), final_content: Some(c) }
                    if id == message_id =>
                {
                    final_text = Some(c.clone())
                }
                _ => {}
            }
            on_event(event);
        };

        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for item in decoder.feed(&chunk) {
                if let Some(event) = sse_item_to_event(item, message_id) {
                    observe(event, &mut on_event);
                }
            }
            if decoder.is_done() {
                break;
            }
        }
        for item in decoder.finish() {
            if let Some(event) = sse_item_to_event(item, message_id) {
                observe(event, &mut on_event);
            }
        }
        if !decoder.is_done() {
            debug!(message_id, "SSE body ended without [DONE]");
            observe(
                InboundEvent::StreamComplete { message_id: Some(message_id.to_string()), final_content: None },
                &mut on_event,
            );
        }

        Ok(final_text.unwrap_or(text))
    }
}

// ---------------------------------------------------------------------------
// SseTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SseTransport {
    client: SseClient,
    session_id: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl SseTransport {
    pub fn new(config: &ClientConfig, session_id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: SseClient::new(config)?,
            session_id: session_id.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn with_client(client: SseClient, config: &ClientConfig, session_id: impl Into<String>) -> Self {
        Self {
            client,
            session_id: session_id.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    fn request(&self, history: &[ChatTurn]) -> ChatCompletionRequest {
        ChatCompletionRequest {
            messages: history.to_vec(),
            model: self.model.clone(),
            stream: true,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            session_id: self.session_id.clone(),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    /// Nothing to dial: the link is ready immediately and each chat turn
    /// opens its own HTTP request.
    async fn open(&self) -> Result<Link> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(self.clone(), cmd_rx, evt_tx));
        Ok(Link::new(cmd_tx, evt_rx))
    }
}

struct InFlight {
    message_id: String,
    handle: JoinHandle<()>,
}

impl InFlight {
    /// Abort the request and, if it had not finished, fail its message.
    fn supersede(self, events: &mpsc::UnboundedSender<TransportEvent>, reason: &str) {
        if self.handle.is_finished() {
            return;
        }
        self.handle.abort();
        debug!(message_id = %self.message_id, reason, "aborting in-flight SSE request");
        let _ = events.send(TransportEvent::Frame(InboundEvent::Error {
            message: reason.to_string(),
            message_id: Some(self.message_id),
        }));
    }
}

async fn run_link(
    transport: SseTransport,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut history: Vec<ChatTurn> = Vec::new();
    let mut in_flight: Option<InFlight> = None;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(LinkCommand::Send(OutboundFrame::ChatMessage { message })) => {
                        if let Some(prev) = in_flight.take() {
                            prev.supersede(&events, "superseded by a newer request");
                        }
                        history.push(ChatTurn { role: Role::User, content: message });

                        let message_id = uuid::Uuid::new_v4().to_string();
                        let request = transport.request(&history);
                        let client = transport.client.clone();
                        let events = events.clone();
                        let done_tx = done_tx.clone();
                        let id = message_id.clone();
                        info!(session_id = %transport.session_id, message_id = %id, "starting SSE completion");
                        let handle = tokio::spawn(async move {
                            let forward = |event: InboundEvent| {
                                let _ = events.send(TransportEvent::Frame(event));
                            };
                            match client.stream_chat(&request, &id, forward).await {
                                Ok(content) => {
                                    let _ = done_tx.send(content);
                                }
                                Err(e) => {
                                    warn!(error = %e, message_id = %id, "SSE request failed");
                                    let _ = events.send(TransportEvent::Frame(InboundEvent::Error {
                                        message: e.to_string(),
                                        message_id: Some(id.clone()),
                                    }));
                                }
                            }
                        });
                        in_flight = Some(InFlight { message_id, handle });
                    }
                    Some(LinkCommand::Send(other)) => {
                        debug!(kind = other.kind(), "frame has no SSE equivalent; dropped");
                    }
                    Some(LinkCommand::Close { .. }) | None => {
                        if let Some(prev) = in_flight.take() {
                            prev.handle.abort();
                        }
                        break;
                    }
                }
            }

            Some(content) = done_rx.recv() => {
                history.push(ChatTurn { role: Role::Assistant, content });
            }
        }
    }
}
