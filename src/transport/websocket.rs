//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::{Link, LinkCommand, Transport, TransportEvent, CLOSE_ABNORMAL};
use crate::config::{redact_url, ClientConfig};
use crate::decoder::decode_ws_frame;
use crate::error::{Result, StreamError};

/// Close code used when a close frame carries no status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Connects to `{ws_base_url}/ws/chat/{session_id}/?token=...`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn for_session(config: &ClientConfig, session_id: &str) -> Result<Self> {
        Ok(Self::new(config.ws_url(session_id)?))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self) -> Result<Link> {
        let shown = redact_url(&self.url);
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| StreamError::Connect {
                url: shown.clone(),
                detail: e.to_string(),
            })?;
        info!(url = %shown, "websocket connected");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws_stream, cmd_rx, evt_tx));
        Ok(Link::new(cmd_tx, evt_rx))
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Multiplex outbound commands and inbound frames until either side closes.
async fn pump(
    ws_stream: WsStream,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(LinkCommand::Send(frame)) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, kind = frame.kind(), "failed to serialize frame");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            let _ = events.send(TransportEvent::Closed {
                                code: CLOSE_ABNORMAL,
                                reason: format!("send failed: {e}"),
                            });
                            break;
                        }
                    }
                    Some(LinkCommand::Close { code }) => {
                        let frame = CloseFrame { code: CloseCode::from(code), reason: "".into() };
                        let _ = sink.send(WsMessage::Close(Some(frame))).await;
                        debug!(code, "websocket closed by client");
                        break;
                    }
                    // link dropped without an explicit close
                    None => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(event) = decode_ws_frame(&text) {
                            if events.send(TransportEvent::Frame(event)).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((CLOSE_NO_STATUS, String::new()));
                        let _ = events.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    Some(Ok(_)) => {} // binary / ping / pong frames
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: e.to_string(),
                        });
                        break;
                    }
                    None => {
                        let _ = events.send(TransportEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: "stream ended".to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }
}
