//! End-to-end tests for the connection manager over the in-memory transport:
//! streaming assembly, reconnection on abnormal close, and clean disconnect.

use std::sync::Arc;
use std::time::Duration;

use prompt_stream::backoff::ReconnectPolicy;
use prompt_stream::manager::{ConnectionManager, ManagerOptions, CONNECTION_CLOSED, CONNECTION_LOST};
use prompt_stream::model::{Role, SessionStatus};
use prompt_stream::protocol::{InboundEvent, OutboundFrame};
use prompt_stream::store::{ConnectionState, ConnectionStatus, StateStore, StoreEvent};
use prompt_stream::transport::{LinkCommand, MemoryPeer, MemoryTransport};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn options(base_delay_ms: u64) -> ManagerOptions {
    ManagerOptions {
        heartbeat_interval: Duration::from_secs(3600),
        connect_timeout: Duration::from_secs(5),
        latency_window: 100,
        policy: ReconnectPolicy {
            base_delay_ms,
            max_delay_ms: base_delay_ms * 8,
            max_jitter_ms: 0,
            max_attempts: 5,
        },
    }
}

struct Harness {
    mgr: ConnectionManager,
    store: StateStore,
    transport: MemoryTransport,
    peers: UnboundedReceiver<MemoryPeer>,
}

impl Harness {
    fn new(base_delay_ms: u64) -> Self {
        let (transport, peers) = MemoryTransport::new();
        let store = StateStore::new();
        let mgr = ConnectionManager::spawn(
            "s1",
            Arc::new(transport.clone()),
            store.clone(),
            options(base_delay_ms),
        );
        Self { mgr, store, transport, peers }
    }

    async fn connect(&mut self) -> MemoryPeer {
        self.mgr.connect().unwrap();
        let peer = timeout(WAIT, self.peers.recv()).await.unwrap().unwrap();
        self.wait_status(|s| s.is_connected()).await;
        peer
    }

    async fn wait_status(&self, pred: impl Fn(&ConnectionStatus) -> bool) -> ConnectionStatus {
        timeout(WAIT, async {
            loop {
                let s = self.store.connection();
                if pred(&s) {
                    return s;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("status never reached")
    }

    async fn wait_session(&self, pred: impl Fn(&prompt_stream::model::Session) -> bool) {
        timeout(WAIT, async {
            loop {
                if self.store.session("s1").map(|s| pred(&s)).unwrap_or(false) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("session never reached expected state")
    }
}

#[tokio::test]
async fn scenario_a_tokens_assemble_into_final_message() {
    let mut h = Harness::new(10);
    let mut peer = h.connect().await;

    let user_id = h.mgr.send_chat_message("Say hello").await.unwrap();
    assert_eq!(
        peer.recv_frame().await,
        Some(OutboundFrame::ChatMessage { message: "Say hello".into() })
    );
    let session = h.store.session("s1").unwrap();
    assert_eq!(session.status, SessionStatus::Processing);
    assert_eq!(session.message(&user_id).unwrap().role, Role::User);

    peer.push(InboundEvent::StreamStart { message_id: Some("m1".into()) });
    for token in ["Hel", "lo ", "world"] {
        peer.push(InboundEvent::StreamToken { message_id: Some("m1".into()), token: token.into() });
    }
    peer.push(InboundEvent::StreamComplete { message_id: Some("m1".into()), final_content: None });

    h.wait_session(|s| s.message("m1").map(|m| !m.partial).unwrap_or(false)).await;
    h.mgr.latency().await.unwrap();
    let session = h.store.session("s1").unwrap();
    let m1 = session.message("m1").unwrap();
    assert_eq!(m1.content, "Hello world");
    assert!(!m1.partial);
    assert_eq!(m1.role, Role::Assistant);
    assert_eq!(session.status, SessionStatus::Completed);

    // duplicate completion is a no-op
    peer.push(InboundEvent::StreamComplete { message_id: Some("m1".into()), final_content: Some("x".into()) });
    h.mgr.latency().await.unwrap();
    assert_eq!(h.store.session("s1").unwrap().message("m1").unwrap().content, "Hello world");

    // turn latency was measured from send to stream_start
    assert_eq!(h.mgr.latency().await.unwrap().count, 1);
}

#[tokio::test]
async fn scenario_b_abnormal_close_schedules_reconnect() {
    let mut h = Harness::new(50);
    let peer = h.connect().await;

    peer.close(1006, "network gone");
    let status = h.wait_status(|s| s.is_reconnecting()).await;
    assert_eq!(status.state, ConnectionState::Reconnecting);
    assert_eq!(status.reconnect_attempts, 1);

    // after the backoff a new connect attempt fires on its own
    let _peer2 = timeout(WAIT, h.peers.recv()).await.unwrap().unwrap();
    let status = h.wait_status(|s| s.is_connected()).await;
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(h.transport.open_count(), 2);
}

#[tokio::test]
async fn scenario_c_disconnect_never_reconnects() {
    let mut h = Harness::new(10);
    let mut peer = h.connect().await;

    h.mgr.disconnect().unwrap();
    assert_eq!(peer.recv().await, Some(LinkCommand::Close { code: 1000 }));
    let status = h.wait_status(|s| s.state == ConnectionState::Disconnected).await;
    assert_eq!(status.reconnect_attempts, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.store.connection().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn server_normal_close_does_not_reconnect() {
    let mut h = Harness::new(10);
    let peer = h.connect().await;
    peer.close(1000, "bye");
    h.wait_status(|s| s.state == ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(h.transport.open_count(), 1);
}

#[tokio::test]
async fn abnormal_close_fails_streaming_message() {
    let mut h = Harness::new(500);
    let peer = h.connect().await;
    peer.push(InboundEvent::StreamStart { message_id: Some("m1".into()) });
    peer.push(InboundEvent::StreamToken { message_id: Some("m1".into()), token: "half".into() });
    peer.close(1006, "");

    h.wait_session(|s| s.message("m1").map(|m| !m.partial).unwrap_or(false)).await;
    h.mgr.latency().await.unwrap();
    let session = h.store.session("s1").unwrap();
    let m1 = session.message("m1").unwrap();
    assert_eq!(m1.error.as_deref(), Some(CONNECTION_LOST));
    assert_eq!(m1.content, "half");
    assert_eq!(session.status, SessionStatus::Error);
}

#[tokio::test]
async fn server_error_frame_is_terminal_for_message() {
    let mut h = Harness::new(10);
    let peer = h.connect().await;
    peer.push(InboundEvent::StreamStart { message_id: Some("m1".into()) });
    peer.push(InboundEvent::Error { message: "quota exceeded".into(), message_id: Some("m1".into()) });
    peer.push(InboundEvent::StreamToken { message_id: Some("m1".into()), token: "late".into() });

    h.wait_session(|s| s.status == SessionStatus::Error).await;
    h.mgr.latency().await.unwrap();
    let session = h.store.session("s1").unwrap();
    let m1 = session.message("m1").unwrap();
    assert_eq!(m1.error.as_deref(), Some("quota exceeded"));
    assert!(!m1.partial);
    assert!(m1.content.is_empty());
}

#[tokio::test]
async fn error_without_message_is_published_as_server_error() {
    let mut h = Harness::new(10);
    let peer = h.connect().await;
    let mut rx = h.store.subscribe();
    peer.push(InboundEvent::Error { message: "bad command".into(), message_id: None });

    let event = timeout(WAIT, async {
        loop {
            if let Ok(StoreEvent::ServerError { message, .. }) = rx.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, "bad command");
}

#[tokio::test]
async fn frames_sent_while_reconnecting_flush_after_connect() {
    let mut h = Harness::new(30);
    let peer = h.connect().await;
    peer.close(4000, "server restart");
    h.wait_status(|s| s.is_reconnecting()).await;

    h.mgr
        .send(OutboundFrame::CreateTemplate { title: "t".into(), content: "c".into(), category: None })
        .unwrap();
    let mut peer2 = timeout(WAIT, h.peers.recv()).await.unwrap().unwrap();
    assert_eq!(
        peer2.recv_frame().await,
        Some(OutboundFrame::CreateTemplate { title: "t".into(), content: "c".into(), category: None })
    );
}

#[tokio::test]
async fn typing_and_notices_reach_the_store() {
    let mut h = Harness::new(10);
    let peer = h.connect().await;
    let mut rx = h.store.subscribe();
    peer.push(InboundEvent::TypingStart);
    peer.push(InboundEvent::TemplateOpportunity { data: serde_json::json!({"score": 0.9}) });

    let mut saw_typing = false;
    let mut saw_notice = false;
    timeout(WAIT, async {
        while !(saw_typing && saw_notice) {
            match rx.recv().await {
                Ok(StoreEvent::Typing { active: true, .. }) => saw_typing = true,
                Ok(StoreEvent::Notice { kind, data, .. }) => {
                    assert_eq!(kind, "template_opportunity");
                    assert_eq!(data["score"], 0.9);
                    saw_notice = true;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(h.store.is_typing("s1"));
}

#[tokio::test]
async fn whole_message_frame_is_added_once() {
    let mut h = Harness::new(10);
    let peer = h.connect().await;
    let frame = r#"{"type":"message","message_id":"a9","content":"Full reply"}"#;
    assert!(peer.push_raw(frame));
    assert!(peer.push_raw(frame));
    h.wait_session(|s| s.message("a9").is_some()).await;
    h.mgr.latency().await.unwrap();
    let session = h.store.session("s1").unwrap();
    assert_eq!(session.messages.iter().filter(|m| m.id == "a9").count(), 1);
    assert_eq!(session.message("a9").unwrap().content, "Full reply");
}

#[tokio::test]
async fn disconnect_mid_stream_fails_message_and_next_turn_completes() {
    let mut h = Harness::new(10);
    let peer = h.connect().await;
    peer.push(InboundEvent::StreamStart { message_id: Some("m1".into()) });
    peer.push(InboundEvent::StreamToken { message_id: Some("m1".into()), token: "half".into() });
    h.wait_session(|s| s.message("m1").map(|m| m.content == "half").unwrap_or(false)).await;

    h.mgr.disconnect().unwrap();
    h.wait_status(|s| s.state == ConnectionState::Disconnected).await;
    h.mgr.latency().await.unwrap();
    let session = h.store.session("s1").unwrap();
    let m1 = session.message("m1").unwrap();
    assert!(!m1.partial);
    assert_eq!(m1.error.as_deref(), Some(CONNECTION_CLOSED));
    assert_eq!(session.status, SessionStatus::Error);

    let mut peer2 = h.connect().await;
    h.mgr.send_chat_message("again").await.unwrap();
    assert_eq!(
        peer2.recv_frame().await,
        Some(OutboundFrame::ChatMessage { message: "again".into() })
    );
    peer2.push(InboundEvent::StreamStart { message_id: Some("m2".into()) });
    peer2.push(InboundEvent::StreamToken { message_id: Some("m2".into()), token: "done".into() });
    peer2.push(InboundEvent::StreamComplete { message_id: Some("m2".into()), final_content: None });

    h.wait_session(|s| s.message("m2").map(|m| !m.partial).unwrap_or(false)).await;
    h.mgr.latency().await.unwrap();
    let session = h.store.session("s1").unwrap();
    assert_eq!(session.message("m2").unwrap().content, "done");
    assert_eq!(session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn error_for_superseded_turn_leaves_new_turn_running() {
    let mut h = Harness::new(10);
    let peer = h.connect().await;

    h.mgr.send_chat_message("first").await.unwrap();
    peer.push(InboundEvent::StreamStart { message_id: Some("old".into()) });
    peer.push(InboundEvent::StreamToken { message_id: Some("old".into()), token: "par".into() });
    h.wait_session(|s| s.message("old").map(|m| m.content == "par").unwrap_or(false)).await;

    h.mgr.send_chat_message("second").await.unwrap();
    peer.push(InboundEvent::Error {
        message: "superseded by a newer request".into(),
        message_id: Some("old".into()),
    });
    h.wait_session(|s| s.message("old").map(|m| !m.partial).unwrap_or(false)).await;
    h.mgr.latency().await.unwrap();
    let session = h.store.session("s1").unwrap();
    assert_eq!(session.message("old").unwrap().error.as_deref(), Some("superseded by a newer request"));
    assert_eq!(session.status, SessionStatus::Processing);

    peer.push(InboundEvent::StreamStart { message_id: Some("new".into()) });
    peer.push(InboundEvent::StreamComplete { message_id: Some("new".into()), final_content: Some("ok".into()) });
    h.wait_session(|s| s.message("new").map(|m| !m.partial).unwrap_or(false)).await;
    let stats = h.mgr.latency().await.unwrap();
    // both turns produced a first-response sample
    assert_eq!(stats.count, 2);
    assert_eq!(h.store.session("s1").unwrap().status, SessionStatus::Completed);
}
