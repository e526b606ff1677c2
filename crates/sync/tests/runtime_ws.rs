use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use chatbook_common::protocol::ws::{ClientMessage, OutboundEnvelope};
use chatbook_common::types::{Conversation, EntityId, Notebook, NotebookMetadata, Paged};
use chatbook_sync::auth::{StaticTokenProvider, TokenProvider};
use chatbook_sync::cache::{MemoryCache, NotebookKey, SyncCache};
use chatbook_sync::connection::ConnectionMachine;
use chatbook_sync::delta::ApplyOutcome;
use chatbook_sync::runtime::{run_session, ReconnectPolicy, SessionCommand};
use chatbook_sync::session::{SessionNotice, SyncSession};

const NOTEBOOK: i64 = 11;
const CONVERSATION: i64 = 22;
const REPLY_UUID: &str = "5a0e7c2e-6f0b-4c1e-9d7a-2b1f3c4d5e6f";

// ── Fake push server ────────────────────────────────────────────────

async fn spawn_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");
    let app = Router::new().route("/ws", get(ws_route));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("push server should run");
    });
    format!("ws://{addr}/ws")
}

async fn ws_route(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_socket)
}

fn frame(message_type: &str, payload: Value) -> WsMessage {
    WsMessage::Text(json!({ "message_type": message_type, "message_payload": payload }).to_string().into())
}

fn patch(updates: Value) -> WsMessage {
    frame(
        "PATCH_PROJECT_RESPONSE",
        json!({ "project_id": NOTEBOOK, "bot_conversation_id": CONVERSATION, "updates": updates }),
    )
}

async fn handle_socket(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            if matches!(message, WsMessage::Close(_)) {
                break;
            }
            continue;
        };
        let Ok(envelope) = serde_json::from_str::<OutboundEnvelope>(text.as_str()) else {
            break;
        };
        let Ok(request) = ClientMessage::from_envelope(&envelope) else {
            break;
        };

        let replies = match request {
            ClientMessage::Auth { token } if token == "good" => {
                vec![frame("AUTH_RESPONSE", json!({ "status": "success" }))]
            }
            ClientMessage::Auth { .. } => {
                vec![frame("AUTH_RESPONSE", json!({ "status": "error", "message": "bad token" }))]
            }
            ClientMessage::SubscribeProject { project_id } => {
                vec![frame("SUBSCRIBE_PROJECT_RESPONSE", json!({ "project_id": project_id, "status": "success" }))]
            }
            ClientMessage::SubscribeBotConversation { bot_conversation_id } => vec![
                frame(
                    "SUBSCRIBE_BOT_CONVERSATION_RESPONSE",
                    json!({ "bot_conversation_id": bot_conversation_id, "status": "success" }),
                ),
                patch(json!([{
                    "action_type": "CreateBotConversationMessage",
                    "bot_conversation_message": {
                        "uuid": REPLY_UUID,
                        "message_status": "in_progress",
                        "sender": "bot",
                        "content": "Working",
                        "created_at": "2026-03-01T12:00:00Z"
                    }
                }])),
            ],
            ClientMessage::StopStream { stream_uuid } if stream_uuid == format!("BOT_CONVERSATION_{CONVERSATION}") => {
                vec![patch(json!([
                    {
                        "action_type": "UpdateBotConversationMessage",
                        "bot_conversation_message_uuid": REPLY_UUID,
                        "key": "message_status",
                        "value": "complete"
                    },
                    {
                        "action_type": "UpdateBotConversation",
                        "bot_conversation_id": CONVERSATION,
                        "key": ["is_streaming"],
                        "value": false
                    }
                ]))]
            }
            _ => Vec::new(),
        };

        for reply in replies {
            if socket.send(reply).await.is_err() {
                return;
            }
        }
    }
}

// ── Client side ─────────────────────────────────────────────────────

fn seeded_cache() -> MemoryCache {
    let mut cache = MemoryCache::new();
    let notebook_id = EntityId::Persisted(NOTEBOOK);
    let conversation_id = EntityId::Persisted(CONVERSATION);
    cache.set_notebook(
        NotebookKey::new(1, notebook_id),
        Arc::new(Notebook {
            metadata: NotebookMetadata {
                id: notebook_id,
                uuid: Uuid::new_v4(),
                organization_id: 1,
                bot_conversation_id: Some(conversation_id),
                title: String::new(),
                extra: Map::new(),
            },
            blocks: Vec::new(),
        }),
    );
    cache.set_message_pages(conversation_id, Arc::new(Paged::default()));
    cache.set_conversation(
        conversation_id,
        Arc::new(Conversation { id: conversation_id, is_streaming: true, title: String::new(), extra: Map::new() }),
    );
    cache
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy { base_delay: Duration::from_millis(20), max_delay: Duration::from_millis(100) }
}

async fn next_patch(notices: &mut mpsc::UnboundedReceiver<SessionNotice>) -> ApplyOutcome {
    loop {
        let notice = timeout(Duration::from_secs(5), notices.recv())
            .await
            .expect("timed out waiting for session notice")
            .expect("notice channel should stay open");
        if let SessionNotice::PatchApplied { outcome, .. } = notice {
            return outcome;
        }
    }
}

/// Returns an empty token first, then a valid one.
struct FlakyProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl TokenProvider for FlakyProvider {
    async fn fetch_token(&self) -> anyhow::Result<String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(String::new())
        } else {
            Ok("good".into())
        }
    }
}

/// Never yields a usable token; records when each fetch happened.
#[derive(Default)]
struct EmptyTokenProvider {
    fetched_at: Mutex<Vec<Instant>>,
}

#[async_trait]
impl TokenProvider for EmptyTokenProvider {
    async fn fetch_token(&self) -> anyhow::Result<String> {
        self.fetched_at.lock().unwrap().push(Instant::now());
        Ok(String::new())
    }
}

#[tokio::test]
async fn session_subscribes_applies_pushes_and_stops_stream() {
    let url = spawn_server().await;
    let session = SyncSession::new(
        ConnectionMachine::new(Uuid::new_v4(), Duration::from_millis(50)),
        seeded_cache(),
        1,
    );
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
    commands_tx
        .send(SessionCommand::Subscribe {
            notebook_id: EntityId::Persisted(NOTEBOOK),
            conversation_id: EntityId::Persisted(CONVERSATION),
        })
        .unwrap();

    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider("good".into()));
    let runner = tokio::spawn(async move {
        run_session(&url, fast_policy(), session, tokens, commands_rx, notices_tx).await
    });

    assert_eq!(next_patch(&mut notices_rx).await, ApplyOutcome::Applied { applied: 1, skipped: 0 });

    commands_tx.send(SessionCommand::StopStream { bot_conversation_id: CONVERSATION }).unwrap();
    assert_eq!(next_patch(&mut notices_rx).await, ApplyOutcome::Applied { applied: 2, skipped: 0 });

    commands_tx.send(SessionCommand::Shutdown).unwrap();
    let session = timeout(Duration::from_secs(5), runner)
        .await
        .expect("session should shut down")
        .expect("session task should not panic")
        .expect("session should end cleanly");

    let conversation_id = EntityId::Persisted(CONVERSATION);
    let pages = session.cache().message_pages(conversation_id).unwrap();
    let reply = pages.iter().next().expect("pushed message cached");
    assert_eq!(reply.uuid, Uuid::parse_str(REPLY_UUID).unwrap());
    assert_eq!(reply.content, "Working");
    assert!(!session.cache().conversation(conversation_id).unwrap().is_streaming);
}

#[tokio::test]
async fn empty_token_closes_and_recovers_on_reconnect() {
    let url = spawn_server().await;
    let session = SyncSession::new(
        ConnectionMachine::new(Uuid::new_v4(), Duration::from_millis(50)),
        seeded_cache(),
        1,
    );
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
    commands_tx
        .send(SessionCommand::Subscribe {
            notebook_id: EntityId::Persisted(NOTEBOOK),
            conversation_id: EntityId::Persisted(CONVERSATION),
        })
        .unwrap();

    let provider = Arc::new(FlakyProvider { calls: AtomicUsize::new(0) });
    let tokens: Arc<dyn TokenProvider> = provider.clone();
    let runner = tokio::spawn(async move {
        run_session(&url, fast_policy(), session, tokens, commands_rx, notices_tx).await
    });

    assert_eq!(next_patch(&mut notices_rx).await, ApplyOutcome::Applied { applied: 1, skipped: 0 });
    assert!(provider.calls.load(Ordering::SeqCst) >= 2);

    commands_tx.send(SessionCommand::Shutdown).unwrap();
    let session = timeout(Duration::from_secs(5), runner).await.unwrap().unwrap().unwrap();
    assert!(session.machine().target().is_some());
}

#[tokio::test]
async fn insecure_remote_url_is_rejected() {
    let session: SyncSession<_, MemoryCache> =
        SyncSession::new(ConnectionMachine::new(Uuid::new_v4(), Duration::from_secs(1)), MemoryCache::new(), 1);
    let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (notices_tx, _notices_rx) = mpsc::unbounded_channel();

    let result = run_session(
        "ws://chatbook.example.com/ws",
        fast_policy(),
        session,
        Arc::new(StaticTokenProvider("good".into())),
        commands_rx,
        notices_tx,
    )
    .await;

    let error = result.err().expect("insecure url should be rejected");
    assert!(error.to_string().contains("ws_url must use wss"));
}

#[tokio::test]
async fn failed_auth_waits_retry_delay_before_next_token_fetch() {
    let url = spawn_server().await;
    let retry_delay = Duration::from_millis(300);
    let session: SyncSession<_, MemoryCache> =
        SyncSession::new(ConnectionMachine::new(Uuid::new_v4(), retry_delay), seeded_cache(), 1);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (notices_tx, _notices_rx) = mpsc::unbounded_channel();

    let provider = Arc::new(EmptyTokenProvider::default());
    let tokens: Arc<dyn TokenProvider> = provider.clone();
    let runner = tokio::spawn(async move {
        run_session(&url, fast_policy(), session, tokens, commands_rx, notices_tx).await
    });

    tokio::time::sleep(Duration::from_millis(750)).await;
    commands_tx.send(SessionCommand::Shutdown).unwrap();
    timeout(Duration::from_secs(5), runner).await.unwrap().unwrap().unwrap();

    let fetched_at = provider.fetched_at.lock().unwrap().clone();
    assert!(!fetched_at.is_empty());
    assert!(fetched_at.len() <= 3, "token fetched {} times in 750ms", fetched_at.len());
    for pair in fetched_at.windows(2) {
        assert!(pair[1] - pair[0] >= retry_delay, "retried after {:?}", pair[1] - pair[0]);
    }
}
