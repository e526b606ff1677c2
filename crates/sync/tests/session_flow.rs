use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use chatbook_common::protocol::updates::RequestUpdate;
use chatbook_common::protocol::ws::{ClientMessage, OutboundEnvelope};
use chatbook_common::types::{
    Block, BlockType, Conversation, EntityId, MessageSender, MessageStatus, Notebook, NotebookMetadata, Paged,
};
use chatbook_sync::cache::{MemoryCache, NotebookKey, SyncCache};
use chatbook_sync::connection::{ConnectionEvent, ConnectionMachine, ConnectionState, Effect, SyncSocket};
use chatbook_sync::delta::{apply_request, ApplyOutcome, PatchTarget};
use chatbook_sync::optimistic::{begin_send_message, settle_send_message, SendOutcome};
use chatbook_sync::session::{SessionNotice, SyncSession};

const ORG: i64 = 3;
const NOTEBOOK: EntityId = EntityId::Persisted(11);
const CONVERSATION: EntityId = EntityId::Persisted(22);

#[derive(Debug, Clone, Default)]
struct RecordingSocket(Rc<RefCell<Vec<OutboundEnvelope>>>);

impl RecordingSocket {
    fn drain(&self) -> Vec<ClientMessage> {
        self.0
            .borrow_mut()
            .drain(..)
            .map(|envelope| ClientMessage::from_envelope(&envelope).expect("client message"))
            .collect()
    }
}

impl SyncSocket for RecordingSocket {
    fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.0.borrow_mut().push(serde_json::from_str(&text)?);
        Ok(())
    }

    fn close(&mut self, _code: u16, _reason: &str) {}
}

fn frame(message_type: &str, payload: Value) -> String {
    json!({ "message_type": message_type, "message_payload": payload }).to_string()
}

fn patch(updates: Value) -> String {
    frame(
        "PATCH_PROJECT_RESPONSE",
        json!({
            "project_id": 11,
            "bot_conversation_id": 22,
            "timestamp": "2026-03-01T12:00:05.000Z",
            "updates": updates
        }),
    )
}

fn seeded_cache() -> MemoryCache {
    let mut cache = MemoryCache::new();
    let metadata = NotebookMetadata {
        id: NOTEBOOK,
        uuid: Uuid::new_v4(),
        organization_id: ORG,
        bot_conversation_id: Some(CONVERSATION),
        title: "Sales".into(),
        extra: Map::new(),
    };
    cache.set_notebook(NotebookKey::new(ORG, NOTEBOOK), Arc::new(Notebook { metadata, blocks: Vec::new() }));
    cache.set_message_pages(CONVERSATION, Arc::new(Paged::default()));
    cache.set_conversation(
        CONVERSATION,
        Arc::new(Conversation { id: CONVERSATION, is_streaming: false, title: "Sales".into(), extra: Map::new() }),
    );
    cache
}

fn connected_session() -> (SyncSession<RecordingSocket, MemoryCache>, RecordingSocket) {
    let machine = ConnectionMachine::new(Uuid::new_v4(), std::time::Duration::from_secs(1));
    let mut session = SyncSession::new(machine, seeded_cache(), ORG);
    let socket = RecordingSocket::default();

    let effects = session.handle(ConnectionEvent::SetSocket(socket.clone()));
    assert_eq!(effects, vec![Effect::RequestToken { attempt: 1 }]);
    session.handle(ConnectionEvent::TokenResolved { attempt: 1, token: Ok("bearer".into()) });
    session.handle_frame(&frame("AUTH_RESPONSE", json!({ "status": "success" })));
    assert_eq!(session.state(), ConnectionState::Idle);
    assert_eq!(socket.drain(), vec![ClientMessage::Auth { token: "bearer".into() }]);

    session.subscribe(NOTEBOOK, CONVERSATION);
    session.handle_frame(&frame("SUBSCRIBE_PROJECT_RESPONSE", json!({ "project_id": 11, "status": "success" })));
    session.handle_frame(&frame(
        "SUBSCRIBE_BOT_CONVERSATION_RESPONSE",
        json!({ "bot_conversation_id": 22, "status": "success" }),
    ));
    assert_eq!(session.state(), ConnectionState::Idle);
    assert_eq!(
        socket.drain(),
        vec![
            ClientMessage::SubscribeProject { project_id: 11 },
            ClientMessage::SubscribeBotConversation { bot_conversation_id: 22 },
        ]
    );
    (session, socket)
}

fn messages(session: &SyncSession<RecordingSocket, MemoryCache>) -> Vec<(Uuid, MessageStatus, String)> {
    session
        .cache()
        .message_pages(CONVERSATION)
        .expect("pages cached")
        .iter()
        .map(|m| (m.uuid, m.message_status, m.content.clone()))
        .collect()
}

#[test]
fn optimistic_message_is_reconciled_by_push() {
    let (mut session, _socket) = connected_session();
    let sent_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

    let pending = begin_send_message(session.cache_mut(), CONVERSATION, "hello", sent_at).expect("pages cached");
    assert_eq!(messages(&session), vec![(pending.message_uuid, MessageStatus::InProgress, "hello".into())]);
    assert!(session.cache().conversation(CONVERSATION).unwrap().is_streaming);

    session.handle_frame(&patch(json!([{
        "action_type": "CreateBotConversationMessage",
        "bot_conversation_message": {
            "id": 501,
            "uuid": pending.message_uuid,
            "message_status": "complete",
            "sender": "user",
            "content": "hello",
            "created_at": "2026-03-01T12:00:00Z"
        }
    }])));

    assert_eq!(messages(&session), vec![(pending.message_uuid, MessageStatus::Complete, "hello".into())]);
    let pages = session.cache().message_pages(CONVERSATION).unwrap();
    assert_eq!(pages.iter().next().unwrap().id, Some(501));
    assert!(matches!(
        session.take_notices().as_slice(),
        [SessionNotice::PatchApplied { outcome: ApplyOutcome::Applied { applied: 1, skipped: 0 }, .. }]
    ));

    settle_send_message(session.cache_mut(), &pending, SendOutcome::Succeeded);
    assert!(!session.cache().conversation(CONVERSATION).unwrap().is_streaming);
}

#[test]
fn bot_reply_streams_and_sorts() {
    let (mut session, _socket) = connected_session();
    let reply = Uuid::new_v4();
    let earlier = Uuid::new_v4();

    session.handle_frame(&patch(json!([
        {
            "action_type": "CreateBotConversationMessage",
            "bot_conversation_message": {
                "uuid": reply, "message_status": "in_progress", "sender": "bot",
                "content": "", "created_at": "2026-03-01T12:00:02Z"
            }
        },
        {
            "action_type": "CreateBotConversationMessage",
            "bot_conversation_message": {
                "uuid": earlier, "message_status": "complete", "sender": "user",
                "content": "q", "created_at": "2026-03-01T12:00:01Z"
            }
        },
        { "action_type": "UpdateBotConversation", "bot_conversation_id": 22, "key": "is_streaming", "value": true }
    ])));
    assert_eq!(messages(&session).iter().map(|m| m.0).collect::<Vec<_>>(), vec![earlier, reply]);
    assert!(session.cache().conversation(CONVERSATION).unwrap().is_streaming);

    for token in ["Total ", "is ", "42."] {
        session.handle_frame(&patch(json!([{
            "action_type": "UpdateBotConversationMessage",
            "bot_conversation_message_uuid": reply,
            "key": ["content"],
            "value": token,
            "is_incremental_string_change": true
        }])));
    }
    session.handle_frame(&patch(json!([
        {
            "action_type": "UpdateBotConversationMessage",
            "bot_conversation_message_uuid": reply,
            "key": "message_status",
            "value": "complete"
        },
        { "action_type": "UpdateBotConversation", "bot_conversation_id": 22, "key": "is_streaming", "value": false }
    ])));

    let all = messages(&session);
    assert_eq!(all[1], (reply, MessageStatus::Complete, "Total is 42.".into()));
    assert!(!session.cache().conversation(CONVERSATION).unwrap().is_streaming);
}

#[test]
fn failed_send_stays_visible_as_error() {
    let (mut session, _socket) = connected_session();
    let pending = begin_send_message(session.cache_mut(), CONVERSATION, "retry me", Utc::now()).unwrap();

    settle_send_message(session.cache_mut(), &pending, SendOutcome::Failed);

    let pages = session.cache().message_pages(CONVERSATION).unwrap();
    let message = pages.iter().next().unwrap();
    assert_eq!(message.message_status, MessageStatus::Error);
    assert_eq!(message.sender, MessageSender::User);
    assert!(!session.cache().conversation(CONVERSATION).unwrap().is_streaming);
}

#[test]
fn optimistic_block_then_confirmation_backfills_id() {
    let (mut session, _socket) = connected_session();
    let target = PatchTarget { organization_id: ORG, notebook_id: NOTEBOOK, conversation_id: CONVERSATION };
    let block = Block {
        id: None,
        uuid: Uuid::new_v4(),
        block_above_uuid: None,
        block_type: BlockType::Sql,
        custom_block_info: json!({ "query": "select 1" }),
        extra: Map::new(),
    };

    apply_request(session.cache_mut(), &target, &[RequestUpdate::CreateBlock { block: block.clone() }]).unwrap();
    let key = NotebookKey::new(ORG, NOTEBOOK);
    assert_eq!(session.cache().notebook(&key).unwrap().block(block.uuid).unwrap().id, None);

    let mut confirmed = serde_json::to_value(&block).unwrap();
    confirmed["id"] = json!(900);
    session.handle_frame(&patch(json!([{ "action_type": "CreateBlock", "block": confirmed }])));

    let notebook = session.cache().notebook(&key).unwrap();
    assert_eq!(notebook.blocks.len(), 1);
    assert_eq!(notebook.block(block.uuid).unwrap().id, Some(900));
}

#[test]
fn desynchronized_push_is_reported_and_cache_untouched() {
    let (mut session, _socket) = connected_session();
    let key = NotebookKey::new(ORG, NOTEBOOK);
    let seed = Uuid::new_v4();
    session.handle_frame(&patch(json!([{
        "action_type": "CreateBlock",
        "block": { "uuid": seed, "block_above_uuid": null, "type": "text" }
    }])));
    session.take_notices();
    let before = session.cache().notebook(&key).unwrap();

    session.handle_frame(&patch(json!([{
        "action_type": "CreateBlock",
        "block": { "uuid": Uuid::new_v4(), "block_above_uuid": Uuid::new_v4(), "type": "text" }
    }])));

    assert!(matches!(session.take_notices().as_slice(), [SessionNotice::CacheDesynchronized { .. }]));
    let after = session.cache().notebook(&key).unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.blocks[0].uuid, seed);
}

#[test]
fn switching_conversation_unsubscribes_and_ignores_stale_acks() {
    let (mut session, socket) = connected_session();

    session.subscribe(NOTEBOOK, EntityId::Persisted(23));
    assert_eq!(
        socket.drain(),
        vec![
            ClientMessage::UnsubscribeBotConversation { bot_conversation_id: 22 },
            ClientMessage::SubscribeProject { project_id: 11 },
            ClientMessage::SubscribeBotConversation { bot_conversation_id: 23 },
        ]
    );

    session.handle_frame(&frame("SUBSCRIBE_PROJECT_RESPONSE", json!({ "project_id": 11 })));
    session.handle_frame(&frame("SUBSCRIBE_BOT_CONVERSATION_RESPONSE", json!({ "bot_conversation_id": 22 })));
    assert_eq!(session.state(), ConnectionState::Subscribing);

    session.handle_frame(&frame("SUBSCRIBE_BOT_CONVERSATION_RESPONSE", json!({ "bot_conversation_id": 23 })));
    assert_eq!(session.state(), ConnectionState::Idle);
}
