// Optimistic message send.
//
// The user's message is shown immediately as in-progress and the
// conversation is flagged as streaming. Settling always clears the flag; a
// failed send leaves the message in place marked as errored so it can be
// retried.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Map;
use tracing::{debug, warn};
use uuid::Uuid;

use chatbook_common::types::{
    BotConversationMessage, Conversation, EntityId, MessageSender, MessageStatus,
};

use crate::cache::SyncCache;

/// Handle for a message inserted by `begin_send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub conversation_id: EntityId,
    /// Client-generated; the server echoes it back when it creates the message.
    pub message_uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Succeeded,
    Failed,
}

/// Append an in-progress user message and mark the conversation as
/// streaming. Returns `None` when the message pages are not cached.
pub fn begin_send_message<C: SyncCache>(
    cache: &mut C,
    conversation_id: EntityId,
    content: &str,
    now: DateTime<Utc>,
) -> Option<PendingMessage> {
    let Some(pages) = cache.message_pages(conversation_id) else {
        debug!(%conversation_id, "message pages not cached, skipping optimistic insert");
        return None;
    };

    let message_uuid = Uuid::new_v4();
    let mut pages = (*pages).clone();
    pages.push(BotConversationMessage {
        id: None,
        uuid: message_uuid,
        message_status: MessageStatus::InProgress,
        sender: MessageSender::User,
        content: content.to_owned(),
        sources: None,
        block_uuid: None,
        created_at: now,
        extra: Map::new(),
    });
    cache.set_message_pages(conversation_id, Arc::new(pages));
    set_streaming(cache, conversation_id, true);

    Some(PendingMessage { conversation_id, message_uuid })
}

/// Finish a send started with `begin_send_message`.
pub fn settle_send_message<C: SyncCache>(cache: &mut C, pending: &PendingMessage, outcome: SendOutcome) {
    set_streaming(cache, pending.conversation_id, false);
    if outcome == SendOutcome::Succeeded {
        return;
    }

    let marked = cache.update_message_pages(pending.conversation_id, |current| {
        let mut pages = current.clone();
        if let Some(message) = pages.iter_mut().find(|m| m.uuid == pending.message_uuid) {
            message.message_status = MessageStatus::Error;
        }
        pages
    });
    if !marked {
        warn!(message_uuid = %pending.message_uuid, "failed send settled after message pages were evicted");
    }
}

fn set_streaming<C: SyncCache>(cache: &mut C, conversation_id: EntityId, is_streaming: bool) {
    let updated = cache.update_conversation(conversation_id, |current| Conversation {
        is_streaming,
        ..current.clone()
    });
    if !updated {
        debug!(%conversation_id, is_streaming, "conversation record not cached");
    }
}
