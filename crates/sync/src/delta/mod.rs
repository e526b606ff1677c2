// Delta application engine.
//
// Applies an ordered batch of update actions to the cached notebook and
// message pages of one chat session. A batch is applied to working copies and
// written back once at the end, so a batch that fails part-way leaves the
// cache untouched. Only a block with a missing predecessor fails a batch;
// every other anomaly is logged and the action skipped.

pub mod blocks;
pub mod messages;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use chatbook_common::patch::{self, patch_typed, PatchMode};
use chatbook_common::protocol::updates::{RequestUpdate, ResponseUpdate};
use chatbook_common::types::{Conversation, EntityId, Notebook, PagedMessages};

use crate::cache::{NotebookKey, SyncCache};

/// The documents a batch applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchTarget {
    pub organization_id: i64,
    pub notebook_id: EntityId,
    pub conversation_id: EntityId,
}

impl PatchTarget {
    pub fn notebook_key(&self) -> NotebookKey {
        NotebookKey::new(self.organization_id, self.notebook_id)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeltaError {
    /// The cache no longer agrees with the server; the caller should re-fetch.
    #[error("block {block_uuid} follows {block_above_uuid}, which is not in notebook {notebook_id}")]
    MissingPredecessor { notebook_id: EntityId, block_uuid: Uuid, block_above_uuid: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Notebook or message pages are not cached; nothing was written.
    CacheMiss,
    Applied { applied: usize, skipped: usize },
}

/// Decode raw update actions one by one, dropping (and logging) any that do
/// not match their declared shape.
pub fn decode_updates<T: DeserializeOwned>(raw: Vec<Value>) -> Vec<T> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, value)| {
            let action_type =
                value.get("action_type").and_then(Value::as_str).unwrap_or("<missing>").to_owned();
            match serde_json::from_value(value) {
                Ok(update) => Some(update),
                Err(error) => {
                    warn!(index, %action_type, %error, "dropping malformed update action");
                    None
                }
            }
        })
        .collect()
}

/// Apply actions the client is about to send, before the server confirms them.
pub fn apply_request<C: SyncCache>(
    cache: &mut C,
    target: &PatchTarget,
    updates: &[RequestUpdate],
) -> Result<ApplyOutcome, DeltaError> {
    let Some(mut batch) = Batch::load(cache, target) else {
        debug!(notebook_id = %target.notebook_id, conversation_id = %target.conversation_id, "request batch skipped: documents not cached");
        return Ok(ApplyOutcome::CacheMiss);
    };

    for update in updates {
        match update {
            RequestUpdate::CreateBlock { block } => batch.create_block(block.clone())?,
            RequestUpdate::DeleteBlock { block_uuid } => batch.delete_block(*block_uuid),
            RequestUpdate::UpdateBlock { block_uuid, key, value } => {
                batch.update_block(*block_uuid, &[key.as_str()], value.clone(), PatchMode::Replace)
            }
            RequestUpdate::UpdateProject { key, value } => {
                batch.update_metadata(&[key.as_str()], value.clone(), PatchMode::Replace)
            }
            RequestUpdate::Unknown => {
                debug!("skipping unrecognized request action");
                batch.skipped += 1;
            }
        }
    }

    Ok(batch.commit(cache, target))
}

/// Apply actions confirmed or pushed by the server.
pub fn apply_response<C: SyncCache>(
    cache: &mut C,
    target: &PatchTarget,
    updates: &[ResponseUpdate],
) -> Result<ApplyOutcome, DeltaError> {
    let Some(mut batch) = Batch::load(cache, target) else {
        debug!(notebook_id = %target.notebook_id, conversation_id = %target.conversation_id, "response batch skipped: documents not cached");
        return Ok(ApplyOutcome::CacheMiss);
    };

    for update in updates {
        let mode = update.patch_mode();
        match update {
            ResponseUpdate::CreateBlock { block } => batch.create_block(block.clone())?,
            ResponseUpdate::DeleteBlock { block_uuid } => batch.delete_block(*block_uuid),
            ResponseUpdate::UpdateBlock { block_uuid, key, value, .. } => {
                batch.update_block(*block_uuid, key.segments(), value.clone(), mode)
            }
            ResponseUpdate::UpdateProject { key, value, .. } => {
                batch.update_metadata(key.segments(), value.clone(), mode)
            }
            ResponseUpdate::CreateBotConversationMessage { bot_conversation_message } => {
                messages::upsert_message(&mut batch.pages, bot_conversation_message.clone());
                batch.mark_pages();
            }
            ResponseUpdate::UpdateBotConversationMessage {
                bot_conversation_message_uuid,
                key,
                value,
                ..
            } => batch.update_message(*bot_conversation_message_uuid, key.segments(), value.clone(), mode),
            ResponseUpdate::DeleteBotConversationMessage { bot_conversation_message_uuid } => {
                if messages::remove_message(&mut batch.pages, *bot_conversation_message_uuid) {
                    batch.mark_pages();
                } else {
                    debug!(message_uuid = %bot_conversation_message_uuid, "delete for message not in cache");
                    batch.skipped += 1;
                }
            }
            ResponseUpdate::UpdateBotConversation { bot_conversation_id, key, value, .. } => {
                batch.update_conversation(*bot_conversation_id, key.segments(), value.clone(), mode)
            }
            ResponseUpdate::Unknown => {
                debug!("skipping unrecognized response action");
                batch.skipped += 1;
            }
        }
    }

    // Pushes can arrive out of timestamp order.
    if messages::sort_by_created_at(&mut batch.pages) {
        batch.pages_dirty = true;
    }

    Ok(batch.commit(cache, target))
}

// ── Working copies ─────────────────────────────────────────────────

struct ListPatch {
    path: Vec<String>,
    value: Value,
    mode: PatchMode,
}

/// Mutable copies of the cached documents for the duration of one batch.
struct Batch {
    notebook: Notebook,
    notebook_dirty: bool,
    pages: PagedMessages,
    pages_dirty: bool,
    conversation: Option<Conversation>,
    conversation_dirty: bool,
    list_patches: Vec<ListPatch>,
    applied: usize,
    skipped: usize,
}

impl Batch {
    fn load<C: SyncCache>(cache: &C, target: &PatchTarget) -> Option<Self> {
        let notebook = cache.notebook(&target.notebook_key())?;
        let pages = cache.message_pages(target.conversation_id)?;
        let conversation = cache.conversation(target.conversation_id);
        Some(Self {
            notebook: Notebook::clone(&notebook),
            notebook_dirty: false,
            pages: PagedMessages::clone(&pages),
            pages_dirty: false,
            conversation: conversation.map(|record| Conversation::clone(&record)),
            conversation_dirty: false,
            list_patches: Vec::new(),
            applied: 0,
            skipped: 0,
        })
    }

    fn mark_notebook(&mut self) {
        self.notebook_dirty = true;
        self.applied += 1;
    }

    fn mark_pages(&mut self) {
        self.pages_dirty = true;
        self.applied += 1;
    }

    fn create_block(&mut self, block: chatbook_common::types::Block) -> Result<(), DeltaError> {
        blocks::upsert_block(&mut self.notebook, block)?;
        self.mark_notebook();
        Ok(())
    }

    fn delete_block(&mut self, uuid: Uuid) {
        if blocks::remove_block(&mut self.notebook, uuid) {
            self.mark_notebook();
        } else {
            warn!(block_uuid = %uuid, "delete for block not in cache");
            self.skipped += 1;
        }
    }

    fn update_block<S: AsRef<str>>(&mut self, uuid: Uuid, path: &[S], value: Value, mode: PatchMode) {
        match blocks::patch_block(&mut self.notebook, uuid, path, value, mode) {
            Ok(true) => self.mark_notebook(),
            Ok(false) => {
                warn!(block_uuid = %uuid, path = %patch::join(path), "update for block not in cache");
                self.skipped += 1;
            }
            Err(error) => {
                error!(block_uuid = %uuid, %error, "failed to patch block");
                self.skipped += 1;
            }
        }
    }

    fn update_metadata<S: AsRef<str>>(&mut self, path: &[S], value: Value, mode: PatchMode) {
        match patch_typed(&self.notebook.metadata, path, value.clone(), mode) {
            Ok(metadata) => {
                self.notebook.metadata = metadata;
                self.mark_notebook();
                self.list_patches.push(ListPatch {
                    path: path.iter().map(|segment| segment.as_ref().to_owned()).collect(),
                    value,
                    mode,
                });
            }
            Err(error) => {
                error!(notebook_id = %self.notebook.metadata.id, %error, "failed to patch notebook metadata");
                self.skipped += 1;
            }
        }
    }

    fn update_message<S: AsRef<str>>(&mut self, uuid: Uuid, path: &[S], value: Value, mode: PatchMode) {
        match messages::patch_message(&mut self.pages, uuid, path, value, mode) {
            Ok(true) => self.mark_pages(),
            Ok(false) => {
                error!(message_uuid = %uuid, "update for message not in cache; message list is out of sync");
                self.skipped += 1;
            }
            Err(error) => {
                error!(message_uuid = %uuid, %error, "failed to patch message");
                self.skipped += 1;
            }
        }
    }

    fn update_conversation<S: AsRef<str>>(
        &mut self,
        bot_conversation_id: i64,
        path: &[S],
        value: Value,
        mode: PatchMode,
    ) {
        let Some(conversation) = self.conversation.as_ref() else {
            debug!(bot_conversation_id, "conversation record not cached");
            self.skipped += 1;
            return;
        };
        if conversation.id != EntityId::Persisted(bot_conversation_id) {
            warn!(bot_conversation_id, cached_id = %conversation.id, "conversation update for another conversation");
            self.skipped += 1;
            return;
        }
        match patch_typed(conversation, path, value, mode) {
            Ok(next) => {
                self.conversation = Some(next);
                self.conversation_dirty = true;
                self.applied += 1;
            }
            Err(error) => {
                error!(bot_conversation_id, %error, "failed to patch conversation");
                self.skipped += 1;
            }
        }
    }

    fn commit<C: SyncCache>(self, cache: &mut C, target: &PatchTarget) -> ApplyOutcome {
        let outcome = ApplyOutcome::Applied { applied: self.applied, skipped: self.skipped };
        let notebook_uuid = self.notebook.metadata.uuid;

        if self.notebook_dirty {
            cache.set_notebook(target.notebook_key(), Arc::new(self.notebook));
        }
        if self.pages_dirty {
            cache.set_message_pages(target.conversation_id, Arc::new(self.pages));
        }
        if let (true, Some(conversation)) = (self.conversation_dirty, self.conversation) {
            cache.set_conversation(target.conversation_id, Arc::new(conversation));
        }
        if !self.list_patches.is_empty() {
            propagate_to_notebook_list(cache, target.organization_id, notebook_uuid, &self.list_patches);
        }
        outcome
    }
}

/// Mirror metadata patches into the organization's notebook list so list
/// views stay current without a re-fetch.
fn propagate_to_notebook_list<C: SyncCache>(
    cache: &mut C,
    organization_id: i64,
    notebook_uuid: Uuid,
    patches: &[ListPatch],
) {
    let Some(list) = cache.notebook_list_pages(organization_id) else {
        return;
    };
    let mut list = (*list).clone();
    let Some(entry) = list.iter_mut().find(|entry| entry.uuid == notebook_uuid) else {
        debug!(%notebook_uuid, "notebook not in cached list");
        return;
    };

    let mut patched = entry.clone();
    for list_patch in patches {
        match patch_typed(&patched, list_patch.path.as_slice(), list_patch.value.clone(), list_patch.mode) {
            Ok(next) => patched = next,
            Err(error) => {
                warn!(%notebook_uuid, %error, "failed to mirror metadata patch into notebook list");
                return;
            }
        }
    }
    *entry = patched;
    cache.set_notebook_list_pages(organization_id, Arc::new(list));
}
