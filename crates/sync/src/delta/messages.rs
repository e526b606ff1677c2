// Message page edits. Messages are found by UUID across every loaded page.

use serde_json::Value;
use uuid::Uuid;

use chatbook_common::patch::{patch_typed, PatchError, PatchMode};
use chatbook_common::types::{BotConversationMessage, PagedMessages};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageUpsert {
    Replaced,
    Appended,
}

/// Replace the message with the same UUID, or append it to the last page.
pub fn upsert_message(pages: &mut PagedMessages, message: BotConversationMessage) -> MessageUpsert {
    let uuid = message.uuid;
    if let Some(existing) = pages.iter_mut().find(|existing| existing.uuid == uuid) {
        *existing = message;
        return MessageUpsert::Replaced;
    }
    pages.push(message);
    MessageUpsert::Appended
}

/// Deep-set a field on a message. `Ok(false)` means the message is not loaded.
pub fn patch_message<S: AsRef<str>>(
    pages: &mut PagedMessages,
    uuid: Uuid,
    path: &[S],
    value: Value,
    mode: PatchMode,
) -> Result<bool, PatchError> {
    let Some(message) = pages.iter_mut().find(|message| message.uuid == uuid) else {
        return Ok(false);
    };
    *message = patch_typed(&*message, path, value, mode)?;
    Ok(true)
}

pub fn remove_message(pages: &mut PagedMessages, uuid: Uuid) -> bool {
    let mut removed = false;
    for page in &mut pages.pages {
        let before = page.results.len();
        page.results.retain(|message| message.uuid != uuid);
        let dropped = before - page.results.len();
        if dropped > 0 {
            page.count = page.count.saturating_sub(dropped);
            removed = true;
        }
    }
    removed
}

/// Stable-sort the whole collection by `created_at`, keeping each page's
/// size. Returns true if any order changed.
pub fn sort_by_created_at(pages: &mut PagedMessages) -> bool {
    let in_order = pages.iter().zip(pages.iter().skip(1)).all(|(a, b)| a.created_at <= b.created_at);
    if in_order {
        return false;
    }

    let sizes: Vec<usize> = pages.pages.iter().map(|page| page.results.len()).collect();
    let mut all: Vec<BotConversationMessage> =
        pages.pages.iter_mut().flat_map(|page| page.results.drain(..)).collect();
    all.sort_by_key(|message| message.created_at);

    let mut sorted = all.into_iter();
    for (page, size) in pages.pages.iter_mut().zip(sizes) {
        page.results.extend(sorted.by_ref().take(size));
    }
    true
}
