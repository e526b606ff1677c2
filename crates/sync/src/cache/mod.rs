// Cache accessor interface consumed by the delta engine.
//
// The sync core never owns documents. It reads and writes them through these
// accessors, and every write replaces the stored `Arc` so readers comparing
// pointers observe the change.

pub mod memory;

use std::sync::Arc;

use chatbook_common::types::{Conversation, EntityId, Notebook, PagedMessages, PagedNotebookList};

pub use memory::{CacheSeed, MemoryCache};

/// Notebooks are cached per organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotebookKey {
    pub organization_id: i64,
    pub notebook_id: EntityId,
}

impl NotebookKey {
    pub fn new(organization_id: i64, notebook_id: impl Into<EntityId>) -> Self {
        Self { organization_id, notebook_id: notebook_id.into() }
    }
}

pub trait SyncCache {
    fn notebook(&self, key: &NotebookKey) -> Option<Arc<Notebook>>;
    fn set_notebook(&mut self, key: NotebookKey, notebook: Arc<Notebook>);

    fn message_pages(&self, conversation_id: EntityId) -> Option<Arc<PagedMessages>>;
    fn set_message_pages(&mut self, conversation_id: EntityId, pages: Arc<PagedMessages>);

    fn conversation(&self, conversation_id: EntityId) -> Option<Arc<Conversation>>;
    fn set_conversation(&mut self, conversation_id: EntityId, conversation: Arc<Conversation>);

    fn notebook_list_pages(&self, organization_id: i64) -> Option<Arc<PagedNotebookList>>;
    fn set_notebook_list_pages(&mut self, organization_id: i64, pages: Arc<PagedNotebookList>);

    /// Replace the cached notebook with `update(current)`. Returns false on a miss.
    fn update_notebook<F>(&mut self, key: NotebookKey, update: F) -> bool
    where
        F: FnOnce(&Notebook) -> Notebook,
        Self: Sized,
    {
        let Some(current) = self.notebook(&key) else {
            return false;
        };
        self.set_notebook(key, Arc::new(update(&current)));
        true
    }

    fn update_message_pages<F>(&mut self, conversation_id: EntityId, update: F) -> bool
    where
        F: FnOnce(&PagedMessages) -> PagedMessages,
        Self: Sized,
    {
        let Some(current) = self.message_pages(conversation_id) else {
            return false;
        };
        self.set_message_pages(conversation_id, Arc::new(update(&current)));
        true
    }

    fn update_conversation<F>(&mut self, conversation_id: EntityId, update: F) -> bool
    where
        F: FnOnce(&Conversation) -> Conversation,
        Self: Sized,
    {
        let Some(current) = self.conversation(conversation_id) else {
            return false;
        };
        self.set_conversation(conversation_id, Arc::new(update(&current)));
        true
    }
}
