// In-process cache used by the CLI and tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use chatbook_common::types::{Conversation, EntityId, Notebook, PagedMessages, PagedNotebookList};

use super::{NotebookKey, SyncCache};

#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    notebooks: HashMap<NotebookKey, Arc<Notebook>>,
    message_pages: HashMap<EntityId, Arc<PagedMessages>>,
    conversations: HashMap<EntityId, Arc<Conversation>>,
    notebook_lists: HashMap<i64, Arc<PagedNotebookList>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a notebook after it was deleted or recreated.
    pub fn invalidate_notebook(&mut self, key: &NotebookKey) -> bool {
        self.notebooks.remove(key).is_some()
    }

    /// Drop a conversation record together with its message pages.
    pub fn invalidate_conversation(&mut self, conversation_id: EntityId) -> bool {
        let pages = self.message_pages.remove(&conversation_id).is_some();
        let record = self.conversations.remove(&conversation_id).is_some();
        pages || record
    }

    /// Forget everything (sign-out).
    pub fn clear(&mut self) {
        self.notebooks.clear();
        self.message_pages.clear();
        self.conversations.clear();
        self.notebook_lists.clear();
    }

    /// Load a seed document fetched elsewhere.
    pub fn seed(&mut self, seed: CacheSeed) -> Result<()> {
        let conversation_id =
            seed.conversation_id.or_else(|| seed.conversation.as_ref().map(|c| c.id));

        if let Some(notebook) = seed.notebook {
            let key = NotebookKey::new(seed.organization_id, notebook.metadata.id);
            self.notebooks.insert(key, Arc::new(notebook));
        }
        if let Some(messages) = seed.messages {
            let Some(conversation_id) = conversation_id else {
                bail!("seed has messages but no conversation id");
            };
            self.message_pages.insert(conversation_id, Arc::new(messages));
        }
        if let Some(conversation) = seed.conversation {
            self.conversations.insert(conversation.id, Arc::new(conversation));
        }
        if let Some(list) = seed.notebook_list {
            self.notebook_lists.insert(seed.organization_id, Arc::new(list));
        }
        Ok(())
    }
}

impl SyncCache for MemoryCache {
    fn notebook(&self, key: &NotebookKey) -> Option<Arc<Notebook>> {
        self.notebooks.get(key).cloned()
    }

    fn set_notebook(&mut self, key: NotebookKey, notebook: Arc<Notebook>) {
        self.notebooks.insert(key, notebook);
    }

    fn message_pages(&self, conversation_id: EntityId) -> Option<Arc<PagedMessages>> {
        self.message_pages.get(&conversation_id).cloned()
    }

    fn set_message_pages(&mut self, conversation_id: EntityId, pages: Arc<PagedMessages>) {
        self.message_pages.insert(conversation_id, pages);
    }

    fn conversation(&self, conversation_id: EntityId) -> Option<Arc<Conversation>> {
        self.conversations.get(&conversation_id).cloned()
    }

    fn set_conversation(&mut self, conversation_id: EntityId, conversation: Arc<Conversation>) {
        self.conversations.insert(conversation_id, conversation);
    }

    fn notebook_list_pages(&self, organization_id: i64) -> Option<Arc<PagedNotebookList>> {
        self.notebook_lists.get(&organization_id).cloned()
    }

    fn set_notebook_list_pages(&mut self, organization_id: i64, pages: Arc<PagedNotebookList>) {
        self.notebook_lists.insert(organization_id, pages);
    }
}

/// Snapshot of one chat session's documents, as fetched over REST.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSeed {
    pub organization_id: i64,
    /// Key for `messages`; defaults to `conversation.id`.
    #[serde(default)]
    pub conversation_id: Option<EntityId>,
    #[serde(default)]
    pub notebook: Option<Notebook>,
    #[serde(default)]
    pub messages: Option<PagedMessages>,
    #[serde(default)]
    pub conversation: Option<Conversation>,
    #[serde(default)]
    pub notebook_list: Option<PagedNotebookList>,
}

impl CacheSeed {
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cache seed `{}`", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse cache seed `{}`", path.display()))
    }
}
