// Document model shared by the sync core: notebooks, blocks, conversations and message pages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identity of a server entity that may not have been persisted yet.
///
/// Serialized untagged: persisted ids are JSON numbers, pending ids are the
/// client-generated UUID string used until the server assigns a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Persisted(i64),
    Pending(Uuid),
}

impl EntityId {
    pub fn pending() -> Self {
        Self::Pending(Uuid::new_v4())
    }

    /// The server-assigned id, if there is one.
    pub fn persisted(self) -> Option<i64> {
        match self {
            Self::Persisted(id) => Some(id),
            Self::Pending(_) => None,
        }
    }

    pub fn is_persisted(self) -> bool {
        matches!(self, Self::Persisted(_))
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self::Persisted(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persisted(id) => write!(f, "{id}"),
            Self::Pending(uuid) => write!(f, "pending:{uuid}"),
        }
    }
}

// ── Notebook ───────────────────────────────────────────────────────

/// Notebook ("project" on the wire) metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotebookMetadata {
    pub id: EntityId,
    pub uuid: Uuid,
    pub organization_id: i64,
    #[serde(default)]
    pub bot_conversation_id: Option<EntityId>,
    #[serde(default)]
    pub title: String,
    /// Server fields the client does not model; kept so path patches survive.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Kind of content a block holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Python,
    Sql,
    Csv,
    Image,
    Pdf,
    Table,
    Text,
}

/// A typed unit of content within a notebook.
///
/// Order is not the position in `Notebook::blocks` but the chain of
/// `block_above_uuid` predecessor pointers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    /// Absent until the server has persisted the block.
    #[serde(default)]
    pub id: Option<i64>,
    pub uuid: Uuid,
    pub block_above_uuid: Option<Uuid>,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default)]
    pub custom_block_info: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notebook {
    pub metadata: NotebookMetadata,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Notebook {
    pub fn block(&self, uuid: Uuid) -> Option<&Block> {
        self.blocks.iter().find(|block| block.uuid == uuid)
    }

    /// Blocks in chain order, starting from the block with no predecessor.
    ///
    /// Stops early if the chain is broken or cyclic, so the result can be
    /// shorter than `blocks`.
    pub fn ordered_blocks(&self) -> Vec<&Block> {
        let mut ordered = Vec::with_capacity(self.blocks.len());
        let mut above: Option<Uuid> = None;
        while ordered.len() < self.blocks.len() {
            let Some(next) = self.blocks.iter().find(|block| block.block_above_uuid == above) else {
                break;
            };
            ordered.push(next);
            above = Some(next.uuid);
        }
        ordered
    }
}

// ── Conversation ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    InProgress,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    User,
    Bot,
}

/// One entry of a bot conversation's message stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotConversationMessage {
    #[serde(default)]
    pub id: Option<i64>,
    pub uuid: Uuid,
    pub message_status: MessageStatus,
    pub sender: MessageSender,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sources: Option<Vec<Value>>,
    /// Block this message produced or refers to.
    #[serde(default)]
    pub block_uuid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The chat session record. `is_streaming` gates the "bot is generating" UI state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: EntityId,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub title: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Pagination ─────────────────────────────────────────────────────

/// One fetched page of a paginated collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn single(item: T) -> Self {
        Self { results: vec![item], count: 1, next: None }
    }
}

/// All fetched pages of a paginated collection, oldest page first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Paged<T> {
    #[serde(default = "Vec::new")]
    pub pages: Vec<Page<T>>,
}

impl<T> Default for Paged<T> {
    fn default() -> Self {
        Self { pages: Vec::new() }
    }
}

impl<T> Paged<T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|page| page.results.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.pages.iter_mut().flat_map(|page| page.results.iter_mut())
    }

    /// Total number of loaded items across pages.
    pub fn len(&self) -> usize {
        self.pages.iter().map(|page| page.results.len()).sum()
    }

    /// Append to the last page, creating the first page if none is loaded.
    pub fn push(&mut self, item: T) {
        match self.pages.last_mut() {
            Some(page) => {
                page.results.push(item);
                page.count += 1;
            }
            None => self.pages.push(Page::single(item)),
        }
    }
}

pub type PagedMessages = Paged<BotConversationMessage>;
pub type PagedNotebookList = Paged<NotebookMetadata>;
