// Update actions carried by patch requests, patch responses and server pushes.
//
// Requests and responses share the `action_type` taxonomy but not payload
// shapes: request actions address a single `key`, response actions address a
// key path and may ask for string append instead of replacement.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::patch::PatchMode;
use crate::types::{Block, BotConversationMessage};

/// Key path into a document. Decodes from either a single key or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct KeyPath(pub Vec<String>);

impl KeyPath {
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for KeyPath {
    fn from(key: &str) -> Self {
        Self(vec![key.to_string()])
    }
}

impl<const N: usize> From<[&str; N]> for KeyPath {
    fn from(path: [&str; N]) -> Self {
        Self(path.iter().map(|segment| segment.to_string()).collect())
    }
}

impl<'de> Deserialize<'de> for KeyPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Key(String),
            Path(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Key(key) => Self(vec![key]),
            Raw::Path(path) => Self(path),
        })
    }
}

/// Action the client is about to send; applied optimistically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type")]
pub enum RequestUpdate {
    CreateBlock {
        block: Block,
    },
    DeleteBlock {
        block_uuid: Uuid,
    },
    UpdateBlock {
        block_uuid: Uuid,
        key: String,
        value: Value,
    },
    #[serde(alias = "UpdateNotebook")]
    UpdateProject {
        key: String,
        value: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Action confirmed or pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type")]
pub enum ResponseUpdate {
    CreateBlock {
        block: Block,
    },
    DeleteBlock {
        block_uuid: Uuid,
    },
    UpdateBlock {
        block_uuid: Uuid,
        key: KeyPath,
        value: Value,
        #[serde(default)]
        is_incremental_string_change: bool,
    },
    #[serde(alias = "UpdateNotebook")]
    UpdateProject {
        key: KeyPath,
        value: Value,
        #[serde(default)]
        is_incremental_string_change: bool,
    },
    CreateBotConversationMessage {
        bot_conversation_message: BotConversationMessage,
    },
    UpdateBotConversationMessage {
        bot_conversation_message_uuid: Uuid,
        key: KeyPath,
        value: Value,
        #[serde(default)]
        is_incremental_string_change: bool,
    },
    DeleteBotConversationMessage {
        bot_conversation_message_uuid: Uuid,
    },
    UpdateBotConversation {
        bot_conversation_id: i64,
        key: KeyPath,
        value: Value,
        #[serde(default)]
        is_incremental_string_change: bool,
    },
    #[serde(other)]
    Unknown,
}

impl ResponseUpdate {
    /// Write mode requested by a field-update action.
    pub fn patch_mode(&self) -> PatchMode {
        match self {
            Self::UpdateBlock { is_incremental_string_change, .. }
            | Self::UpdateProject { is_incremental_string_change, .. }
            | Self::UpdateBotConversationMessage { is_incremental_string_change, .. }
            | Self::UpdateBotConversation { is_incremental_string_change, .. } => {
                PatchMode::from_incremental(*is_incremental_string_change)
            }
            _ => PatchMode::Replace,
        }
    }
}
