// WebSocket message types for the chatbook push channel.
//
// Every frame is a JSON object tagged by `message_type`. Outbound frames carry
// the full envelope (request id, timestamp, tab id); inbound frames are only
// required to carry `message_type` and `message_payload`.

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// All message types in the push-channel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Client -> Server
    Auth,
    SubscribeProject,
    UnsubscribeProject,
    SubscribeBotConversation,
    UnsubscribeBotConversation,
    StopStream,

    // Server -> Client
    CheckAuthResponse,
    AuthResponse,
    SubscribeProjectResponse,
    SubscribeBotConversationResponse,
    UnsubscribeProjectResponse,
    UnsubscribeBotConversationResponse,
    PatchProjectResponse,
}

impl MessageType {
    pub const ALL: &'static [MessageType] = &[
        Self::Auth,
        Self::SubscribeProject,
        Self::UnsubscribeProject,
        Self::SubscribeBotConversation,
        Self::UnsubscribeBotConversation,
        Self::StopStream,
        Self::CheckAuthResponse,
        Self::AuthResponse,
        Self::SubscribeProjectResponse,
        Self::SubscribeBotConversationResponse,
        Self::UnsubscribeProjectResponse,
        Self::UnsubscribeBotConversationResponse,
        Self::PatchProjectResponse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::SubscribeProject => "SUBSCRIBE_PROJECT",
            Self::UnsubscribeProject => "UNSUBSCRIBE_PROJECT",
            Self::SubscribeBotConversation => "SUBSCRIBE_BOT_CONVERSATION",
            Self::UnsubscribeBotConversation => "UNSUBSCRIBE_BOT_CONVERSATION",
            Self::StopStream => "STOP_STREAM",
            Self::CheckAuthResponse => "CHECK_AUTH_RESPONSE",
            Self::AuthResponse => "AUTH_RESPONSE",
            Self::SubscribeProjectResponse => "SUBSCRIBE_PROJECT_RESPONSE",
            Self::SubscribeBotConversationResponse => "SUBSCRIBE_BOT_CONVERSATION_RESPONSE",
            Self::UnsubscribeProjectResponse => "UNSUBSCRIBE_PROJECT_RESPONSE",
            Self::UnsubscribeBotConversationResponse => "UNSUBSCRIBE_BOT_CONVERSATION_RESPONSE",
            Self::PatchProjectResponse => "PATCH_PROJECT_RESPONSE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == value)
    }
}

/// Prefix the server uses to name a conversation's token stream.
pub const STREAM_UUID_PREFIX: &str = "BOT_CONVERSATION_";

pub fn stop_stream_uuid(bot_conversation_id: i64) -> String {
    format!("{STREAM_UUID_PREFIX}{bot_conversation_id}")
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid {message_type} payload: {source}")]
    Payload {
        message_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} is not a client message type")]
    NotAClientMessage(&'static str),
}

// ── Outbound ───────────────────────────────────────────────────────

/// Messages the client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Auth { token: String },
    SubscribeProject { project_id: i64 },
    UnsubscribeProject { project_id: i64 },
    SubscribeBotConversation { bot_conversation_id: i64 },
    UnsubscribeBotConversation { bot_conversation_id: i64 },
    /// Ask the server to stop generating into a conversation.
    StopStream { stream_uuid: String },
}

#[derive(Deserialize)]
struct TokenPayload {
    token: String,
}

#[derive(Deserialize)]
struct ProjectIdPayload {
    project_id: i64,
}

#[derive(Deserialize)]
struct ConversationIdPayload {
    bot_conversation_id: i64,
}

#[derive(Deserialize)]
struct StreamPayload {
    stream_uuid: String,
}

impl ClientMessage {
    pub fn stop_stream(bot_conversation_id: i64) -> Self {
        Self::StopStream { stream_uuid: stop_stream_uuid(bot_conversation_id) }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Auth { .. } => MessageType::Auth,
            Self::SubscribeProject { .. } => MessageType::SubscribeProject,
            Self::UnsubscribeProject { .. } => MessageType::UnsubscribeProject,
            Self::SubscribeBotConversation { .. } => MessageType::SubscribeBotConversation,
            Self::UnsubscribeBotConversation { .. } => MessageType::UnsubscribeBotConversation,
            Self::StopStream { .. } => MessageType::StopStream,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Auth { token } => json!({ "token": token }),
            Self::SubscribeProject { project_id } | Self::UnsubscribeProject { project_id } => {
                json!({ "project_id": project_id })
            }
            Self::SubscribeBotConversation { bot_conversation_id }
            | Self::UnsubscribeBotConversation { bot_conversation_id } => {
                json!({ "bot_conversation_id": bot_conversation_id })
            }
            Self::StopStream { stream_uuid } => json!({ "stream_uuid": stream_uuid }),
        }
    }

    /// Wrap in an envelope with a fresh request id and the current time.
    pub fn into_envelope(self, tab_id: Uuid) -> OutboundEnvelope {
        OutboundEnvelope {
            message_type: self.message_type(),
            message_payload: self.payload(),
            request_id: Uuid::new_v4(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            tab_id,
        }
    }

    /// Recover the message from an envelope (used by servers and test doubles).
    pub fn from_envelope(envelope: &OutboundEnvelope) -> Result<Self, ProtocolError> {
        let kind = envelope.message_type;
        let payload = envelope.message_payload.clone();
        Ok(match kind {
            MessageType::Auth => {
                Self::Auth { token: decode_payload::<TokenPayload>(kind, payload)?.token }
            }
            MessageType::SubscribeProject => Self::SubscribeProject {
                project_id: decode_payload::<ProjectIdPayload>(kind, payload)?.project_id,
            },
            MessageType::UnsubscribeProject => Self::UnsubscribeProject {
                project_id: decode_payload::<ProjectIdPayload>(kind, payload)?.project_id,
            },
            MessageType::SubscribeBotConversation => Self::SubscribeBotConversation {
                bot_conversation_id: decode_payload::<ConversationIdPayload>(kind, payload)?
                    .bot_conversation_id,
            },
            MessageType::UnsubscribeBotConversation => Self::UnsubscribeBotConversation {
                bot_conversation_id: decode_payload::<ConversationIdPayload>(kind, payload)?
                    .bot_conversation_id,
            },
            MessageType::StopStream => Self::StopStream {
                stream_uuid: decode_payload::<StreamPayload>(kind, payload)?.stream_uuid,
            },
            other => return Err(ProtocolError::NotAClientMessage(other.as_str())),
        })
    }
}

/// Outbound frame. Every field is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub message_type: MessageType,
    pub message_payload: Value,
    pub request_id: Uuid,
    /// ISO-8601 send time.
    pub timestamp: String,
    pub tab_id: Uuid,
}

impl OutboundEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Inbound ────────────────────────────────────────────────────────

/// Minimal inbound frame; anything beyond the tag and payload is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub message_type: String,
    #[serde(default)]
    pub message_payload: Value,
}

/// `AUTH_RESPONSE` / `CHECK_AUTH_RESPONSE` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthStatusPayload {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AuthStatusPayload {
    pub fn is_success(&self) -> bool {
        self.status.as_deref().is_some_and(|status| status.eq_ignore_ascii_case("success"))
    }
}

/// Body of (un)subscribe responses for the project channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSubscriptionPayload {
    pub project_id: i64,
    #[serde(default)]
    pub status: Option<String>,
}

impl ProjectSubscriptionPayload {
    /// A missing status counts as success.
    pub fn is_success(&self) -> bool {
        status_ok(self.status.as_deref())
    }
}

/// Body of (un)subscribe responses for the conversation channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSubscriptionPayload {
    pub bot_conversation_id: i64,
    #[serde(default)]
    pub status: Option<String>,
}

impl ConversationSubscriptionPayload {
    pub fn is_success(&self) -> bool {
        status_ok(self.status.as_deref())
    }
}

/// `PATCH_PROJECT_RESPONSE` body.
///
/// `updates` stays as raw JSON so one malformed action cannot reject the
/// whole frame; the delta engine decodes them one by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchProjectPayload {
    pub project_id: i64,
    pub bot_conversation_id: i64,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub updates: Vec<Value>,
}

fn status_ok(status: Option<&str>) -> bool {
    status.is_none_or(|status| status.eq_ignore_ascii_case("success"))
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    CheckAuthResponse(AuthStatusPayload),
    AuthResponse(AuthStatusPayload),
    SubscribeProjectResponse(ProjectSubscriptionPayload),
    SubscribeBotConversationResponse(ConversationSubscriptionPayload),
    UnsubscribeProjectResponse(ProjectSubscriptionPayload),
    UnsubscribeBotConversationResponse(ConversationSubscriptionPayload),
    PatchProjectResponse(PatchProjectPayload),
    /// A tag this client does not handle. Not an error.
    Unknown { message_type: String },
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: InboundEnvelope =
            serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: InboundEnvelope) -> Result<Self, ProtocolError> {
        let InboundEnvelope { message_type, message_payload: payload } = envelope;
        let Some(kind) = MessageType::parse(&message_type) else {
            return Ok(Self::Unknown { message_type });
        };

        Ok(match kind {
            MessageType::CheckAuthResponse => Self::CheckAuthResponse(decode_payload(kind, payload)?),
            MessageType::AuthResponse => Self::AuthResponse(decode_payload(kind, payload)?),
            MessageType::SubscribeProjectResponse => {
                Self::SubscribeProjectResponse(decode_payload(kind, payload)?)
            }
            MessageType::SubscribeBotConversationResponse => {
                Self::SubscribeBotConversationResponse(decode_payload(kind, payload)?)
            }
            MessageType::UnsubscribeProjectResponse => {
                Self::UnsubscribeProjectResponse(decode_payload(kind, payload)?)
            }
            MessageType::UnsubscribeBotConversationResponse => {
                Self::UnsubscribeBotConversationResponse(decode_payload(kind, payload)?)
            }
            MessageType::PatchProjectResponse => {
                Self::PatchProjectResponse(decode_payload(kind, payload)?)
            }
            // Client-originated tags echoed back are not something we act on.
            _ => Self::Unknown { message_type },
        })
    }
}

fn decode_payload<T: DeserializeOwned>(kind: MessageType, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload)
        .map_err(|source| ProtocolError::Payload { message_type: kind.as_str(), source })
}
