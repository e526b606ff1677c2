// Inbound frame dispatch for one push-channel session.
//
// Each frame is handled to completion before the next: auth and subscription
// responses become machine events, patch pushes go through the delta engine.

use tracing::{debug, info, warn};

use chatbook_common::protocol::updates::ResponseUpdate;
use chatbook_common::protocol::ws::{ClientMessage, PatchProjectPayload, ServerMessage};
use chatbook_common::types::EntityId;

use crate::cache::SyncCache;
use crate::connection::{ConnectionEvent, ConnectionMachine, ConnectionState, Effect, SyncSocket};
use crate::delta::{self, ApplyOutcome, DeltaError, PatchTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChannel {
    Notebook,
    BotConversation,
}

/// Things the UI layer should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    PatchApplied { target: PatchTarget, outcome: ApplyOutcome },
    /// The server refused a subscription; the user should refresh.
    SubscriptionFailed { channel: SubscriptionChannel, id: i64, status: Option<String> },
    /// A push could not be applied; the documents must be re-fetched.
    CacheDesynchronized { target: PatchTarget, error: DeltaError },
}

pub struct SyncSession<S: SyncSocket, C: SyncCache> {
    machine: ConnectionMachine<S>,
    cache: C,
    organization_id: i64,
    notices: Vec<SessionNotice>,
}

impl<S: SyncSocket, C: SyncCache> SyncSession<S, C> {
    pub fn new(machine: ConnectionMachine<S>, cache: C, organization_id: i64) -> Self {
        Self { machine, cache, organization_id, notices: Vec::new() }
    }

    pub fn machine(&self) -> &ConnectionMachine<S> {
        &self.machine
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    pub fn into_cache(self) -> C {
        self.cache
    }

    pub fn take_notices(&mut self) -> Vec<SessionNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn handle(&mut self, event: ConnectionEvent<S>) -> Vec<Effect> {
        self.machine.handle(event)
    }

    pub fn subscribe(&mut self, notebook_id: EntityId, conversation_id: EntityId) -> Vec<Effect> {
        self.machine.handle(ConnectionEvent::SubscribeToNotebookAndBotConversation {
            notebook_id,
            conversation_id,
        })
    }

    /// Ask the server to stop generating into a conversation.
    pub fn stop_stream(&mut self, bot_conversation_id: i64) -> bool {
        self.machine.send(ClientMessage::stop_stream(bot_conversation_id))
    }

    /// Handle one inbound text frame.
    pub fn handle_frame(&mut self, text: &str) -> Vec<Effect> {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping undecodable frame");
                return Vec::new();
            }
        };

        match message {
            ServerMessage::AuthResponse(payload) | ServerMessage::CheckAuthResponse(payload) => {
                if payload.is_success() {
                    self.machine.handle(ConnectionEvent::AuthSucceeded)
                } else {
                    let reason = payload
                        .message
                        .or(payload.status)
                        .unwrap_or_else(|| "authentication rejected".into());
                    self.machine.handle(ConnectionEvent::AuthRejected { reason })
                }
            }

            ServerMessage::SubscribeProjectResponse(payload) => {
                if payload.is_success() {
                    return self
                        .machine
                        .handle(ConnectionEvent::SubscribedToNotebook { notebook_id: payload.project_id });
                }
                warn!(project_id = payload.project_id, status = ?payload.status, "notebook subscription failed");
                self.notices.push(SessionNotice::SubscriptionFailed {
                    channel: SubscriptionChannel::Notebook,
                    id: payload.project_id,
                    status: payload.status,
                });
                Vec::new()
            }

            ServerMessage::SubscribeBotConversationResponse(payload) => {
                if payload.is_success() {
                    return self.machine.handle(ConnectionEvent::SubscribedToBotConversation {
                        conversation_id: payload.bot_conversation_id,
                    });
                }
                warn!(
                    bot_conversation_id = payload.bot_conversation_id,
                    status = ?payload.status,
                    "conversation subscription failed"
                );
                self.notices.push(SessionNotice::SubscriptionFailed {
                    channel: SubscriptionChannel::BotConversation,
                    id: payload.bot_conversation_id,
                    status: payload.status,
                });
                Vec::new()
            }

            ServerMessage::UnsubscribeProjectResponse(payload) => {
                debug!(project_id = payload.project_id, "unsubscribed from notebook");
                Vec::new()
            }

            ServerMessage::UnsubscribeBotConversationResponse(payload) => {
                debug!(bot_conversation_id = payload.bot_conversation_id, "unsubscribed from conversation");
                Vec::new()
            }

            ServerMessage::PatchProjectResponse(payload) => {
                self.apply_push(payload);
                Vec::new()
            }

            ServerMessage::Unknown { message_type } => {
                info!(%message_type, "ignoring unhandled message type");
                Vec::new()
            }
        }
    }

    fn apply_push(&mut self, payload: PatchProjectPayload) {
        let target = PatchTarget {
            organization_id: self.organization_id,
            notebook_id: EntityId::Persisted(payload.project_id),
            conversation_id: EntityId::Persisted(payload.bot_conversation_id),
        };
        let updates: Vec<ResponseUpdate> = delta::decode_updates(payload.updates);

        match delta::apply_response(&mut self.cache, &target, &updates) {
            Ok(outcome) => {
                debug!(
                    notebook_id = payload.project_id,
                    bot_conversation_id = payload.bot_conversation_id,
                    ?outcome,
                    "applied pushed updates"
                );
                self.notices.push(SessionNotice::PatchApplied { target, outcome });
            }
            Err(error) => {
                warn!(%error, "pushed updates do not fit the cached notebook");
                self.notices.push(SessionNotice::CacheDesynchronized { target, error });
            }
        }
    }
}
