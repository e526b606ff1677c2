// Push-channel connection state machine.
//
// Tracks one WebSocket's lifecycle: authenticate, subscribe to the active
// notebook/conversation pair, resubscribe when the pair changes. The machine
// is synchronous. Work that must wait (token fetch, retry delay) is handed to
// the caller as an `Effect` and comes back later as an event, so the machine
// keeps handling events while that work is in flight.
//
// The socket is abstracted via `SyncSocket` for testability.

use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use chatbook_common::protocol::ws::ClientMessage;
use chatbook_common::types::EntityId;

/// Close code sent when authentication cannot proceed.
pub const AUTH_FAILED_CLOSE_CODE: u16 = 4001;

pub const DEFAULT_AUTH_RETRY_DELAY: Duration = Duration::from_secs(1);

// ── Socket trait ────────────────────────────────────────────────────

/// Outbound half of the push channel.
pub trait SyncSocket {
    /// Queue one text frame. Frames go out in call order.
    fn send_text(&mut self, text: String) -> anyhow::Result<()>;

    fn close(&mut self, code: u16, reason: &str);
}

// ── States, events, effects ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Authenticating,
    Subscribing,
    /// No usable socket until the next `SetSocket`.
    Closed,
}

#[derive(Debug)]
pub enum ConnectionEvent<S> {
    /// The transport connected.
    SetSocket(S),
    AuthSucceeded,
    AuthRejected { reason: String },
    /// Result of an `Effect::RequestToken`.
    TokenResolved { attempt: u64, token: Result<String, String> },
    /// The delay from an `Effect::RetryAuthAfter` elapsed.
    RetryAuth,
    SubscribeToNotebookAndBotConversation { notebook_id: EntityId, conversation_id: EntityId },
    SubscribedToNotebook { notebook_id: i64 },
    SubscribedToBotConversation { conversation_id: i64 },
    /// The transport closed.
    Closed,
}

/// Deferred work requested by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Fetch a token and report it back as `TokenResolved` with this attempt.
    RequestToken { attempt: u64 },
    /// Fire `RetryAuth` after `delay`.
    RetryAuthAfter { delay: Duration },
}

/// Notebook/conversation pair the channel should be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub notebook_id: EntityId,
    pub conversation_id: EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthAttempt {
    None,
    FetchingToken(u64),
    AwaitingResponse,
}

// ── Machine ─────────────────────────────────────────────────────────

pub struct ConnectionMachine<S: SyncSocket> {
    tab_id: Uuid,
    auth_retry_delay: Duration,
    socket: Option<S>,
    state: ConnectionState,
    authenticated: bool,
    target: Option<SubscriptionTarget>,
    subscribed_to_notebook: bool,
    subscribed_to_conversation: bool,
    auth_attempt: AuthAttempt,
    attempts_started: u64,
}

impl<S: SyncSocket> ConnectionMachine<S> {
    pub fn new(tab_id: Uuid, auth_retry_delay: Duration) -> Self {
        Self {
            tab_id,
            auth_retry_delay,
            socket: None,
            state: ConnectionState::Idle,
            authenticated: false,
            target: None,
            subscribed_to_notebook: false,
            subscribed_to_conversation: false,
            auth_attempt: AuthAttempt::None,
            attempts_started: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn target(&self) -> Option<SubscriptionTarget> {
        self.target
    }

    pub fn is_subscribed_to_notebook(&self) -> bool {
        self.subscribed_to_notebook
    }

    pub fn is_subscribed_to_bot_conversation(&self) -> bool {
        self.subscribed_to_conversation
    }

    pub fn socket(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    /// Send a message in a fresh envelope. Returns false if it was not sent.
    pub fn send(&mut self, message: ClientMessage) -> bool {
        let message_type = message.message_type().as_str();
        let Some(socket) = self.socket.as_mut() else {
            debug!(message_type, "no socket, dropping outbound message");
            return false;
        };
        let frame = match message.into_envelope(self.tab_id).to_json() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(message_type, %error, "failed to encode outbound message");
                return false;
            }
        };
        if let Err(error) = socket.send_text(frame) {
            warn!(message_type, %error, "failed to send outbound message");
            return false;
        }
        true
    }

    pub fn handle(&mut self, event: ConnectionEvent<S>) -> Vec<Effect> {
        match event {
            ConnectionEvent::SetSocket(socket) => {
                self.socket = Some(socket);
                self.authenticated = false;
                self.reset_acks();
                self.auth_attempt = AuthAttempt::None;
                self.enter_authenticating()
            }

            ConnectionEvent::TokenResolved { attempt, token } => {
                if self.auth_attempt != AuthAttempt::FetchingToken(attempt) {
                    debug!(attempt, "ignoring stale token result");
                    return Vec::new();
                }
                match token {
                    Ok(token) if !token.trim().is_empty() => {
                        self.auth_attempt = AuthAttempt::AwaitingResponse;
                        if self.send(ClientMessage::Auth { token }) {
                            Vec::new()
                        } else {
                            self.fail_auth("could not send auth message")
                        }
                    }
                    Ok(_) => self.fail_auth("token provider returned an empty token"),
                    Err(reason) => self.fail_auth(&reason),
                }
            }

            ConnectionEvent::AuthSucceeded => {
                self.authenticated = true;
                self.auth_attempt = AuthAttempt::None;
                if self.state != ConnectionState::Authenticating {
                    return Vec::new();
                }
                info!(tab_id = %self.tab_id, "push channel authenticated");
                if self.target.is_some() && !self.fully_subscribed() {
                    self.enter_subscribing()
                } else {
                    self.transition(ConnectionState::Idle);
                    Vec::new()
                }
            }

            ConnectionEvent::AuthRejected { reason } => {
                if self.state == ConnectionState::Closed {
                    return Vec::new();
                }
                self.authenticated = false;
                self.reset_acks();
                self.transition(ConnectionState::Authenticating);
                self.fail_auth(&reason)
            }

            ConnectionEvent::RetryAuth => {
                if self.state != ConnectionState::Authenticating {
                    debug!(state = ?self.state, "ignoring auth retry");
                    return Vec::new();
                }
                self.enter_authenticating()
            }

            ConnectionEvent::SubscribeToNotebookAndBotConversation { notebook_id, conversation_id } => {
                let next = SubscriptionTarget { notebook_id, conversation_id };
                self.unsubscribe_changed(next);
                self.target = Some(next);
                self.reset_acks();
                if self.state == ConnectionState::Closed {
                    debug!(%notebook_id, %conversation_id, "recorded subscription target while closed");
                    return Vec::new();
                }
                self.enter_subscribing()
            }

            ConnectionEvent::SubscribedToNotebook { notebook_id } => {
                if self.target.map(|t| t.notebook_id) == Some(EntityId::Persisted(notebook_id)) {
                    self.subscribed_to_notebook = true;
                    self.finish_subscribing();
                } else {
                    debug!(notebook_id, "ignoring stale notebook subscription ack");
                }
                Vec::new()
            }

            ConnectionEvent::SubscribedToBotConversation { conversation_id } => {
                if self.target.map(|t| t.conversation_id) == Some(EntityId::Persisted(conversation_id)) {
                    self.subscribed_to_conversation = true;
                    self.finish_subscribing();
                } else {
                    debug!(conversation_id, "ignoring stale conversation subscription ack");
                }
                Vec::new()
            }

            ConnectionEvent::Closed => {
                self.socket = None;
                self.authenticated = false;
                self.reset_acks();
                self.auth_attempt = AuthAttempt::None;
                self.transition(ConnectionState::Closed);
                Vec::new()
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "connection state change");
            self.state = next;
        }
    }

    fn reset_acks(&mut self) {
        self.subscribed_to_notebook = false;
        self.subscribed_to_conversation = false;
    }

    fn fully_subscribed(&self) -> bool {
        self.subscribed_to_notebook && self.subscribed_to_conversation
    }

    fn enter_authenticating(&mut self) -> Vec<Effect> {
        self.transition(ConnectionState::Authenticating);
        if self.socket.is_none() || self.auth_attempt != AuthAttempt::None {
            return Vec::new();
        }
        self.attempts_started += 1;
        let attempt = self.attempts_started;
        self.auth_attempt = AuthAttempt::FetchingToken(attempt);
        vec![Effect::RequestToken { attempt }]
    }

    /// Close the socket and schedule another attempt.
    fn fail_auth(&mut self, reason: &str) -> Vec<Effect> {
        warn!(reason, retry_in = ?self.auth_retry_delay, "push channel authentication failed");
        self.auth_attempt = AuthAttempt::None;
        if let Some(socket) = self.socket.as_mut() {
            socket.close(AUTH_FAILED_CLOSE_CODE, reason);
        }
        vec![Effect::RetryAuthAfter { delay: self.auth_retry_delay }]
    }

    fn enter_subscribing(&mut self) -> Vec<Effect> {
        self.transition(ConnectionState::Subscribing);
        if !self.authenticated {
            return self.enter_authenticating();
        }
        let Some(target) = self.target else {
            self.transition(ConnectionState::Idle);
            return Vec::new();
        };
        let (EntityId::Persisted(project_id), EntityId::Persisted(bot_conversation_id)) =
            (target.notebook_id, target.conversation_id)
        else {
            debug!(
                notebook_id = %target.notebook_id,
                conversation_id = %target.conversation_id,
                "subscription target not persisted yet"
            );
            self.transition(ConnectionState::Idle);
            return Vec::new();
        };

        self.send(ClientMessage::SubscribeProject { project_id });
        self.send(ClientMessage::SubscribeBotConversation { bot_conversation_id });
        Vec::new()
    }

    fn finish_subscribing(&mut self) {
        if self.state == ConnectionState::Subscribing && self.fully_subscribed() {
            info!(subscription = ?self.target, "push channel subscribed");
            self.transition(ConnectionState::Idle);
        }
    }

    /// Best-effort teardown of channels the new target no longer covers.
    fn unsubscribe_changed(&mut self, next: SubscriptionTarget) {
        let Some(previous) = self.target else {
            return;
        };
        if !self.authenticated {
            return;
        }
        if previous.notebook_id != next.notebook_id {
            if let EntityId::Persisted(project_id) = previous.notebook_id {
                self.send(ClientMessage::UnsubscribeProject { project_id });
            }
        }
        if previous.conversation_id != next.conversation_id {
            if let EntityId::Persisted(bot_conversation_id) = previous.conversation_id {
                self.send(ClientMessage::UnsubscribeBotConversation { bot_conversation_id });
            }
        }
    }
}
