// Transport driver: owns the real WebSocket and feeds the session.
//
// Inbound frames, deferred effect results and external commands are handled
// one at a time on a single task. Token fetches and retry sleeps run on
// spawned tasks and report back through an event channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use chatbook_common::types::EntityId;

use crate::auth::TokenProvider;
use crate::cache::SyncCache;
use crate::config::{validate_ws_url, ReconnectConfig};
use crate::connection::{ConnectionEvent, Effect, SyncSocket};
use crate::session::{SessionNotice, SyncSession};

// ── Reconnect policy ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(250), max_delay: Duration::from_secs(30) }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before reconnect attempt number `failures` (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

// ── Socket ──────────────────────────────────────────────────────────

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// `SyncSocket` backed by the writer task's queue.
#[derive(Debug, Clone)]
pub struct ChannelSocket {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SyncSocket for ChannelSocket {
    fn send_text(&mut self, text: String) -> Result<()> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| anyhow::anyhow!("push channel writer has stopped"))
    }

    fn close(&mut self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close { code, reason: reason.to_owned() });
    }
}

// ── Commands ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Subscribe { notebook_id: EntityId, conversation_id: EntityId },
    StopStream { bot_conversation_id: i64 },
    Shutdown,
}

enum Exit {
    Disconnected,
    Shutdown,
}

/// Shared plumbing for running effects and forwarding notices.
struct Driver {
    tokens: Arc<dyn TokenProvider>,
    events: mpsc::UnboundedSender<ConnectionEvent<ChannelSocket>>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    /// Earliest time the next auth attempt may start after a failure.
    auth_retry_at: Option<Instant>,
}

impl Driver {
    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::RequestToken { attempt } => {
                    let tokens = Arc::clone(&self.tokens);
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let token = tokens.fetch_token().await.map_err(|error| format!("{error:#}"));
                        let _ = events.send(ConnectionEvent::TokenResolved { attempt, token });
                    });
                }
                Effect::RetryAuthAfter { delay } => {
                    self.auth_retry_at = Some(Instant::now() + delay);
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send(ConnectionEvent::RetryAuth);
                    });
                }
            }
        }
    }

    fn forward_notices<C: SyncCache>(&self, session: &mut SyncSession<ChannelSocket, C>) {
        for notice in session.take_notices() {
            match &notice {
                SessionNotice::PatchApplied { .. } => debug!(?notice, "session notice"),
                _ => warn!(?notice, "session notice"),
            }
            let _ = self.notices.send(notice);
        }
    }

    /// An auth failure closes the socket, so reconnecting must not start a
    /// new attempt before the auth retry delay has passed.
    fn reconnect_delay(&mut self, backoff: Duration) -> Duration {
        let auth_wait = self
            .auth_retry_at
            .take()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        backoff.max(auth_wait)
    }

    /// Returns true on shutdown.
    fn apply_command<C: SyncCache>(
        &mut self,
        session: &mut SyncSession<ChannelSocket, C>,
        command: Option<SessionCommand>,
    ) -> bool {
        match command {
            Some(SessionCommand::Subscribe { notebook_id, conversation_id }) => {
                self.run_effects(session.subscribe(notebook_id, conversation_id));
                false
            }
            Some(SessionCommand::StopStream { bot_conversation_id }) => {
                if !session.stop_stream(bot_conversation_id) {
                    warn!(bot_conversation_id, "stop-stream not sent: push channel is down");
                }
                false
            }
            Some(SessionCommand::Shutdown) | None => true,
        }
    }
}

/// Drive `session` over the WebSocket at `ws_url` until a `Shutdown`
/// command arrives (or the command channel closes), then hand it back.
pub async fn run_session<C: SyncCache>(
    ws_url: &str,
    policy: ReconnectPolicy,
    mut session: SyncSession<ChannelSocket, C>,
    tokens: Arc<dyn TokenProvider>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    notices: mpsc::UnboundedSender<SessionNotice>,
) -> Result<SyncSession<ChannelSocket, C>> {
    let ws_url = validate_ws_url(ws_url)?;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut driver = Driver { tokens, events: events_tx, notices, auth_retry_at: None };
    let mut failures: u32 = 0;

    loop {
        let stream = match connect_async(ws_url.as_str()).await {
            Ok((stream, _)) => {
                info!(url = %ws_url, "push channel connected");
                failures = 0;
                Some(stream)
            }
            Err(error) => {
                warn!(url = %ws_url, %error, "push channel connect failed");
                None
            }
        };

        if let Some(stream) = stream {
            let (mut sink, mut inbound) = stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
            let writer = tokio::spawn(async move {
                while let Some(outbound) = out_rx.recv().await {
                    match outbound {
                        Outbound::Text(text) => {
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                return;
                            }
                        }
                        Outbound::Close { code, reason } => {
                            let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
                            let _ = sink.send(Message::Close(Some(frame))).await;
                            return;
                        }
                    }
                }
                let _ = sink.close().await;
            });

            driver.run_effects(session.handle(ConnectionEvent::SetSocket(ChannelSocket { tx: out_tx })));

            let exit = loop {
                tokio::select! {
                    frame = inbound.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            driver.run_effects(session.handle_frame(text.as_str()));
                            driver.forward_notices(&mut session);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "push channel closed by server");
                            break Exit::Disconnected;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            warn!(%error, "push channel read failed");
                            break Exit::Disconnected;
                        }
                        None => break Exit::Disconnected,
                    },
                    Some(event) = events_rx.recv() => {
                        driver.run_effects(session.handle(event));
                    }
                    command = commands.recv() => {
                        if driver.apply_command(&mut session, command) {
                            break Exit::Shutdown;
                        }
                    }
                }
            };

            // Drops the socket; the writer flushes and closes.
            session.handle(ConnectionEvent::Closed);
            if matches!(exit, Exit::Shutdown) {
                let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
                info!("push channel shut down");
                return Ok(session);
            }
            writer.abort();
        }

        failures = failures.saturating_add(1);
        let delay = driver.reconnect_delay(policy.delay(failures));
        debug!(failures, ?delay, "waiting before reconnect");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                Some(event) = events_rx.recv() => {
                    driver.run_effects(session.handle(event));
                }
                command = commands.recv() => {
                    if driver.apply_command(&mut session, command) {
                        return Ok(session);
                    }
                }
            }
        }
    }
}
