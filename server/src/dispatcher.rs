//! Inbound dispatcher (tier 2).
//!
//! Decodes raw frames and routes each one by the sending session's state:
//!
//! | state                 | accepted                               | destination            |
//! |-----------------------|----------------------------------------|------------------------|
//! | `Handshake`           | handshake with a valid one-time token   | synthesized list request |
//! | `CharacterManagement` | list, create, delete, start, logout     | character queue        |
//! | `InWorld`             | player action, logout                   | action queue           |
//! | `InWorld`             | chat                                    | chat queue             |
//! | `Disconnecting`, `Disconnected` | nothing                       | discarded              |
//! | `Kicked`              | nothing                                 | discarded, connection force-closed |
//!
//! Peer frames carrying the shared secret go to the inter-server queue from
//! any active session. Every frame ends in at most one of: one enqueue, one
//! disconnect, or a logged discard.

use log::{debug, info, warn};
use shared::{
    decode_frame, ClientPayload, SessionId, WireFrame, PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::credentials::CredentialStore;
use crate::interfaces::Transport;
use crate::message::{ClientMessage, InterServerMessage, RawFrame};
use crate::queues::QueueHub;
use crate::scheduler::TurnCounter;
use crate::sessions::{disconnect_session, Session, SessionState, SessionTable};
use crate::workers::{guarded, WorkerToken, YIELD_EVERY};

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Actions,
    CharacterManagement,
    Chat,
    InterServer,
    Discarded(&'static str),
    Disconnected(&'static str),
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub peer_secret: String,
    /// Grace period before closing a connection that sent a malformed frame
    pub decode_grace: Duration,
    pub idle_wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Actions,
    Character,
    Chat,
    InterServer,
    /// Handshake accepted: queue a list request in its place
    CharacterList,
}

impl Target {
    fn route(self) -> Route {
        match self {
            Target::Actions => Route::Actions,
            Target::Character | Target::CharacterList => Route::CharacterManagement,
            Target::Chat => Route::Chat,
            Target::InterServer => Route::InterServer,
        }
    }
}

enum Decision {
    Enqueue(Target),
    Discard(&'static str),
    Disconnect(&'static str),
    ForceClose(shared::ConnectionId),
}

pub struct InboundDispatcher {
    hub: Arc<QueueHub>,
    sessions: Arc<SessionTable>,
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    turns: Arc<TurnCounter>,
    settings: DispatchSettings,
}

impl InboundDispatcher {
    pub fn new(
        hub: Arc<QueueHub>,
        sessions: Arc<SessionTable>,
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        turns: Arc<TurnCounter>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            hub,
            sessions,
            transport,
            credentials,
            turns,
            settings,
        }
    }

    /// Worker loop: drain the inbound queue, then wait for more. Yields to
    /// the runtime every few frames while the queue stays busy.
    pub async fn run_worker(self: Arc<Self>, token: WorkerToken) {
        debug!("Dispatcher worker {} started", token.id());
        while token.is_running() {
            let mut drained = 0usize;
            while let Some(frame) = self.hub.inbound().pop() {
                let session = frame.session;
                if guarded("dispatcher", || self.dispatch(frame)).is_none() {
                    warn!("Session {}: frame lost to a dispatcher panic", session);
                }
                if !token.is_running() {
                    break;
                }
                drained += 1;
                if drained % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
            }
            self.hub.inbound().wait(self.settings.idle_wait).await;
        }
        debug!("Dispatcher worker {} stopped", token.id());
    }

    pub fn dispatch(&self, frame: RawFrame) -> Route {
        let session = frame.session;
        let wire = match decode_frame(&frame.bytes) {
            Ok(wire) => wire,
            Err(e) => return self.reject_malformed(session, e),
        };

        let decision = self
            .sessions
            .with(session, |s| self.classify(s, &wire, frame.received_at));

        match decision {
            None => {
                debug!("Dropping frame for unknown session {}", session);
                Route::Discarded("unknown session")
            }
            Some(Decision::Enqueue(target)) => self.enqueue(session, target, wire),
            Some(Decision::Discard(reason)) => {
                debug!("Session {}: discarding frame ({})", session, reason);
                Route::Discarded(reason)
            }
            Some(Decision::Disconnect(reason)) => self.disconnect(session, reason, Duration::ZERO),
            Some(Decision::ForceClose(connection)) => {
                debug!("Session {}: traffic after kick, closing connection", session);
                self.transport.disconnect(connection, "kicked", Duration::ZERO);
                Route::Discarded("kicked")
            }
        }
    }

    fn classify(&self, session: &mut Session, wire: &WireFrame, now: Instant) -> Decision {
        match session.state() {
            SessionState::Disconnecting | SessionState::Disconnected => {
                return Decision::Discard("session leaving")
            }
            SessionState::Kicked => return Decision::ForceClose(session.connection),
            SessionState::Handshake
            | SessionState::CharacterManagement
            | SessionState::InWorld => session.touch(now),
        }

        let payload = match wire {
            WireFrame::Peer { secret, .. } => {
                return if *secret == self.settings.peer_secret {
                    Decision::Enqueue(Target::InterServer)
                } else {
                    Decision::Disconnect("invalid peer secret")
                };
            }
            WireFrame::Client(payload) => payload,
        };

        match session.state() {
            SessionState::Handshake => self.classify_handshake(session, payload),
            SessionState::CharacterManagement if payload.is_character_management() => {
                Decision::Enqueue(Target::Character)
            }
            SessionState::InWorld => classify_in_world(session, payload, now),
            _ => Decision::Disconnect("unexpected message"),
        }
    }

    fn classify_handshake(&self, session: &mut Session, payload: &ClientPayload) -> Decision {
        let ClientPayload::Handshake {
            account_id,
            secret,
            client_version,
        } = payload
        else {
            return Decision::Disconnect("unexpected message");
        };

        if *client_version != PROTOCOL_VERSION {
            return Decision::Disconnect("protocol version mismatch");
        }
        if !self.credentials.redeem(*account_id, secret) {
            return Decision::Disconnect("invalid credentials");
        }
        if let Err(e) = session.transition(SessionState::CharacterManagement) {
            warn!("Session {}: {}", session.id, e);
            return Decision::Disconnect("unexpected message");
        }

        session.account_id = Some(*account_id);
        info!(
            "Session {} authenticated as account {}",
            session.id, account_id
        );
        Decision::Enqueue(Target::CharacterList)
    }

    fn enqueue(&self, session: SessionId, target: Target, wire: WireFrame) -> Route {
        let turn = self.turns.current();
        let pushed = match wire {
            WireFrame::Peer { payload, .. } => self.hub.inter_server().push(InterServerMessage {
                origin: session,
                payload,
                turn,
            }),
            WireFrame::Client(payload) => {
                let payload = match target {
                    Target::CharacterList => ClientPayload::ListCharacters,
                    _ => payload,
                };
                let message = ClientMessage {
                    session,
                    payload,
                    turn,
                };
                match target {
                    Target::Actions => self.hub.actions().write_enqueue(message),
                    Target::Chat => self.hub.chat().push(message),
                    _ => self.hub.character().push(message),
                }
            }
        };

        match pushed {
            Ok(()) => target.route(),
            Err(e) => {
                warn!("Session {}: dropping message: {}", session, e);
                Route::Discarded("queue full")
            }
        }
    }

    fn reject_malformed(&self, session: SessionId, error: bincode::Error) -> Route {
        match self.sessions.state_of(session) {
            None => Route::Discarded("unknown session"),
            Some(state) if !state.is_active() => {
                debug!("Session {}: ignoring malformed frame while leaving", session);
                Route::Discarded("session leaving")
            }
            Some(_) => {
                warn!("Session {}: malformed frame: {}", session, error);
                self.disconnect(session, "malformed message", self.settings.decode_grace)
            }
        }
    }

    fn disconnect(&self, session: SessionId, reason: &'static str, grace: Duration) -> Route {
        if disconnect_session(&self.sessions, self.transport.as_ref(), session, reason, grace) {
            Route::Disconnected(reason)
        } else {
            Route::Discarded("session leaving")
        }
    }
}

fn classify_in_world(session: &mut Session, payload: &ClientPayload, now: Instant) -> Decision {
    let target = match payload {
        ClientPayload::PlayerAction { .. } | ClientPayload::Logout { .. } => Target::Actions,
        ClientPayload::Chat { .. } => Target::Chat,
        _ => return Decision::Disconnect("unexpected message"),
    };

    match payload.character_id() {
        Some(id) if session.owns_character(id) => {}
        claimed => {
            warn!(
                "Session {}: {} names character {:?}, bound to {:?}",
                session.id,
                payload.kind(),
                claimed,
                session.character_id
            );
            return Decision::Disconnect("invalid message");
        }
    }

    if matches!(payload, ClientPayload::PlayerAction { .. }) && !session.flood.admit(now) {
        warn!(
            "Session {}: action dropped by flood gate ({} so far)",
            session.id,
            session.flood.rejected()
        );
        return Decision::Discard("flood limit");
    }
    Decision::Enqueue(target)
}
