//! Session records and the table that owns them.
//!
//! One [`Session`] per logical connection: created when the transport sees a
//! new peer, mutated by the dispatcher, the turn scheduler, the processor and
//! the sweeper, and evicted by the sweeper once it reaches `Disconnected`.
//!
//! ## Locking
//! The table lock guards membership only (insert, remove, iterate). Each
//! record has its own mutex, held for a single read-modify-write and never
//! across a collaborator call. Lock order is table, then one record; no code
//! path holds two record locks at once, which is sufficient because no
//! operation needs atomicity across sessions.
//!
//! ## State machine
//! Every state change goes through [`Session::transition`], which enforces
//! the table in [`SessionState::can_transition_to`].

use log::{debug, info, warn};
use shared::{AccountId, CharacterId, ConnectionId, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::SessionError;
use crate::interfaces::Transport;
use crate::utils::{lock, read, write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Handshake,
    CharacterManagement,
    InWorld,
    Disconnecting,
    Disconnected,
    Kicked,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Handshake, CharacterManagement)
                | (Handshake, Disconnecting)
                | (Handshake, Kicked)
                | (CharacterManagement, InWorld)
                | (CharacterManagement, Disconnecting)
                | (CharacterManagement, Kicked)
                | (InWorld, CharacterManagement)
                | (InWorld, Disconnecting)
                | (InWorld, Kicked)
                | (Disconnecting, Disconnected)
                | (Kicked, Disconnected)
        )
    }

    /// States in which the client may still send traffic.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Handshake | SessionState::CharacterManagement | SessionState::InWorld
        )
    }
}

/// Fixed-window rate limiter for player actions.
#[derive(Debug, Clone)]
pub struct FloodGate {
    limit: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
    rejected: u64,
}

impl FloodGate {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            window_start: Instant::now(),
            count: 0,
            rejected: 0,
        }
    }

    /// Counts one action; false if the window's budget is spent. A limit of
    /// zero disables the gate.
    pub fn admit(&mut self, now: Instant) -> bool {
        if self.limit == 0 {
            return true;
        }
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.limit {
            self.rejected += 1;
            return false;
        }
        self.count += 1;
        true
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub connection: ConnectionId,
    pub account_id: Option<AccountId>,
    /// Character bound to the session once selected
    pub character_id: Option<CharacterId>,
    state: SessionState,
    /// True while the simulation holds an avatar for this session
    pub in_world: bool,
    /// A character load is running in the background
    pub entering_world: bool,
    pub flood: FloodGate,
    pub character_logout_requested: bool,
    pub character_logout_granted: bool,
    pub client_logout_requested: bool,
    pub connected_at: Instant,
    pub last_seen: Instant,
    pub disconnect_reason: Option<String>,
}

impl Session {
    pub fn new(id: SessionId, connection: ConnectionId, flood_limit: u32) -> Self {
        let now = Instant::now();
        Self {
            id,
            connection,
            account_id: None,
            character_id: None,
            state: SessionState::Handshake,
            in_world: false,
            entering_world: false,
            flood: FloodGate::new(flood_limit, Duration::from_secs(1)),
            character_logout_requested: false,
            character_logout_granted: false,
            client_logout_requested: false,
            connected_at: now,
            last_seen: now,
            disconnect_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn owns_character(&self, character_id: CharacterId) -> bool {
        self.character_id == Some(character_id)
    }

    /// Moves an active session to `Disconnecting` and raises both logout
    /// flags so the next turn finalizes it. Returns false if the session was
    /// already on its way out.
    pub fn begin_disconnect(&mut self, reason: &str) -> bool {
        if !self.state.is_active() {
            return false;
        }
        if self.transition(SessionState::Disconnecting).is_err() {
            return false;
        }
        self.character_logout_requested = true;
        self.character_logout_granted = false;
        self.client_logout_requested = true;
        self.disconnect_reason = Some(reason.to_string());
        true
    }

    /// Like [`Session::begin_disconnect`] but ends in `Kicked`, which skips
    /// the simulation's logout check.
    pub fn kick(&mut self, reason: &str) -> bool {
        if !self.state.is_active() {
            return false;
        }
        if self.transition(SessionState::Kicked).is_err() {
            return false;
        }
        self.character_logout_requested = true;
        self.character_logout_granted = false;
        self.client_logout_requested = true;
        self.disconnect_reason = Some(reason.to_string());
        true
    }

    pub fn enter_world(&mut self, character_id: CharacterId) -> Result<(), SessionError> {
        self.transition(SessionState::InWorld)?;
        self.character_id = Some(character_id);
        self.in_world = true;
        self.entering_world = false;
        self.character_logout_requested = false;
        self.character_logout_granted = false;
        self.client_logout_requested = false;
        Ok(())
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_seen) > timeout
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Directory of live sessions.
#[derive(Debug)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
    flood_limit: u32,
}

impl SessionTable {
    pub fn new(flood_limit: u32) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            flood_limit,
        }
    }

    /// Creates a `Handshake` session for a new transport connection.
    pub fn open(&self, connection: ConnectionId) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, connection, self.flood_limit);
        write(&self.sessions).insert(id, Arc::new(Mutex::new(session)));
        info!("Session {} opened on connection {}", id, connection);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        read(&self.sessions).get(&id).cloned()
    }

    /// Runs `f` under the record lock. `None` if the session is gone.
    pub fn with<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let handle = self.get(id)?;
        let mut session = lock(&handle);
        Some(f(&mut session))
    }

    pub fn state_of(&self, id: SessionId) -> Option<SessionState> {
        self.with(id, |s| s.state())
    }

    /// Session ids in ascending order.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = read(&self.sessions).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn remove(&self, id: SessionId) -> bool {
        if write(&self.sessions).remove(&id).is_some() {
            info!("Session {} evicted", id);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        read(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.sessions).is_empty()
    }

    pub fn count_in_state(&self, state: SessionState) -> usize {
        let handles: Vec<SessionHandle> = read(&self.sessions).values().cloned().collect();
        handles
            .iter()
            .filter(|handle| lock(handle).state() == state)
            .count()
    }

    pub fn count_in_world(&self) -> usize {
        let handles: Vec<SessionHandle> = read(&self.sessions).values().cloned().collect();
        handles.iter().filter(|handle| lock(handle).in_world).count()
    }

    /// Removes every `Disconnected` session and returns their ids.
    pub fn cleanup(&self) -> Vec<SessionId> {
        let finished: Vec<SessionId> = self
            .ids()
            .into_iter()
            .filter(|id| self.state_of(*id) == Some(SessionState::Disconnected))
            .collect();

        for id in &finished {
            self.remove(*id);
        }
        finished
    }

    /// Active sessions that stalled: still in `Handshake` past
    /// `handshake_timeout`, or silent for longer than `idle_timeout`.
    pub fn stale(
        &self,
        now: Instant,
        handshake_timeout: Duration,
        idle_timeout: Duration,
    ) -> Vec<(SessionId, &'static str)> {
        self.ids()
            .into_iter()
            .filter_map(|id| {
                self.with(id, |s| {
                    if s.state() == SessionState::Handshake
                        && now.duration_since(s.connected_at) > handshake_timeout
                    {
                        Some((id, "handshake timeout"))
                    } else if s.state().is_active() && s.is_idle(now, idle_timeout) {
                        Some((id, "idle timeout"))
                    } else {
                        None
                    }
                })
                .flatten()
            })
            .collect()
    }
}

/// Issues exactly one disconnect: marks the session `Disconnecting` and asks
/// the transport to close after `grace`. No-op (returns false) for sessions
/// already leaving.
pub fn disconnect_session(
    sessions: &SessionTable,
    transport: &dyn Transport,
    id: SessionId,
    reason: &str,
    grace: Duration,
) -> bool {
    let connection = sessions.with(id, |s| {
        if s.begin_disconnect(reason) {
            Some(s.connection)
        } else {
            None
        }
    });

    match connection.flatten() {
        Some(connection) => {
            warn!("Disconnecting session {}: {}", id, reason);
            transport.disconnect(connection, reason, grace);
            true
        }
        None => false,
    }
}

/// Operator kick: the session is closed immediately and its character is
/// removed on the next turn regardless of the simulation's logout rules.
pub fn kick_session(
    sessions: &SessionTable,
    transport: &dyn Transport,
    id: SessionId,
    reason: &str,
) -> bool {
    let connection = sessions.with(id, |s| if s.kick(reason) { Some(s.connection) } else { None });

    match connection.flatten() {
        Some(connection) => {
            warn!("Kicking session {}: {}", id, reason);
            transport.disconnect(connection, reason, Duration::ZERO);
            true
        }
        None => false,
    }
}
