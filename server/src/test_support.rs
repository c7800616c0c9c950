//! Recording collaborators and a ready-made set of pipeline parts for unit
//! tests.

use shared::{
    decode_server_frame, Action, CharacterId, ClientPayload, ConnectionId, DeliveryMode, ServerFrame,
    SessionId, Turn,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::credentials::CredentialStore;
use crate::error::{SimulationError, TransportError};
use crate::interfaces::{CharacterRecord, Simulation, Transport};
use crate::message::{ClientMessage, OutboundMessage, Outbox};
use crate::message_pool::MessagePool;
use crate::queues::QueueHub;
use crate::scheduler::TurnCounter;
use crate::sessions::{SessionState, SessionTable};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SentFrame {
    pub connection: ConnectionId,
    pub frame: ServerFrame,
    pub delivery: DeliveryMode,
    pub channel: u8,
}

#[derive(Default)]
pub(crate) struct RecordingTransport {
    closed: Mutex<HashSet<ConnectionId>>,
    sent: Mutex<Vec<SentFrame>>,
    disconnects: Mutex<Vec<(ConnectionId, String, Duration)>>,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self, connection: ConnectionId) {
        self.closed.lock().unwrap().insert(connection);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<(ConnectionId, String, Duration)> {
        self.disconnects.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn is_connected(&self, connection: ConnectionId) -> bool {
        !self.closed.lock().unwrap().contains(&connection)
    }

    fn send(
        &self,
        connection: ConnectionId,
        frame: &[u8],
        delivery: DeliveryMode,
        channel: u8,
    ) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "send failed",
            )));
        }
        let frame = decode_server_frame(frame).expect("sender produced an undecodable frame");
        self.sent.lock().unwrap().push(SentFrame {
            connection,
            frame,
            delivery,
            channel,
        });
        Ok(())
    }

    fn disconnect(&self, connection: ConnectionId, reason: &str, grace: Duration) {
        self.disconnects
            .lock()
            .unwrap()
            .push((connection, reason.to_string(), grace));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SimCall {
    NewTurn(Turn),
    Action(SessionId, ClientPayload),
    LogoutAllowed(SessionId),
    CharacterLogout(SessionId),
    EnterWorld(SessionId, CharacterId),
    Chat(SessionId, String),
}

pub(crate) struct RecordingSimulation {
    calls: Mutex<Vec<SimCall>>,
    allow_logout: AtomicBool,
    fail_actions: AtomicBool,
    fail_enter: AtomicBool,
    panic_on_turn: AtomicBool,
    panic_on_move: Mutex<Option<i32>>,
    panic_on_logout_check: Mutex<Option<SessionId>>,
    turn_delay_ms: AtomicU64,
    active_turns: AtomicUsize,
    max_active_turns: AtomicUsize,
}

impl Default for RecordingSimulation {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            allow_logout: AtomicBool::new(true),
            fail_actions: AtomicBool::new(false),
            fail_enter: AtomicBool::new(false),
            panic_on_turn: AtomicBool::new(false),
            panic_on_move: Mutex::new(None),
            panic_on_logout_check: Mutex::new(None),
            turn_delay_ms: AtomicU64::new(0),
            active_turns: AtomicUsize::new(0),
            max_active_turns: AtomicUsize::new(0),
        }
    }
}

impl RecordingSimulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<(SessionId, ClientPayload)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SimCall::Action(session, payload) => Some((session, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn set_allow_logout(&self, allow: bool) {
        self.allow_logout.store(allow, Ordering::SeqCst);
    }

    pub fn set_fail_actions(&self, fail: bool) {
        self.fail_actions.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_enter(&self, fail: bool) {
        self.fail_enter.store(fail, Ordering::SeqCst);
    }

    pub fn set_panic_on_turn(&self, panic: bool) {
        self.panic_on_turn.store(panic, Ordering::SeqCst);
    }

    /// Panics on any move with this `dx`, before recording it.
    pub fn set_panic_on_move(&self, dx: Option<i32>) {
        *self.panic_on_move.lock().unwrap() = dx;
    }

    pub fn set_panic_on_logout_check(&self, session: Option<SessionId>) {
        *self.panic_on_logout_check.lock().unwrap() = session;
    }

    pub fn set_turn_delay(&self, delay: Duration) {
        self.turn_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn max_concurrent_turns(&self) -> usize {
        self.max_active_turns.load(Ordering::SeqCst)
    }

    fn record(&self, call: SimCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Simulation for RecordingSimulation {
    fn on_new_turn(
        &self,
        turn: Turn,
        _elapsed: Duration,
        _outbox: &Outbox,
    ) -> Result<(), SimulationError> {
        if self.panic_on_turn.load(Ordering::SeqCst) {
            panic!("simulation exploded on turn {}", turn);
        }
        let active = self.active_turns.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_turns.fetch_max(active, Ordering::SeqCst);
        self.record(SimCall::NewTurn(turn));

        let delay = self.turn_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.active_turns.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn process_action(
        &self,
        message: &ClientMessage,
        _outbox: &Outbox,
    ) -> Result<(), SimulationError> {
        if let ClientPayload::PlayerAction {
            action: Action::Move { dx, .. },
            ..
        } = &message.payload
        {
            if *self.panic_on_move.lock().unwrap() == Some(*dx) {
                panic!("simulation exploded on move dx={}", dx);
            }
        }
        self.record(SimCall::Action(message.session, message.payload.clone()));
        if self.fail_actions.load(Ordering::SeqCst) {
            return Err(SimulationError::Rejected("scripted failure".to_string()));
        }
        Ok(())
    }

    fn is_logout_allowed(&self, session: SessionId) -> bool {
        self.record(SimCall::LogoutAllowed(session));
        if *self.panic_on_logout_check.lock().unwrap() == Some(session) {
            panic!("logout check exploded for session {}", session);
        }
        self.allow_logout.load(Ordering::SeqCst)
    }

    fn on_character_logout(&self, session: SessionId, _outbox: &Outbox) {
        self.record(SimCall::CharacterLogout(session));
    }

    fn enter_world(
        &self,
        session: SessionId,
        character: &CharacterRecord,
        _outbox: &Outbox,
    ) -> Result<(i32, i32), SimulationError> {
        self.record(SimCall::EnterWorld(session, character.summary.id));
        if self.fail_enter.load(Ordering::SeqCst) {
            return Err(SimulationError::AlreadyInWorld(character.summary.id));
        }
        Ok((character.x, character.y))
    }

    fn chat(
        &self,
        session: SessionId,
        _character_id: CharacterId,
        text: &str,
        _outbox: &Outbox,
    ) -> Result<(), SimulationError> {
        self.record(SimCall::Chat(session, text.to_string()));
        Ok(())
    }
}

/// One of everything, wired together the way the runtime does it.
pub(crate) struct Harness {
    pub hub: Arc<QueueHub>,
    pub sessions: Arc<SessionTable>,
    pub pool: Arc<MessagePool>,
    pub turns: Arc<TurnCounter>,
    pub outbox: Outbox,
    pub credentials: Arc<CredentialStore>,
    pub transport: Arc<RecordingTransport>,
    pub simulation: Arc<RecordingSimulation>,
    next_connection: AtomicU64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_flood_limit(0)
    }

    pub fn with_flood_limit(flood_limit: u32) -> Self {
        Self::build(flood_limit, 0)
    }

    /// Every hub queue bounded to `capacity`.
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self::build(0, capacity)
    }

    fn build(flood_limit: u32, capacity: usize) -> Self {
        let hub = Arc::new(QueueHub::new(capacity));
        let pool = MessagePool::new(64);
        let turns = Arc::new(TurnCounter::new());
        let outbox = Outbox::new(Arc::clone(&hub), Arc::clone(&pool), Arc::clone(&turns));
        Self {
            hub,
            sessions: Arc::new(SessionTable::new(flood_limit)),
            pool,
            turns,
            outbox,
            credentials: Arc::new(CredentialStore::new(Duration::from_secs(60))),
            transport: Arc::new(RecordingTransport::new()),
            simulation: Arc::new(RecordingSimulation::new()),
            next_connection: AtomicU64::new(100),
        }
    }

    pub fn handshake_session(&self) -> SessionId {
        self.sessions
            .open(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    pub fn character_select_session(&self) -> SessionId {
        let id = self.handshake_session();
        self.sessions.with(id, |s| {
            s.account_id = Some(1);
            s.transition(SessionState::CharacterManagement).unwrap();
        });
        id
    }

    pub fn in_world_session(&self, character: CharacterId) -> SessionId {
        let id = self.character_select_session();
        self.sessions
            .with(id, |s| s.enter_world(character).unwrap());
        id
    }

    pub fn connection_of(&self, id: SessionId) -> ConnectionId {
        self.sessions.with(id, |s| s.connection).unwrap()
    }

    pub fn drain_outbound(&self) -> Vec<OutboundMessage> {
        std::iter::from_fn(|| self.hub.outbound().pop()).collect()
    }
}
