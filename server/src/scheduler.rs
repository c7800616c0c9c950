//! Turn scheduler: the fixed-cadence clock that advances the simulation.
//!
//! Each clock firing tries to start one turn. At most one turn body runs at a
//! time; a firing that finds the previous turn still running is skipped and
//! counted, never queued. A turn:
//!
//! 1. calls the simulation's new-turn hook with the time since the last
//!    completed turn,
//! 2. swaps the action queue and feeds every swapped-in message to the
//!    simulation in enqueue order,
//! 3. finalizes pending logouts and disconnects,
//! 4. advances the turn counter, even if a step above failed or panicked.
//!
//! Every simulation call is contained on its own: a panic costs that one
//! call and is counted as a failure, and the rest of the turn goes on. The
//! body runs on the blocking pool, so anything that still escapes surfaces
//! as a join error and the scheduler keeps going.

use log::{debug, error, info, warn};
use shared::{ClientPayload, ConnectionId, ServerPayload, SessionId, Turn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::interfaces::{Simulation, Transport};
use crate::message::{ClientMessage, Outbox};
use crate::queues::QueueHub;
use crate::sessions::{Session, SessionState, SessionTable};
use crate::utils::lock;
use crate::workers::{guarded, WorkerToken};

/// Completed-turn counter. The value is also the number of the turn in
/// progress, which is what outbound messages are stamped with.
#[derive(Debug, Default)]
pub struct TurnCounter {
    value: AtomicU64,
}

impl TurnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Turn {
        self.value.load(Ordering::Acquire)
    }

    /// Marks a turn complete and returns the new value.
    pub fn advance(&self) -> Turn {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// What one turn did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnReport {
    pub turn: Turn,
    pub actions: usize,
    pub discarded: usize,
    pub logouts: usize,
    pub failures: usize,
}

enum ActionVerdict {
    Process,
    LogoutNoted,
    Discard,
}

struct PendingLogout {
    state: SessionState,
    in_world: bool,
    exit_client: bool,
}

enum LogoutOutcome {
    ToCharacterSelect,
    Exit(ConnectionId),
    Finalized,
}

struct TurnCore {
    hub: Arc<QueueHub>,
    sessions: Arc<SessionTable>,
    simulation: Arc<dyn Simulation>,
    transport: Arc<dyn Transport>,
    outbox: Outbox,
    turns: Arc<TurnCounter>,
    exit_grace: Duration,
    in_flight: AtomicBool,
    skipped: AtomicU64,
    last_completed: Mutex<Instant>,
}

#[derive(Clone)]
pub struct TurnScheduler {
    core: Arc<TurnCore>,
    interval: Duration,
}

impl TurnScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<QueueHub>,
        sessions: Arc<SessionTable>,
        simulation: Arc<dyn Simulation>,
        transport: Arc<dyn Transport>,
        outbox: Outbox,
        turns: Arc<TurnCounter>,
        interval: Duration,
        exit_grace: Duration,
    ) -> Self {
        Self {
            core: Arc::new(TurnCore {
                hub,
                sessions,
                simulation,
                transport,
                outbox,
                turns,
                exit_grace,
                in_flight: AtomicBool::new(false),
                skipped: AtomicU64::new(0),
                last_completed: Mutex::new(Instant::now()),
            }),
            interval,
        }
    }

    /// Starts a turn unless one is already running. The returned handle
    /// resolves once the turn counter has advanced.
    pub fn fire(&self) -> Option<JoinHandle<TurnReport>> {
        if self
            .core
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let skipped = self.core.skipped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Turn {} still running, skipping clock tick ({} skipped so far)",
                self.core.turns.current(),
                skipped
            );
            return None;
        }

        let core = Arc::clone(&self.core);
        Some(tokio::spawn(core.complete_turn()))
    }

    pub fn current_turn(&self) -> Turn {
        self.core.turns.current()
    }

    pub fn skipped_turns(&self) -> u64 {
        self.core.skipped.load(Ordering::Relaxed)
    }

    pub fn is_turn_in_flight(&self) -> bool {
        self.core.in_flight.load(Ordering::Acquire)
    }

    /// Clock loop. Runs until the token is stopped; a turn already in flight
    /// finishes on its own.
    pub async fn run(self, token: WorkerToken) {
        let mut clock = interval(self.interval);
        clock.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        clock.tick().await;
        info!("Turn clock started ({:?} interval)", self.interval);

        while token.is_running() {
            clock.tick().await;
            if !token.is_running() {
                break;
            }
            self.fire();
        }

        info!("Turn clock stopped at turn {}", self.current_turn());
    }
}

impl TurnCore {
    async fn complete_turn(self: Arc<Self>) -> TurnReport {
        let turn = self.turns.current();
        let elapsed = lock(&self.last_completed).elapsed();

        let core = Arc::clone(&self);
        let report = match tokio::task::spawn_blocking(move || core.run_turn(turn, elapsed)).await {
            Ok(report) => report,
            Err(e) => {
                error!("Turn {} aborted: {}", turn, e);
                TurnReport {
                    turn,
                    failures: 1,
                    ..TurnReport::default()
                }
            }
        };

        *lock(&self.last_completed) = Instant::now();
        self.turns.advance();
        self.in_flight.store(false, Ordering::Release);

        if turn % 100 == 0 {
            debug!(
                "Turn {}: {} sessions, {} actions, {} discarded, {} logouts, queues {:?}",
                turn,
                self.sessions.len(),
                report.actions,
                report.discarded,
                report.logouts,
                self.hub.sample()
            );
        }
        report
    }

    fn run_turn(&self, turn: Turn, elapsed: Duration) -> TurnReport {
        let mut report = TurnReport {
            turn,
            ..TurnReport::default()
        };

        match guarded("new-turn hook", || {
            self.simulation.on_new_turn(turn, elapsed, &self.outbox)
        }) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!("Turn {}: new-turn hook failed: {}", turn, e);
                report.failures += 1;
            }
            None => report.failures += 1,
        }

        let mut batch = self.hub.actions().swap();
        for message in batch.drain(..) {
            self.apply_action(turn, message, &mut report);
        }
        self.hub.actions().recycle(batch);

        self.finalize_logouts(turn, &mut report);
        report
    }

    fn apply_action(&self, turn: Turn, message: ClientMessage, report: &mut TurnReport) {
        let verdict = self.sessions.with(message.session, |s| {
            if s.state() != SessionState::InWorld || s.character_logout_granted {
                return ActionVerdict::Discard;
            }
            match &message.payload {
                ClientPayload::PlayerAction { .. } => ActionVerdict::Process,
                ClientPayload::Logout { exit_client, .. } => {
                    s.character_logout_requested = true;
                    s.client_logout_requested |= *exit_client;
                    ActionVerdict::LogoutNoted
                }
                _ => ActionVerdict::Discard,
            }
        });

        match verdict {
            Some(ActionVerdict::Process) => {
                report.actions += 1;
                match guarded("action", || self.simulation.process_action(&message, &self.outbox)) {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        warn!(
                            "Turn {}: {} from session {} failed: {}",
                            turn,
                            message.payload.kind(),
                            message.session,
                            e
                        );
                        report.failures += 1;
                    }
                    None => report.failures += 1,
                }
            }
            Some(ActionVerdict::LogoutNoted) => {
                debug!("Turn {}: session {} requested logout", turn, message.session);
            }
            Some(ActionVerdict::Discard) | None => {
                debug!(
                    "Turn {}: discarding {} from session {} (not in world)",
                    turn,
                    message.payload.kind(),
                    message.session
                );
                report.discarded += 1;
            }
        }
    }

    fn finalize_logouts(&self, turn: Turn, report: &mut TurnReport) {
        for id in self.sessions.ids() {
            let pending = self
                .sessions
                .with(id, |s| {
                    if s.character_logout_requested && !s.character_logout_granted {
                        Some(PendingLogout {
                            state: s.state(),
                            in_world: s.in_world,
                            exit_client: s.client_logout_requested,
                        })
                    } else {
                        None
                    }
                })
                .flatten();

            let Some(pending) = pending else {
                continue;
            };

            // A panicking logout check defers the logout to the next turn.
            let allowed = pending.state == SessionState::Kicked
                || !pending.in_world
                || match guarded("logout check", || self.simulation.is_logout_allowed(id)) {
                    Some(allowed) => allowed,
                    None => {
                        report.failures += 1;
                        false
                    }
                };
            if !allowed {
                debug!("Turn {}: logout of session {} deferred", turn, id);
                continue;
            }

            if pending.in_world
                && guarded("character logout", || {
                    self.simulation.on_character_logout(id, &self.outbox)
                })
                .is_none()
            {
                report.failures += 1;
            }

            let outcome = self
                .sessions
                .with(id, |s| grant_logout(s, pending.exit_client))
                .flatten();
            let Some(outcome) = outcome else {
                continue;
            };
            report.logouts += 1;

            match outcome {
                LogoutOutcome::ToCharacterSelect => {
                    info!("Turn {}: session {} returned to character selection", turn, id);
                    self.outbox
                        .reply_or_log(id, ServerPayload::LogoutConfirmed { exit_client: false });
                    self.request_character_list(id, turn);
                }
                LogoutOutcome::Exit(connection) => {
                    info!("Turn {}: session {} logged out", turn, id);
                    if let Err(e) = self.outbox.reply_then_close(
                        id,
                        ServerPayload::LogoutConfirmed { exit_client: true },
                        "logged out",
                        self.exit_grace,
                    ) {
                        warn!("Session {}: dropping logout confirmation: {}", id, e);
                        self.transport
                            .disconnect(connection, "logged out", self.exit_grace);
                    }
                }
                LogoutOutcome::Finalized => {
                    info!("Turn {}: session {} finalized", turn, id);
                }
            }
        }
    }

    fn request_character_list(&self, session: SessionId, turn: Turn) {
        let request = ClientMessage {
            session,
            payload: ClientPayload::ListCharacters,
            turn,
        };
        if let Err(e) = self.hub.character().push(request) {
            warn!("Session {}: could not queue character list: {}", session, e);
        }
    }
}

/// Applies a granted logout to the record. `None` if the session changed
/// state in a way that makes the grant moot.
fn grant_logout(session: &mut Session, exit_client: bool) -> Option<LogoutOutcome> {
    match session.state() {
        SessionState::InWorld => {
            let next = if exit_client {
                SessionState::Disconnecting
            } else {
                SessionState::CharacterManagement
            };
            session.transition(next).ok()?;
            session.character_logout_granted = true;
            session.in_world = false;
            if exit_client {
                session.disconnect_reason = Some("logged out".to_string());
                Some(LogoutOutcome::Exit(session.connection))
            } else {
                session.character_id = None;
                Some(LogoutOutcome::ToCharacterSelect)
            }
        }
        SessionState::Disconnecting | SessionState::Kicked => {
            session.transition(SessionState::Disconnected).ok()?;
            session.character_logout_granted = true;
            session.in_world = false;
            Some(LogoutOutcome::Finalized)
        }
        _ => None,
    }
}
