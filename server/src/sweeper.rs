//! Session sweeper: periodic maintenance of the session table.
//!
//! Each sweep, in order:
//! 1. active sessions whose transport connection dropped start disconnecting,
//!    raising both logout flags so the next turn finalizes them,
//! 2. sessions stuck in handshake or idle too long are disconnected,
//! 3. sessions that finished logging out and whose connection has closed
//!    become `Disconnected`,
//! 4. `Disconnected` sessions are evicted,
//! 5. expired login tokens are purged.

use log::{debug, info, warn};
use shared::{ConnectionId, SessionId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

use crate::credentials::CredentialStore;
use crate::interfaces::Transport;
use crate::sessions::{disconnect_session, SessionState, SessionTable};
use crate::workers::{guarded, WorkerToken};

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub interval: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub disconnect_grace: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub lost: usize,
    pub stale: usize,
    pub closed: usize,
    pub evicted: Vec<SessionId>,
    pub expired_tokens: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.lost == 0
            && self.stale == 0
            && self.closed == 0
            && self.evicted.is_empty()
            && self.expired_tokens == 0
    }
}

struct Snapshot {
    id: SessionId,
    state: SessionState,
    connection: ConnectionId,
    logout_granted: bool,
}

pub struct SessionSweeper {
    sessions: Arc<SessionTable>,
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    settings: SweepSettings,
}

impl SessionSweeper {
    pub fn new(
        sessions: Arc<SessionTable>,
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            sessions,
            transport,
            credentials,
            settings,
        }
    }

    pub async fn run(self: Arc<Self>, token: WorkerToken) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Session sweeper started ({:?} interval)", self.settings.interval);

        while token.is_running() {
            ticker.tick().await;
            if !token.is_running() {
                break;
            }
            if let Some(report) = guarded("session sweep", || self.sweep(Instant::now())) {
                if !report.is_quiet() {
                    debug!("Sweep: {:?}", report);
                }
            }
        }
        info!("Session sweeper stopped");
    }

    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for snapshot in self.snapshot() {
            let connected = self.transport.is_connected(snapshot.connection);

            if snapshot.state.is_active() && !connected {
                let started = self
                    .sessions
                    .with(snapshot.id, |s| s.begin_disconnect("connection lost"))
                    .unwrap_or(false);
                if started {
                    info!("Session {}: transport connection lost", snapshot.id);
                    report.lost += 1;
                }
            } else if snapshot.state == SessionState::Disconnecting
                && snapshot.logout_granted
                && !connected
            {
                let closed = self.sessions.with(snapshot.id, |s| {
                    s.state() == SessionState::Disconnecting
                        && s.transition(SessionState::Disconnected).is_ok()
                });
                if closed == Some(true) {
                    report.closed += 1;
                }
            }
        }

        for (id, reason) in self.sessions.stale(
            now,
            self.settings.handshake_timeout,
            self.settings.idle_timeout,
        ) {
            if disconnect_session(
                &self.sessions,
                self.transport.as_ref(),
                id,
                reason,
                self.settings.disconnect_grace,
            ) {
                report.stale += 1;
            }
        }

        report.evicted = self.sessions.cleanup();
        report.expired_tokens = self.credentials.purge_expired(now);

        if report.lost > 0 || report.stale > 0 {
            warn!(
                "Sweep disconnected {} lost and {} stale sessions",
                report.lost, report.stale
            );
        }
        report
    }

    fn snapshot(&self) -> Vec<Snapshot> {
        self.sessions
            .ids()
            .into_iter()
            .filter_map(|id| {
                self.sessions.with(id, |s| Snapshot {
                    id,
                    state: s.state(),
                    connection: s.connection,
                    logout_granted: s.character_logout_granted,
                })
            })
            .collect()
    }
}
