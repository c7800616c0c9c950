//! Composition root: builds every pipeline component around one queue hub
//! and owns their lifecycles.

use log::{info, warn};
use shared::{ServerStatus, SessionId};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::credentials::CredentialStore;
use crate::dispatcher::{DispatchSettings, InboundDispatcher};
use crate::error::PoolError;
use crate::interfaces::{CharacterStore, Simulation, Transport};
use crate::message::Outbox;
use crate::message_pool::{MessagePool, PoolStats};
use crate::processor::{LowPriorityProcessor, ProcessorSettings};
use crate::queues::QueueHub;
use crate::scheduler::{TurnCounter, TurnScheduler};
use crate::sender::OutboundSender;
use crate::sessions::{kick_session, SessionState, SessionTable};
use crate::sweeper::{SessionSweeper, SweepSettings};
use crate::workers::{WorkerPool, WorkerToken};

/// The resizable worker tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Dispatch,
    Process,
    Send,
}

impl FromStr for Tier {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dispatch" | "dispatcher" => Ok(Tier::Dispatch),
            "process" | "processor" => Ok(Tier::Process),
            "send" | "sender" => Ok(Tier::Send),
            _ => Err(PoolError::UnknownTier(s.to_string())),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Dispatch => "dispatch",
            Tier::Process => "process",
            Tier::Send => "send",
        };
        f.write_str(name)
    }
}

/// External systems the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub simulation: Arc<dyn Simulation>,
    pub store: Arc<dyn CharacterStore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub status: ServerStatus,
    pub handshaking: usize,
    pub selecting: usize,
    pub leaving: usize,
    pub dispatchers: usize,
    pub processors: usize,
    pub senders: usize,
    pub skipped_turns: u64,
    pub pool: PoolStats,
    pub pending_credentials: usize,
}

impl fmt::Display for ServerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = &self.status.queues;
        writeln!(
            f,
            "{} (protocol {}), up {}s, turn {} ({} skipped)",
            self.status.name,
            self.status.protocol_version,
            self.status.uptime_secs,
            self.status.turn,
            self.skipped_turns
        )?;
        writeln!(
            f,
            "sessions: {} total, {} handshaking, {} selecting, {} in world, {} leaving",
            self.status.sessions, self.handshaking, self.selecting, self.status.in_world, self.leaving
        )?;
        writeln!(
            f,
            "queues: inbound {}, actions {}, character {}, chat {}, inter-server {}, outbound {}",
            q.inbound, q.actions, q.character, q.chat, q.inter_server, q.outbound
        )?;
        writeln!(
            f,
            "workers: dispatch {}, process {}, send {}",
            self.dispatchers, self.processors, self.senders
        )?;
        write!(
            f,
            "messages: {} in flight, {} pooled, {} allocated; {} login tokens pending",
            self.pool.outstanding(),
            self.pool.free,
            self.pool.allocated,
            self.pending_credentials
        )
    }
}

pub struct WorldServer {
    config: ServerConfig,
    hub: Arc<QueueHub>,
    sessions: Arc<SessionTable>,
    credentials: Arc<CredentialStore>,
    pool: Arc<MessagePool>,
    transport: Arc<dyn Transport>,
    outbox: Outbox,
    processor: Arc<LowPriorityProcessor>,
    scheduler: TurnScheduler,
    sweeper: Arc<SessionSweeper>,
    dispatchers: WorkerPool,
    processors: WorkerPool,
    senders: WorkerPool,
    background: Mutex<Vec<(WorkerToken, JoinHandle<()>)>>,
}

impl WorldServer {
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            transport,
            simulation,
            store,
        } = collaborators;

        let hub = Arc::new(QueueHub::new(config.queue_capacity));
        let sessions = Arc::new(SessionTable::new(config.flood_limit));
        let credentials = Arc::new(CredentialStore::new(config.credential_ttl()));
        let pool = MessagePool::new(config.pool_max_free);
        let turns = Arc::new(TurnCounter::new());
        let outbox = Outbox::new(Arc::clone(&hub), Arc::clone(&pool), Arc::clone(&turns));

        let dispatcher = Arc::new(InboundDispatcher::new(
            Arc::clone(&hub),
            Arc::clone(&sessions),
            Arc::clone(&transport),
            Arc::clone(&credentials),
            Arc::clone(&turns),
            DispatchSettings {
                peer_secret: config.peer_secret.clone(),
                decode_grace: config.decode_grace(),
                idle_wait: config.idle_wait(),
            },
        ));
        let processor = Arc::new(LowPriorityProcessor::new(
            Arc::clone(&hub),
            Arc::clone(&sessions),
            Arc::clone(&simulation),
            store,
            Arc::clone(&transport),
            Arc::clone(&credentials),
            outbox.clone(),
            ProcessorSettings {
                server_name: config.server_name.clone(),
                max_chat_length: config.max_chat_length,
                idle_wait: config.idle_wait(),
                exit_grace: config.decode_grace(),
            },
        ));
        let sender = Arc::new(OutboundSender::new(
            Arc::clone(&hub),
            Arc::clone(&sessions),
            Arc::clone(&transport),
            config.idle_wait(),
        ));
        let scheduler = TurnScheduler::new(
            Arc::clone(&hub),
            Arc::clone(&sessions),
            simulation,
            Arc::clone(&transport),
            outbox.clone(),
            turns,
            config.timer_interval(),
            config.decode_grace(),
        );
        let sweeper = Arc::new(SessionSweeper::new(
            Arc::clone(&sessions),
            Arc::clone(&transport),
            Arc::clone(&credentials),
            SweepSettings {
                interval: config.sweep_interval(),
                handshake_timeout: config.handshake_timeout(),
                idle_timeout: config.idle_timeout(),
                disconnect_grace: config.decode_grace(),
            },
        ));

        let join_timeout = config.join_timeout();
        let dispatchers = WorkerPool::new("dispatch", 1, join_timeout, move |token| {
            Arc::clone(&dispatcher).run_worker(token)
        });
        let processors = {
            let processor = Arc::clone(&processor);
            WorkerPool::new("process", 0, join_timeout, move |token| {
                Arc::clone(&processor).run_worker(token)
            })
        };
        let senders = WorkerPool::new("send", 1, join_timeout, move |token| {
            Arc::clone(&sender).run_worker(token)
        });

        Self {
            config,
            hub,
            sessions,
            credentials,
            pool,
            transport,
            outbox,
            processor,
            scheduler,
            sweeper,
            dispatchers,
            processors,
            senders,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn hub(&self) -> &Arc<QueueHub> {
        &self.hub
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Starts the worker tiers at their configured sizes, the turn clock and
    /// the sweeper.
    pub async fn start(&self) -> Result<(), PoolError> {
        self.dispatchers.resize(self.config.dispatcher_workers).await?;
        self.processors.resize(self.config.processor_workers).await?;
        self.senders.resize(self.config.sender_workers).await?;

        let mut background = self.background.lock().await;
        let clock = WorkerToken::new(0);
        background.push((
            clock.clone(),
            tokio::spawn(self.scheduler.clone().run(clock)),
        ));
        let sweep = WorkerToken::new(1);
        background.push((
            sweep.clone(),
            tokio::spawn(Arc::clone(&self.sweeper).run(sweep)),
        ));

        info!(
            "{} started: turn {:?}, workers {}/{}/{}",
            self.config.server_name,
            self.config.turn_duration(),
            self.config.dispatcher_workers,
            self.config.processor_workers,
            self.config.sender_workers
        );
        Ok(())
    }

    pub async fn resize(&self, tier: Tier, workers: usize) -> Result<usize, PoolError> {
        let result = self.pool_for(tier).resize(workers).await;
        if let Err(e) = &result {
            warn!("Resizing the {} tier failed: {}", tier, e);
        }
        result
    }

    pub fn workers(&self, tier: Tier) -> usize {
        self.pool_for(tier).size()
    }

    fn pool_for(&self, tier: Tier) -> &WorkerPool {
        match tier {
            Tier::Dispatch => &self.dispatchers,
            Tier::Process => &self.processors,
            Tier::Send => &self.senders,
        }
    }

    pub fn current_turn(&self) -> shared::Turn {
        self.scheduler.current_turn()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            status: self.processor.status(),
            handshaking: self.sessions.count_in_state(SessionState::Handshake),
            selecting: self.sessions.count_in_state(SessionState::CharacterManagement),
            leaving: self.sessions.count_in_state(SessionState::Disconnecting)
                + self.sessions.count_in_state(SessionState::Kicked),
            dispatchers: self.dispatchers.size(),
            processors: self.processors.size(),
            senders: self.senders.size(),
            skipped_turns: self.scheduler.skipped_turns(),
            pool: self.pool.stats(),
            pending_credentials: self.credentials.pending(),
        }
    }

    /// Operator kick. The character leaves the world on the next turn.
    pub fn kick(&self, session: SessionId) -> bool {
        kick_session(
            &self.sessions,
            self.transport.as_ref(),
            session,
            "kicked by operator",
        )
    }

    /// Stops the clock and sweeper, then the tiers from the inbound side out
    /// so replies already queued still reach the transport.
    pub async fn shutdown(&self) {
        info!("Shutting down at turn {}", self.current_turn());

        let background = std::mem::take(&mut *self.background.lock().await);
        for (token, _) in &background {
            token.stop();
        }
        for (_, task) in background {
            match tokio::time::timeout(self.config.join_timeout(), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task ended abnormally: {}", e),
                Err(_) => warn!("Background task did not stop in time, detaching it"),
            }
        }

        self.dispatchers.stop().await;
        self.processors.stop().await;
        self.senders.stop().await;
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryCharacterStore;
    use crate::test_support::{RecordingSimulation, RecordingTransport};
    use std::time::Duration;

    fn server() -> WorldServer {
        let config = ServerConfig {
            turn_duration_ms: 20,
            dispatcher_workers: 1,
            processor_workers: 1,
            sender_workers: 1,
            ..ServerConfig::default()
        };
        WorldServer::new(
            config,
            Collaborators {
                transport: Arc::new(RecordingTransport::new()),
                simulation: Arc::new(RecordingSimulation::new()),
                store: Arc::new(InMemoryCharacterStore::default()),
            },
        )
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("dispatch".parse::<Tier>(), Ok(Tier::Dispatch));
        assert_eq!("Processor".parse::<Tier>(), Ok(Tier::Process));
        assert_eq!("send".parse::<Tier>(), Ok(Tier::Send));
        assert_eq!(
            "render".parse::<Tier>(),
            Err(PoolError::UnknownTier("render".to_string()))
        );
        assert_eq!(Tier::Send.to_string(), "send");
    }

    #[tokio::test]
    async fn test_start_resize_and_shutdown() {
        let server = server();
        server.start().await.unwrap();
        assert_eq!(server.workers(Tier::Dispatch), 1);

        assert_eq!(server.resize(Tier::Dispatch, 3).await, Ok(3));
        assert_eq!(server.stats().dispatchers, 3);
        assert!(server.resize(Tier::Send, 0).await.is_err());
        assert_eq!(server.workers(Tier::Send), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.current_turn() > 0);

        server.shutdown().await;
        assert_eq!(server.workers(Tier::Dispatch), 0);
        assert_eq!(server.workers(Tier::Send), 0);
    }

    #[tokio::test]
    async fn test_kick_marks_session() {
        let server = server();
        let session = server.sessions().open(5);

        assert!(server.kick(session));
        assert_eq!(
            server.sessions().state_of(session),
            Some(SessionState::Kicked)
        );
        assert!(!server.kick(session));
    }

    #[test]
    fn test_stats_display() {
        let server = server();
        server.sessions().open(1);
        let text = server.stats().to_string();
        assert!(text.contains("1 total, 1 handshaking"));
        assert!(text.contains("workers: dispatch 0"));
    }
}
