//! Low-priority processor (tier 3).
//!
//! Drains the chat, character-management and inter-server queues round-robin,
//! one message from each per round, so a flood on one queue cannot starve the
//! others. Persistence calls run on the blocking pool; starting a character
//! runs as its own task and answers later through the outbound queue.
//!
//! Every reply goes out reliable-ordered on channel 0.

use log::{debug, error, info, warn};
use shared::{
    AccountId, CharacterId, ClientPayload, InterServerPayload, ServerPayload, ServerStatus,
    SessionId, PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::credentials::CredentialStore;
use crate::error::PersistenceError;
use crate::interfaces::{CharacterStore, Simulation, Transport};
use crate::message::{ClientMessage, InterServerMessage, Outbox};
use crate::queues::QueueHub;
use crate::sessions::{disconnect_session, SessionState, SessionTable};
use crate::workers::{guarded, WorkerToken};

/// Rounds per pass before the worker re-checks its token.
const ROUNDS_PER_PASS: usize = 64;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub server_name: String,
    pub max_chat_length: usize,
    pub idle_wait: Duration,
    /// Grace period for connections closed by a client exit
    pub exit_grace: Duration,
}

pub struct LowPriorityProcessor {
    hub: Arc<QueueHub>,
    sessions: Arc<SessionTable>,
    simulation: Arc<dyn Simulation>,
    store: Arc<dyn CharacterStore>,
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    outbox: Outbox,
    settings: ProcessorSettings,
    started_at: Instant,
}

impl LowPriorityProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<QueueHub>,
        sessions: Arc<SessionTable>,
        simulation: Arc<dyn Simulation>,
        store: Arc<dyn CharacterStore>,
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        outbox: Outbox,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            hub,
            sessions,
            simulation,
            store,
            transport,
            credentials,
            outbox,
            settings,
            started_at: Instant::now(),
        }
    }

    pub async fn run_worker(self: Arc<Self>, token: WorkerToken) {
        debug!("Processor worker {} started", token.id());
        while token.is_running() {
            if self.run_pass().await > 0 {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = self.hub.chat().notified() => {}
                _ = self.hub.character().notified() => {}
                _ = self.hub.inter_server().notified() => {}
                _ = tokio::time::sleep(self.settings.idle_wait) => {}
            }
        }
        debug!("Processor worker {} stopped", token.id());
    }

    /// Takes one message from each queue per round until all three are empty
    /// or the round budget is spent. Returns how many messages were handled.
    pub async fn run_pass(self: &Arc<Self>) -> usize {
        let mut handled = 0;
        for _ in 0..ROUNDS_PER_PASS {
            let mut progressed = false;

            if let Some(message) = self.hub.chat().pop() {
                self.handle_chat(&message);
                progressed = true;
                handled += 1;
            }
            if let Some(message) = self.hub.character().pop() {
                // Character loads finish on their own task.
                let _ = self.handle_character(message).await;
                progressed = true;
                handled += 1;
            }
            if let Some(message) = self.hub.inter_server().pop() {
                self.handle_inter_server(message);
                progressed = true;
                handled += 1;
            }

            if !progressed {
                break;
            }
        }
        handled
    }

    /// Answers one character-management request. A start request returns the
    /// handle of the background load instead of replying directly.
    pub async fn handle_character(self: &Arc<Self>, message: ClientMessage) -> Option<JoinHandle<()>> {
        let session = message.session;
        let context = self.sessions.with(session, |s| (s.state(), s.account_id));
        let account = match context {
            Some((SessionState::CharacterManagement, Some(account))) => account,
            Some((state, _)) => {
                debug!(
                    "Session {}: dropping {} in state {:?}",
                    session,
                    message.payload.kind(),
                    state
                );
                return None;
            }
            None => {
                debug!("Dropping {} for evicted session {}", message.payload.kind(), session);
                return None;
            }
        };

        match message.payload {
            ClientPayload::ListCharacters => {
                let characters = match self
                    .persist("list characters", move |store| store.list_characters(account))
                    .await
                {
                    Ok(characters) => characters,
                    Err(e) => {
                        warn!("Session {}: listing characters failed: {}", session, e);
                        Vec::new()
                    }
                };
                self.outbox
                    .reply_or_log(session, ServerPayload::CharacterList { characters });
            }
            ClientPayload::CreateCharacter { name } => {
                let reply = match self
                    .persist("create character", move |store| {
                        store.create_character(account, &name)
                    })
                    .await
                {
                    Ok(character) => ServerPayload::CharacterCreated { character },
                    Err(e) => ServerPayload::CreateFailed {
                        reason: e.to_string(),
                    },
                };
                self.outbox.reply_or_log(session, reply);
            }
            ClientPayload::DeleteCharacter { character_id } => {
                let reply = match self
                    .persist("delete character", move |store| {
                        store.delete_character(account, character_id)
                    })
                    .await
                {
                    Ok(()) => ServerPayload::CharacterDeleted { character_id },
                    Err(e) => ServerPayload::DeleteFailed {
                        reason: e.to_string(),
                    },
                };
                self.outbox.reply_or_log(session, reply);
            }
            ClientPayload::StartCharacter { character_id } => {
                let claimed = self
                    .sessions
                    .with(session, |s| !std::mem::replace(&mut s.entering_world, true))
                    .unwrap_or(false);
                if !claimed {
                    debug!("Session {}: character load already running", session);
                    return None;
                }
                let processor = Arc::clone(self);
                return Some(tokio::spawn(processor.start_character(
                    session,
                    account,
                    character_id,
                )));
            }
            ClientPayload::Logout { exit_client, .. } => {
                self.outbox
                    .reply_or_log(session, ServerPayload::LogoutConfirmed { exit_client });
                if exit_client {
                    disconnect_session(
                        &self.sessions,
                        self.transport.as_ref(),
                        session,
                        "logged out",
                        self.settings.exit_grace,
                    );
                }
            }
            other => {
                warn!("Session {}: {} is not a character request", session, other.kind());
            }
        }
        None
    }

    async fn start_character(
        self: Arc<Self>,
        session: SessionId,
        account: AccountId,
        character_id: CharacterId,
    ) {
        let record = match self
            .persist("load character", move |store| {
                store.load_character(account, character_id)
            })
            .await
        {
            Ok(record) => record,
            Err(e) => return self.fail_start(session, e.to_string()),
        };

        if self.sessions.state_of(session) != Some(SessionState::CharacterManagement) {
            info!("Session {} left before character {} loaded", session, character_id);
            self.sessions.with(session, |s| s.entering_world = false);
            return;
        }

        let core = Arc::clone(&self);
        let placed = record.clone();
        let entered = tokio::task::spawn_blocking(move || {
            core.simulation.enter_world(session, &placed, &core.outbox)
        })
        .await;
        let (x, y) = match entered {
            Ok(Ok(position)) => position,
            Ok(Err(e)) => return self.fail_start(session, e.to_string()),
            Err(e) => {
                error!("Session {}: entering the world panicked: {}", session, e);
                return self.fail_start(session, "world unavailable".to_string());
            }
        };

        match self.sessions.with(session, |s| s.enter_world(character_id)) {
            Some(Ok(())) => {
                info!(
                    "Session {} entered the world as character {} at ({}, {})",
                    session, character_id, x, y
                );
                self.outbox.reply_or_log(
                    session,
                    ServerPayload::EnterWorld {
                        character: record.summary,
                        x,
                        y,
                    },
                );
            }
            bound => {
                if let Some(Err(e)) = bound {
                    warn!("Session {}: {}", session, e);
                }
                info!("Session {} left while entering the world", session);
                self.sessions.with(session, |s| s.entering_world = false);
                guarded("character logout", || {
                    self.simulation.on_character_logout(session, &self.outbox)
                });
            }
        }
    }

    fn fail_start(&self, session: SessionId, reason: String) {
        warn!("Session {}: start failed: {}", session, reason);
        self.sessions.with(session, |s| s.entering_world = false);
        self.outbox
            .reply_or_log(session, ServerPayload::StartFailed { reason });
    }

    fn handle_chat(&self, message: &ClientMessage) {
        let session = message.session;
        let ClientPayload::Chat { character_id, text } = &message.payload else {
            warn!("Session {}: {} on the chat queue", session, message.payload.kind());
            return;
        };

        let speaking = self
            .sessions
            .with(session, |s| {
                s.state() == SessionState::InWorld
                    && s.owns_character(*character_id)
                    && !s.character_logout_granted
            })
            .unwrap_or(false);
        if !speaking {
            debug!("Session {}: dropping chat, not in the world", session);
            return;
        }

        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let text = match text.char_indices().nth(self.settings.max_chat_length) {
            Some((cut, _)) => {
                debug!("Session {}: chat truncated to {} characters", session, self.settings.max_chat_length);
                &text[..cut]
            }
            None => text,
        };

        match guarded("chat", || {
            self.simulation.chat(session, *character_id, text, &self.outbox)
        }) {
            Some(Err(e)) => warn!("Session {}: chat failed: {}", session, e),
            Some(Ok(())) | None => {}
        }
    }

    fn handle_inter_server(&self, message: InterServerMessage) {
        match message.payload {
            InterServerPayload::CredentialToken { account_id, token } => {
                self.credentials.record(account_id, token);
            }
            InterServerPayload::StatusProbe => {
                debug!("Status probe from session {}", message.origin);
                self.outbox
                    .reply_or_log(message.origin, ServerPayload::Status(self.status()));
            }
        }
    }

    /// Self-description served to status probes and the operator console.
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.settings.server_name.clone(),
            protocol_version: PROTOCOL_VERSION,
            turn: self.outbox.current_turn(),
            sessions: self.sessions.len(),
            in_world: self.sessions.count_in_world(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            queues: self.hub.sample(),
        }
    }

    async fn persist<R, F>(&self, what: &'static str, call: F) -> Result<R, PersistenceError>
    where
        F: FnOnce(&dyn CharacterStore) -> Result<R, PersistenceError> + Send + 'static,
        R: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || call(store.as_ref())).await {
            Ok(result) => result,
            Err(e) => {
                error!("Storage call '{}' failed: {}", what, e);
                Err(PersistenceError::Unavailable(what.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::CharacterRecord;
    use crate::message::OutboundMessage;
    use crate::storage::InMemoryCharacterStore;
    use crate::test_support::{Harness, SimCall};
    use shared::{CharacterSummary, DeliveryMode};

    fn processor_with(harness: &Harness, store: Arc<dyn CharacterStore>) -> Arc<LowPriorityProcessor> {
        Arc::new(LowPriorityProcessor::new(
            Arc::clone(&harness.hub),
            Arc::clone(&harness.sessions),
            harness.simulation.clone(),
            store,
            harness.transport.clone(),
            Arc::clone(&harness.credentials),
            harness.outbox.clone(),
            ProcessorSettings {
                server_name: "test-world".to_string(),
                max_chat_length: 8,
                idle_wait: Duration::from_millis(10),
                exit_grace: Duration::from_secs(5),
            },
        ))
    }

    fn processor(harness: &Harness) -> (Arc<LowPriorityProcessor>, Arc<InMemoryCharacterStore>) {
        let store = Arc::new(InMemoryCharacterStore::new(4));
        (processor_with(harness, store.clone()), store)
    }

    fn request(session: SessionId, payload: ClientPayload) -> ClientMessage {
        ClientMessage {
            session,
            payload,
            turn: 0,
        }
    }

    fn single_reply(harness: &Harness) -> OutboundMessage {
        let mut outbound = harness.drain_outbound();
        assert_eq!(outbound.len(), 1, "expected exactly one reply");
        outbound.remove(0)
    }

    struct BrokenStore;

    impl CharacterStore for BrokenStore {
        fn list_characters(&self, _: AccountId) -> Result<Vec<CharacterSummary>, PersistenceError> {
            panic!("connection pool exhausted");
        }
        fn create_character(&self, _: AccountId, _: &str) -> Result<CharacterSummary, PersistenceError> {
            panic!("connection pool exhausted");
        }
        fn delete_character(&self, _: AccountId, _: CharacterId) -> Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("offline".to_string()))
        }
        fn load_character(&self, _: AccountId, _: CharacterId) -> Result<CharacterRecord, PersistenceError> {
            Err(PersistenceError::Unavailable("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_list_reply_is_reliable_ordered() {
        let harness = Harness::new();
        let (processor, store) = processor(&harness);
        let session = harness.character_select_session();
        store.create_character(1, "Aria").unwrap();

        processor
            .handle_character(request(session, ClientPayload::ListCharacters))
            .await;

        let reply = single_reply(&harness);
        assert_eq!(reply.target, session);
        assert_eq!(reply.delivery, DeliveryMode::ReliableOrdered);
        assert_eq!(reply.channel, 0);
        match reply.payload {
            ServerPayload::CharacterList { characters } => {
                assert_eq!(characters.len(), 1);
                assert_eq!(characters[0].name, "Aria");
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_and_delete_replies() {
        let harness = Harness::new();
        let (processor, _) = processor(&harness);
        let session = harness.character_select_session();

        processor
            .handle_character(request(
                session,
                ClientPayload::CreateCharacter {
                    name: "Aria".to_string(),
                },
            ))
            .await;
        let created = match single_reply(&harness).payload {
            ServerPayload::CharacterCreated { character } => character,
            other => panic!("unexpected reply {:?}", other),
        };

        processor
            .handle_character(request(
                session,
                ClientPayload::CreateCharacter {
                    name: "aria".to_string(),
                },
            ))
            .await;
        assert!(matches!(
            single_reply(&harness).payload,
            ServerPayload::CreateFailed { .. }
        ));

        processor
            .handle_character(request(
                session,
                ClientPayload::DeleteCharacter {
                    character_id: created.id,
                },
            ))
            .await;
        assert_eq!(
            single_reply(&harness).payload,
            ServerPayload::CharacterDeleted {
                character_id: created.id
            }
        );
    }

    #[tokio::test]
    async fn test_storage_panic_becomes_failure_reply() {
        let harness = Harness::new();
        let processor = processor_with(&harness, Arc::new(BrokenStore));
        let session = harness.character_select_session();

        processor
            .handle_character(request(
                session,
                ClientPayload::CreateCharacter {
                    name: "Aria".to_string(),
                },
            ))
            .await;
        assert!(matches!(
            single_reply(&harness).payload,
            ServerPayload::CreateFailed { .. }
        ));

        processor
            .handle_character(request(session, ClientPayload::ListCharacters))
            .await;
        assert_eq!(
            single_reply(&harness).payload,
            ServerPayload::CharacterList { characters: vec![] }
        );
    }

    #[tokio::test]
    async fn test_start_character_enters_world_asynchronously() {
        let harness = Harness::new();
        let (processor, store) = processor(&harness);
        let session = harness.character_select_session();
        let aria = store.create_character(1, "Aria").unwrap();

        let load = processor
            .handle_character(request(
                session,
                ClientPayload::StartCharacter {
                    character_id: aria.id,
                },
            ))
            .await
            .expect("start should run in the background");
        load.await.unwrap();

        assert_eq!(harness.sessions.state_of(session), Some(SessionState::InWorld));
        assert!(harness
            .simulation
            .calls()
            .contains(&SimCall::EnterWorld(session, aria.id)));
        match single_reply(&harness).payload {
            ServerPayload::EnterWorld { character, .. } => assert_eq!(character, aria),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(
            harness.sessions.with(session, |s| (s.in_world, s.entering_world)),
            Some((true, false))
        );
    }

    #[tokio::test]
    async fn test_start_unknown_character_fails() {
        let harness = Harness::new();
        let (processor, _) = processor(&harness);
        let session = harness.character_select_session();

        processor
            .handle_character(request(
                session,
                ClientPayload::StartCharacter { character_id: 99 },
            ))
            .await
            .unwrap()
            .await
            .unwrap();

        assert!(matches!(
            single_reply(&harness).payload,
            ServerPayload::StartFailed { .. }
        ));
        assert_eq!(
            harness.sessions.state_of(session),
            Some(SessionState::CharacterManagement)
        );
        assert_eq!(harness.sessions.with(session, |s| s.entering_world), Some(false));
    }

    #[tokio::test]
    async fn test_start_rejected_by_simulation() {
        let harness = Harness::new();
        harness.simulation.set_fail_enter(true);
        let (processor, store) = processor(&harness);
        let session = harness.character_select_session();
        let aria = store.create_character(1, "Aria").unwrap();

        processor
            .handle_character(request(
                session,
                ClientPayload::StartCharacter {
                    character_id: aria.id,
                },
            ))
            .await
            .unwrap()
            .await
            .unwrap();

        assert!(matches!(
            single_reply(&harness).payload,
            ServerPayload::StartFailed { .. }
        ));
        assert_eq!(
            harness.sessions.state_of(session),
            Some(SessionState::CharacterManagement)
        );
    }

    #[tokio::test]
    async fn test_duplicate_start_is_ignored() {
        let harness = Harness::new();
        let (processor, store) = processor(&harness);
        let session = harness.character_select_session();
        let aria = store.create_character(1, "Aria").unwrap();
        harness.sessions.with(session, |s| s.entering_world = true);

        let start = request(
            session,
            ClientPayload::StartCharacter {
                character_id: aria.id,
            },
        );
        assert!(processor.handle_character(start).await.is_none());
        assert!(harness.drain_outbound().is_empty());
    }

    #[tokio::test]
    async fn test_requests_outside_character_selection_are_dropped() {
        let harness = Harness::new();
        let (processor, _) = processor(&harness);
        let session = harness.in_world_session(3);

        processor
            .handle_character(request(session, ClientPayload::ListCharacters))
            .await;
        assert!(harness.drain_outbound().is_empty());
    }

    #[tokio::test]
    async fn test_exit_from_character_selection() {
        let harness = Harness::new();
        let (processor, _) = processor(&harness);
        let session = harness.character_select_session();

        processor
            .handle_character(request(
                session,
                ClientPayload::Logout {
                    character_id: None,
                    exit_client: true,
                },
            ))
            .await;

        assert_eq!(
            single_reply(&harness).payload,
            ServerPayload::LogoutConfirmed { exit_client: true }
        );
        assert_eq!(
            harness.sessions.state_of(session),
            Some(SessionState::Disconnecting)
        );
        assert_eq!(harness.transport.disconnects()[0].1, "logged out");
    }

    #[tokio::test]
    async fn test_chat_goes_to_simulation_truncated() {
        let harness = Harness::new();
        let (processor, _) = processor(&harness);
        let speaker = harness.in_world_session(3);
        let bystander = harness.character_select_session();

        for (session, text) in [
            (speaker, "  hello everyone  "),
            (speaker, "   "),
            (bystander, "hi"),
        ] {
            harness
                .hub
                .chat()
                .push(request(
                    session,
                    ClientPayload::Chat {
                        character_id: 3,
                        text: text.to_string(),
                    },
                ))
                .unwrap();
        }
        assert_eq!(processor.run_pass().await, 3);

        let chats: Vec<_> = harness
            .simulation
            .calls()
            .into_iter()
            .filter(|c| matches!(c, SimCall::Chat(..)))
            .collect();
        assert_eq!(chats, vec![SimCall::Chat(speaker, "hello ev".to_string())]);
    }

    #[tokio::test]
    async fn test_inter_server_messages() {
        let harness = Harness::new();
        let (processor, _) = processor(&harness);
        let peer = harness.handshake_session();

        harness
            .hub
            .inter_server()
            .push(InterServerMessage {
                origin: peer,
                payload: InterServerPayload::CredentialToken {
                    account_id: 9,
                    token: "abc".to_string(),
                },
                turn: 0,
            })
            .unwrap();
        harness
            .hub
            .inter_server()
            .push(InterServerMessage {
                origin: peer,
                payload: InterServerPayload::StatusProbe,
                turn: 0,
            })
            .unwrap();
        processor.run_pass().await;

        assert!(harness.credentials.redeem(9, "abc"));
        match single_reply(&harness).payload {
            ServerPayload::Status(status) => {
                assert_eq!(status.name, "test-world");
                assert_eq!(status.protocol_version, PROTOCOL_VERSION);
                assert_eq!(status.sessions, 1);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pass_interleaves_queues() {
        let harness = Harness::new();
        let (processor, _) = processor(&harness);
        let session = harness.character_select_session();

        for _ in 0..3 {
            harness
                .hub
                .character()
                .push(request(session, ClientPayload::ListCharacters))
                .unwrap();
            harness
                .hub
                .inter_server()
                .push(InterServerMessage {
                    origin: session,
                    payload: InterServerPayload::StatusProbe,
                    turn: 0,
                })
                .unwrap();
        }

        assert_eq!(processor.run_pass().await, 6);
        let kinds: Vec<&str> = harness
            .drain_outbound()
            .iter()
            .map(|m| m.payload.kind())
            .collect();
        assert_eq!(kinds.len(), 6);
        // One from each queue per round.
        for round in kinds.chunks(2) {
            assert_ne!(round[0], round[1]);
        }
    }

    #[tokio::test]
    async fn test_worker_stops_when_idle() {
        let harness = Harness::new();
        let (processor, _) = processor(&harness);
        let token = WorkerToken::new(0);
        let worker = tokio::spawn(Arc::clone(&processor).run_worker(token.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.stop();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker should notice the stop within the idle wait")
            .unwrap();
    }
}
