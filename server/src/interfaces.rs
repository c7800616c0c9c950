//! Contracts for the collaborators the pipeline drives but does not own:
//! the world simulation, character persistence, and the transport.
//!
//! All three are shared across worker threads, so every method takes `&self`
//! and implementations provide their own interior locking.

use shared::{AccountId, CharacterId, CharacterSummary, ConnectionId, DeliveryMode, SessionId, Turn};
use std::time::Duration;

use crate::error::{PersistenceError, SimulationError, TransportError};
use crate::message::{ClientMessage, Outbox};

/// A character as loaded from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterRecord {
    pub account_id: AccountId,
    pub summary: CharacterSummary,
    pub x: i32,
    pub y: i32,
}

/// The authoritative world.
///
/// `on_new_turn` and `process_action` are only ever called from the turn
/// scheduler, one turn at a time. `enter_world` and `chat` come from the
/// low-priority processor and may run concurrently with a turn.
pub trait Simulation: Send + Sync {
    fn on_new_turn(&self, turn: Turn, elapsed: Duration, outbox: &Outbox)
        -> Result<(), SimulationError>;

    fn process_action(&self, message: &ClientMessage, outbox: &Outbox)
        -> Result<(), SimulationError>;

    fn is_logout_allowed(&self, session: SessionId) -> bool;

    fn on_character_logout(&self, session: SessionId, outbox: &Outbox);

    /// Places a loaded character in the world and returns its position.
    fn enter_world(
        &self,
        session: SessionId,
        character: &CharacterRecord,
        outbox: &Outbox,
    ) -> Result<(i32, i32), SimulationError>;

    fn chat(
        &self,
        session: SessionId,
        character_id: CharacterId,
        text: &str,
        outbox: &Outbox,
    ) -> Result<(), SimulationError>;
}

/// Character storage. Calls may block on I/O; the pipeline runs them on the
/// blocking thread pool.
pub trait CharacterStore: Send + Sync {
    fn list_characters(&self, account: AccountId) -> Result<Vec<CharacterSummary>, PersistenceError>;

    fn create_character(
        &self,
        account: AccountId,
        name: &str,
    ) -> Result<CharacterSummary, PersistenceError>;

    fn delete_character(
        &self,
        account: AccountId,
        character: CharacterId,
    ) -> Result<(), PersistenceError>;

    fn load_character(
        &self,
        account: AccountId,
        character: CharacterId,
    ) -> Result<CharacterRecord, PersistenceError>;
}

/// Datagram transport, one connection per client or peer.
pub trait Transport: Send + Sync {
    fn is_connected(&self, connection: ConnectionId) -> bool;

    fn send(
        &self,
        connection: ConnectionId,
        frame: &[u8],
        delivery: DeliveryMode,
        channel: u8,
    ) -> Result<(), TransportError>;

    /// Notifies the peer and closes the connection once `grace` has passed.
    fn disconnect(&self, connection: ConnectionId, reason: &str, grace: Duration);
}
