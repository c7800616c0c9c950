//! # World Server Library
//!
//! The concurrent message pipeline and turn scheduler of a persistent
//! multiplayer world server. Every client session moves through a handshake,
//! character selection and the live world; every message it sends is routed
//! by priority and every world change happens inside a numbered turn.
//!
//! ## Core Responsibilities
//!
//! ### Turn-Based Simulation
//! A periodic clock fires turns. Each turn the scheduler swaps the action
//! queue's buffers, applies every queued player action to the simulation in
//! arrival order and then finalizes pending logouts. At most one turn runs at
//! a time and the turn counter advances even when a turn fails.
//!
//! ### Session Lifecycle
//! Sessions follow a strict state machine:
//! `Handshake -> CharacterManagement <-> InWorld -> Disconnecting -> Disconnected`,
//! with `Kicked` reachable from any live state. Invalid or out-of-state traffic
//! disconnects the sender exactly once.
//!
//! ### Prioritized Message Routing
//! Inbound frames are decoded and routed to one of four queues: player
//! actions (drained by the turn scheduler), character management, chat, and
//! inter-server messages (all drained round-robin by the low-priority
//! processor). Replies flow through a single outbound queue.
//!
//! ## Architecture Design
//!
//! ### Worker Tiers
//! Four tiers run as tokio tasks and talk only through the queue hub:
//! - **Dispatch**: decode, validate against session state, route
//! - **Turn**: the scheduler's clock-driven turns
//! - **Process**: character management, chat, inter-server traffic
//! - **Send**: hand encoded replies to the transport
//!
//! Dispatch, process and send are worker pools that can be resized while the
//! server runs.
//!
//! ### Pooled Outbound Messages
//! Outbound messages draw their encode buffer from a shared pool and return
//! it exactly once, when the sender drops them.
//!
//! ### Collaborators
//! The simulation, character storage and transport are traits
//! ([`interfaces`]). The crate ships an in-memory world ([`game`]), an
//! in-memory store ([`storage`]) and a UDP transport ([`network`]).
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game::InMemoryWorld;
//! use server::network::UdpTransport;
//! use server::runtime::{Collaborators, WorldServer};
//! use server::storage::InMemoryCharacterStore;
//! use server::workers::WorkerToken;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let transport = UdpTransport::bind(&config.bind, config.connection_timeout()).await?;
//!
//!     let server = WorldServer::new(
//!         config,
//!         Collaborators {
//!             transport: transport.clone(),
//!             simulation: Arc::new(InMemoryWorld::new()),
//!             store: Arc::new(InMemoryCharacterStore::default()),
//!         },
//!     );
//!     let token = WorkerToken::new(0);
//!     transport.spawn_receiver(server.hub().clone(), server.sessions().clone(), token.clone());
//!     transport.spawn_reaper(token.clone());
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     token.stop();
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod console;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod game;
pub mod interfaces;
pub mod message;
pub mod message_pool;
pub mod network;
pub mod processor;
pub mod queues;
pub mod runtime;
pub mod scheduler;
pub mod sender;
pub mod sessions;
pub mod storage;
pub mod sweeper;
pub mod utils;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use config::ServerConfig;
pub use interfaces::{CharacterRecord, CharacterStore, Simulation, Transport};
pub use message::{ClientMessage, Outbox};
pub use runtime::{Collaborators, ServerStats, Tier, WorldServer};
pub use sessions::SessionState;
