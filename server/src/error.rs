//! Error types for every failure class the pipeline distinguishes.
//!
//! None of these cross a tier boundary: each worker loop logs what it
//! receives and moves on to the next message.

use shared::{AccountId, CharacterId, ConnectionId, SessionId};
use std::path::PathBuf;
use thiserror::Error;

use crate::sessions::SessionState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("{queue} queue is full ({capacity} items)")]
    Full {
        queue: &'static str,
        capacity: usize,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("illegal session transition {from:?} -> {to:?}")]
    IllegalTransition { from: SessionState, to: SessionState },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimulationError {
    #[error("session {0} has no character in the world")]
    NotInWorld(SessionId),
    #[error("character {0} is already in the world")]
    AlreadyInWorld(CharacterId),
    #[error("action rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("character {0} not found")]
    CharacterNotFound(CharacterId),
    #[error("invalid character name: {0}")]
    InvalidName(String),
    #[error("character name '{0}' is taken")]
    NameTaken(String),
    #[error("account {0} has reached the character limit ({1})")]
    CharacterLimit(AccountId, usize),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("frame of {0} bytes exceeds the transport limit")]
    FrameTooLarge(usize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("unknown worker tier '{0}'")]
    UnknownTier(String),
    #[error("{pool} pool cannot grow beyond {max} workers")]
    TooLarge { pool: &'static str, max: usize },
    #[error("{0} pool needs at least one worker")]
    Empty(&'static str),
}
