//! In-memory character storage used by the standalone server binary.

use log::{debug, info};
use shared::{AccountId, CharacterId, CharacterSummary};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::PersistenceError;
use crate::interfaces::{CharacterRecord, CharacterStore};
use crate::utils::lock;

pub const DEFAULT_CHARACTER_LIMIT: usize = 4;
const MIN_NAME_LEN: usize = 3;
const MAX_NAME_LEN: usize = 16;

/// Trims `name` and checks it is 3 to 16 ASCII letters, digits, `_` or `-`.
pub fn validate_name(name: &str) -> Result<&str, PersistenceError> {
    let name = name.trim();
    if name.len() < MIN_NAME_LEN || name.len() > MAX_NAME_LEN {
        return Err(PersistenceError::InvalidName(format!(
            "must be {} to {} characters",
            MIN_NAME_LEN, MAX_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PersistenceError::InvalidName(
            "only letters, digits, '_' and '-' are allowed".to_string(),
        ));
    }
    Ok(name)
}

#[derive(Debug, Default)]
struct Characters {
    next_id: CharacterId,
    records: BTreeMap<CharacterId, CharacterRecord>,
}

#[derive(Debug)]
pub struct InMemoryCharacterStore {
    characters: Mutex<Characters>,
    limit: usize,
    latency: Duration,
}

impl InMemoryCharacterStore {
    pub fn new(limit: usize) -> Self {
        Self {
            characters: Mutex::new(Characters {
                next_id: 1,
                records: BTreeMap::new(),
            }),
            limit,
            latency: Duration::ZERO,
        }
    }

    /// Adds a fixed delay to every call, standing in for a database round
    /// trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
    }
}

impl Default for InMemoryCharacterStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHARACTER_LIMIT)
    }
}

impl CharacterStore for InMemoryCharacterStore {
    fn list_characters(&self, account: AccountId) -> Result<Vec<CharacterSummary>, PersistenceError> {
        self.simulate_latency();
        let characters = lock(&self.characters);
        Ok(characters
            .records
            .values()
            .filter(|r| r.account_id == account)
            .map(|r| r.summary.clone())
            .collect())
    }

    fn create_character(
        &self,
        account: AccountId,
        name: &str,
    ) -> Result<CharacterSummary, PersistenceError> {
        self.simulate_latency();
        let name = validate_name(name)?;

        let mut characters = lock(&self.characters);
        let owned = characters
            .records
            .values()
            .filter(|r| r.account_id == account)
            .count();
        if owned >= self.limit {
            return Err(PersistenceError::CharacterLimit(account, self.limit));
        }
        if characters
            .records
            .values()
            .any(|r| r.summary.name.eq_ignore_ascii_case(name))
        {
            return Err(PersistenceError::NameTaken(name.to_string()));
        }

        let id = characters.next_id;
        characters.next_id += 1;

        // Spread new characters around the origin
        let spawn = (id as i32 * 7) % 21 - 10;
        let summary = CharacterSummary {
            id,
            name: name.to_string(),
            level: 1,
        };
        characters.records.insert(
            id,
            CharacterRecord {
                account_id: account,
                summary: summary.clone(),
                x: spawn,
                y: -spawn,
            },
        );
        info!("Account {} created character {} ({})", account, id, name);
        Ok(summary)
    }

    fn delete_character(
        &self,
        account: AccountId,
        character: CharacterId,
    ) -> Result<(), PersistenceError> {
        self.simulate_latency();
        let mut characters = lock(&self.characters);
        match characters.records.get(&character) {
            Some(record) if record.account_id == account => {
                characters.records.remove(&character);
                info!("Account {} deleted character {}", account, character);
                Ok(())
            }
            _ => Err(PersistenceError::CharacterNotFound(character)),
        }
    }

    fn load_character(
        &self,
        account: AccountId,
        character: CharacterId,
    ) -> Result<CharacterRecord, PersistenceError> {
        self.simulate_latency();
        let characters = lock(&self.characters);
        match characters.records.get(&character) {
            Some(record) if record.account_id == account => {
                debug!("Loaded character {} for account {}", character, account);
                Ok(record.clone())
            }
            _ => Err(PersistenceError::CharacterNotFound(character)),
        }
    }
}
