//! One-time login tokens handed over by the login service.
//!
//! A peer records a token for an account; the client's handshake redeems it.
//! A token is consumed by the first redeem attempt that matches and expires
//! after its TTL either way.

use log::{debug, info};
use shared::AccountId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::utils::lock;

#[derive(Debug)]
struct Credential {
    token: String,
    issued_at: Instant,
}

#[derive(Debug)]
pub struct CredentialStore {
    ttl: Duration,
    tokens: Mutex<HashMap<AccountId, Credential>>,
}

impl CredentialStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Stores a token, replacing any earlier one for the account.
    pub fn record(&self, account_id: AccountId, token: String) {
        lock(&self.tokens).insert(
            account_id,
            Credential {
                token,
                issued_at: Instant::now(),
            },
        );
        info!("Recorded login token for account {}", account_id);
    }

    pub fn redeem(&self, account_id: AccountId, token: &str) -> bool {
        let mut tokens = lock(&self.tokens);
        let valid = match tokens.get(&account_id) {
            Some(credential) => {
                credential.token == token && credential.issued_at.elapsed() <= self.ttl
            }
            None => false,
        };
        if valid {
            tokens.remove(&account_id);
        }
        valid
    }

    /// Drops expired tokens; returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut tokens = lock(&self.tokens);
        let before = tokens.len();
        tokens.retain(|_, c| now.duration_since(c.issued_at) <= self.ttl);
        let purged = before - tokens.len();
        if purged > 0 {
            debug!("Purged {} expired login tokens", purged);
        }
        purged
    }

    pub fn pending(&self) -> usize {
        lock(&self.tokens).len()
    }
}
