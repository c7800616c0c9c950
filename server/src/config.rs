//! Startup configuration.
//!
//! Values come from an optional TOML file and are then overridden by
//! command-line flags (see `main.rs`). Pool sizes and the turn duration size
//! the worker pools and the scheduler clock directly.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound for any single worker pool.
pub const MAX_WORKERS_PER_TIER: usize = 64;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP address the transport binds to
    pub bind: String,
    /// Name reported to status probes
    pub server_name: String,
    /// Nominal length of one turn
    pub turn_duration_ms: u64,
    /// Fraction of the turn duration used as the clock interval
    pub timer_ratio: f64,
    pub dispatcher_workers: usize,
    pub processor_workers: usize,
    pub sender_workers: usize,
    /// Per-queue capacity; 0 disables the bound
    pub queue_capacity: usize,
    pub sweep_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Grace period between a disconnect notice and the hard close
    pub decode_grace_ms: u64,
    pub join_timeout_ms: u64,
    /// Player actions accepted per session per second
    pub flood_limit: u32,
    pub max_chat_length: usize,
    /// Shared secret peers must present on inter-server frames
    pub peer_secret: String,
    pub credential_ttl_ms: u64,
    /// Buffers kept on the message pool free-list
    pub pool_max_free: usize,
    /// Inbound silence after which the transport drops a connection
    pub connection_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            server_name: "worldgate".to_string(),
            turn_duration_ms: 100,
            timer_ratio: 0.9,
            dispatcher_workers: 2,
            processor_workers: 2,
            sender_workers: 2,
            queue_capacity: 65_536,
            sweep_interval_ms: 500,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            decode_grace_ms: 5_000,
            join_timeout_ms: 3_000,
            flood_limit: 30,
            max_chat_length: 256,
            peer_secret: "change-me".to_string(),
            credential_ttl_ms: 60_000,
            pool_max_free: 1_024,
            connection_timeout_ms: 15_000,
        }
    }
}

impl ServerConfig {
    /// Reads a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.turn_duration_ms == 0 {
            return Err(ConfigError::Invalid("turn_duration_ms must be positive".into()));
        }
        if !(self.timer_ratio > 0.0 && self.timer_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "timer_ratio must be in (0, 1], got {}",
                self.timer_ratio
            )));
        }
        if self.dispatcher_workers == 0 || self.sender_workers == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher_workers and sender_workers must be at least 1".into(),
            ));
        }
        for (name, size) in [
            ("dispatcher_workers", self.dispatcher_workers),
            ("processor_workers", self.processor_workers),
            ("sender_workers", self.sender_workers),
        ] {
            if size > MAX_WORKERS_PER_TIER {
                return Err(ConfigError::Invalid(format!(
                    "{} must not exceed {}",
                    name, MAX_WORKERS_PER_TIER
                )));
            }
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("sweep_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn turn_duration(&self) -> Duration {
        Duration::from_millis(self.turn_duration_ms)
    }

    /// Clock interval: a little shorter than a turn to absorb timer jitter.
    pub fn timer_interval(&self) -> Duration {
        self.turn_duration().mul_f64(self.timer_ratio)
    }

    /// How long an idle tier worker waits for a wake signal before
    /// re-checking its running flag.
    pub fn idle_wait(&self) -> Duration {
        self.turn_duration() / 2
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn decode_grace(&self) -> Duration {
        Duration::from_millis(self.decode_grace_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_millis(self.credential_ttl_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sweep_interval(), Duration::from_millis(500));
        assert_eq!(config.decode_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_derived_intervals() {
        let config = ServerConfig::default();
        assert_approx_eq!(config.timer_interval().as_secs_f64(), 0.09, 1e-9);
        assert_eq!(config.idle_wait(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            server_name = "test-shard"
            turn_duration_ms = 200
            sender_workers = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.server_name, "test-shard");
        assert_eq!(config.turn_duration(), Duration::from_millis(200));
        assert_eq!(config.sender_workers, 4);
        assert_eq!(config.dispatcher_workers, 2);
        assert_eq!(config.idle_wait(), Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ServerConfig::default();
        config.timer_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.turn_duration_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.sender_workers = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.processor_workers = MAX_WORKERS_PER_TIER + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let result = ServerConfig::from_toml("turn_duration_ms = \"fast\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let result = ServerConfig::load(Path::new("/nonexistent/worldgate.toml"));
        match result {
            Err(ConfigError::Read { path, .. }) => {
                assert_eq!(path, Path::new("/nonexistent/worldgate.toml"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
