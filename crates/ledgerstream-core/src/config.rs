//! Client configuration.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::{RetryConfig, RetryPolicy};

/// Reconnect behaviour of the connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// When `false` the first failure or drop closes the client.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Consecutive failed reconnect attempts tolerated before giving up (absent = unbounded).
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter_fraction: f64,
}

fn bool_true() -> bool { true }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.1 }

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter_fraction: default_jitter(),
        }
    }
}

impl ReconnectConfig {
    /// One-shot semantics: never reconnect.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Default::default() }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: if self.enabled { self.max_attempts } else { Some(0) },
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            jitter_fraction: self.jitter_fraction,
        })
    }
}

/// Retry behaviour for restoring subscriptions after a reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_replay_retries")]
    pub max_retries: u32,
    #[serde(default = "default_replay_initial_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_replay_max_ms")]
    pub max_backoff_ms: u64,
}

fn default_replay_retries() -> u32 { 3 }
fn default_replay_initial_ms() -> u64 { 250 }
fn default_replay_max_ms() -> u64 { 5_000 }

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_retries: default_replay_retries(),
            initial_backoff_ms: default_replay_initial_ms(),
            max_backoff_ms: default_replay_max_ms(),
        }
    }
}

impl ReplayConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: Some(self.max_retries),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        })
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Default per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Commands that are safe to re-send after a reconnect
    #[serde(default = "default_idempotent_commands")]
    pub idempotent_commands: Vec<String>,
    #[serde(default)]
    pub replay: ReplayConfig,
    /// Per-handler event queue capacity
    #[serde(default = "default_handler_queue")]
    pub handler_queue_capacity: usize,
    /// Maximum derived requests in flight at once
    #[serde(default = "default_max_derived")]
    pub max_derived_requests: usize,
    /// Derived requests outstanding (waiting or in flight) before new ones are refused
    #[serde(default = "default_max_pending_derived")]
    pub max_pending_derived_requests: usize,
    /// Capacity of the error observation channel
    #[serde(default = "default_error_channel")]
    pub error_channel_capacity: usize,
}

fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_handler_queue() -> usize { 1_024 }
fn default_max_derived() -> usize { 32 }
fn default_max_pending_derived() -> usize { 512 }
fn default_error_channel() -> usize { 256 }

fn default_idempotent_commands() -> Vec<String> {
    [
        "server_info",
        "server_state",
        "book_changes",
        "ledger",
        "ledger_closed",
        "ledger_current",
        "fee",
        "account_info",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            idempotent_commands: default_idempotent_commands(),
            replay: ReplayConfig::default(),
            handler_queue_capacity: default_handler_queue(),
            max_derived_requests: default_max_derived(),
            max_pending_derived_requests: default_max_pending_derived(),
            error_channel_capacity: default_error_channel(),
        }
    }
}

impl ClientConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idempotent_set(&self) -> HashSet<String> {
        self.idempotent_commands.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let cfg = ClientConfig::from_json("{}").unwrap();
        assert_eq!(cfg.request_timeout_ms, 30_000);
        assert!(cfg.reconnect.enabled);
        assert_eq!(cfg.reconnect.max_attempts, None);
        assert!(cfg.idempotent_set().contains("book_changes"));
        assert_eq!(cfg.replay.max_retries, 3);
    }

    #[test]
    fn partial_override() {
        let cfg = ClientConfig::from_json(
            r#"{"reconnect":{"max_attempts":5,"initial_backoff_ms":10},"idempotent_commands":["fee"]}"#,
        )
        .unwrap();
        assert_eq!(cfg.reconnect.max_attempts, Some(5));
        assert_eq!(cfg.reconnect.initial_backoff_ms, 10);
        assert_eq!(cfg.reconnect.max_backoff_ms, 30_000);
        assert_eq!(cfg.idempotent_commands, vec!["fee".to_string()]);
    }

    #[test]
    fn load_errors_are_classified() {
        let missing = ClientConfig::from_json_file("/nonexistent/ledgerstream.json").unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }), "{missing:?}");
        assert!(missing.to_string().contains("/nonexistent/ledgerstream.json"));

        let malformed = ClientConfig::from_json(r#"{"request_timeout_ms": "soon"}"#).unwrap_err();
        assert!(matches!(malformed, ConfigError::Parse(_)), "{malformed:?}");
    }

    #[test]
    fn disabled_reconnect_never_retries() {
        let policy = ReconnectConfig::disabled().policy();
        assert!(policy.next_delay(1).is_none());
    }
}
