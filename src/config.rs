//! Slave-node configuration.
//!
//! Single source of truth for everything the synchronization layer needs to
//! know about this node: control-plane credentials, cache behaviour, poll
//! intervals and feature flags. Supports construction from the embedding
//! gateway's own config file (serde) or from environment variables, with
//! defaults matching a stock deployment.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default values for configuration
mod defaults {
    pub fn call_timeout_secs() -> u64 {
        30
    }
    pub fn ping_timeout_secs() -> u64 {
        60
    }
    pub fn cache_ttl_secs() -> u64 {
        30
    }
    pub fn key_space_sync_interval_secs() -> u64 {
        10
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    Missing { key: String },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Configuration of a slave node's link to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Control-plane connection string, handed to the transport.
    pub connection_string: String,
    /// Node credential used for login. Rotated in place on a user-key-reset
    /// event.
    pub api_key: String,
    /// Group this node belongs to. Empty means ungrouped: login and keyspace
    /// polls use the single-node RPC variants.
    #[serde(default)]
    pub group_id: String,
    /// Per-call RPC timeout, enforced by the transport.
    #[serde(default = "defaults::call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Ping timeout, enforced by the transport.
    #[serde(default = "defaults::ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// Serve repeated reads from the local cache tier.
    #[serde(default)]
    pub enable_rpc_cache: bool,
    /// TTL for positive cache entries.
    #[serde(default = "defaults::cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Seconds between keyspace-change polls. Zero falls back to the default.
    #[serde(default = "defaults::key_space_sync_interval_secs")]
    pub key_space_sync_interval_secs: u64,
    /// Disable the keyspace poller entirely.
    #[serde(default)]
    pub disable_keyspace_sync: bool,
    /// When set, sessions missing locally are re-fetched from the control
    /// plane during reconciliation.
    #[serde(default)]
    pub synchroniser_enabled: bool,
    /// Hash entity ids before prefixing externally visible keys.
    #[serde(default)]
    pub hash_keys: bool,
    /// Liveness-check duration in seconds; feeds the node TTL reported at
    /// login. Zero means unset.
    #[serde(default)]
    pub check_duration_secs: u64,
    /// Whether this node only loads a tagged subset of API definitions.
    #[serde(default)]
    pub node_is_segmented: bool,
    /// Segmentation tags reported at login.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            api_key: String::new(),
            group_id: String::new(),
            call_timeout_secs: defaults::call_timeout_secs(),
            ping_timeout_secs: defaults::ping_timeout_secs(),
            enable_rpc_cache: false,
            cache_ttl_secs: defaults::cache_ttl_secs(),
            key_space_sync_interval_secs: defaults::key_space_sync_interval_secs(),
            disable_keyspace_sync: false,
            synchroniser_enabled: false,
            hash_keys: false,
            check_duration_secs: 0,
            node_is_segmented: false,
            tags: Vec::new(),
        }
    }
}

impl SlaveConfig {
    /// Load configuration from environment variables.
    ///
    /// `SLAVE_CONNECTION_STRING` and `SLAVE_API_KEY` are required; everything
    /// else falls back to defaults.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let connection_string = require_env("SLAVE_CONNECTION_STRING")?;
        let api_key = require_env("SLAVE_API_KEY")?;

        Ok(Self {
            connection_string,
            api_key,
            group_id: std::env::var("SLAVE_GROUP_ID").unwrap_or_default(),
            call_timeout_secs: env_u64("SLAVE_CALL_TIMEOUT", defaults::call_timeout_secs())?,
            ping_timeout_secs: env_u64("SLAVE_PING_TIMEOUT", defaults::ping_timeout_secs())?,
            enable_rpc_cache: env_bool("SLAVE_ENABLE_RPC_CACHE", false)?,
            cache_ttl_secs: env_u64("SLAVE_CACHE_TTL", defaults::cache_ttl_secs())?,
            key_space_sync_interval_secs: env_u64(
                "SLAVE_KEY_SPACE_SYNC_INTERVAL",
                defaults::key_space_sync_interval_secs(),
            )?,
            disable_keyspace_sync: env_bool("SLAVE_DISABLE_KEY_SPACE_SYNC", false)?,
            synchroniser_enabled: env_bool("SLAVE_SYNCHRONISER_ENABLED", false)?,
            hash_keys: env_bool("SLAVE_HASH_KEYS", false)?,
            check_duration_secs: env_u64("SLAVE_CHECK_DURATION", 0)?,
            node_is_segmented: env_bool("SLAVE_NODE_IS_SEGMENTED", false)?,
            tags: std::env::var("SLAVE_TAGS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// The poll interval actually used by the keyspace poller. A configured
    /// zero falls back to the default rather than producing a busy loop.
    pub fn effective_sync_interval_secs(&self) -> u64 {
        if self.key_space_sync_interval_secs == 0 {
            defaults::key_space_sync_interval_secs()
        } else {
            self.key_space_sync_interval_secs
        }
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing {
        key: key.to_string(),
    })
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: format!("must be a non-negative integer: {}", e),
        }),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
                reason: "must be one of true/false/1/0".to_string(),
            }),
        },
    }
}
