//! TTL-based local cache for RPC results.
//!
//! Two independent partitions exist — a general one and one dedicated to
//! certificate material — so that certificate churn never evicts session
//! state and vice versa. Both successful values and "not found" outcomes are
//! cached: a failed remote lookup leaves a short-lived negative entry behind
//! so repeated misses do not stampede the control plane, and the one-second
//! bound keeps a stale failure from masking recovery for long.
//!
//! Entries expire lazily on read; the cache holds no background sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::StorageError;

/// TTL for negative (key-not-found) entries. Deliberately much shorter than
/// any positive TTL.
pub const NEGATIVE_ENTRY_TTL: Duration = Duration::from_secs(1);

/// Keys containing this marker are routed to the certificate partition.
pub const CERT_KEY_MARKER: &str = "cert-";

#[derive(Debug, Clone)]
enum CachedValue {
    Value(String),
    NotFound,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    expires_at: Instant,
}

/// Thread-safe TTL cache keyed by the externally visible key string.
#[derive(Clone)]
pub struct TtlCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    default_ttl: Duration,
    negative_ttl: Duration,
}

impl TtlCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_ttls(default_ttl, NEGATIVE_ENTRY_TTL)
    }

    /// Construct with explicit positive and negative TTLs.
    pub fn with_ttls(default_ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
            negative_ttl,
        }
    }

    /// Look up a key. Returns the cached value, the cached not-found outcome,
    /// or `None` on a miss. Expired entries are removed on the way out.
    pub async fn get(&self, key: &str) -> Option<Result<String, StorageError>> {
        let expired = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(match &entry.value {
                        CachedValue::Value(value) => Ok(value.clone()),
                        CachedValue::NotFound => Err(StorageError::KeyNotFound),
                    });
                }
                Some(_) => true,
            }
        };
        if expired {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get(key) {
                if entry.expires_at <= Instant::now() {
                    entries.remove(key);
                }
            }
        }
        None
    }

    /// Store a positive value under the default TTL.
    pub async fn set(&self, key: &str, value: String) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: CachedValue::Value(value),
                expires_at: Instant::now() + self.default_ttl,
            },
        );
    }

    /// Record a failed lookup under the short negative TTL.
    pub async fn set_negative(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: CachedValue::NotFound,
                expires_at: Instant::now() + self.negative_ttl,
            },
        );
    }

    pub async fn delete(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    /// Whether a live (non-expired) entry exists for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

/// The dual-partition cache tier in front of the RPC facade.
#[derive(Clone)]
pub struct CacheTier {
    enabled: bool,
    general: TtlCache,
    certificates: TtlCache,
}

impl CacheTier {
    pub fn new(enabled: bool, default_ttl: Duration) -> Self {
        Self {
            enabled,
            general: TtlCache::new(default_ttl),
            certificates: TtlCache::new(default_ttl),
        }
    }

    /// Whether the read path may consult the cache at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Select the partition responsible for `key`: anything mentioning
    /// certificate material goes to the certificate partition.
    pub fn partition_for(&self, key: &str) -> &TtlCache {
        if key.contains(CERT_KEY_MARKER) {
            &self.certificates
        } else {
            &self.general
        }
    }

    pub fn general(&self) -> &TtlCache {
        &self.general
    }

    pub fn certificates(&self) -> &TtlCache {
        &self.certificates
    }
}
