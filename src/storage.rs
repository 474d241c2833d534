//! The RPC-backed storage handler.
//!
//! [`RpcStorageHandler`] is what the gateway plugs in as its storage backend
//! on a slave node: reads and writes are proxied to the control plane through
//! the retrying facade, hot reads are served from the cache tier, and the
//! operations a remote backend cannot support degrade to harmless no-ops.
//!
//! The handler also owns the poll-side entry points (`check_for_reload`,
//! `check_for_keyspace_changes`) driven by the background loops, and the
//! reconciler in [`crate::keyspace`] runs as methods on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cache::{CacheTier, TtlCache};
use crate::config::SlaveConfig;
use crate::error::{RpcError, StorageError};
use crate::keys;
use crate::notify::ClusterNotifier;
use crate::rpc::client::RpcClient;
use crate::rpc::protocol::{DefRequest, GroupKeySpaceRequest, RpcRequest};
use crate::stores::{
    ApiCacheInvalidator, CertificateManager, CredentialStore, OAuthStoreResolver, SessionStore,
    SortedSetStore, StorageBackend,
};

/// Namespace prefix under which sessions are stored on the control plane.
pub const SESSION_KEY_PREFIX: &str = "apikey-";

/// Everything the handler needs from its environment, grouped so the
/// constructor stays readable.
pub struct SyncContext {
    pub config: Arc<RwLock<SlaveConfig>>,
    pub client: Arc<RpcClient>,
    pub cache: Arc<CacheTier>,
    /// The gateway's in-process session cache; reconciliation evicts from it.
    pub session_cache: Arc<TtlCache>,
    pub sessions: Arc<dyn SessionStore>,
    pub certificates: Arc<dyn CertificateManager>,
    pub oauth: Arc<dyn OAuthStoreResolver>,
    pub api_cache: Arc<dyn ApiCacheInvalidator>,
    pub sorted_sets: Arc<dyn SortedSetStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub notifier: ClusterNotifier,
}

/// Storage manager backed by the remote control plane.
pub struct RpcStorageHandler {
    pub(crate) key_prefix: String,
    pub(crate) config: Arc<RwLock<SlaveConfig>>,
    pub(crate) client: Arc<RpcClient>,
    pub(crate) cache: Arc<CacheTier>,
    pub(crate) session_cache: Arc<TtlCache>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) certificates: Arc<dyn CertificateManager>,
    pub(crate) oauth: Arc<dyn OAuthStoreResolver>,
    pub(crate) api_cache: Arc<dyn ApiCacheInvalidator>,
    pub(crate) sorted_sets: Arc<dyn SortedSetStore>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) notifier: ClusterNotifier,
}

impl RpcStorageHandler {
    pub fn new(key_prefix: impl Into<String>, ctx: SyncContext) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            config: ctx.config,
            client: ctx.client,
            cache: ctx.cache,
            session_cache: ctx.session_cache,
            sessions: ctx.sessions,
            certificates: ctx.certificates,
            oauth: ctx.oauth,
            api_cache: ctx.api_cache,
            sorted_sets: ctx.sorted_sets,
            credentials: ctx.credentials,
            notifier: ctx.notifier,
        }
    }

    /// Establish (or re-establish) the control-plane session.
    pub async fn connect(&self) -> bool {
        self.client.login().await
    }

    /// Deregister this node from the control plane.
    pub async fn disconnect(&self) -> Result<(), RpcError> {
        self.client.disconnect().await
    }

    pub fn notifier(&self) -> &ClusterNotifier {
        &self.notifier
    }

    pub(crate) async fn fix_key(&self, key: &str) -> String {
        let hash_keys = self.config.read().await.hash_keys;
        keys::fix_key(&self.key_prefix, hash_keys, key)
    }

    pub(crate) fn clean_key(&self, key: &str) -> String {
        keys::clean_key(&self.key_prefix, key)
    }

    /// Pull API definitions for an org. Returns an empty string when the
    /// control plane has nothing for us or the call failed terminally.
    pub async fn get_api_definitions(&self, org_id: &str, tags: &[String]) -> String {
        let request = RpcRequest::GetApiDefinitions {
            request: DefRequest {
                org_id: org_id.to_string(),
                tags: tags.to_vec(),
                load_oas: true,
            },
        };
        let joined_tags = tags.join(",");
        match self
            .client
            .call_with_retry(request, &[("org_id", org_id), ("tags", &joined_tags)])
            .await
        {
            Ok(response) => match response.into_string() {
                Some(definitions) => {
                    tracing::debug!("api definitions retrieved");
                    definitions
                }
                None => {
                    tracing::warn!("GetApiDefinitions returned no value, returning empty string");
                    String::new()
                }
            },
            Err(_) => String::new(),
        }
    }

    /// Pull policies for an org. Empty string on failure or absent data.
    pub async fn get_policies(&self, org_id: &str) -> String {
        match self
            .client
            .call_with_retry(
                RpcRequest::GetPolicies {
                    org_id: org_id.to_string(),
                },
                &[("org_id", org_id)],
            )
            .await
        {
            Ok(response) => response.into_string().unwrap_or_default(),
            Err(_) => String::new(),
        }
    }

    /// Ask the control plane whether this node must perform a full reload.
    pub async fn check_for_reload(&self, org_id: &str) -> Result<bool, RpcError> {
        tracing::debug!("check reload called...");
        match self
            .client
            .call_with_retry(
                RpcRequest::CheckReload {
                    org_id: org_id.to_string(),
                },
                &[("org_id", org_id)],
            )
            .await
        {
            Ok(response) => {
                if response.into_bool() {
                    tracing::warn!("received reload instruction");
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(err) => {
                if !matches!(err, RpcError::ResponseTimeout) {
                    tracing::warn!(error = %err, "reload checker encountered unexpected error");
                }
                Err(err)
            }
        }
    }

    /// One keyspace poll: fetch the pending diff and hand any changes to the
    /// reconciler on a separate task, so a slow reconciliation never delays
    /// the next poll tick.
    pub async fn check_for_keyspace_changes(self: Arc<Self>, org_id: &str) {
        tracing::debug!("checking for keyspace changes...");

        let group_id = { self.config.read().await.group_id.clone() };
        let request = if group_id.is_empty() {
            RpcRequest::GetKeySpaceUpdate {
                org_id: org_id.to_string(),
            }
        } else {
            RpcRequest::GetGroupKeySpaceUpdate {
                group: GroupKeySpaceRequest {
                    org_id: org_id.to_string(),
                    group_id: group_id.clone(),
                },
            }
        };

        match self
            .client
            .call_with_retry(request, &[("org_id", org_id), ("group_id", &group_id)])
            .await
        {
            Err(err) => {
                tracing::warn!(error = %err, "keyspace check warning");
            }
            Ok(response) => match response.into_keys() {
                None => {
                    tracing::info!("keys returned nil object, skipping check");
                }
                Some(changed) if changed.is_empty() => {}
                Some(changed) => {
                    tracing::info!(count = changed.len(), "keyspace changes detected, updating local cache");
                    let handler = Arc::clone(&self);
                    let org_id = org_id.to_string();
                    tokio::spawn(async move {
                        handler.process_keyspace_changes(changed, &org_id).await;
                    });
                }
            },
        }
    }
}

#[async_trait]
impl StorageBackend for RpcStorageHandler {
    async fn get_key(&self, key: &str) -> Result<String, StorageError> {
        let start = Instant::now();
        let fixed = self.fix_key(key).await;
        let value = self.get_raw_key(&fixed).await;
        tracing::debug!(elapsed = ?start.elapsed(), "GetKey");
        value
    }

    async fn get_multi_key(&self, key_names: &[String]) -> Result<Vec<String>, StorageError> {
        let mut last_err = StorageError::KeyNotFound;
        for key in key_names {
            match self.get_key(key).await {
                Ok(value) => return Ok(vec![value]),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn get_raw_key(&self, key: &str) -> Result<String, StorageError> {
        let cache_enabled = self.cache.enabled();
        if cache_enabled {
            if let Some(hit) = self.cache.partition_for(key).get(key).await {
                return hit;
            }
        }

        if self.client.is_emergency_mode() {
            return Err(StorageError::ConnectionLost);
        }

        match self
            .client
            .call_with_retry(
                RpcRequest::GetKey {
                    key: key.to_string(),
                },
                &[("key_name", key)],
            )
            .await
        {
            Ok(response) => match response.into_string() {
                Some(value) => {
                    if cache_enabled {
                        self.cache.partition_for(key).set(key, value.clone()).await;
                    }
                    Ok(value)
                }
                None => {
                    if cache_enabled {
                        self.cache.partition_for(key).set_negative(key).await;
                    }
                    Err(StorageError::KeyNotFound)
                }
            },
            Err(_) => {
                // failed lookups are cached for a short window
                if cache_enabled {
                    self.cache.partition_for(key).set_negative(key).await;
                }
                Err(StorageError::KeyNotFound)
            }
        }
    }

    async fn get_exp(&self, key: &str) -> Result<i64, StorageError> {
        let fixed = self.fix_key(key).await;
        match self
            .client
            .call_with_retry(
                RpcRequest::GetExp { key: fixed.clone() },
                &[("key_name", key), ("fixed_key_name", &fixed)],
            )
            .await
        {
            Ok(response) => response.into_int().ok_or(StorageError::KeyNotFound),
            Err(err) => {
                tracing::error!(error = %err, "error trying to get TTL");
                Err(StorageError::KeyNotFound)
            }
        }
    }

    async fn set_exp(&self, _key: &str, _timeout: i64) -> Result<(), StorageError> {
        tracing::warn!("SetExp is not implemented for the rpc backend");
        Ok(())
    }

    async fn set_key(&self, key: &str, session: &str, timeout: i64) -> Result<(), StorageError> {
        let start = Instant::now();
        let fixed = self.fix_key(key).await;
        let result = self
            .client
            .call_with_retry(
                RpcRequest::SetKey {
                    key: fixed.clone(),
                    session: session.to_string(),
                    timeout,
                },
                &[("key_name", key), ("fixed_key_name", &fixed)],
            )
            .await;

        match result {
            Ok(_) => {
                tracing::debug!(elapsed = ?start.elapsed(), "SetKey");
                Ok(())
            }
            Err(err) => {
                tracing::debug!(error = %err, "error trying to set value");
                Err(err.into())
            }
        }
    }

    async fn set_raw_key(
        &self,
        _key: &str,
        _session: &str,
        _timeout: i64,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> bool {
        let fixed = self.fix_key(key).await;
        tracing::debug!(
            key = %keys::obfuscate_key(key),
            fixed = %keys::obfuscate_key(&fixed),
            "deleting key"
        );
        match self
            .client
            .call_with_retry(
                RpcRequest::DeleteKey { key: fixed.clone() },
                &[("key_name", key), ("fixed_key_name", &fixed)],
            )
            .await
        {
            Ok(response) => response.into_bool(),
            Err(_) => false,
        }
    }

    async fn delete_raw_key(&self, key: &str) -> bool {
        match self
            .client
            .call_with_retry(
                RpcRequest::DeleteRawKey {
                    key: key.to_string(),
                },
                &[("key_name", key)],
            )
            .await
        {
            Ok(response) => response.into_bool(),
            Err(_) => false,
        }
    }

    async fn delete_keys(&self, keys_to_delete: &[String]) -> bool {
        if keys_to_delete.is_empty() {
            tracing::debug!("called delete with nothing to delete");
            return true;
        }

        let mut fixed = Vec::with_capacity(keys_to_delete.len());
        for key in keys_to_delete {
            fixed.push(self.fix_key(key).await);
        }

        let joined = keys_to_delete.join(",");
        let joined_fixed = fixed.join(",");
        match self
            .client
            .call_with_retry(
                RpcRequest::DeleteKeys { keys: fixed },
                &[("keys", &joined), ("fixed_keys", &joined_fixed)],
            )
            .await
        {
            Ok(response) => response.into_bool(),
            Err(_) => false,
        }
    }

    async fn delete_raw_keys(&self, keys_to_delete: &[String]) -> bool {
        match self
            .client
            .call_with_retry(
                RpcRequest::DeleteRawKeys {
                    keys: keys_to_delete.to_vec(),
                },
                &[],
            )
            .await
        {
            Ok(response) => response.into_bool(),
            Err(_) => false,
        }
    }

    async fn delete_all_keys(&self) -> bool {
        tracing::warn!("DeleteAllKeys is not implemented for the rpc backend");
        false
    }

    async fn delete_scan_match(&self, _pattern: &str) -> bool {
        tracing::warn!("DeleteScanMatch is not implemented for the rpc backend");
        false
    }

    async fn get_keys(&self, _filter: &str) -> Vec<String> {
        tracing::warn!("GetKeys is not implemented for the rpc backend");
        Vec::new()
    }

    async fn get_keys_and_values(&self) -> HashMap<String, String> {
        let search = format!("{}*", self.key_prefix);
        match self
            .client
            .call_with_retry(RpcRequest::GetKeysAndValues { search }, &[])
            .await
        {
            Ok(response) => match response.into_keys_values() {
                Some((found_keys, values)) => found_keys
                    .into_iter()
                    .zip(values)
                    .map(|(key, value)| (self.clean_key(&key), value))
                    .collect(),
                None => HashMap::new(),
            },
            Err(_) => HashMap::new(),
        }
    }

    async fn get_keys_and_values_with_filter(&self, filter: &str) -> HashMap<String, String> {
        let hash_keys = self.config.read().await.hash_keys;
        let search = format!("{}{}*", self.key_prefix, keys::hash_key(filter, hash_keys));
        tracing::debug!(search = %search, "getting list by filter");

        match self
            .client
            .call_with_retry(
                RpcRequest::GetKeysAndValuesWithFilter {
                    search: search.clone(),
                },
                &[("search_str", &search)],
            )
            .await
        {
            Ok(response) => match response.into_keys_values() {
                Some((found_keys, values)) => found_keys
                    .into_iter()
                    .zip(values)
                    .map(|(key, value)| (self.clean_key(&key), value))
                    .collect(),
                None => HashMap::new(),
            },
            Err(_) => HashMap::new(),
        }
    }

    async fn decrement(&self, key: &str) {
        tracing::warn!(key = %keys::obfuscate_key(key), "decrement called");
        let _ = self
            .client
            .call_with_retry(
                RpcRequest::Decrement {
                    key: key.to_string(),
                },
                &[("key_name", key)],
            )
            .await;
    }

    async fn increment_with_expire(&self, key: &str, expire: i64) -> i64 {
        match self
            .client
            .call_with_retry(
                RpcRequest::IncrementWithExpire {
                    key: key.to_string(),
                    expire,
                },
                &[("key_name", key)],
            )
            .await
        {
            Ok(response) => match response.into_int() {
                Some(value) => value,
                None => {
                    tracing::warn!("rpc increment returned nil value, returning 0");
                    0
                }
            },
            Err(_) => 0,
        }
    }

    async fn append_to_set(&self, key: &str, value: &str) {
        let _ = self
            .client
            .call_with_retry(
                RpcRequest::AppendToSet {
                    key: key.to_string(),
                    value: value.to_string(),
                },
                &[("key_name", key)],
            )
            .await;
    }

    async fn get_and_delete_set(&self, _key: &str) -> Vec<String> {
        tracing::warn!("GetAndDeleteSet is not implemented, disable your purger");
        Vec::new()
    }

    async fn add_to_set(&self, _key: &str, _value: &str) {
        tracing::warn!("AddToSet is not implemented for the rpc backend");
    }

    async fn remove_from_set(&self, _key: &str, _value: &str) {
        tracing::warn!("RemoveFromSet is not implemented for the rpc backend");
    }

    async fn get_set(&self, _key: &str) -> Result<HashMap<String, String>, StorageError> {
        tracing::warn!("GetSet is not implemented for the rpc backend");
        Ok(HashMap::new())
    }

    async fn set_rolling_window(&self, key: &str, per: i64) -> i64 {
        let start = Instant::now();
        let per_str = per.to_string();
        match self
            .client
            .call_with_retry(
                RpcRequest::SetRollingWindow {
                    key: key.to_string(),
                    per,
                },
                &[("key_name", key), ("per", &per_str)],
            )
            .await
        {
            Ok(response) => match response.into_int() {
                Some(count) => {
                    tracing::debug!(elapsed = ?start.elapsed(), "SetRollingWindow");
                    count
                }
                None => {
                    tracing::warn!("SetRollingWindow returned nil value, returning 0");
                    0
                }
            },
            Err(_) => 0,
        }
    }

    async fn get_rolling_window(&self, _key: &str, _per: i64) -> i64 {
        tracing::warn!("GetRollingWindow is not implemented for the rpc backend");
        0
    }

    async fn get_key_prefix(&self) -> String {
        tracing::warn!("GetKeyPrefix is not implemented for the rpc backend");
        String::new()
    }

    async fn add_to_sorted_set(&self, key: &str, value: &str, score: f64) {
        self.sorted_sets.add_to_sorted_set(key, value, score).await;
    }

    async fn get_sorted_set_range(
        &self,
        key: &str,
        score_from: &str,
        score_to: &str,
    ) -> Result<(Vec<String>, Vec<f64>), StorageError> {
        self.sorted_sets
            .get_sorted_set_range(key, score_from, score_to)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "sorted set range read failed");
                StorageError::KeyNotFound
            })
    }

    async fn remove_sorted_set_range(
        &self,
        key: &str,
        score_from: &str,
        score_to: &str,
    ) -> Result<(), StorageError> {
        self.sorted_sets
            .remove_sorted_set_range(key, score_from, score_to)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "sorted set range removal failed");
                StorageError::KeyNotFound
            })
    }

    async fn remove_from_list(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        tracing::warn!("RemoveFromList is not implemented for the rpc backend");
        Ok(())
    }

    async fn get_list_range(
        &self,
        _key: &str,
        _from: i64,
        _to: i64,
    ) -> Result<Vec<String>, StorageError> {
        tracing::warn!("GetListRange is not implemented for the rpc backend");
        Ok(Vec::new())
    }

    async fn exists(&self, _key: &str) -> Result<bool, StorageError> {
        tracing::warn!("Exists is not implemented for the rpc backend");
        Ok(false)
    }
}
