//! Shared test doubles: a scriptable transport and recording collaborator
//! stores, plus a harness wiring a full handler together.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::sync::mpsc;

use crate::cache::{CacheTier, TtlCache};
use crate::config::SlaveConfig;
use crate::error::RpcError;
use crate::node::{GatewayStats, HealthSnapshot, HostDetails, NodeStateProvider};
use crate::notify::{ClusterNotifier, Notification};
use crate::rpc::client::{RpcClient, RpcTransport};
use crate::rpc::protocol::{GroupLoginRequest, RpcRequest, RpcResponse};
use crate::storage::{RpcStorageHandler, SyncContext};
use crate::stores::{
    ApiCacheInvalidator, CertificateManager, CredentialStore, DeleteStatus, OAuthClientStore,
    OAuthStoreResolver, SessionStore, SortedSetStore, StoreError,
};

/// Transport double: scripted responses per method with sensible defaults,
/// recording every request it sees.
#[derive(Default)]
pub(crate) struct MockTransport {
    calls: Mutex<Vec<RpcRequest>>,
    scripts: Mutex<HashMap<String, VecDeque<Result<RpcResponse, RpcError>>>>,
    login_rejected: AtomicBool,
}

impl MockTransport {
    /// Queue one response for the named method; consumed in FIFO order.
    pub fn script(&self, method: &str, response: Result<RpcResponse, RpcError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn set_login_ok(&self, ok: bool) {
        self.login_rejected.store(!ok, Ordering::SeqCst);
    }

    pub fn calls_for(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.method() == method)
            .count()
    }

    pub fn login_calls(&self) -> usize {
        self.calls_for("Login") + self.calls_for("LoginWithGroup")
    }

    pub fn last_request_for(&self, method: &str) -> Option<RpcRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|request| request.method() == method)
            .cloned()
    }

    pub fn last_group_login(&self) -> Option<GroupLoginRequest> {
        self.calls.lock().unwrap().iter().rev().find_map(|request| match request {
            RpcRequest::LoginWithGroup { group } => Some(group.clone()),
            _ => None,
        })
    }

    fn default_response(request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        match request {
            RpcRequest::GetKey { .. } => Err(RpcError::Remote("key not found".into())),
            RpcRequest::SetKey { .. }
            | RpcRequest::AppendToSet { .. }
            | RpcRequest::Decrement { .. }
            | RpcRequest::Disconnect { .. } => Ok(RpcResponse::Ok),
            RpcRequest::DeleteKey { .. }
            | RpcRequest::DeleteRawKey { .. }
            | RpcRequest::DeleteKeys { .. }
            | RpcRequest::DeleteRawKeys { .. } => Ok(RpcResponse::Bool(true)),
            RpcRequest::GetExp { .. }
            | RpcRequest::IncrementWithExpire { .. }
            | RpcRequest::SetRollingWindow { .. } => Ok(RpcResponse::Int(0)),
            RpcRequest::GetKeysAndValues { .. }
            | RpcRequest::GetKeysAndValuesWithFilter { .. } => Ok(RpcResponse::KeysValues {
                keys: Vec::new(),
                values: Vec::new(),
            }),
            RpcRequest::CheckReload { .. } => Ok(RpcResponse::Bool(false)),
            RpcRequest::Ping => Ok(RpcResponse::Bool(true)),
            _ => Ok(RpcResponse::Nil),
        }
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        self.calls.lock().unwrap().push(request.clone());

        if matches!(
            request,
            RpcRequest::Login { .. } | RpcRequest::LoginWithGroup { .. }
        ) {
            return Ok(RpcResponse::Bool(!self.login_rejected.load(Ordering::SeqCst)));
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(request.method())
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(response) => response,
            None => Self::default_response(&request),
        }
    }
}

#[derive(Default)]
pub(crate) struct MockNodeState;

impl NodeStateProvider for MockNodeState {
    fn node_id(&self) -> String {
        "test-node".to_string()
    }

    fn health(&self) -> HealthSnapshot {
        HealthSnapshot::new()
    }

    fn stats(&self) -> GatewayStats {
        GatewayStats {
            apis_count: 1,
            policies_count: 1,
        }
    }

    fn host_details(&self) -> HostDetails {
        HostDetails {
            hostname: "test-host".to_string(),
            pid: 1,
            address: "127.0.0.1".to_string(),
        }
    }
}

/// Session store double backed by a set of known keys.
#[derive(Default)]
pub(crate) struct MockSessionStore {
    existing: Mutex<HashSet<String>>,
    deletes: Mutex<Vec<(String, bool)>>,
    hashed_deletes: Mutex<Vec<(String, String)>>,
    materialized: Mutex<Vec<String>>,
}

impl MockSessionStore {
    pub async fn insert_existing(&self, key: &str) {
        self.existing.lock().unwrap().insert(key.to_string());
    }

    /// Every delete attempt as `(key, reset_quota)`, in call order.
    pub async fn deletes(&self) -> Vec<(String, bool)> {
        self.deletes.lock().unwrap().clone()
    }

    /// Every hashed delete as `(key, api_id)`.
    pub async fn hashed_deletes(&self) -> Vec<(String, String)> {
        self.hashed_deletes.lock().unwrap().clone()
    }

    /// Keys materialized from control-plane sessions.
    pub async fn materialized(&self) -> Vec<String> {
        self.materialized.lock().unwrap().clone()
    }

    fn remove(&self, key: &str) -> DeleteStatus {
        if self.existing.lock().unwrap().remove(key) {
            DeleteStatus::Deleted
        } else {
            DeleteStatus::NotFound
        }
    }
}

#[async_trait]
impl SessionStore for MockSessionStore {
    async fn add_session(&self, key: &str, _session: &str, _org_id: &str) {
        self.existing.lock().unwrap().insert(key.to_string());
        self.materialized.lock().unwrap().push(key.to_string());
    }

    async fn delete_session(&self, key: &str, _org_id: &str, reset_quota: bool) -> DeleteStatus {
        self.deletes
            .lock()
            .unwrap()
            .push((key.to_string(), reset_quota));
        self.remove(key)
    }

    async fn delete_hashed_session(
        &self,
        key: &str,
        _org_id: &str,
        api_id: &str,
        _reset_quota: bool,
    ) -> DeleteStatus {
        self.hashed_deletes
            .lock()
            .unwrap()
            .push((key.to_string(), api_id.to_string()));
        self.remove(key)
    }
}

#[derive(Default)]
pub(crate) struct MockCertificateManager {
    deletes: Mutex<Vec<(String, String)>>,
    raw_fetches: Mutex<Vec<String>>,
    fail_fetches: AtomicBool,
}

impl MockCertificateManager {
    pub async fn deletes(&self) -> Vec<(String, String)> {
        self.deletes.lock().unwrap().clone()
    }

    pub async fn raw_fetches(&self) -> Vec<String> {
        self.raw_fetches.lock().unwrap().clone()
    }

    pub async fn fail_fetches(&self) {
        self.fail_fetches.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CertificateManager for MockCertificateManager {
    async fn get_raw(&self, cert_id: &str) -> Result<String, StoreError> {
        self.raw_fetches.lock().unwrap().push(cert_id.to_string());
        if self.fail_fetches.load(Ordering::SeqCst) {
            Err(StoreError("certificate fetch failed".into()))
        } else {
            Ok("pem-content".to_string())
        }
    }

    async fn delete(&self, cert_id: &str, org_id: &str) {
        self.deletes
            .lock()
            .unwrap()
            .push((cert_id.to_string(), org_id.to_string()));
    }
}

/// OAuth store double, also acting as its own per-API resolver.
#[derive(Default)]
pub(crate) struct MockOAuthStore {
    revoked_tokens: Mutex<Vec<(String, String)>>,
    revoked_clients: Mutex<Vec<(String, String)>>,
    deleted_clients: Mutex<Vec<(String, String)>>,
    saved_clients: Mutex<Vec<(String, String)>>,
    all_tokens: Mutex<Vec<String>>,
}

impl MockOAuthStore {
    pub async fn revoked_tokens(&self) -> Vec<(String, String)> {
        self.revoked_tokens.lock().unwrap().clone()
    }

    pub async fn revoked_clients(&self) -> Vec<(String, String)> {
        self.revoked_clients.lock().unwrap().clone()
    }

    pub async fn deleted_clients(&self) -> Vec<(String, String)> {
        self.deleted_clients.lock().unwrap().clone()
    }

    pub async fn saved_clients(&self) -> Vec<(String, String)> {
        self.saved_clients.lock().unwrap().clone()
    }

    /// Token keys the next `revoke_all_tokens` call returns.
    pub async fn set_all_tokens(&self, tokens: Vec<String>) {
        *self.all_tokens.lock().unwrap() = tokens;
    }
}

#[async_trait]
impl OAuthClientStore for MockOAuthStore {
    async fn get_client(&self, _client_id: &str) -> Result<String, StoreError> {
        Ok("client-json".to_string())
    }

    async fn set_client(
        &self,
        client_id: &str,
        org_id: &str,
        _client: &str,
    ) -> Result<(), StoreError> {
        self.saved_clients
            .lock()
            .unwrap()
            .push((client_id.to_string(), org_id.to_string()));
        Ok(())
    }

    async fn delete_client(&self, client_id: &str, org_id: &str) -> Result<(), StoreError> {
        self.deleted_clients
            .lock()
            .unwrap()
            .push((client_id.to_string(), org_id.to_string()));
        Ok(())
    }

    async fn revoke_token(&self, token: &str, token_type_hint: &str) {
        self.revoked_tokens
            .lock()
            .unwrap()
            .push((token.to_string(), token_type_hint.to_string()));
    }

    async fn revoke_all_tokens(&self, client_id: &str, client_secret: &str) -> Vec<String> {
        self.revoked_clients
            .lock()
            .unwrap()
            .push((client_id.to_string(), client_secret.to_string()));
        self.all_tokens.lock().unwrap().clone()
    }
}

pub(crate) struct MockOAuthResolver {
    store: Arc<MockOAuthStore>,
}

impl OAuthStoreResolver for MockOAuthResolver {
    fn store_for_api(&self, _api_id: &str) -> Option<Arc<dyn OAuthClientStore>> {
        Some(self.store.clone())
    }
}

#[derive(Default)]
pub(crate) struct MockApiCache {
    invalidated: Mutex<Vec<String>>,
    failures: Mutex<HashSet<String>>,
}

impl MockApiCache {
    pub async fn invalidated(&self) -> Vec<String> {
        self.invalidated.lock().unwrap().clone()
    }

    pub async fn fail_for(&self, api_id: &str) {
        self.failures.lock().unwrap().insert(api_id.to_string());
    }
}

#[async_trait]
impl ApiCacheInvalidator for MockApiCache {
    async fn invalidate(&self, api_id: &str) -> bool {
        self.invalidated.lock().unwrap().push(api_id.to_string());
        !self.failures.lock().unwrap().contains(api_id)
    }
}

#[derive(Default)]
pub(crate) struct MockSortedSets {
    adds: Mutex<Vec<(String, String)>>,
}

impl MockSortedSets {
    pub async fn adds(&self) -> Vec<(String, String)> {
        self.adds.lock().unwrap().clone()
    }
}

#[async_trait]
impl SortedSetStore for MockSortedSets {
    async fn add_to_sorted_set(&self, key: &str, value: &str, _score: f64) {
        self.adds
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
    }

    async fn get_sorted_set_range(
        &self,
        _key: &str,
        _score_from: &str,
        _score_to: &str,
    ) -> Result<(Vec<String>, Vec<f64>), StoreError> {
        Ok((Vec::new(), Vec::new()))
    }

    async fn remove_sorted_set_range(
        &self,
        _key: &str,
        _score_from: &str,
        _score_to: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockCredentialStore {
    persisted: Mutex<Vec<String>>,
}

impl MockCredentialStore {
    pub async fn persisted(&self) -> Vec<String> {
        self.persisted.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialStore for MockCredentialStore {
    async fn persist_api_key(&self, new_key: &str) -> Result<(), StoreError> {
        self.persisted.lock().unwrap().push(new_key.to_string());
        Ok(())
    }
}

/// A full handler wired against mocks.
pub(crate) struct TestHarness {
    pub transport: Arc<MockTransport>,
    pub client: Arc<RpcClient>,
    pub config: Arc<RwLock<SlaveConfig>>,
    pub cache: Arc<CacheTier>,
    pub session_cache: Arc<TtlCache>,
    pub sessions: Arc<MockSessionStore>,
    pub certificates: Arc<MockCertificateManager>,
    pub oauth: Arc<MockOAuthStore>,
    pub api_cache: Arc<MockApiCache>,
    pub sorted_sets: Arc<MockSortedSets>,
    pub credentials: Arc<MockCredentialStore>,
    pub handler: Arc<RpcStorageHandler>,
    notifications: tokio::sync::Mutex<mpsc::Receiver<Notification>>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    /// Next pending notification, if any was queued.
    pub async fn next_notification(&self) -> Option<Notification> {
        self.notifications.lock().await.try_recv().ok()
    }

    pub async fn notification_count(&self) -> usize {
        let mut receiver = self.notifications.lock().await;
        let mut count = 0;
        while receiver.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}

#[derive(Default)]
pub(crate) struct TestHarnessBuilder {
    cache_enabled: bool,
    synchroniser_enabled: bool,
    hash_keys: bool,
    api_key: Option<String>,
    group_id: Option<String>,
}

impl TestHarnessBuilder {
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn synchroniser_enabled(mut self, enabled: bool) -> Self {
        self.synchroniser_enabled = enabled;
        self
    }

    pub fn hash_keys(mut self, enabled: bool) -> Self {
        self.hash_keys = enabled;
        self
    }

    pub fn api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn group(mut self, group_id: &str) -> Self {
        self.group_id = Some(group_id.to_string());
        self
    }

    pub fn build(self) -> TestHarness {
        let config = Arc::new(RwLock::new(SlaveConfig {
            connection_string: "cp:9090".to_string(),
            api_key: self.api_key.unwrap_or_else(|| "test-api-key".to_string()),
            group_id: self.group_id.unwrap_or_default(),
            enable_rpc_cache: self.cache_enabled,
            synchroniser_enabled: self.synchroniser_enabled,
            hash_keys: self.hash_keys,
            ..SlaveConfig::default()
        }));

        let transport = Arc::new(MockTransport::default());
        let client = Arc::new(RpcClient::new(
            transport.clone(),
            config.clone(),
            Arc::new(MockNodeState),
        ));

        let cache = Arc::new(CacheTier::new(self.cache_enabled, Duration::from_secs(30)));
        let session_cache = Arc::new(TtlCache::new(Duration::from_secs(30)));
        let sessions = Arc::new(MockSessionStore::default());
        let certificates = Arc::new(MockCertificateManager::default());
        let oauth = Arc::new(MockOAuthStore::default());
        let api_cache = Arc::new(MockApiCache::default());
        let sorted_sets = Arc::new(MockSortedSets::default());
        let credentials = Arc::new(MockCredentialStore::default());
        let (notifier, receiver) = ClusterNotifier::new();

        let handler = Arc::new(RpcStorageHandler::new(
            "test-prefix-",
            SyncContext {
                config: config.clone(),
                client: client.clone(),
                cache: cache.clone(),
                session_cache: session_cache.clone(),
                sessions: sessions.clone(),
                certificates: certificates.clone(),
                oauth: Arc::new(MockOAuthResolver {
                    store: oauth.clone(),
                }),
                api_cache: api_cache.clone(),
                sorted_sets: sorted_sets.clone(),
                credentials: credentials.clone(),
                notifier,
            },
        ));

        TestHarness {
            transport,
            client,
            config,
            cache,
            session_cache,
            sessions,
            certificates,
            oauth,
            api_cache,
            sorted_sets,
            credentials,
            handler,
            notifications: tokio::sync::Mutex::new(receiver),
        }
    }
}
