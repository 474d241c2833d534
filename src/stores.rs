//! Trait seams to the subsystems this layer mutates, and the storage-backend
//! surface it offers to the gateway.
//!
//! The concrete engines (session store, certificate manager, OAuth storage,
//! response cache, local sorted sets) live in the embedding gateway; the
//! reconciler and the storage handler only ever talk to these traits. Each
//! individual store operation is atomic at the store's own boundary — this
//! layer adds no locking of its own and relies on every mutation being
//! idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::StorageError;

/// Opaque failure from a collaborator store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StoreError(pub String);

/// Outcome of a local delete, used to drive the not-found fallbacks in the
/// reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    Deleted,
    NotFound,
}

/// The gateway's session/token store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Materialize a session fetched from the control plane.
    async fn add_session(&self, key: &str, session: &str, org_id: &str);

    /// Delete a session by key. Deleting an absent key reports
    /// [`DeleteStatus::NotFound`], never an error.
    async fn delete_session(&self, key: &str, org_id: &str, reset_quota: bool) -> DeleteStatus;

    /// Delete a session by its pre-hashed key.
    async fn delete_hashed_session(
        &self,
        key: &str,
        org_id: &str,
        api_id: &str,
        reset_quota: bool,
    ) -> DeleteStatus;
}

/// The gateway's certificate manager.
#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Fetch raw certificate content. On a slave node this reads through to
    /// the control plane and warms the local certificate cache.
    async fn get_raw(&self, cert_id: &str) -> Result<String, StoreError>;

    /// Remove a certificate. Removing an absent certificate is a no-op.
    async fn delete(&self, cert_id: &str, org_id: &str);
}

/// OAuth client storage scoped to one API.
#[async_trait]
pub trait OAuthClientStore: Send + Sync {
    /// Fetch the serialized client definition.
    async fn get_client(&self, client_id: &str) -> Result<String, StoreError>;

    async fn set_client(
        &self,
        client_id: &str,
        org_id: &str,
        client: &str,
    ) -> Result<(), StoreError>;

    async fn delete_client(&self, client_id: &str, org_id: &str) -> Result<(), StoreError>;

    /// Revoke one token. `token_type_hint` is `"access_token"`,
    /// `"refresh_token"`, or empty when unknown. Revoking an absent token is
    /// a no-op.
    async fn revoke_token(&self, token: &str, token_type_hint: &str);

    /// Revoke every token issued to a client, returning the keys of the
    /// revoked tokens so callers can invalidate them locally too.
    async fn revoke_all_tokens(&self, client_id: &str, client_secret: &str) -> Vec<String>;
}

/// Resolves the OAuth storage backend responsible for an API.
pub trait OAuthStoreResolver: Send + Sync {
    fn store_for_api(&self, api_id: &str) -> Option<Arc<dyn OAuthClientStore>>;
}

/// Per-API response/definition cache.
#[async_trait]
pub trait ApiCacheInvalidator: Send + Sync {
    /// Invalidate one API's cache. Returns whether invalidation succeeded.
    async fn invalidate(&self, api_id: &str) -> bool;
}

/// Local sorted-set storage the handler delegates to — sorted sets are never
/// proxied to the control plane.
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    async fn add_to_sorted_set(&self, key: &str, value: &str, score: f64);

    async fn get_sorted_set_range(
        &self,
        key: &str,
        score_from: &str,
        score_to: &str,
    ) -> Result<(Vec<String>, Vec<f64>), StoreError>;

    async fn remove_sorted_set_range(
        &self,
        key: &str,
        score_from: &str,
        score_to: &str,
    ) -> Result<(), StoreError>;
}

/// Durable storage for this node's own credential, written when the control
/// plane rotates it via a user-key-reset event.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn persist_api_key(&self, new_key: &str) -> Result<(), StoreError>;
}

/// The key/value storage surface this layer offers to the gateway.
///
/// Callers written against a richer store interface get graceful degradation:
/// operations this backend deliberately does not support log a warning and
/// return a harmless empty/false/no-op result instead of failing loudly.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_key(&self, key: &str) -> Result<String, StorageError>;

    /// Try each key in order, returning the first hit.
    async fn get_multi_key(&self, keys: &[String]) -> Result<Vec<String>, StorageError>;

    async fn get_raw_key(&self, key: &str) -> Result<String, StorageError>;

    async fn get_exp(&self, key: &str) -> Result<i64, StorageError>;

    /// Not supported by this backend.
    async fn set_exp(&self, key: &str, timeout: i64) -> Result<(), StorageError>;

    async fn set_key(&self, key: &str, session: &str, timeout: i64) -> Result<(), StorageError>;

    /// Not supported by this backend.
    async fn set_raw_key(&self, key: &str, session: &str, timeout: i64)
        -> Result<(), StorageError>;

    async fn delete_key(&self, key: &str) -> bool;

    async fn delete_raw_key(&self, key: &str) -> bool;

    async fn delete_keys(&self, keys: &[String]) -> bool;

    async fn delete_raw_keys(&self, keys: &[String]) -> bool;

    /// Not supported by this backend.
    async fn delete_all_keys(&self) -> bool;

    /// Not supported by this backend.
    async fn delete_scan_match(&self, pattern: &str) -> bool;

    /// Not supported by this backend.
    async fn get_keys(&self, filter: &str) -> Vec<String>;

    async fn get_keys_and_values(&self) -> HashMap<String, String>;

    async fn get_keys_and_values_with_filter(&self, filter: &str) -> HashMap<String, String>;

    async fn decrement(&self, key: &str);

    async fn increment_with_expire(&self, key: &str, expire: i64) -> i64;

    async fn append_to_set(&self, key: &str, value: &str);

    /// Not supported by this backend.
    async fn get_and_delete_set(&self, key: &str) -> Vec<String>;

    /// Not supported by this backend.
    async fn add_to_set(&self, key: &str, value: &str);

    /// Not supported by this backend.
    async fn remove_from_set(&self, key: &str, value: &str);

    /// Not supported by this backend.
    async fn get_set(&self, key: &str) -> Result<HashMap<String, String>, StorageError>;

    async fn set_rolling_window(&self, key: &str, per: i64) -> i64;

    /// Not supported by this backend.
    async fn get_rolling_window(&self, key: &str, per: i64) -> i64;

    /// Not supported by this backend.
    async fn get_key_prefix(&self) -> String;

    async fn add_to_sorted_set(&self, key: &str, value: &str, score: f64);

    async fn get_sorted_set_range(
        &self,
        key: &str,
        score_from: &str,
        score_to: &str,
    ) -> Result<(Vec<String>, Vec<f64>), StorageError>;

    async fn remove_sorted_set_range(
        &self,
        key: &str,
        score_from: &str,
        score_to: &str,
    ) -> Result<(), StorageError>;

    /// Not supported by this backend.
    async fn remove_from_list(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Not supported by this backend.
    async fn get_list_range(&self, key: &str, from: i64, to: i64)
        -> Result<Vec<String>, StorageError>;

    /// Not supported by this backend.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}
