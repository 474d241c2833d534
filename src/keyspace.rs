//! Keyspace-change classification and reconciliation.
//!
//! The control plane's diff poll returns an unordered batch of opaque
//! change-keys. Each key may carry an action tag as its last colon-delimited
//! segment; [`ChangeAction`] is the closed vocabulary of those tags, decoded
//! once per key during classification. Everything the batch implies is then
//! applied in a fixed phase order — credential resets first, then OAuth
//! client operations, token/client revocations, certificate sync, regular key
//! invalidations, API cache invalidations, and finally a single cluster-wide
//! fan-out of the processed key list.
//!
//! Phase order matters: revocations append token keys that the regular-key
//! phase must also invalidate, and credential resets mark keys that it must
//! skip. Every mutation is idempotent, so reprocessing a batch (or two nodes
//! racing on the same diff) converges to the same state.

use std::collections::{HashMap, HashSet};

use crate::keys;
use crate::notify::Notification;
use crate::storage::{RpcStorageHandler, SESSION_KEY_PREFIX};
use crate::stores::{DeleteStatus, StorageBackend};

/// Action tags a change-key can carry as its last `:`-separated segment.
///
/// Unrecognized tags are deliberately not an error: the control plane may be
/// newer than this node, so unknown actions are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    ResetQuota,
    CertificateAdded,
    CertificateRemoved,
    OAuthRevokeToken,
    OAuthRevokeAccessToken,
    OAuthRevokeRefreshToken,
    OAuthRevokeAllTokens,
    OauthClientAdded,
    OauthClientUpdated,
    OauthClientRemoved,
    DeleteApiCache,
    UserKeyReset,
}

impl ChangeAction {
    /// Decode an action tag. Actions are inferred purely from the literal
    /// suffix.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "resetQuota" => Some(ChangeAction::ResetQuota),
            "CertificateAdded" => Some(ChangeAction::CertificateAdded),
            "CertificateRemoved" => Some(ChangeAction::CertificateRemoved),
            "oAuthRevokeToken" => Some(ChangeAction::OAuthRevokeToken),
            "oAuthRevokeAccessToken" => Some(ChangeAction::OAuthRevokeAccessToken),
            "oAuthRevokeRefreshToken" => Some(ChangeAction::OAuthRevokeRefreshToken),
            "revoke_all_tokens" => Some(ChangeAction::OAuthRevokeAllTokens),
            "OauthClientAdded" => Some(ChangeAction::OauthClientAdded),
            "OauthClientUpdated" => Some(ChangeAction::OauthClientUpdated),
            "OauthClientRemoved" => Some(ChangeAction::OauthClientRemoved),
            "DeleteAPICache" => Some(ChangeAction::DeleteApiCache),
            "UserKeyReset" => Some(ChangeAction::UserKeyReset),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ChangeAction::ResetQuota => "resetQuota",
            ChangeAction::CertificateAdded => "CertificateAdded",
            ChangeAction::CertificateRemoved => "CertificateRemoved",
            ChangeAction::OAuthRevokeToken => "oAuthRevokeToken",
            ChangeAction::OAuthRevokeAccessToken => "oAuthRevokeAccessToken",
            ChangeAction::OAuthRevokeRefreshToken => "oAuthRevokeRefreshToken",
            ChangeAction::OAuthRevokeAllTokens => "revoke_all_tokens",
            ChangeAction::OauthClientAdded => "OauthClientAdded",
            ChangeAction::OauthClientUpdated => "OauthClientUpdated",
            ChangeAction::OauthClientRemoved => "OauthClientRemoved",
            ChangeAction::DeleteApiCache => "DeleteAPICache",
            ChangeAction::UserKeyReset => "UserKeyReset",
        }
    }
}

/// Marker suffix on a token segment indicating the token is pre-hashed.
const HASHED_TOKEN_MARKER: &str = "#hashed";

/// The per-poll working set: every raw key routed into its bucket, plus the
/// exclusion set of keys already fully handled by a bucket. Lives for one
/// reconciliation cycle and is discarded.
#[derive(Debug, Default)]
pub(crate) struct ReconciliationBatch {
    /// Entity ids whose quota must be reset when they show up as plain keys.
    pub keys_to_reset: HashSet<String>,
    /// Certificate ids to delete locally.
    pub certs_to_remove: Vec<String>,
    /// Certificate ids to eagerly warm in the local cache.
    pub certs_to_add: Vec<String>,
    /// token → raw change-key, for individually revoked tokens.
    pub tokens_to_revoke: HashMap<String, String>,
    /// client id → raw change-key, for full client revocations.
    pub clients_to_revoke: HashMap<String, String>,
    /// `apiId.clientId.orgId` → client operation.
    pub oauth_clients: HashMap<String, ChangeAction>,
    /// API ids whose local response cache must be invalidated.
    pub api_cache_invalidations: Vec<String>,
    /// old credential → new credential.
    pub user_key_resets: HashMap<String, String>,
    /// Raw keys fully handled by a bucket; excluded from the regular-key
    /// phase.
    pub not_regular_keys: HashSet<String>,
}

impl ReconciliationBatch {
    /// Scan the raw key list once and route every key into its bucket.
    pub(crate) fn classify(raw_keys: &[String]) -> Self {
        let mut batch = ReconciliationBatch::default();

        for key in raw_keys {
            let segments: Vec<&str> = key.split(':').collect();
            if segments.len() < 2 {
                continue;
            }
            let Some(action) = ChangeAction::parse(segments[segments.len() - 1]) else {
                tracing::debug!(
                    action = segments[segments.len() - 1],
                    "ignoring processing of action"
                );
                continue;
            };

            match action {
                // the raw key still reaches the regular-key phase, which
                // honours the reset flag on delete
                ChangeAction::ResetQuota => {
                    batch.keys_to_reset.insert(segments[0].to_string());
                }
                ChangeAction::CertificateRemoved => {
                    batch.certs_to_remove.push(segments[0].to_string());
                    batch.not_regular_keys.insert(key.clone());
                }
                ChangeAction::CertificateAdded => {
                    batch.certs_to_add.push(segments[0].to_string());
                    batch.not_regular_keys.insert(key.clone());
                }
                ChangeAction::OAuthRevokeToken
                | ChangeAction::OAuthRevokeAccessToken
                | ChangeAction::OAuthRevokeRefreshToken => {
                    batch
                        .tokens_to_revoke
                        .insert(segments[0].to_string(), key.clone());
                    batch.not_regular_keys.insert(key.clone());
                }
                ChangeAction::OAuthRevokeAllTokens => {
                    batch
                        .clients_to_revoke
                        .insert(segments[1].to_string(), key.clone());
                    batch.not_regular_keys.insert(key.clone());
                }
                ChangeAction::OauthClientAdded
                | ChangeAction::OauthClientUpdated
                | ChangeAction::OauthClientRemoved => {
                    batch
                        .oauth_clients
                        .insert(segments[0].to_string(), action);
                    batch.not_regular_keys.insert(key.clone());
                }
                ChangeAction::DeleteApiCache => {
                    batch
                        .api_cache_invalidations
                        .push(segments[0].to_string());
                    batch.not_regular_keys.insert(key.clone());
                }
                ChangeAction::UserKeyReset => {
                    let parts: Vec<&str> = segments[0].split('.').collect();
                    if parts.len() != 2 {
                        tracing::error!("invalid user key reset format");
                        continue;
                    }
                    batch
                        .user_key_resets
                        .insert(parts[0].to_string(), parts[1].to_string());
                }
            }
        }

        batch
    }
}

impl RpcStorageHandler {
    /// Apply one batch of keyspace changes.
    ///
    /// Failures applying any one entry are logged and skip only that entry —
    /// a partially applied batch is corrected by a later poll, never by
    /// aborting the rest of the work.
    pub async fn process_keyspace_changes(&self, raw_keys: Vec<String>, org_id: &str) {
        let mut working_keys = raw_keys;
        let batch = ReconciliationBatch::classify(&working_keys);

        self.apply_user_key_resets(&batch).await;
        self.apply_oauth_client_ops(&batch).await;
        self.apply_client_revocations(&batch, &mut working_keys).await;
        self.apply_token_revocations(&batch, org_id).await;
        self.apply_certificate_changes(&batch, org_id).await;
        self.apply_regular_keys(&batch, &working_keys, org_id).await;
        self.apply_api_cache_invalidations(&batch).await;

        // tell the rest of the cluster to flush, including any token keys
        // appended by the revocation phase
        self.notifier.notify(Notification::KeySpaceUpdate {
            payload: working_keys.join(","),
        });
    }

    /// Credential rotations. When the old key is this node's own credential,
    /// swap it, persist it, and reconnect; either way broadcast the reset so
    /// peer nodes do the same.
    async fn apply_user_key_resets(&self, batch: &ReconciliationBatch) {
        for (old_key, new_key) in &batch.user_key_resets {
            let is_own_key = { self.config.read().await.api_key == *old_key };
            if is_own_key {
                if let Err(err) = self.credentials.persist_api_key(new_key).await {
                    tracing::error!(error = %err, "failed to persist the rotated api key");
                }
                {
                    self.config.write().await.api_key = new_key.clone();
                }
                if !self.connect().await {
                    tracing::error!("failed to reconnect to rpc storage after key reset");
                    continue;
                }
            }
            let delivered = self.notifier.notify(Notification::UserKeyReset {
                payload: format!(
                    "{}.{}:{}",
                    old_key,
                    new_key,
                    ChangeAction::UserKeyReset.tag()
                ),
            });
            if !delivered {
                tracing::error!("failed to notify other gateways about user key reset");
            }
        }
    }

    /// OAuth client create/update/delete operations.
    async fn apply_oauth_client_ops(&self, batch: &ReconciliationBatch) {
        for (client_info, action) in &batch.oauth_clients {
            // clientInfo is APIID.ClientID.OrgID
            let parts: Vec<&str> = client_info.split('.').collect();
            if parts.len() != 3 {
                tracing::error!(client_info = %client_info, "malformed oauth client event");
                continue;
            }
            self.process_oauth_client_event(parts[0], parts[1], parts[2], *action)
                .await;
        }
    }

    async fn process_oauth_client_event(
        &self,
        api_id: &str,
        client_id: &str,
        org_id: &str,
        action: ChangeAction,
    ) {
        let Some(store) = self.oauth.store_for_api(api_id) else {
            tracing::error!(api_id = %api_id, "could not get oauth storage for api");
            return;
        };

        match action {
            ChangeAction::OauthClientAdded => {
                // on add: pull from the control plane and persist locally
                let client = match store.get_client(client_id).await {
                    Ok(client) => client,
                    Err(err) => {
                        tracing::error!(error = %err, "could not retrieve new oauth client information");
                        return;
                    }
                };
                if let Err(err) = store.set_client(client_id, org_id, &client).await {
                    tracing::error!(error = %err, "could not save oauth client");
                    return;
                }
                tracing::info!("oauth client created successfully");
            }
            ChangeAction::OauthClientRemoved => {
                if let Err(err) = store.delete_client(client_id, org_id).await {
                    tracing::error!(error = %err, client_id = %client_id, "could not delete oauth client");
                    return;
                }
                tracing::info!("oauth client deleted successfully");
            }
            ChangeAction::OauthClientUpdated => {
                // on update: delete the local copy and pull again, so no
                // stale partial state survives
                if let Err(err) = store.get_client(client_id).await {
                    tracing::error!(error = %err, "could not retrieve oauth client information");
                    return;
                }
                if let Err(err) = store.delete_client(client_id, org_id).await {
                    tracing::error!(error = %err, "could not delete oauth client");
                    return;
                }
                let client = match store.get_client(client_id).await {
                    Ok(client) => client,
                    Err(err) => {
                        tracing::error!(error = %err, "could not retrieve oauth client information");
                        return;
                    }
                };
                if let Err(err) = store.set_client(client_id, org_id, &client).await {
                    tracing::error!(error = %err, "could not save oauth client");
                    return;
                }
                tracing::info!("oauth client updated successfully");
            }
            other => {
                tracing::warn!(action = other.tag(), "oauth client event not supported");
            }
        }
    }

    /// Full client revocations. Every token the store revokes is appended to
    /// the working key list so the regular-key phase invalidates it too.
    async fn apply_client_revocations(
        &self,
        batch: &ReconciliationBatch,
        working_keys: &mut Vec<String>,
    ) {
        for (client_id, raw_key) in &batch.clients_to_revoke {
            // raw key is apiId:clientId:clientSecret:revoke_all_tokens
            let segments: Vec<&str> = raw_key.split(':').collect();
            if segments.len() < 3 {
                tracing::warn!(key = %raw_key, "malformed client revocation key");
                continue;
            }
            let api_id = segments[0];
            let client_secret = segments[2];
            let Some(store) = self.oauth.store_for_api(api_id) else {
                continue;
            };
            let revoked = store.revoke_all_tokens(client_id, client_secret).await;
            working_keys.extend(revoked);
        }
    }

    /// Individually targeted token revocations.
    async fn apply_token_revocations(&self, batch: &ReconciliationBatch, org_id: &str) {
        for (token, raw_key) in &batch.tokens_to_revoke {
            // formed as token:apiId:actionHint, with the token segment
            // carrying a #hashed marker when it is pre-hashed
            let segments: Vec<&str> = raw_key.split(':').collect();
            if segments.len() < 3 {
                tracing::warn!(key = %raw_key, "malformed token revocation key");
                continue;
            }
            let api_id = segments[1];
            let action_hint = segments[2];

            let mut token = token.clone();
            if token.contains(HASHED_TOKEN_MARKER) {
                token = token.split('#').next().unwrap_or_default().to_string();
                self.sessions
                    .delete_hashed_session(&token, org_id, api_id, false)
                    .await;
            } else {
                let Some(store) = self.oauth.store_for_api(api_id) else {
                    continue;
                };
                let token_type_hint = match ChangeAction::parse(action_hint) {
                    Some(ChangeAction::OAuthRevokeAccessToken) => "access_token",
                    Some(ChangeAction::OAuthRevokeRefreshToken) => "refresh_token",
                    _ => "",
                };
                store.revoke_token(&token, token_type_hint).await;
            }

            self.session_cache.delete(&token).await;
            self.cache
                .general()
                .delete(&format!("{}{}", self.key_prefix, token))
                .await;
        }
    }

    /// Certificate removals and cache warm-ups for additions.
    async fn apply_certificate_changes(&self, batch: &ReconciliationBatch, org_id: &str) {
        for cert_id in &batch.certs_to_remove {
            tracing::debug!(cert_id = %cert_id, "removing certificate");
            self.certificates.delete(cert_id, org_id).await;
            self.cache
                .certificates()
                .delete(&format!("cert-raw-{}", cert_id))
                .await;
        }

        for cert_id in &batch.certs_to_add {
            tracing::debug!(cert_id = %cert_id, "adding certificate");
            // on a slave node this read pulls the certificate from the
            // control plane and leaves the local cache warm
            if let Err(err) = self.certificates.get_raw(cert_id).await {
                tracing::debug!(error = %err, "error getting certificate content");
            }
        }
    }

    /// Plain key invalidations: everything not already handled by a bucket.
    async fn apply_regular_keys(
        &self,
        batch: &ReconciliationBatch,
        working_keys: &[String],
        org_id: &str,
    ) {
        let synchroniser_enabled = { self.config.read().await.synchroniser_enabled };

        for key in working_keys {
            let segments: Vec<&str> = key.split(':').collect();

            // keys superseded by a credential rotation in this batch
            if segments.len() > 1 {
                let user_parts: Vec<&str> = segments[0].split('.').collect();
                if user_parts.len() == 2 && batch.user_key_resets.contains_key(user_parts[0]) {
                    continue;
                }
            }
            if batch.not_regular_keys.contains(key) {
                continue;
            }

            let reset_quota = batch.keys_to_reset.contains(segments[0]);
            let is_hashed = segments.len() > 1 && segments[1] == "hashed";

            let mut target = key.clone();
            let status;
            if is_hashed {
                target = segments[0].to_string();
                tracing::info!(key = %target, "removing cached hashed key");
                status = self
                    .sessions
                    .delete_hashed_session(&target, org_id, "", reset_quota)
                    .await;
            } else {
                tracing::info!(key = %keys::obfuscate_key(&target), "removing cached key");
                // usernames (basic auth) and custom keys carry no org prefix;
                // canonicalize them into a token first
                if keys::token_org(&target).is_empty() {
                    target = keys::generate_token(org_id, &target);
                }
                let mut delete_status = self
                    .sessions
                    .delete_session(&target, org_id, reset_quota)
                    .await;
                if delete_status == DeleteStatus::NotFound {
                    delete_status = self
                        .delete_using_token_id(&target, org_id, reset_quota)
                        .await;
                }
                status = delete_status;
            }

            // a key absent locally is only re-fetched when the synchroniser
            // pulls sessions proactively
            if status == DeleteStatus::NotFound && !synchroniser_enabled {
                continue;
            }

            self.fetch_and_materialize_session(&target, is_hashed, org_id)
                .await;
            self.session_cache.delete(&target).await;
            self.cache
                .general()
                .delete(&format!("{}{}", self.key_prefix, target))
                .await;
        }
    }

    /// Fallback deletion by the token-id form of a key that was not found
    /// under its full name.
    async fn delete_using_token_id(
        &self,
        key: &str,
        org_id: &str,
        reset_quota: bool,
    ) -> DeleteStatus {
        match keys::token_id(key) {
            Some(id) => self.sessions.delete_session(id, org_id, reset_quota).await,
            None => {
                tracing::debug!(key = %keys::obfuscate_key(key), "cannot resolve token id for key");
                DeleteStatus::NotFound
            }
        }
    }

    /// Re-fetch a session from the control plane and materialize it locally.
    /// A failed fetch leaves the key absent; the next read repopulates it.
    async fn fetch_and_materialize_session(&self, key_name: &str, is_hashed: bool, org_id: &str) {
        let key = if is_hashed {
            // avoid double hashing
            key_name.to_string()
        } else {
            let hash_keys = { self.config.read().await.hash_keys };
            keys::hash_key(key_name, hash_keys)
        };

        match self
            .get_raw_key(&format!("{}{}", SESSION_KEY_PREFIX, key))
            .await
        {
            Ok(session) => self.sessions.add_session(&key, &session, org_id).await,
            Err(_) => tracing::error!("key not found in master - skipping"),
        }
    }

    async fn apply_api_cache_invalidations(&self, batch: &ReconciliationBatch) {
        for api_id in &batch.api_cache_invalidations {
            if self.api_cache.invalidate(api_id).await {
                tracing::info!(api_id = %api_id, "cache invalidated");
            } else {
                tracing::error!(api_id = %api_id, "cache invalidation failed");
            }
        }
    }
}
