//! Retrying facade over the RPC transport.
//!
//! Every remote operation goes through [`RpcClient::call_with_retry`]: a
//! failed call emits a structured error event, and a retriable failure
//! (expired session, transport timeout) triggers exactly one re-login and one
//! replay. Callers that need persistent retry — the background loops —
//! re-invoke on their own schedule, which bounds retry amplification to one
//! extra RPC per failure.
//!
//! The client owns the emergency-mode flag: when the transport marks the
//! control plane known-unreachable, hot-path reads short-circuit instead of
//! blocking on a doomed call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::SlaveConfig;
use crate::error::RpcError;
use crate::node::{NodeStateProvider, build_node_info};
use crate::rpc::protocol::{GroupLoginRequest, RpcRequest, RpcResponse};

/// The transport boundary. Implementations own connection pooling, wire
/// serialization, TLS and per-call timeouts.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, RpcError>;
}

/// Retrying, login-aware RPC client.
///
/// One instance per control-plane link. All state is per-instance so tests
/// and multi-link embedders construct isolated clients.
pub struct RpcClient {
    transport: Arc<dyn RpcTransport>,
    config: Arc<RwLock<SlaveConfig>>,
    node_state: Arc<dyn NodeStateProvider>,
    emergency_mode: AtomicBool,
}

impl RpcClient {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        config: Arc<RwLock<SlaveConfig>>,
        node_state: Arc<dyn NodeStateProvider>,
    ) -> Self {
        Self {
            transport,
            config,
            node_state,
            emergency_mode: AtomicBool::new(false),
        }
    }

    /// Flag the control plane unreachable/reachable. Flipped by the transport
    /// adapter on connection loss and recovery.
    pub fn set_emergency_mode(&self, on: bool) {
        self.emergency_mode.store(on, Ordering::SeqCst);
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.emergency_mode.load(Ordering::SeqCst)
    }

    /// One raw call, no retry handling.
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        self.transport.call(request).await
    }

    /// Call with the standard failure handling: emit an error event on every
    /// failure, and on a retriable one attempt a single re-login followed by
    /// a single replay.
    pub async fn call_with_retry(
        &self,
        request: RpcRequest,
        diagnostics: &[(&str, &str)],
    ) -> Result<RpcResponse, RpcError> {
        let method = request.method();
        let mut attempted_login = false;
        loop {
            match self.transport.call(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    emit_error_event(method, &err, diagnostics);
                    if err.is_retriable() && !attempted_login {
                        attempted_login = true;
                        if self.login().await {
                            continue;
                        }
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Authenticate against the control plane, registering this node's
    /// identity payload when it belongs to a group. Returns whether the
    /// control plane accepted the login.
    pub async fn login(&self) -> bool {
        let request = {
            let config = self.config.read().await;
            if config.group_id.is_empty() {
                RpcRequest::Login {
                    user_key: config.api_key.clone(),
                }
            } else {
                RpcRequest::LoginWithGroup {
                    group: GroupLoginRequest {
                        user_key: config.api_key.clone(),
                        group_id: config.group_id.clone(),
                        node: build_node_info(&config, self.node_state.as_ref()),
                    },
                }
            }
        };

        match self.transport.call(request).await {
            Ok(RpcResponse::Bool(true)) => {
                tracing::debug!("logged into the control plane");
                true
            }
            Ok(_) => {
                tracing::warn!("control plane rejected login");
                false
            }
            Err(err) => {
                tracing::error!(error = %err, "login call failed");
                false
            }
        }
    }

    /// Connection health probe.
    pub async fn ping(&self) -> bool {
        match self.transport.call(RpcRequest::Ping).await {
            Ok(response) => response.into_bool(),
            Err(_) => false,
        }
    }

    /// Deregister this node, sending a final identity payload.
    pub async fn disconnect(&self) -> Result<(), RpcError> {
        let request = {
            let config = self.config.read().await;
            RpcRequest::Disconnect {
                group: GroupLoginRequest {
                    user_key: config.api_key.clone(),
                    group_id: config.group_id.clone(),
                    node: build_node_info(&config, self.node_state.as_ref()),
                },
            }
        };
        self.transport.call(request).await.map(|_| ())
    }
}

/// Structured error event for a failed remote call. This is the observability
/// side channel every failure must pass through, not optional logging.
fn emit_error_event(method: &str, err: &RpcError, diagnostics: &[(&str, &str)]) {
    tracing::error!(
        method,
        error = %err,
        details = ?diagnostics,
        "rpc call failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockNodeState, MockTransport};

    fn client_with(transport: Arc<MockTransport>, config: SlaveConfig) -> RpcClient {
        RpcClient::new(
            transport,
            Arc::new(RwLock::new(config)),
            Arc::new(MockNodeState::default()),
        )
    }

    fn get_key_request() -> RpcRequest {
        RpcRequest::GetKey { key: "k1".into() }
    }

    #[tokio::test]
    async fn test_retriable_error_triggers_one_login_and_one_replay() {
        let transport = Arc::new(MockTransport::default());
        transport.script("GetKey", Err(RpcError::AccessDenied));
        transport.script("GetKey", Ok(RpcResponse::Value("v1".into())));
        let client = client_with(transport.clone(), SlaveConfig::default());

        let result = client.call_with_retry(get_key_request(), &[]).await;
        assert_eq!(result, Ok(RpcResponse::Value("v1".into())));
        assert_eq!(transport.calls_for("GetKey"), 2);
        assert_eq!(transport.login_calls(), 1);
    }

    #[tokio::test]
    async fn test_retry_is_bounded_to_one_replay() {
        let transport = Arc::new(MockTransport::default());
        transport.script("GetKey", Err(RpcError::AccessDenied));
        transport.script("GetKey", Err(RpcError::AccessDenied));
        transport.script("GetKey", Ok(RpcResponse::Value("never".into())));
        let client = client_with(transport.clone(), SlaveConfig::default());

        let result = client.call_with_retry(get_key_request(), &[]).await;
        assert_eq!(result, Err(RpcError::AccessDenied));
        // initial call + exactly one replay, even though a third attempt
        // would have succeeded
        assert_eq!(transport.calls_for("GetKey"), 2);
        assert_eq!(transport.login_calls(), 1);
    }

    #[tokio::test]
    async fn test_non_retriable_error_never_logs_in() {
        let transport = Arc::new(MockTransport::default());
        transport.script("GetKey", Err(RpcError::Remote("boom".into())));
        let client = client_with(transport.clone(), SlaveConfig::default());

        let result = client.call_with_retry(get_key_request(), &[]).await;
        assert_eq!(result, Err(RpcError::Remote("boom".into())));
        assert_eq!(transport.calls_for("GetKey"), 1);
        assert_eq!(transport.login_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_relogin_stops_the_retry() {
        let transport = Arc::new(MockTransport::default());
        transport.set_login_ok(false);
        transport.script("GetKey", Err(RpcError::ResponseTimeout));
        let client = client_with(transport.clone(), SlaveConfig::default());

        let result = client.call_with_retry(get_key_request(), &[]).await;
        assert_eq!(result, Err(RpcError::ResponseTimeout));
        assert_eq!(transport.calls_for("GetKey"), 1);
        assert_eq!(transport.login_calls(), 1);
    }

    #[tokio::test]
    async fn test_login_variant_depends_on_group_id() {
        let transport = Arc::new(MockTransport::default());
        let client = client_with(transport.clone(), SlaveConfig::default());
        assert!(client.login().await);
        assert_eq!(transport.calls_for("Login"), 1);

        let transport = Arc::new(MockTransport::default());
        let config = SlaveConfig {
            group_id: "g1".into(),
            api_key: "key".into(),
            ..SlaveConfig::default()
        };
        let client = client_with(transport.clone(), config);
        assert!(client.login().await);
        assert_eq!(transport.calls_for("LoginWithGroup"), 1);

        let group = transport.last_group_login().expect("group login recorded");
        assert_eq!(group.group_id, "g1");
        assert_eq!(group.user_key, "key");
        assert!(!group.node.is_empty());
    }

    #[tokio::test]
    async fn test_emergency_mode_flag_is_per_instance() {
        let transport = Arc::new(MockTransport::default());
        let one = client_with(transport.clone(), SlaveConfig::default());
        let two = client_with(transport, SlaveConfig::default());
        one.set_emergency_mode(true);
        assert!(one.is_emergency_mode());
        assert!(!two.is_emergency_mode());
    }
}
