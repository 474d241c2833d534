//! Error taxonomies for the synchronization layer.
//!
//! Two surfaces exist on purpose: [`RpcError`] is what the transport and the
//! retrying facade speak; [`StorageError`] is the narrow error surface exposed
//! to storage-backend callers. Remote failures collapse to
//! [`StorageError::KeyNotFound`] at the storage boundary — callers only see a
//! distinct value when the control plane is known-unreachable
//! ([`StorageError::ConnectionLost`]).

use thiserror::Error;

/// Errors produced by the RPC transport and the call facade.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The control plane rejected the current credentials. Retriable via
    /// re-login.
    #[error("access denied")]
    AccessDenied,

    /// The transport could not obtain a response within its timeout.
    /// Retriable via re-login.
    #[error("cannot obtain response during timeout")]
    ResponseTimeout,

    /// The control plane is known-unreachable (emergency mode).
    #[error("control plane connection lost")]
    ConnectionLost,

    /// Any other remote failure. Terminal for the call.
    #[error("remote call failed: {0}")]
    Remote(String),

    /// A request or response payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

impl RpcError {
    /// An error is retriable iff it indicates an expired/denied session or a
    /// transport response timeout. Everything else is terminal for the call.
    pub fn is_retriable(&self) -> bool {
        matches!(self, RpcError::AccessDenied | RpcError::ResponseTimeout)
    }
}

/// Errors surfaced by the storage-backend interface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The key does not exist — or the remote lookup failed terminally.
    /// Callers cannot distinguish the two; that is the contract.
    #[error("key not found")]
    KeyNotFound,

    /// Emergency-mode short-circuit: no RPC was attempted.
    #[error("control plane connection lost")]
    ConnectionLost,

    /// A write-path RPC failure, surfaced with its original classification so
    /// that callers running their own schedule (the keepalive loop) can react
    /// to retriable conditions.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl StorageError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::Rpc(err) if err.is_retriable())
    }
}
