//! Typed RPC protocol spoken with the control plane.
//!
//! Every remote operation is one variant of [`RpcRequest`] with a typed
//! payload; responses are the closed set of [`RpcResponse`] shapes. The
//! transport owns wire serialization; this module only fixes the command
//! surface so unsupported methods cannot exist at runtime.

use serde::{Deserialize, Serialize};

/// Maximum RPC message size (1 MB). Bounded to keep a misbehaving control
/// plane from exhausting slave-node memory.
pub const MAX_RPC_MESSAGE_SIZE: usize = 1024 * 1024;

/// Group login descriptor: credential, group membership and the node's
/// identity/heartbeat payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLoginRequest {
    pub user_key: String,
    pub group_id: String,
    /// Serialized node info; empty when telemetry serialization failed.
    pub node: Vec<u8>,
}

/// API definition pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefRequest {
    pub org_id: String,
    pub tags: Vec<String>,
    pub load_oas: bool,
}

/// Group-scoped keyspace diff request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeySpaceRequest {
    pub org_id: String,
    pub group_id: String,
}

/// Requests this node can issue against the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Authenticate an ungrouped node.
    Login { user_key: String },

    /// Authenticate a node as part of a group, carrying its identity payload.
    LoginWithGroup { group: GroupLoginRequest },

    /// Read a key.
    GetKey { key: String },

    /// Create or update a key.
    SetKey {
        key: String,
        session: String,
        timeout: i64,
    },

    /// Remaining TTL of a key, in seconds.
    GetExp { key: String },

    /// All keys and values under the node's namespace.
    GetKeysAndValues { search: String },

    /// Keys and values matching a prefix pattern.
    GetKeysAndValuesWithFilter { search: String },

    /// Delete a prefixed key.
    DeleteKey { key: String },

    /// Delete a key without prefixing.
    DeleteRawKey { key: String },

    /// Bulk delete of prefixed keys.
    DeleteKeys { keys: Vec<String> },

    /// Bulk delete without prefixing.
    DeleteRawKeys { keys: Vec<String> },

    /// Decrement a counter key.
    Decrement { key: String },

    /// Increment a counter key, setting its expiry.
    IncrementWithExpire { key: String, expire: i64 },

    /// Append a value to a remote set.
    AppendToSet { key: String, value: String },

    /// Record a hit in the rate limiter's rolling window.
    SetRollingWindow { key: String, per: i64 },

    /// Pull API definitions for an org.
    GetApiDefinitions { request: DefRequest },

    /// Pull policies for an org.
    GetPolicies { org_id: String },

    /// Ask whether a full reload is pending for this node.
    CheckReload { org_id: String },

    /// Fetch the pending keyspace diff for an ungrouped node.
    GetKeySpaceUpdate { org_id: String },

    /// Fetch the pending keyspace diff for a node group.
    GetGroupKeySpaceUpdate { group: GroupKeySpaceRequest },

    /// Connection health probe.
    Ping,

    /// Deregister this node.
    Disconnect { group: GroupLoginRequest },
}

impl RpcRequest {
    /// Wire method name, used for dispatch on the control plane and for
    /// diagnostic events on this side.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Login { .. } => "Login",
            RpcRequest::LoginWithGroup { .. } => "LoginWithGroup",
            RpcRequest::GetKey { .. } => "GetKey",
            RpcRequest::SetKey { .. } => "SetKey",
            RpcRequest::GetExp { .. } => "GetExp",
            RpcRequest::GetKeysAndValues { .. } => "GetKeysAndValues",
            RpcRequest::GetKeysAndValuesWithFilter { .. } => "GetKeysAndValuesWithFilter",
            RpcRequest::DeleteKey { .. } => "DeleteKey",
            RpcRequest::DeleteRawKey { .. } => "DeleteRawKey",
            RpcRequest::DeleteKeys { .. } => "DeleteKeys",
            RpcRequest::DeleteRawKeys { .. } => "DeleteRawKeys",
            RpcRequest::Decrement { .. } => "Decrement",
            // Historical wire spelling, kept for control-plane compatibility.
            RpcRequest::IncrementWithExpire { .. } => "IncrememntWithExpire",
            RpcRequest::AppendToSet { .. } => "AppendToSet",
            RpcRequest::SetRollingWindow { .. } => "SetRollingWindow",
            RpcRequest::GetApiDefinitions { .. } => "GetApiDefinitions",
            RpcRequest::GetPolicies { .. } => "GetPolicies",
            RpcRequest::CheckReload { .. } => "CheckReload",
            RpcRequest::GetKeySpaceUpdate { .. } => "GetKeySpaceUpdate",
            RpcRequest::GetGroupKeySpaceUpdate { .. } => "GetGroupKeySpaceUpdate",
            RpcRequest::Ping => "Ping",
            RpcRequest::Disconnect { .. } => "Disconnect",
        }
    }
}

/// Responses the control plane can return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Acknowledgement with no payload.
    Ok,
    Bool(bool),
    Value(String),
    Int(i64),
    Keys(Vec<String>),
    KeysValues {
        keys: Vec<String>,
        values: Vec<String>,
    },
    /// Explicit absent result. Callers treat it as "no data", not an error.
    Nil,
}

impl RpcResponse {
    pub fn into_bool(self) -> bool {
        matches!(self, RpcResponse::Bool(true))
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            RpcResponse::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_int(self) -> Option<i64> {
        match self {
            RpcResponse::Int(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_keys(self) -> Option<Vec<String>> {
        match self {
            RpcResponse::Keys(keys) => Some(keys),
            _ => None,
        }
    }

    pub fn into_keys_values(self) -> Option<(Vec<String>, Vec<String>)> {
        match self {
            RpcResponse::KeysValues { keys, values } => Some((keys, values)),
            _ => None,
        }
    }
}
