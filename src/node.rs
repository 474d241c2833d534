//! Node identity and heartbeat payload.
//!
//! Every login and disconnect carries a fresh [`NodeInfo`] snapshot — it is
//! rebuilt on demand, never cached, so the control plane always sees current
//! health and load figures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::SlaveConfig;

/// Gateway version string reported to the control plane.
pub const NODE_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// Node TTL reported when no liveness-check duration is configured.
pub const DEFAULT_NODE_TTL_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pass,
    Warn,
    Fail,
}

/// One component's health reading at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckItem {
    pub status: HealthStatus,
    pub component_type: String,
    /// Unix timestamp of the reading.
    pub time: i64,
}

pub type HealthSnapshot = HashMap<String, HealthCheckItem>;

/// Load counters reported alongside health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStats {
    pub apis_count: usize,
    pub policies_count: usize,
}

/// Where this node runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDetails {
    pub hostname: String,
    pub pid: u32,
    pub address: String,
}

/// Identity/heartbeat record sent at login and on disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub group_id: String,
    pub api_key: String,
    pub node_version: String,
    /// Seconds the control plane should consider this node alive without a
    /// fresh heartbeat.
    pub ttl: i64,
    pub node_is_segmented: bool,
    pub tags: Vec<String>,
    pub health: HealthSnapshot,
    pub stats: GatewayStats,
    pub host_details: HostDetails,
}

/// Point-in-time view of the embedding gateway, consulted while building a
/// [`NodeInfo`] payload.
pub trait NodeStateProvider: Send + Sync {
    fn node_id(&self) -> String;
    fn health(&self) -> HealthSnapshot;
    fn stats(&self) -> GatewayStats;
    fn host_details(&self) -> HostDetails;
}

/// Build the serialized identity payload for a login or disconnect call.
///
/// Serialization failures degrade to an empty payload: a login must not fail
/// solely because telemetry could not be encoded.
pub fn build_node_info(config: &SlaveConfig, state: &dyn NodeStateProvider) -> Vec<u8> {
    let ttl = if config.check_duration_secs != 0 {
        config.check_duration_secs as i64
    } else {
        DEFAULT_NODE_TTL_SECS
    };

    let node = NodeInfo {
        node_id: state.node_id(),
        group_id: config.group_id.clone(),
        api_key: config.api_key.clone(),
        node_version: NODE_VERSION.to_string(),
        ttl,
        node_is_segmented: config.node_is_segmented,
        tags: config.tags.clone(),
        health: state.health(),
        stats: state.stats(),
        host_details: state.host_details(),
    };

    match serde_json::to_vec(&node) {
        Ok(data) => data,
        Err(err) => {
            tracing::error!(error = %err, "error marshalling node info");
            Vec::new()
        }
    }
}
