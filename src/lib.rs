//! tether — RPC-backed synchronization layer for clustered gateway nodes.
//!
//! A slave node of a clustered API gateway runs against a remote,
//! authoritative control plane instead of a local database. This crate is the
//! layer in between: it proxies key/value, policy and API-definition
//! operations over RPC, shields the gateway from transient auth and network
//! failures with automatic re-login and bounded retry, serves hot reads from
//! a dual-tier TTL cache, and continuously reconciles local state against
//! the control plane's keyspace-change feed.
//!
//! # Architecture
//!
//! - [`rpc`]: the typed command surface and the retrying client facade
//! - [`cache`]: positive/negative TTL cache with general and certificate
//!   partitions
//! - [`storage`]: the [`storage::RpcStorageHandler`] the gateway plugs in as
//!   its storage backend
//! - [`keyspace`]: classification and phased reconciliation of change-key
//!   batches
//! - [`loops`]: the keepalive watcher and keyspace poller
//! - [`stores`]: trait seams to the gateway's session, certificate, OAuth
//!   and cache subsystems
//! - [`notify`]: bounded fan-out of cluster notifications
//!
//! The transport itself (wire format, pooling, TLS) is injected behind
//! [`rpc::RpcTransport`].

pub mod cache;
pub mod config;
pub mod error;
pub mod keys;
pub mod keyspace;
pub mod loops;
pub mod node;
pub mod notify;
pub mod rpc;
pub mod storage;
pub mod stores;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{CacheTier, TtlCache};
pub use config::{ConfigError, SlaveConfig};
pub use error::{RpcError, StorageError};
pub use keyspace::ChangeAction;
pub use loops::SyncLoops;
pub use node::{NodeInfo, NodeStateProvider, build_node_info};
pub use notify::{ClusterNotifier, Notification};
pub use rpc::client::{RpcClient, RpcTransport};
pub use rpc::protocol::{RpcRequest, RpcResponse};
pub use storage::{RpcStorageHandler, SyncContext};
pub use stores::StorageBackend;
