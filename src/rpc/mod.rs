//! RPC layer: the typed protocol and the retrying client facade.

pub mod client;
pub mod protocol;

pub use client::{RpcClient, RpcTransport};
pub use protocol::{
    DefRequest, GroupKeySpaceRequest, GroupLoginRequest, RpcRequest, RpcResponse,
};
