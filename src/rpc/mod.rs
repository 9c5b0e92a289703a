//! Transports between paxlock nodes and clients: TCP for deployments, and an
//! in-process net for multi-node tests.

mod local;
mod messages;
mod tcp;

pub use local::LocalNet;
pub use messages::{RpcReply, RpcRequest};
pub use tcp::{
    tcp_bind_with_retry, RemoteLockServer, RpcClient, RpcDispatcher,
    RpcHandler, RpcServer,
};
