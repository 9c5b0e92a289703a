//! Paxlock: a caching lock service replicated with single-decree Paxos.

#[macro_use]
mod utils;

mod client;
mod paxos;
mod rpc;
mod server;

// Helper utilities, functions, and macros
pub use crate::utils::{logger_init, Bitmap, PaxlockError, ME};

// Paxos consensus
pub use crate::paxos::{
    Acceptor, AcceptorConfig, Ballot, Breakpoint, Instance, NodeId,
    PaxosChange, PaxosTransport, PrepareReply, Proposer, ProposerConfig,
};

// Server-side lock service
pub use crate::server::{
    ClientId, LockClientApi, LockCommand, LockId, LockManager,
    LockManagerConfig, LockReplica, LockServerApi, LockStatus, PrimaryOracle,
    ReplicaConfig, SeqNum, ServerConfig, StaticPrimary,
};

// Client-side lock cache
pub use crate::client::{
    LockClientCache, LockClientConfig, LockReleaseUser, LockState,
};

// Transports
pub use crate::rpc::{
    tcp_bind_with_retry, LocalNet, RemoteLockServer, RpcClient,
    RpcDispatcher, RpcHandler, RpcReply, RpcRequest, RpcServer,
};
