//! Lock server side: durable log, lock cache manager, and the Paxos-replicated
//! lock service built on them.

mod lockman;
mod replica;
mod storage;

pub use lockman::{
    ClientId, LockClientApi, LockCommand, LockId, LockManager,
    LockManagerConfig, LockServerApi, LockStatus, PrimaryOracle, SeqNum,
    StaticPrimary,
};
pub use replica::{LockReplica, ReplicaConfig, ServerConfig};

pub(crate) use storage::StorageHub;

#[cfg(test)]
pub(crate) use lockman::test_utils;
