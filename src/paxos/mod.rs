//! Single-decree Paxos, run once per instance.
//!
//! Each node hosts one `Acceptor` (durable promise/accept state plus the
//! decided values) and one `Proposer` that drives a single instance at a
//! time across a given node list. References:
//!   - <https://lamport.azurewebsites.net/pubs/paxos-simple.pdf>

mod acceptor;
mod proposer;

pub use acceptor::{Acceptor, AcceptorConfig};
pub use proposer::{Breakpoint, Proposer, ProposerConfig};

use std::fmt;

use crate::utils::PaxlockError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

/// Paxos instance number type. Instance 0 is never decided.
pub type Instance = u64;

/// Node ID type; the node's RPC address string.
pub type NodeId = String;

/// Ballot number: round first, then proposer ID as tie-break. The derived
/// ordering is lexicographic over the fields in declaration order, which
/// makes it a strict total order across distinct proposers.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Serialize, Deserialize,
)]
pub struct Ballot {
    pub round: u64,
    pub proposer: NodeId,
}

impl Ballot {
    /// The null ballot of a node; proposers never use round 0.
    pub fn null(me: &str) -> Self {
        Ballot {
            round: 0,
            proposer: me.into(),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.round == 0
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.round, self.proposer)
    }
}

/// Acceptor's answer to a Prepare.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PrepareReply {
    /// The instance has already been decided here; carries the decided value
    /// so that the proposer can catch up locally.
    OldInstance { instance: Instance, value: String },

    /// Promise not to accept lower ballots. Carries the highest accepted
    /// ballot and value for the instance (null ballot and empty value if
    /// nothing was accepted yet).
    Promise { accepted: Ballot, value: String },

    /// Ballot too low; carries the ballot already promised.
    Reject { promised: Ballot },
}

/// Transport used by a proposer to reach acceptors. Any `Err` is treated by
/// the proposer as an abstention of that node.
#[async_trait]
pub trait PaxosTransport: Send + Sync {
    async fn prepare(
        &self,
        node: &str,
        src: &str,
        instance: Instance,
        ballot: Ballot,
    ) -> Result<PrepareReply, PaxlockError>;

    async fn accept(
        &self,
        node: &str,
        src: &str,
        instance: Instance,
        ballot: Ballot,
        value: String,
    ) -> Result<bool, PaxlockError>;

    async fn decide(
        &self,
        node: &str,
        src: &str,
        instance: Instance,
        value: String,
    ) -> Result<(), PaxlockError>;
}

/// Upcall invoked by an acceptor once per newly decided instance.
#[async_trait]
pub trait PaxosChange: Send + Sync {
    async fn paxos_commit(&self, instance: Instance, value: &str);
}


#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use tokio::fs;
    use tokio::sync::Mutex;

    /// Upcall target that remembers every commit it sees.
    #[derive(Default)]
    pub(crate) struct CommitRecorder(Mutex<Vec<(Instance, String)>>);

    impl CommitRecorder {
        pub(crate) async fn commits(&self) -> Vec<(Instance, String)> {
            self.0.lock().await.clone()
        }
    }

    #[async_trait]
    impl PaxosChange for CommitRecorder {
        async fn paxos_commit(&self, instance: Instance, value: &str) {
            self.0.lock().await.push((instance, value.into()));
        }
    }

    /// Acceptor config backed by an empty per-test WAL file.
    pub(crate) async fn fresh_config(
        tag: &str,
    ) -> Result<AcceptorConfig, PaxlockError> {
        let path = format!("/tmp/paxlock-test-{}.wal", tag);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(AcceptorConfig {
            backer_path: path,
            logger_sync: false,
        })
    }
}
