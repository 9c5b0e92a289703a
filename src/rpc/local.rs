//! In-process transport: routes Paxos and lock callback calls straight to
//! components living in the same process. Nodes can be cut off and every
//! call can be delayed, for multi-node scenarios without sockets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::client::LockClientCache;
use crate::paxos::{
    Acceptor, Ballot, Instance, NodeId, PaxosTransport, PrepareReply,
};
use crate::server::{ClientId, LockClientApi, LockId};
use crate::utils::PaxlockError;

use async_trait::async_trait;

use tokio::sync::Mutex;
use tokio::time::{self, Duration};

/// In-process network of acceptors and client lock caches.
#[derive(Default)]
pub struct LocalNet {
    acceptors: Mutex<HashMap<NodeId, Arc<Acceptor>>>,
    caches: Mutex<HashMap<ClientId, Weak<LockClientCache>>>,
    unreachable: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
}

impl LocalNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an acceptor under its node ID.
    pub async fn add_acceptor(&self, acceptor: Arc<Acceptor>) {
        let node = acceptor.me().to_string();
        self.acceptors.lock().await.insert(node, acceptor);
    }

    pub async fn remove_acceptor(&self, node: &str) {
        self.acceptors.lock().await.remove(node);
    }

    pub async fn acceptor(&self, node: &str) -> Option<Arc<Acceptor>> {
        self.acceptors.lock().await.get(node).cloned()
    }

    /// Registers a client lock cache under its client ID. The net does not
    /// keep the cache alive.
    pub async fn add_cache(&self, cache: &Arc<LockClientCache>) {
        self.caches
            .lock()
            .await
            .insert(cache.id().into(), Arc::downgrade(cache));
    }

    /// Cuts a node (or client) off, or brings it back.
    pub async fn set_unreachable(&self, node: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().await;
        if unreachable {
            set.insert(node.into());
        } else {
            set.remove(node);
        }
    }

    /// Sets the delay added to every call.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = delay;
    }

    async fn reach(&self, node: &str) -> Result<(), PaxlockError> {
        let delay = *self.delay.lock().await;
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        if self.unreachable.lock().await.contains(node) {
            return Err(PaxlockError(format!("{} unreachable", node)));
        }
        Ok(())
    }

    async fn reach_acceptor(&self, node: &str) -> Result<Arc<Acceptor>, PaxlockError> {
        self.reach(node).await?;
        self.acceptor(node)
            .await
            .ok_or_else(|| PaxlockError(format!("no acceptor {}", node)))
    }

    async fn reach_cache(
        &self,
        client: &str,
    ) -> Result<Arc<LockClientCache>, PaxlockError> {
        self.reach(client).await?;
        self.caches
            .lock()
            .await
            .get(client)
            .and_then(Weak::upgrade)
            .ok_or_else(|| PaxlockError(format!("no lock cache {}", client)))
    }
}

#[async_trait]
impl PaxosTransport for LocalNet {
    async fn prepare(
        &self,
        node: &str,
        src: &str,
        instance: Instance,
        ballot: Ballot,
    ) -> Result<PrepareReply, PaxlockError> {
        self.reach_acceptor(node)
            .await?
            .prepare(src, instance, ballot)
            .await
    }

    async fn accept(
        &self,
        node: &str,
        src: &str,
        instance: Instance,
        ballot: Ballot,
        value: String,
    ) -> Result<bool, PaxlockError> {
        self.reach_acceptor(node)
            .await?
            .accept(src, instance, ballot, value)
            .await
    }

    async fn decide(
        &self,
        node: &str,
        src: &str,
        instance: Instance,
        value: String,
    ) -> Result<(), PaxlockError> {
        self.reach_acceptor(node)
            .await?
            .decide(src, instance, value)
            .await
    }
}

#[async_trait]
impl LockClientApi for LocalNet {
    async fn revoke(&self, client: &str, lid: LockId) -> Result<(), PaxlockError> {
        self.reach_cache(client).await?.revoke(lid).await;
        Ok(())
    }

    async fn retry(&self, client: &str, lid: LockId) -> Result<(), PaxlockError> {
        self.reach_cache(client).await?.retry(lid).await;
        Ok(())
    }
}

#[cfg(test)]
mod local_tests {
    use super::*;
    use crate::paxos::test_utils::fresh_config;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn route_and_cut_off() -> Result<(), PaxlockError> {
        let net = LocalNet::new();
        let acc = Acceptor::new_and_setup(
            "local-0",
            fresh_config("local-route").await?,
            None,
            None,
        )
        .await?;
        net.add_acceptor(Arc::new(acc)).await;

        let ballot = Ballot {
            round: 1,
            proposer: "p".into(),
        };
        assert!(matches!(
            net.prepare("local-0", "p", 1, ballot.clone()).await?,
            PrepareReply::Promise { .. }
        ));
        assert!(net.prepare("local-1", "p", 1, ballot.clone()).await.is_err());

        net.set_unreachable("local-0", true).await;
        assert!(net.accept("local-0", "p", 1, ballot.clone(), "v".into()).await.is_err());
        net.set_unreachable("local-0", false).await;
        assert!(net.accept("local-0", "p", 1, ballot, "v".into()).await?);

        assert!(net.revoke("nobody", 1).await.is_err());
        Ok(())
    }
}
