//! Replicated lock service: every mutating lock request is decided through
//! Paxos as the next instance before it is executed, and every replica applies
//! decided commands to its own lock manager in instance order.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::lockman::{
    ClientId, LockClientApi, LockCommand, LockId, LockManager,
    LockManagerConfig, LockServerApi, LockStatus, PrimaryOracle, SeqNum,
};
use crate::paxos::{
    Acceptor, AcceptorConfig, Instance, NodeId, PaxosChange, PaxosTransport,
    Proposer, ProposerConfig,
};
use crate::utils::PaxlockError;

use async_trait::async_trait;

use serde::Deserialize;

use tokio::sync::Mutex;
use tokio::time::{self, Duration};

/// Max number of per-instance apply results kept around for submitters.
const RESULTS_CAP: usize = 1024;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Number of instances to try before a submission gives up.
    pub submit_attempts: u32,

    /// Pause between two submission attempts in millisecs.
    pub submit_backoff_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            submit_attempts: 8,
            submit_backoff_ms: 50,
        }
    }
}

/// Configuration of a whole lock server node, one TOML table per component.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub acceptor: AcceptorConfig,
    pub proposer: ProposerConfig,
    pub manager: LockManagerConfig,
    pub replica: ReplicaConfig,
}

impl ServerConfig {
    /// Parses a TOML config string with optional `[acceptor]`, `[proposer]`,
    /// `[manager]` and `[replica]` tables. Missing entries keep defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, PaxlockError> {
        parsed_config!(config_str => ServerConfig;
                       acceptor, proposer, manager, replica)
    }
}

/// Commit upcall target: applies decided lock commands to the local manager.
struct LockApplier {
    manager: Arc<LockManager>,

    /// Recent apply results, by instance.
    results: Mutex<BTreeMap<Instance, (LockCommand, LockStatus)>>,
}

impl LockApplier {
    async fn apply_value(&self, instance: Instance, value: &str) {
        let cmd = match value.parse::<LockCommand>() {
            Ok(cmd) => cmd,
            Err(_) => {
                pf_debug!("instance {} carries non-lock value '{}'",
                          instance, value);
                return;
            }
        };

        match self.manager.apply(&cmd).await {
            Ok(status) => {
                pf_trace!("applied instance {} '{}' -> {:?}",
                          instance, cmd, status);
                let mut results = self.results.lock().await;
                results.insert(instance, (cmd, status));
                while results.len() > RESULTS_CAP {
                    results.pop_first();
                }
            }
            Err(e) => {
                pf_error!("error applying instance {} '{}': {}",
                          instance, cmd, e);
            }
        }
    }

    /// Takes the result of `instance` if it executed exactly `cmd`.
    async fn take_result(
        &self,
        instance: Instance,
        cmd: &LockCommand,
    ) -> Option<LockStatus> {
        let mut results = self.results.lock().await;
        match results.get(&instance) {
            Some((applied, status)) if applied == cmd => {
                let status = *status;
                results.remove(&instance);
                Some(status)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl PaxosChange for LockApplier {
    async fn paxos_commit(&self, instance: Instance, value: &str) {
        self.apply_value(instance, value).await;
    }
}

/// Replicated lock service node.
pub struct LockReplica {
    /// Node list of the Paxos group, me included.
    nodes: Vec<NodeId>,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    manager: Arc<LockManager>,
    applier: Arc<LockApplier>,
    acceptor: Arc<Acceptor>,
    proposer: Proposer,
    primary: Arc<dyn PrimaryOracle>,

    /// Serializes submissions so that each takes a fresh instance.
    submitting: Mutex<()>,
}

impl LockReplica {
    /// Creates a replica: recovers the acceptor from its log (bootstrapping
    /// instance 1 with the node list on a fresh log), rebuilds the lock table
    /// from the decided commands, and sets up the proposer.
    pub async fn new_and_setup(
        me: &str,
        nodes: Vec<NodeId>,
        config: ServerConfig,
        primary: Arc<dyn PrimaryOracle>,
        transport: Arc<dyn PaxosTransport>,
        callbacks: Arc<dyn LockClientApi>,
    ) -> Result<Self, PaxlockError> {
        if !nodes.iter().any(|n| n == me) {
            return logged_err!("node list [{}] misses me {}",
                               nodes.join(","), me);
        }

        let manager = Arc::new(LockManager::new_and_setup(
            config.manager,
            primary.clone(),
            callbacks,
        ));
        let applier = Arc::new(LockApplier {
            manager: manager.clone(),
            results: Mutex::new(BTreeMap::new()),
        });

        let bootstrap = nodes.join(",");
        let acceptor = Arc::new(
            Acceptor::new_and_setup(
                me,
                config.acceptor,
                Some(&bootstrap),
                Some(applier.clone()),
            )
            .await?,
        );

        // replay decided commands into the fresh lock table
        let instance_h = acceptor.instance_h().await;
        for instance in 1..=instance_h {
            if let Some(value) = acceptor.value(instance).await {
                applier.apply_value(instance, &value).await;
            }
        }
        applier.results.lock().await.clear();
        if instance_h > 1 {
            pf_info!("replayed {} decided instances into lock table",
                     instance_h);
        }

        let proposer =
            Proposer::new(me, config.proposer, acceptor.clone(), transport);

        Ok(LockReplica {
            nodes,
            config: config.replica,
            manager,
            applier,
            acceptor,
            proposer,
            primary,
            submitting: Mutex::new(()),
        })
    }

    /// The local acceptor, for serving Paxos RPCs.
    pub fn acceptor(&self) -> Arc<Acceptor> {
        self.acceptor.clone()
    }

    /// The local lock manager.
    pub fn manager(&self) -> &LockManager {
        &self.manager
    }

    /// Decides `cmd` as the next instance and returns the status of
    /// executing it.
    async fn submit(&self, cmd: LockCommand) -> Result<LockStatus, PaxlockError> {
        let _turn = self.submitting.lock().await;
        let value = cmd.to_string();

        for attempt in 0..self.config.submit_attempts {
            let instance = self.acceptor.instance_h().await + 1;
            let decided = self.proposer.run(instance, &self.nodes, &value).await?;

            // the instance may have been decided with my value by another
            // proposer too, so check regardless
            if let Some(status) = self.applier.take_result(instance, &cmd).await {
                return Ok(status);
            }
            pf_debug!("attempt {} for '{}' at instance {} lost (decided {})",
                      attempt, value, instance, decided);
            time::sleep(Duration::from_millis(self.config.submit_backoff_ms))
                .await;
        }

        logged_err!("failed to replicate '{}' after {} attempts",
                    value, self.config.submit_attempts)
    }
}

#[async_trait]
impl LockServerApi for LockReplica {
    async fn acquire(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError> {
        if !self.primary.am_i_primary() {
            return Ok(LockStatus::NotPrimary);
        }
        self.submit(LockCommand::Acquire {
            client: ClientId::from(client),
            seq,
            lid,
        })
        .await
    }

    async fn release(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError> {
        if !self.primary.am_i_primary() {
            return Ok(LockStatus::NotPrimary);
        }
        self.submit(LockCommand::Release {
            client: ClientId::from(client),
            seq,
            lid,
        })
        .await
    }

    async fn stat(&self, client: &str, lid: LockId) -> Result<u64, PaxlockError> {
        self.manager.stat(client, lid).await
    }
}
