//! Paxos proposer: drives one instance at a time through prepare, accept and
//! decide across a node list.

use std::cmp;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::{Acceptor, Ballot, Instance, NodeId, PaxosTransport, PrepareReply};
use crate::utils::{Bitmap, PaxlockError};

use futures::future::join_all;

use rand::Rng;

use serde::Deserialize;

use tokio::sync::Mutex;
use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProposerConfig {
    /// Timeout of each prepare/accept/decide RPC in millisecs.
    pub rpc_timeout_ms: u64,

    /// Maximum number of prepare rounds per run before giving up.
    pub max_prepare_rounds: u32,

    /// Min random backoff before re-preparing after a reject, in millisecs.
    pub backoff_min_ms: u64,
    /// Max random backoff before re-preparing after a reject, in millisecs.
    pub backoff_max_ms: u64,

    /// Commit the chosen value locally before broadcasting Decide. If false,
    /// the local acceptor learns the decision only through its own Decide
    /// RPC (reduced fault tolerance).
    pub commit_before_decide: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for ProposerConfig {
    fn default() -> Self {
        ProposerConfig {
            rpc_timeout_ms: 1000,
            max_prepare_rounds: 5,
            backoff_min_ms: 10,
            backoff_max_ms: 200,
            commit_before_decide: true,
        }
    }
}

/// Test crash points; reaching an armed one stops the run as if the
/// proposer had died there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakpoint {
    /// Between a successful prepare phase and sending any Accept.
    AfterPrepare = 1,
    /// Between a successful accept phase and sending any Decide.
    AfterAccept = 2,
}

/// Proposer state kept across runs.
#[derive(Debug)]
struct ProposerState {
    /// Ballot of the current (or last) prepare round.
    my_ballot: Ballot,

    /// Highest round seen in a Reject.
    max_seen_round: u64,
}

/// Outcome of a prepare phase that reached the acceptors.
struct Prepared {
    ballot: Ballot,
    promised: Bitmap,
    adopted: Option<String>,
}

/// Per-node Paxos proposer.
pub struct Proposer {
    /// My node ID.
    me: NodeId,

    /// Configuration parameters struct.
    config: ProposerConfig,

    /// My local acceptor, consulted for ballot choice and catch-up commits.
    acceptor: Arc<Acceptor>,

    /// Transport to all acceptors, including my own.
    transport: Arc<dyn PaxosTransport>,

    /// Held for the whole duration of a run.
    state: Mutex<ProposerState>,

    /// Armed breakpoint; 0 means none.
    breakpoint: AtomicU8,
}

impl Proposer {
    /// Creates a new proposer bound to the local acceptor.
    pub fn new(
        me: &str,
        config: ProposerConfig,
        acceptor: Arc<Acceptor>,
        transport: Arc<dyn PaxosTransport>,
    ) -> Self {
        Proposer {
            me: me.into(),
            config,
            acceptor,
            transport,
            state: Mutex::new(ProposerState {
                my_ballot: Ballot::null(me),
                max_seen_round: 0,
            }),
            breakpoint: AtomicU8::new(0),
        }
    }

    /// True if a run is in progress.
    pub fn is_running(&self) -> bool {
        self.state.try_lock().is_err()
    }

    /// Arms (or clears with `None`) a crash point.
    pub fn set_breakpoint(&self, bp: Option<Breakpoint>) {
        self.breakpoint
            .store(bp.map_or(0, |bp| bp as u8), Ordering::SeqCst);
    }

    fn hits_breakpoint(&self, bp: Breakpoint) -> bool {
        if self.breakpoint.load(Ordering::SeqCst) == bp as u8 {
            pf_warn!("proposer stopping at breakpoint {:?}", bp);
            true
        } else {
            false
        }
    }

    /// Picks a ballot strictly higher than anything promised locally, used
    /// before, or seen in a reject.
    async fn set_ballot(&self, state: &mut ProposerState) {
        let promised = self.acceptor.promised().await;
        let round = cmp::max(
            cmp::max(promised.round, state.my_ballot.round),
            state.max_seen_round,
        ) + 1;
        state.my_ballot = Ballot {
            round,
            proposer: self.me.clone(),
        };
    }

    /// Bounds an RPC future by the configured timeout.
    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, PaxlockError>>,
    ) -> Result<T, PaxlockError> {
        time::timeout(Duration::from_millis(self.config.rpc_timeout_ms), call)
            .await?
    }

    /// Runs Paxos for `instance` over `nodes`, proposing `value` unless some
    /// value may already have been chosen. Returns `Ok(true)` once a value is
    /// decided by this run (not necessarily `value`), `Ok(false)` if the run
    /// could not complete, e.g. another run is in progress, no majority was
    /// reached, or the instance turned out to be decided already.
    pub async fn run(
        &self,
        instance: Instance,
        nodes: &[NodeId],
        value: &str,
    ) -> Result<bool, PaxlockError> {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(_) => {
                pf_debug!("proposer already running, instance {} dropped",
                          instance);
                return Ok(false);
            }
        };
        if nodes.is_empty() || nodes.len() > u8::MAX as usize {
            pf_warn!("invalid node list size {}", nodes.len());
            return Ok(false);
        }
        pf_debug!("start paxos for [{}] instance {} value '{}'",
                  nodes.join(","), instance, value);

        let prepared = match self.prepare_phase(&mut state, instance, nodes).await? {
            Some(prepared) => prepared,
            None => return Ok(false),
        };
        if !prepared.promised.is_majority() {
            pf_debug!("no majority of prepare responses {:?}",
                      prepared.promised);
            return Ok(false);
        }
        let chosen = prepared.adopted.unwrap_or_else(|| value.to_string());
        if self.hits_breakpoint(Breakpoint::AfterPrepare) {
            return Ok(false);
        }

        let accepted = self
            .accept_phase(instance, nodes, &prepared.promised, &prepared.ballot, &chosen)
            .await?;
        if !accepted.is_majority() {
            pf_debug!("no majority of accept responses {:?}", accepted);
            return Ok(false);
        }
        if self.hits_breakpoint(Breakpoint::AfterAccept) {
            return Ok(false);
        }

        self.decide_phase(instance, nodes, &accepted, &chosen).await?;
        Ok(true)
    }

    /// Prepare phase, restarted with a higher ballot whenever any acceptor
    /// rejects. Returns `None` if the instance was found decided already or
    /// the round budget ran out.
    async fn prepare_phase(
        &self,
        state: &mut ProposerState,
        instance: Instance,
        nodes: &[NodeId],
    ) -> Result<Option<Prepared>, PaxlockError> {
        for _ in 0..self.config.max_prepare_rounds {
            self.set_ballot(state).await;
            let ballot = state.my_ballot.clone();
            pf_trace!("prepare instance {} bal {}", instance, ballot);

            let replies = join_all(nodes.iter().map(|node| {
                self.with_timeout(self.transport.prepare(
                    node,
                    &self.me,
                    instance,
                    ballot.clone(),
                ))
            }))
            .await;

            let mut promised = Bitmap::new(nodes.len() as u8);
            let mut highest: Option<(Ballot, String)> = None;
            let mut rejected = false;
            for (idx, (node, reply)) in nodes.iter().zip(replies).enumerate() {
                match reply {
                    Ok(PrepareReply::OldInstance { value, .. }) => {
                        pf_debug!("instance {} already decided at {}",
                                  instance, node);
                        if !value.is_empty() {
                            self.acceptor.commit(instance, value).await?;
                        }
                        return Ok(None);
                    }
                    Ok(PrepareReply::Promise { accepted, value }) => {
                        promised.set(idx as u8, true)?;
                        let higher = highest
                            .as_ref()
                            .map_or(true, |(bal, _)| accepted > *bal);
                        if !value.is_empty() && higher {
                            highest = Some((accepted, value));
                        }
                    }
                    Ok(PrepareReply::Reject { promised: p }) => {
                        pf_trace!("prepare rejected by {} promised {}", node, p);
                        state.max_seen_round =
                            cmp::max(state.max_seen_round, p.round);
                        rejected = true;
                    }
                    Err(e) => {
                        pf_trace!("prepare to {} failed: {}", node, e);
                    }
                }
            }

            if !rejected {
                if let Some((bal, _)) = highest.as_ref() {
                    pf_debug!("adopting value accepted at bal {}", bal);
                }
                return Ok(Some(Prepared {
                    ballot,
                    promised,
                    adopted: highest.map(|(_, value)| value),
                }));
            }

            let backoff = rand::thread_rng().gen_range(
                self.config.backoff_min_ms..=self.config.backoff_max_ms,
            );
            time::sleep(Duration::from_millis(backoff)).await;
        }

        pf_debug!("prepare for instance {} rejected {} times, giving up",
                  instance, self.config.max_prepare_rounds);
        Ok(None)
    }

    /// Accept phase towards the nodes that promised. Returns the set of
    /// nodes that accepted.
    async fn accept_phase(
        &self,
        instance: Instance,
        nodes: &[NodeId],
        promised: &Bitmap,
        ballot: &Ballot,
        value: &str,
    ) -> Result<Bitmap, PaxlockError> {
        let targets: Vec<u8> = promised.ones().collect();
        let replies = join_all(targets.iter().map(|&idx| {
            self.with_timeout(self.transport.accept(
                &nodes[idx as usize],
                &self.me,
                instance,
                ballot.clone(),
                value.to_string(),
            ))
        }))
        .await;

        let mut accepted = Bitmap::new(nodes.len() as u8);
        for (idx, reply) in targets.into_iter().zip(replies) {
            match reply {
                Ok(true) => accepted.set(idx, true)?,
                Ok(false) => {}
                Err(e) => {
                    pf_trace!("accept to {} failed: {}", nodes[idx as usize], e);
                }
            }
        }
        Ok(accepted)
    }

    /// Decide phase: commit locally (unless configured not to), then tell
    /// every node that accepted.
    async fn decide_phase(
        &self,
        instance: Instance,
        nodes: &[NodeId],
        accepted: &Bitmap,
        value: &str,
    ) -> Result<(), PaxlockError> {
        if self.config.commit_before_decide {
            self.acceptor.commit(instance, value.to_string()).await?;
        }

        let targets: Vec<u8> = accepted.ones().collect();
        let replies = join_all(targets.iter().map(|&idx| {
            self.with_timeout(self.transport.decide(
                &nodes[idx as usize],
                &self.me,
                instance,
                value.to_string(),
            ))
        }))
        .await;
        for (idx, reply) in targets.into_iter().zip(replies) {
            if let Err(e) = reply {
                pf_debug!("decide to {} failed: {}", nodes[idx as usize], e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod proposer_tests {
    use super::*;
    use crate::paxos::test_utils::{fresh_config, CommitRecorder};
    use crate::rpc::LocalNet;

    fn fast_config() -> ProposerConfig {
        ProposerConfig {
            rpc_timeout_ms: 500,
            max_prepare_rounds: 20,
            backoff_min_ms: 1,
            backoff_max_ms: 30,
            commit_before_decide: true,
        }
    }

    /// Sets up `n` acceptors named `<tag>-<i>` on a fresh in-process net.
    async fn setup_nodes(
        tag: &str,
        n: usize,
    ) -> Result<(Arc<LocalNet>, Vec<NodeId>, Vec<Arc<CommitRecorder>>), PaxlockError>
    {
        let net = Arc::new(LocalNet::new());
        let mut nodes = vec![];
        let mut recorders = vec![];
        for i in 0..n {
            let node = format!("{}-{}", tag, i);
            let recorder = Arc::new(CommitRecorder::default());
            let acc = Acceptor::new_and_setup(
                &node,
                fresh_config(&node).await?,
                None,
                Some(recorder.clone()),
            )
            .await?;
            net.add_acceptor(Arc::new(acc)).await;
            nodes.push(node);
            recorders.push(recorder);
        }
        Ok((net, nodes, recorders))
    }

    async fn proposer_at(
        net: &Arc<LocalNet>,
        node: &str,
        config: ProposerConfig,
    ) -> Result<Proposer, PaxlockError> {
        let acc = match net.acceptor(node).await {
            Some(acc) => acc,
            None => return logged_err!("no acceptor {}", node),
        };
        Ok(Proposer::new(node, config, acc, net.clone()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn majority_with_one_down() -> Result<(), PaxlockError> {
        let (net, nodes, recorders) = setup_nodes("prop-maj", 3).await?;
        net.set_unreachable(&nodes[2], true).await;
        let proposer = proposer_at(&net, &nodes[0], fast_config()).await?;
        assert!(proposer.run(1, &nodes, "v1").await?);
        for node in &nodes[..2] {
            let acc = net.acceptor(node).await.unwrap();
            assert_eq!(acc.value(1).await, Some("v1".into()));
        }
        let down = net.acceptor(&nodes[2]).await.unwrap();
        assert_eq!(down.value(1).await, None);
        assert_eq!(recorders[0].commits().await, vec![(1, "v1".into())]);
        assert_eq!(recorders[1].commits().await, vec![(1, "v1".into())]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_majority_fails() -> Result<(), PaxlockError> {
        let (net, nodes, _) = setup_nodes("prop-nomaj", 3).await?;
        net.set_unreachable(&nodes[1], true).await;
        net.set_unreachable(&nodes[2], true).await;
        let proposer = proposer_at(&net, &nodes[0], fast_config()).await?;
        assert!(!proposer.run(1, &nodes, "v1").await?);
        assert_eq!(net.acceptor(&nodes[0]).await.unwrap().value(1).await, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ballot_above_local_promise() -> Result<(), PaxlockError> {
        let (net, nodes, _) = setup_nodes("prop-ballot", 3).await?;
        let local = net.acceptor(&nodes[0]).await.unwrap();
        let high = Ballot {
            round: 41,
            proposer: "zz".into(),
        };
        local.prepare("zz", 1, high).await?;
        let proposer = proposer_at(&net, &nodes[0], fast_config()).await?;
        assert!(proposer.run(1, &nodes, "v1").await?);
        let state = proposer.state.lock().await;
        assert_eq!(state.my_ballot.round, 42);
        assert_eq!(state.my_ballot.proposer, nodes[0]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_instance_catch_up() -> Result<(), PaxlockError> {
        let (net, nodes, recorders) = setup_nodes("prop-stale", 3).await?;
        // node 0 misses the decision of instance 1
        net.set_unreachable(&nodes[0], true).await;
        let p1 = proposer_at(&net, &nodes[1], fast_config()).await?;
        assert!(p1.run(1, &nodes, "first").await?);
        net.set_unreachable(&nodes[0], false).await;

        let p0 = proposer_at(&net, &nodes[0], fast_config()).await?;
        assert!(!p0.run(1, &nodes, "second").await?);
        let acc0 = net.acceptor(&nodes[0]).await.unwrap();
        assert_eq!(acc0.value(1).await, Some("first".into()));
        assert_eq!(recorders[0].commits().await, vec![(1, "first".into())]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn adopt_accepted_value() -> Result<(), PaxlockError> {
        let (net, nodes, _) = setup_nodes("prop-adopt", 3).await?;
        let p0 = proposer_at(&net, &nodes[0], fast_config()).await?;
        p0.set_breakpoint(Some(Breakpoint::AfterAccept));
        assert!(!p0.run(1, &nodes, "orig").await?);
        for node in &nodes {
            let acc = net.acceptor(node).await.unwrap();
            assert_eq!(acc.value(1).await, None);
            assert_eq!(acc.accepted().await.1, "orig");
        }

        let p1 = proposer_at(&net, &nodes[1], fast_config()).await?;
        assert!(p1.run(1, &nodes, "usurper").await?);
        for node in &nodes {
            let acc = net.acceptor(node).await.unwrap();
            assert_eq!(acc.value(1).await, Some("orig".into()));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn breakpoint_after_prepare() -> Result<(), PaxlockError> {
        let (net, nodes, _) = setup_nodes("prop-bp1", 3).await?;
        let p0 = proposer_at(&net, &nodes[0], fast_config()).await?;
        p0.set_breakpoint(Some(Breakpoint::AfterPrepare));
        assert!(!p0.run(1, &nodes, "lost").await?);
        let acc = net.acceptor(&nodes[1]).await.unwrap();
        assert_eq!(acc.accepted().await.1, "");

        p0.set_breakpoint(None);
        assert!(p0.run(1, &nodes, "kept").await?);
        assert_eq!(acc.value(1).await, Some("kept".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_flight() -> Result<(), PaxlockError> {
        let (net, nodes, _) = setup_nodes("prop-single", 3).await?;
        net.set_delay(Duration::from_millis(100)).await;
        let p0 = Arc::new(proposer_at(&net, &nodes[0], fast_config()).await?);
        let p0_bg = p0.clone();
        let nodes_bg = nodes.clone();
        let first = tokio::spawn(async move {
            p0_bg.run(1, &nodes_bg, "first").await
        });
        time::sleep(Duration::from_millis(30)).await;
        assert!(p0.is_running());
        assert!(!p0.run(1, &nodes, "second").await?);
        assert!(first.await??);
        assert!(!p0.is_running());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_proposers_agree() -> Result<(), PaxlockError> {
        let (net, nodes, recorders) = setup_nodes("prop-race", 3).await?;
        let mut handles = vec![];
        for (i, node) in nodes.iter().enumerate() {
            let proposer =
                Arc::new(proposer_at(&net, node, fast_config()).await?);
            let nodes = nodes.clone();
            handles.push(tokio::spawn(async move {
                proposer.run(1, &nodes, &format!("value-{}", i)).await
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await?? {
                successes += 1;
            }
        }

        let mut decided: Vec<String> = vec![];
        for recorder in &recorders {
            for (instance, value) in recorder.commits().await {
                assert_eq!(instance, 1);
                decided.push(value);
            }
        }
        if successes > 0 {
            assert!(!decided.is_empty());
        }
        decided.dedup();
        assert!(decided.len() <= 1, "conflicting decisions {:?}", decided);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reduced_mode_decides_via_rpc() -> Result<(), PaxlockError> {
        let (net, nodes, recorders) = setup_nodes("prop-reduced", 3).await?;
        let config = ProposerConfig {
            commit_before_decide: false,
            ..fast_config()
        };
        let p0 = proposer_at(&net, &nodes[0], config).await?;
        assert!(p0.run(1, &nodes, "v1").await?);
        for recorder in &recorders {
            assert_eq!(recorder.commits().await, vec![(1, "v1".into())]);
        }
        Ok(())
    }
}
