//! Server-side lock cache manager: grants cached locks to clients, and
//! dispatches revoke/retry callbacks from background workers so that request
//! handlers never wait on client I/O.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::utils::PaxlockError;

use async_trait::async_trait;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Lock ID type.
pub type LockId = u64;

/// Client ID type; the client's callback address string.
pub type ClientId = String;

/// Per-client request sequence number type.
pub type SeqNum = u64;

/// Result status of lock requests.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum LockStatus {
    /// Granted (acquire) or given back (release).
    Ok,

    /// Lock is owned by someone else; wait for a retry callback.
    Retry,

    /// Release from a client that does not own the lock.
    NoEnt,

    /// This server is not the primary; redirect.
    NotPrimary,
}

/// Mutating lock request, as replicated through Paxos.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum LockCommand {
    Acquire {
        client: ClientId,
        seq: SeqNum,
        lid: LockId,
    },

    Release {
        client: ClientId,
        seq: SeqNum,
        lid: LockId,
    },
}

impl fmt::Display for LockCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockCommand::Acquire { client, seq, lid } => {
                write!(f, "acquire {} {} {}", client, seq, lid)
            }
            LockCommand::Release { client, seq, lid } => {
                write!(f, "release {} {} {}", client, seq, lid)
            }
        }
    }
}

impl FromStr for LockCommand {
    type Err = PaxlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segs: Vec<&str> = s.split_whitespace().collect();
        if segs.len() != 4 {
            return Err(PaxlockError(format!("invalid lock command '{}'", s)));
        }
        let client = segs[1].to_string();
        let seq = segs[2].parse::<SeqNum>()?;
        let lid = segs[3].parse::<LockId>()?;
        match segs[0] {
            "acquire" => Ok(LockCommand::Acquire { client, seq, lid }),
            "release" => Ok(LockCommand::Release { client, seq, lid }),
            op => Err(PaxlockError(format!("invalid lock op '{}'", op))),
        }
    }
}

/// Lock service API as seen by clients.
#[async_trait]
pub trait LockServerApi: Send + Sync {
    async fn acquire(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError>;

    async fn release(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError>;

    async fn stat(&self, client: &str, lid: LockId) -> Result<u64, PaxlockError>;
}

/// Callback API of a client's lock cache, as invoked by the server.
#[async_trait]
pub trait LockClientApi: Send + Sync {
    async fn revoke(&self, client: &str, lid: LockId) -> Result<(), PaxlockError>;

    async fn retry(&self, client: &str, lid: LockId) -> Result<(), PaxlockError>;
}

/// Tells whether this server is currently the primary.
pub trait PrimaryOracle: Send + Sync {
    fn am_i_primary(&self) -> bool;
}

/// Primary oracle with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticPrimary(pub bool);

impl PrimaryOracle for StaticPrimary {
    fn am_i_primary(&self) -> bool {
        self.0
    }
}

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Timeout of each revoke/retry callback RPC in millisecs.
    pub callback_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            callback_timeout_ms: 1000,
        }
    }
}

/// Server-side state of one lock.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
struct LockEntry {
    owner: Option<ClientId>,
    waiters: Vec<ClientId>,
    /// A revoke has been sent to the current owner.
    revoked: bool,
}

/// Server-side lock cache manager.
pub struct LockManager {
    /// Configuration parameters struct.
    config: LockManagerConfig,

    /// Lock table; each lock has its own mutex.
    locks: Mutex<HashMap<LockId, Arc<Mutex<LockEntry>>>>,

    /// Number of grants made so far.
    grants: AtomicU64,

    /// Primary check for the public handlers.
    primary: Arc<dyn PrimaryOracle>,

    /// Sender side of the revoke work queue.
    tx_revoke: mpsc::UnboundedSender<(ClientId, LockId)>,

    /// Sender side of the retry work queue.
    tx_retry: mpsc::UnboundedSender<(Vec<ClientId>, LockId)>,

    /// Join handle of the revoker thread.
    revoker_handle: JoinHandle<()>,

    /// Join handle of the retryer thread.
    retryer_handle: JoinHandle<()>,
}

impl LockManager {
    /// Creates a new lock manager. Spawns the revoker and retryer threads,
    /// which deliver callbacks through `callbacks`.
    pub fn new_and_setup(
        config: LockManagerConfig,
        primary: Arc<dyn PrimaryOracle>,
        callbacks: Arc<dyn LockClientApi>,
    ) -> Self {
        let (tx_revoke, rx_revoke) = mpsc::unbounded_channel();
        let (tx_retry, rx_retry) = mpsc::unbounded_channel();
        let timeout = Duration::from_millis(config.callback_timeout_ms);

        let revoker_handle = tokio::spawn(Self::revoker_thread(
            rx_revoke,
            callbacks.clone(),
            primary.clone(),
            timeout,
        ));
        let retryer_handle = tokio::spawn(Self::retryer_thread(
            rx_retry,
            callbacks,
            primary.clone(),
            timeout,
        ));

        LockManager {
            config,
            locks: Mutex::new(HashMap::new()),
            grants: AtomicU64::new(0),
            primary,
            tx_revoke,
            tx_retry,
            revoker_handle,
            retryer_handle,
        }
    }

    /// Returns true if this server is the primary.
    pub fn am_i_primary(&self) -> bool {
        self.primary.am_i_primary()
    }

    async fn entry(&self, lid: LockId) -> Arc<Mutex<LockEntry>> {
        self.locks.lock().await.entry(lid).or_default().clone()
    }

    fn enqueue_revoke(&self, owner: &str, lid: LockId) -> Result<(), PaxlockError> {
        self.tx_revoke.send((owner.into(), lid))?;
        Ok(())
    }

    /// Acquire without the primary check.
    async fn do_acquire(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError> {
        let entry = self.entry(lid).await;
        let mut entry = entry.lock().await;

        let owner = entry.owner.clone();
        match owner.as_deref() {
            None => {
                entry.owner = Some(client.into());
                entry.revoked = false;
                entry.waiters.retain(|w| w != client);
                self.grants.fetch_add(1, Ordering::SeqCst);
                pf_debug!("lock {} granted to {} (seq {})", lid, client, seq);

                if !entry.waiters.is_empty() {
                    self.enqueue_revoke(client, lid)?;
                    entry.revoked = true;
                }
                Ok(LockStatus::Ok)
            }

            Some(owner) if owner == client => {
                // retransmitted acquire from the current owner
                pf_debug!("lock {} re-granted to {} (seq {})", lid, client, seq);
                if !entry.waiters.is_empty() && !entry.revoked {
                    self.enqueue_revoke(client, lid)?;
                    entry.revoked = true;
                }
                Ok(LockStatus::Ok)
            }

            Some(owner) => {
                if !entry.waiters.iter().any(|w| w == client) {
                    entry.waiters.push(client.into());
                }
                // at most one revoke outstanding until the owner releases
                if !entry.revoked {
                    self.enqueue_revoke(owner, lid)?;
                    entry.revoked = true;
                }
                pf_trace!("lock {} busy for {} (owner {}, seq {})",
                          lid, client, owner, seq);
                Ok(LockStatus::Retry)
            }
        }
    }

    /// Release without the primary check.
    async fn do_release(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError> {
        let entry = match self.locks.lock().await.get(&lid) {
            Some(entry) => entry.clone(),
            None => return Ok(LockStatus::NoEnt),
        };
        let mut entry = entry.lock().await;

        if entry.owner.as_deref() != Some(client) {
            pf_debug!("stale release of lock {} from {} (seq {})",
                      lid, client, seq);
            return Ok(LockStatus::NoEnt);
        }
        entry.owner = None;
        entry.revoked = false;
        pf_debug!("lock {} released by {} (seq {})", lid, client, seq);

        if !entry.waiters.is_empty() {
            let waiters = std::mem::take(&mut entry.waiters);
            self.tx_retry.send((waiters, lid))?;
        }
        Ok(LockStatus::Ok)
    }

    /// Executes a command without the primary check; used when applying
    /// committed commands on every replica.
    pub async fn apply(
        &self,
        cmd: &LockCommand,
    ) -> Result<LockStatus, PaxlockError> {
        match cmd {
            LockCommand::Acquire { client, seq, lid } => {
                self.do_acquire(client, *seq, *lid).await
            }
            LockCommand::Release { client, seq, lid } => {
                self.do_release(client, *seq, *lid).await
            }
        }
    }

    /// Number of grants made by this manager.
    pub fn grant_count(&self) -> u64 {
        self.grants.load(Ordering::SeqCst)
    }

    /// Current owner of a lock.
    pub async fn owner_of(&self, lid: LockId) -> Option<ClientId> {
        let entry = self.locks.lock().await.get(&lid).cloned()?;
        let owner = entry.lock().await.owner.clone();
        owner
    }

    /// Current waiters of a lock.
    pub async fn waiters_of(&self, lid: LockId) -> Vec<ClientId> {
        let entry = match self.locks.lock().await.get(&lid) {
            Some(entry) => entry.clone(),
            None => return vec![],
        };
        let waiters = entry.lock().await.waiters.clone();
        waiters
    }

    /// Snapshots the lock table into a blob.
    pub async fn marshal_state(&self) -> Result<Vec<u8>, PaxlockError> {
        let locks = self.locks.lock().await;
        let mut table = BTreeMap::new();
        for (&lid, entry) in locks.iter() {
            table.insert(lid, entry.lock().await.clone());
        }
        Ok(encode_to_vec(&(self.grant_count(), table))?)
    }

    /// Replaces the lock table with a blob produced by `marshal_state()`.
    pub async fn unmarshal_state(&self, blob: &[u8]) -> Result<(), PaxlockError> {
        let (grants, table): (u64, BTreeMap<LockId, LockEntry>) =
            decode_from_slice(blob)?;
        let mut locks = self.locks.lock().await;
        *locks = table
            .into_iter()
            .map(|(lid, entry)| (lid, Arc::new(Mutex::new(entry))))
            .collect();
        self.grants.store(grants, Ordering::SeqCst);
        pf_info!("lock table restored with {} locks", locks.len());
        Ok(())
    }
}

// LockManager callback workers
impl LockManager {
    /// Revoker thread function.
    async fn revoker_thread(
        mut rx_revoke: mpsc::UnboundedReceiver<(ClientId, LockId)>,
        callbacks: Arc<dyn LockClientApi>,
        primary: Arc<dyn PrimaryOracle>,
        timeout: Duration,
    ) {
        pf_debug!("revoker thread spawned");

        while let Some((client, lid)) = rx_revoke.recv().await {
            if !primary.am_i_primary() {
                continue;
            }
            match time::timeout(timeout, callbacks.revoke(&client, lid)).await {
                Ok(Ok(())) => pf_trace!("revoked lock {} from {}", lid, client),
                Ok(Err(e)) => {
                    pf_warn!("revoke lock {} from {} failed: {}", lid, client, e)
                }
                Err(_) => pf_warn!("revoke lock {} from {} timed out", lid, client),
            }
        }

        pf_debug!("revoker thread exitted");
    }

    /// Retryer thread function.
    async fn retryer_thread(
        mut rx_retry: mpsc::UnboundedReceiver<(Vec<ClientId>, LockId)>,
        callbacks: Arc<dyn LockClientApi>,
        primary: Arc<dyn PrimaryOracle>,
        timeout: Duration,
    ) {
        pf_debug!("retryer thread spawned");

        while let Some((waiters, lid)) = rx_retry.recv().await {
            if !primary.am_i_primary() {
                continue;
            }
            for client in waiters {
                match time::timeout(timeout, callbacks.retry(&client, lid)).await
                {
                    Ok(Ok(())) => pf_trace!("sent retry of lock {} to {}", lid, client),
                    Ok(Err(e)) => {
                        pf_warn!("retry lock {} to {} failed: {}", lid, client, e)
                    }
                    Err(_) => {
                        pf_warn!("retry lock {} to {} timed out", lid, client)
                    }
                }
            }
        }

        pf_debug!("retryer thread exitted");
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.revoker_handle.abort();
        self.retryer_handle.abort();
    }
}

#[async_trait]
impl LockServerApi for LockManager {
    async fn acquire(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError> {
        if !self.am_i_primary() {
            return Ok(LockStatus::NotPrimary);
        }
        self.do_acquire(client, seq, lid).await
    }

    async fn release(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError> {
        if !self.am_i_primary() {
            return Ok(LockStatus::NotPrimary);
        }
        self.do_release(client, seq, lid).await
    }

    async fn stat(&self, client: &str, lid: LockId) -> Result<u64, PaxlockError> {
        if !self.am_i_primary() {
            return logged_err!("stat of lock {} from {}: not primary", lid, client);
        }
        pf_trace!("stat of lock {} from {}", lid, client);
        Ok(self.grant_count())
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("config", &self.config)
            .field("grants", &self.grant_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Callback target that remembers every revoke and retry it gets.
    #[derive(Default)]
    pub(crate) struct CallbackRecorder {
        pub(crate) revokes: Mutex<Vec<(ClientId, LockId)>>,
        pub(crate) retries: Mutex<Vec<(ClientId, LockId)>>,
    }

    #[async_trait]
    impl LockClientApi for CallbackRecorder {
        async fn revoke(
            &self,
            client: &str,
            lid: LockId,
        ) -> Result<(), PaxlockError> {
            self.revokes.lock().await.push((client.into(), lid));
            Ok(())
        }

        async fn retry(
            &self,
            client: &str,
            lid: LockId,
        ) -> Result<(), PaxlockError> {
            self.retries.lock().await.push((client.into(), lid));
            Ok(())
        }
    }

    /// Polls until `list` holds at least `n` items or a second passes.
    pub(crate) async fn wait_for_len(
        list: &Mutex<Vec<(ClientId, LockId)>>,
        n: usize,
    ) -> Vec<(ClientId, LockId)> {
        for _ in 0..100 {
            {
                let list = list.lock().await;
                if list.len() >= n {
                    return list.clone();
                }
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        list.lock().await.clone()
    }
}
