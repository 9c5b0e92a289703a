//! Paxos acceptor: answers Prepare/Accept/Decide, persists every state
//! change to its WAL before replying, and delivers commit upcalls.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::{Ballot, Instance, NodeId, PaxosChange, PrepareReply};
use crate::server::StorageHub;
use crate::utils::PaxlockError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

use tokio::sync::Mutex;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcceptorConfig {
    /// Path to backing log file.
    pub backer_path: String,

    /// Whether to call `fdatasync()` on every appended entry.
    pub logger_sync: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for AcceptorConfig {
    fn default() -> Self {
        AcceptorConfig {
            backer_path: "/tmp/paxlock.acceptor.wal".into(),
            logger_sync: true,
        }
    }
}

/// Stable storage WAL log entry type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum WalEntry {
    /// Records a new highest promised ballot.
    Promise { instance: Instance, ballot: Ballot },

    /// Records a newly accepted ballot and value.
    Accept {
        instance: Instance,
        ballot: Ballot,
        value: String,
    },

    /// Records a decided value.
    Decide { instance: Instance, value: String },
}

/// In-memory acceptor state, always derivable by replaying the WAL. Promise
/// and accept state refer to the instance after `instance_h`.
#[derive(Debug, PartialEq, Eq, Clone)]
struct AcceptorState {
    promised: Ballot,
    accepted: Ballot,
    accepted_value: String,
    instance_h: Instance,
    values: BTreeMap<Instance, String>,
}

impl AcceptorState {
    fn fresh(me: &str) -> Self {
        AcceptorState {
            promised: Ballot::null(me),
            accepted: Ballot::null(me),
            accepted_value: String::new(),
            instance_h: 0,
            values: BTreeMap::new(),
        }
    }

    /// Applies a log entry, both on the live path and during replay. Returns
    /// true if the entry decided a new instance.
    fn apply(&mut self, me: &str, entry: &WalEntry) -> bool {
        match entry {
            WalEntry::Promise { instance, ballot } => {
                if *instance > self.instance_h && *ballot > self.promised {
                    self.promised = ballot.clone();
                }
                false
            }

            WalEntry::Accept {
                instance,
                ballot,
                value,
            } => {
                if *instance > self.instance_h {
                    self.accepted = ballot.clone();
                    self.accepted_value = value.clone();
                    if *ballot > self.promised {
                        self.promised = ballot.clone();
                    }
                }
                false
            }

            WalEntry::Decide { instance, value } => {
                if *instance <= self.instance_h {
                    return false;
                }
                self.values.insert(*instance, value.clone());
                self.instance_h = *instance;
                self.promised = Ballot::null(me);
                self.accepted = Ballot::null(me);
                self.accepted_value.clear();
                true
            }
        }
    }
}

/// State guarded by the acceptor's single mutex.
struct AcceptorInner {
    st: AcceptorState,
    storage_hub: StorageHub<WalEntry>,
}

/// Per-node Paxos acceptor.
pub struct Acceptor {
    /// My node ID.
    me: NodeId,

    /// Configuration parameters struct.
    config: AcceptorConfig,

    /// Protocol state and its durable log.
    inner: Mutex<AcceptorInner>,

    /// Serializes commit upcalls in the order decisions were recorded.
    commit_order: Mutex<()>,

    /// Commit upcall into the layer above, if any.
    upcall: Option<Arc<dyn PaxosChange>>,
}

impl Acceptor {
    /// Creates an acceptor backed by the configured WAL file, replaying any
    /// existing entries. If the log holds no decision yet and `bootstrap` is
    /// given, instance 1 is durably decided with that value.
    pub async fn new_and_setup(
        me: &str,
        config: AcceptorConfig,
        bootstrap: Option<&str>,
        upcall: Option<Arc<dyn PaxosChange>>,
    ) -> Result<Self, PaxlockError> {
        let mut storage_hub =
            StorageHub::new_and_setup(Path::new(&config.backer_path)).await?;

        let mut st = AcceptorState::fresh(me);
        let (entries, end_offset) = storage_hub.read_all().await?;
        for entry in &entries {
            st.apply(me, entry);
        }
        // drop a partially written tail entry, if any
        storage_hub.truncate(end_offset).await?;
        if !entries.is_empty() {
            pf_info!(
                "acceptor recovered {} wal entries: instance_h {} promised {}",
                entries.len(),
                st.instance_h,
                st.promised
            );
        }

        let mut inner = AcceptorInner { st, storage_hub };
        if let Some(value) = bootstrap {
            if inner.st.instance_h == 0 {
                let entry = WalEntry::Decide {
                    instance: 1,
                    value: value.into(),
                };
                Self::record(me, &config, &mut inner, entry).await?;
                pf_debug!("acceptor bootstrapped instance 1 with '{}'", value);
            }
        }

        Ok(Acceptor {
            me: me.into(),
            config,
            inner: Mutex::new(inner),
            commit_order: Mutex::new(()),
            upcall,
        })
    }

    /// Persists an entry, then applies it to the in-memory state.
    async fn record(
        me: &str,
        config: &AcceptorConfig,
        inner: &mut AcceptorInner,
        entry: WalEntry,
    ) -> Result<bool, PaxlockError> {
        inner
            .storage_hub
            .append(entry.clone(), config.logger_sync)
            .await?;
        Ok(inner.st.apply(me, &entry))
    }

    /// My node ID.
    pub fn me(&self) -> &str {
        &self.me
    }

    /// Handler of Prepare from a proposer.
    pub async fn prepare(
        &self,
        src: &str,
        instance: Instance,
        ballot: Ballot,
    ) -> Result<PrepareReply, PaxlockError> {
        let mut inner = self.inner.lock().await;
        pf_trace!("received Prepare <- {} for instance {} bal {}",
                  src, instance, ballot);

        if instance <= inner.st.instance_h {
            let value =
                inner.st.values.get(&instance).cloned().unwrap_or_default();
            return Ok(PrepareReply::OldInstance { instance, value });
        }

        if ballot < inner.st.promised {
            return Ok(PrepareReply::Reject {
                promised: inner.st.promised.clone(),
            });
        }
        if ballot > inner.st.promised {
            Self::record(
                &self.me,
                &self.config,
                &mut inner,
                WalEntry::Promise { instance, ballot },
            )
            .await?;
        }
        // an equal ballot is a retransmission of the promise already made

        Ok(PrepareReply::Promise {
            accepted: inner.st.accepted.clone(),
            value: inner.st.accepted_value.clone(),
        })
    }

    /// Handler of Accept from a proposer.
    pub async fn accept(
        &self,
        src: &str,
        instance: Instance,
        ballot: Ballot,
        value: String,
    ) -> Result<bool, PaxlockError> {
        let mut inner = self.inner.lock().await;
        pf_trace!("received Accept <- {} for instance {} bal {}",
                  src, instance, ballot);

        if instance <= inner.st.instance_h || ballot < inner.st.promised {
            return Ok(false);
        }
        if inner.st.accepted != ballot || inner.st.accepted_value != value {
            Self::record(
                &self.me,
                &self.config,
                &mut inner,
                WalEntry::Accept {
                    instance,
                    ballot,
                    value,
                },
            )
            .await?;
        }
        Ok(true)
    }

    /// Handler of Decide from a proposer.
    pub async fn decide(
        &self,
        src: &str,
        instance: Instance,
        value: String,
    ) -> Result<(), PaxlockError> {
        pf_trace!("received Decide <- {} for instance {}", src, instance);
        self.commit(instance, value).await
    }

    /// Durably records `value` as decided for `instance` if the instance is
    /// newer than everything decided so far, then delivers the upcall.
    pub async fn commit(
        &self,
        instance: Instance,
        value: String,
    ) -> Result<(), PaxlockError> {
        let mut inner = self.inner.lock().await;
        if instance <= inner.st.instance_h {
            return Ok(());
        }
        let entry = WalEntry::Decide {
            instance,
            value: value.clone(),
        };
        Self::record(&self.me, &self.config, &mut inner, entry).await?;
        pf_debug!("committed instance {} value '{}'", instance, value);

        // take the upcall turn before letting go of the state so that
        // upcalls come out in decision order
        let order = self.commit_order.lock().await;
        drop(inner);
        if let Some(upcall) = self.upcall.as_ref() {
            upcall.paxos_commit(instance, &value).await;
        }
        drop(order);
        Ok(())
    }

    /// Highest decided instance number.
    pub async fn instance_h(&self) -> Instance {
        self.inner.lock().await.st.instance_h
    }

    /// Highest promised ballot for the next instance.
    pub async fn promised(&self) -> Ballot {
        self.inner.lock().await.st.promised.clone()
    }

    /// Highest accepted ballot and value for the next instance.
    pub async fn accepted(&self) -> (Ballot, String) {
        let inner = self.inner.lock().await;
        (inner.st.accepted.clone(), inner.st.accepted_value.clone())
    }

    /// Decided value of an instance, if known here.
    pub async fn value(&self, instance: Instance) -> Option<String> {
        self.inner.lock().await.st.values.get(&instance).cloned()
    }

    /// Serializes the whole WAL into a blob.
    pub async fn dump(&self) -> Result<Vec<u8>, PaxlockError> {
        let mut inner = self.inner.lock().await;
        let (entries, _) = inner.storage_hub.read_all().await?;
        Ok(encode_to_vec(&entries)?)
    }

    /// Replaces the WAL with the entries of a blob produced by `dump()` and
    /// rebuilds the in-memory state from them. No upcalls are delivered.
    pub async fn restore(&self, blob: &[u8]) -> Result<(), PaxlockError> {
        let entries: Vec<WalEntry> = decode_from_slice(blob)?;
        let mut inner = self.inner.lock().await;

        inner.storage_hub.truncate(0).await?;
        let num_entries = entries.len();
        let mut st = AcceptorState::fresh(&self.me);
        for (i, entry) in entries.into_iter().enumerate() {
            let sync = self.config.logger_sync && i + 1 == num_entries;
            st.apply(&self.me, &entry);
            inner.storage_hub.append(entry, sync).await?;
        }
        inner.st = st;

        pf_info!("acceptor restored {} wal entries: instance_h {}",
                 num_entries, inner.st.instance_h);
        Ok(())
    }
}
