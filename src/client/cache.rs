//! Client-side lock cache. Grants from the server stay cached locally until
//! the server revokes them, so repeated acquires by local callers need no
//! server round trip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::server::{ClientId, LockId, LockServerApi, LockStatus, SeqNum};
use crate::utils::PaxlockError;

use async_trait::async_trait;

use serde::Deserialize;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockClientConfig {
    /// Timeout of each acquire/release/stat RPC to the server in millisecs.
    pub rpc_timeout_ms: u64,

    /// Max time to wait for a retry callback before polling the server
    /// again, in millisecs.
    pub retry_wait_ms: u64,

    /// Pause before talking to the server again after it failed or said it
    /// is not the primary, in millisecs.
    pub unreachable_backoff_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for LockClientConfig {
    fn default() -> Self {
        LockClientConfig {
            rpc_timeout_ms: 1000,
            retry_wait_ms: 3000,
            unreachable_backoff_ms: 500,
        }
    }
}

impl LockClientConfig {
    /// Parses a TOML config string; missing fields keep defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, PaxlockError> {
        parsed_config!(config_str => LockClientConfig;
                       rpc_timeout_ms, retry_wait_ms, unreachable_backoff_ms)
    }
}

/// Client-side state of a lock.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LockState {
    /// Not cached.
    None,
    /// Cached and not used by anyone locally.
    Free,
    /// Cached and held by a local caller.
    Locked,
    /// Acquire RPC to the server in flight.
    Acquiring,
    /// Revoked; release to the server pending or in flight.
    Releasing,
}

/// Hook invoked before a revoked lock is given back to the server, so that
/// state protected by the lock can be flushed first.
#[async_trait]
pub trait LockReleaseUser: Send + Sync {
    async fn do_release(&self, lid: LockId);
}

#[derive(Debug)]
struct LockSlot {
    state: LockState,

    /// A local caller holds the lock and has yet to release it.
    taken: bool,

    /// Seq number of the latest acquire RPC.
    acquire_seq: SeqNum,

    /// A retry arrived since the latest acquire RPC was sent.
    retried: bool,

    /// A revoke arrived while the acquire RPC was in flight.
    revoke_deferred: bool,
}

struct CachedLock {
    slot: Mutex<LockSlot>,

    /// Signaled on every state change and local release.
    changed: Notify,

    /// Signaled on retry callbacks.
    retried: Notify,
}

impl CachedLock {
    fn new() -> Self {
        CachedLock {
            slot: Mutex::new(LockSlot {
                state: LockState::None,
                taken: false,
                acquire_seq: 0,
                retried: false,
                revoke_deferred: false,
            }),
            changed: Notify::new(),
            retried: Notify::new(),
        }
    }
}

/// State shared between the cache handle, the releaser thread, and
/// detached acquire RPC tasks.
struct CacheShared {
    /// My client ID.
    id: ClientId,

    /// Configuration parameters struct.
    config: LockClientConfig,

    /// Lock server (or primary replica) to talk to.
    server: Arc<dyn LockServerApi>,

    /// Optional flush hook.
    release_user: Option<Arc<dyn LockReleaseUser>>,

    /// Lock table; each lock has its own mutex.
    locks: Mutex<HashMap<LockId, Arc<CachedLock>>>,

    /// Next request sequence number.
    next_seq: AtomicU64,

    /// Sender side of the release queue.
    tx_release: mpsc::UnboundedSender<LockId>,

    /// Set by `shutdown`; no new acquires, releases bypass the releaser.
    closed: AtomicBool,
}

impl CacheShared {
    async fn lock_of(&self, lid: LockId) -> Arc<CachedLock> {
        self.locks
            .lock()
            .await
            .entry(lid)
            .or_insert_with(|| Arc::new(CachedLock::new()))
            .clone()
    }

    async fn existing_lock_of(&self, lid: LockId) -> Option<Arc<CachedLock>> {
        self.locks.lock().await.get(&lid).cloned()
    }

    fn next_seq(&self) -> SeqNum {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }

    fn enqueue_release(self: &Arc<Self>, lid: LockId) {
        if self.closed.load(Ordering::SeqCst) {
            // releaser is gone after shutdown
            tokio::spawn(self.clone().release_to_server(lid));
            return;
        }
        if let Err(e) = self.tx_release.send(lid) {
            pf_error!("error enqueueing release of lock {}: {}", lid, e);
        }
    }

    /// Body of a detached acquire RPC task. On a grant the lock is claimed
    /// (`taken`) on behalf of the local caller that started the RPC.
    async fn acquire_from_server(
        self: Arc<Self>,
        lock: Arc<CachedLock>,
        lid: LockId,
        seq: SeqNum,
    ) -> Result<LockStatus, PaxlockError> {
        let reply =
            time::timeout(self.rpc_timeout(), self.server.acquire(&self.id, seq, lid))
                .await
                .map_err(PaxlockError::from)
                .and_then(|r| r);

        let mut slot = lock.slot.lock().await;
        debug_assert_eq!(slot.state, LockState::Acquiring);
        debug_assert_eq!(slot.acquire_seq, seq);
        match reply {
            Ok(LockStatus::Ok) => {
                slot.taken = true;
                if slot.revoke_deferred {
                    slot.revoke_deferred = false;
                    slot.state = LockState::Releasing;
                    self.enqueue_release(lid);
                } else {
                    slot.state = LockState::Locked;
                }
                pf_debug!("acquired lock {} from server (seq {})", lid, seq);
            }
            Ok(status) => {
                slot.state = LockState::None;
                slot.revoke_deferred = false;
                pf_trace!("acquire lock {} (seq {}) -> {:?}", lid, seq, status);
            }
            Err(ref e) => {
                slot.state = LockState::None;
                slot.revoke_deferred = false;
                pf_warn!("acquire lock {} (seq {}) failed: {}", lid, seq, e);
            }
        }
        lock.changed.notify_waiters();
        reply
    }

    /// Gives a lock back to the server once no local caller holds it.
    async fn release_to_server(self: Arc<Self>, lid: LockId) {
        let lock = match self.existing_lock_of(lid).await {
            Some(lock) => lock,
            None => return,
        };

        loop {
            let slot = lock.slot.lock().await;
            if slot.state != LockState::Releasing {
                return;
            }
            if !slot.taken {
                break;
            }
            let notified = lock.changed.notified();
            drop(slot);
            notified.await;
        }

        if let Some(user) = self.release_user.as_ref() {
            user.do_release(lid).await;
        }

        let seq = self.next_seq();
        let reply = time::timeout(
            self.rpc_timeout(),
            self.server.release(&self.id, seq, lid),
        )
        .await
        .map_err(PaxlockError::from)
        .and_then(|r| r);

        let mut slot = lock.slot.lock().await;
        match reply {
            Ok(LockStatus::Ok) | Ok(LockStatus::NoEnt) => {
                slot.state = LockState::None;
                pf_debug!("released lock {} to server (seq {})", lid, seq);
            }
            Ok(status) => {
                // definitely not processed; keep it cached until revoked again
                slot.state = LockState::Free;
                pf_warn!("release lock {} (seq {}) -> {:?}", lid, seq, status);
            }
            Err(e) => {
                // outcome unknown; try again later
                pf_warn!("release lock {} (seq {}) failed: {}", lid, seq, e);
                let backoff = self.config.unreachable_backoff_ms;
                let shared = self.clone();
                tokio::spawn(async move {
                    time::sleep(Duration::from_millis(backoff)).await;
                    shared.enqueue_release(lid);
                });
            }
        }
        lock.changed.notify_waiters();
    }

    /// Releaser thread function. Each lock is released by its own task, so a
    /// lock still held locally never delays the release of another.
    async fn releaser_thread(
        self: Arc<Self>,
        mut rx_release: mpsc::UnboundedReceiver<LockId>,
    ) {
        pf_debug!("releaser thread spawned");

        while let Some(lid) = rx_release.recv().await {
            tokio::spawn(self.clone().release_to_server(lid));
        }

        pf_debug!("releaser thread exitted");
    }
}

/// Acquire RPC in flight for a local caller. If the caller goes away before
/// learning the outcome, a grant claimed on its behalf is handed back to the
/// cache as FREE.
struct InFlightAcquire {
    lock: Arc<CachedLock>,
    handle: Option<JoinHandle<Result<LockStatus, PaxlockError>>>,
}

impl InFlightAcquire {
    async fn outcome(mut self) -> Result<LockStatus, PaxlockError> {
        let result = match self.handle.as_mut() {
            Some(handle) => handle.await,
            None => return logged_err!("acquire outcome already taken"),
        };
        self.handle = None;
        result?
    }
}

impl Drop for InFlightAcquire {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let lock = self.lock.clone();
            tokio::spawn(async move {
                if let Ok(Ok(LockStatus::Ok)) = handle.await {
                    let mut slot = lock.slot.lock().await;
                    slot.taken = false;
                    if slot.state == LockState::Locked {
                        slot.state = LockState::Free;
                    }
                    lock.changed.notify_waiters();
                }
            });
        }
    }
}

/// Client-side lock cache.
pub struct LockClientCache {
    shared: Arc<CacheShared>,

    /// Join handle of the releaser thread.
    releaser_handle: JoinHandle<()>,
}

impl LockClientCache {
    /// Creates a new lock cache for client `id` talking to `server`. Spawns
    /// the releaser thread.
    pub fn new_and_setup(
        id: &str,
        config: LockClientConfig,
        server: Arc<dyn LockServerApi>,
        release_user: Option<Arc<dyn LockReleaseUser>>,
    ) -> Self {
        let (tx_release, rx_release) = mpsc::unbounded_channel();
        let shared = Arc::new(CacheShared {
            id: id.into(),
            config,
            server,
            release_user,
            locks: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            tx_release,
            closed: AtomicBool::new(false),
        });
        let releaser_handle =
            tokio::spawn(shared.clone().releaser_thread(rx_release));

        LockClientCache {
            shared,
            releaser_handle,
        }
    }

    /// My client ID.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Current state of a lock.
    pub async fn state_of(&self, lid: LockId) -> LockState {
        match self.shared.existing_lock_of(lid).await {
            Some(lock) => lock.slot.lock().await.state,
            None => LockState::None,
        }
    }

    /// Acquires a lock for a local caller, blocking until granted. Returns
    /// `Ok(LockStatus::Ok)`; the caller must `release()` exactly once.
    /// Fails once the cache has been shut down.
    pub async fn acquire(&self, lid: LockId) -> Result<LockStatus, PaxlockError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return logged_err!("lock cache {} is shut down", self.shared.id);
        }
        let lock = self.shared.lock_of(lid).await;

        loop {
            let mut slot = lock.slot.lock().await;
            let state = slot.state;
            match state {
                LockState::Free => {
                    slot.state = LockState::Locked;
                    slot.taken = true;
                    pf_trace!("acquired cached lock {}", lid);
                    return Ok(LockStatus::Ok);
                }

                LockState::None => {
                    let seq = self.shared.next_seq();
                    slot.state = LockState::Acquiring;
                    slot.acquire_seq = seq;
                    slot.retried = false;
                    slot.revoke_deferred = false;
                    drop(slot);

                    let in_flight = InFlightAcquire {
                        lock: lock.clone(),
                        handle: Some(tokio::spawn(
                            self.shared.clone().acquire_from_server(
                                lock.clone(),
                                lid,
                                seq,
                            ),
                        )),
                    };
                    match in_flight.outcome().await {
                        Ok(LockStatus::Ok) => return Ok(LockStatus::Ok),
                        Ok(LockStatus::Retry) => self.wait_retry(&lock).await,
                        _ => {
                            time::sleep(Duration::from_millis(
                                self.shared.config.unreachable_backoff_ms,
                            ))
                            .await;
                        }
                    }
                }

                LockState::Locked
                | LockState::Acquiring
                | LockState::Releasing => {
                    let notified = lock.changed.notified();
                    drop(slot);
                    notified.await;
                }
            }
        }
    }

    /// Waits for a retry callback, or at most the re-poll interval.
    async fn wait_retry(&self, lock: &CachedLock) {
        let slot = lock.slot.lock().await;
        if slot.retried {
            return;
        }
        let notified = lock.retried.notified();
        drop(slot);

        let wait = Duration::from_millis(self.shared.config.retry_wait_ms);
        if time::timeout(wait, notified).await.is_err() {
            pf_debug!("no retry within {:?}, polling server again", wait);
        }
    }

    /// Like `acquire()`, but gives up after `dur` and returns
    /// `Ok(LockStatus::Retry)`.
    pub async fn acquire_timeout(
        &self,
        lid: LockId,
        dur: Duration,
    ) -> Result<LockStatus, PaxlockError> {
        match time::timeout(dur, self.acquire(lid)).await {
            Ok(result) => result,
            Err(_) => Ok(LockStatus::Retry),
        }
    }

    /// Releases a lock held by a local caller. The grant stays cached unless
    /// it has been revoked. Returns `Ok(LockStatus::NoEnt)` if not held.
    pub async fn release(&self, lid: LockId) -> Result<LockStatus, PaxlockError> {
        let lock = match self.shared.existing_lock_of(lid).await {
            Some(lock) => lock,
            None => return Ok(LockStatus::NoEnt),
        };
        let mut slot = lock.slot.lock().await;
        if !slot.taken {
            return Ok(LockStatus::NoEnt);
        }

        match slot.state {
            LockState::Locked => slot.state = LockState::Free,
            LockState::Releasing => {}
            state => {
                return logged_err!("lock {} taken in impossible state {:?}",
                                   lid, state);
            }
        }
        slot.taken = false;
        lock.changed.notify_waiters();
        pf_trace!("released lock {} locally", lid);
        Ok(LockStatus::Ok)
    }

    /// Handler of a revoke callback from the server.
    pub async fn revoke(&self, lid: LockId) {
        let lock = match self.shared.existing_lock_of(lid).await {
            Some(lock) => lock,
            None => return,
        };
        let mut slot = lock.slot.lock().await;
        match slot.state {
            LockState::Free | LockState::Locked => {
                slot.state = LockState::Releasing;
                self.shared.enqueue_release(lid);
                lock.changed.notify_waiters();
                pf_debug!("lock {} revoked", lid);
            }
            LockState::Acquiring => {
                slot.revoke_deferred = true;
                pf_debug!("lock {} revoked while acquiring", lid);
            }
            LockState::None | LockState::Releasing => {}
        }
    }

    /// Handler of a retry callback from the server.
    pub async fn retry(&self, lid: LockId) {
        let lock = self.shared.lock_of(lid).await;
        lock.slot.lock().await.retried = true;
        lock.retried.notify_waiters();
        pf_trace!("got retry for lock {}", lid);
    }

    /// Asks the server for its grant counter.
    pub async fn stat(&self, lid: LockId) -> Result<u64, PaxlockError> {
        time::timeout(
            self.shared.rpc_timeout(),
            self.shared.server.stat(&self.shared.id, lid),
        )
        .await?
    }

    /// Stops the releaser and gives every lock not held locally back to
    /// the server. Later acquires fail; locks still held locally go back to
    /// the server when revoked and released.
    pub async fn shutdown(&self) -> Result<(), PaxlockError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.releaser_handle.abort();

        let locks: Vec<(LockId, Arc<CachedLock>)> = self
            .shared
            .locks
            .lock()
            .await
            .iter()
            .map(|(&lid, lock)| (lid, lock.clone()))
            .collect();

        for (lid, lock) in locks {
            {
                let mut slot = lock.slot.lock().await;
                let idle = slot.state == LockState::Free
                    || (slot.state == LockState::Releasing && !slot.taken);
                if !idle {
                    continue;
                }
                slot.state = LockState::Releasing;
            }
            self.shared.clone().release_to_server(lid).await;
        }

        pf_info!("lock cache {} shut down", self.shared.id);
        Ok(())
    }
}

impl Drop for LockClientCache {
    fn drop(&mut self) {
        self.releaser_handle.abort();
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;
    use crate::rpc::LocalNet;
    use crate::server::{LockManager, LockManagerConfig, StaticPrimary};
    use std::sync::atomic::AtomicUsize;

    /// Flush hook that remembers what it flushed.
    #[derive(Default)]
    struct FlushRecorder(Mutex<Vec<LockId>>);

    #[async_trait]
    impl LockReleaseUser for FlushRecorder {
        async fn do_release(&self, lid: LockId) {
            self.0.lock().await.push(lid);
        }
    }

    /// Server wrapper that delays every acquire.
    struct SlowServer {
        inner: Arc<LockManager>,
        delay: Duration,
    }

    #[async_trait]
    impl LockServerApi for SlowServer {
        async fn acquire(
            &self,
            client: &str,
            seq: SeqNum,
            lid: LockId,
        ) -> Result<LockStatus, PaxlockError> {
            time::sleep(self.delay).await;
            self.inner.acquire(client, seq, lid).await
        }

        async fn release(
            &self,
            client: &str,
            seq: SeqNum,
            lid: LockId,
        ) -> Result<LockStatus, PaxlockError> {
            self.inner.release(client, seq, lid).await
        }

        async fn stat(
            &self,
            client: &str,
            lid: LockId,
        ) -> Result<u64, PaxlockError> {
            self.inner.stat(client, lid).await
        }
    }

    fn test_config() -> LockClientConfig {
        LockClientConfig {
            rpc_timeout_ms: 1000,
            retry_wait_ms: 5000,
            unreachable_backoff_ms: 20,
        }
    }

    fn setup_server() -> (Arc<LocalNet>, Arc<LockManager>) {
        let net = Arc::new(LocalNet::new());
        let manager = Arc::new(LockManager::new_and_setup(
            LockManagerConfig::default(),
            Arc::new(StaticPrimary(true)),
            net.clone(),
        ));
        (net, manager)
    }

    async fn new_cache(
        net: &Arc<LocalNet>,
        id: &str,
        server: Arc<dyn LockServerApi>,
        release_user: Option<Arc<dyn LockReleaseUser>>,
    ) -> Arc<LockClientCache> {
        let cache = Arc::new(LockClientCache::new_and_setup(
            id,
            test_config(),
            server,
            release_user,
        ));
        net.add_cache(&cache).await;
        cache
    }

    async fn wait_state(
        cache: &LockClientCache,
        lid: LockId,
        state: LockState,
    ) -> bool {
        for _ in 0..200 {
            if cache.state_of(lid).await == state {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn parse_client_config() -> Result<(), PaxlockError> {
        let config = LockClientConfig::parse(Some("retry_wait_ms = 100"))?;
        assert_eq!(config.retry_wait_ms, 100);
        assert_eq!(config.rpc_timeout_ms, 1000);
        assert!(LockClientConfig::parse(Some("retry_wait = 100")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cached_reacquire() -> Result<(), PaxlockError> {
        let (net, manager) = setup_server();
        let a = new_cache(&net, "a", manager.clone(), None).await;
        assert_eq!(a.acquire(1).await?, LockStatus::Ok);
        assert_eq!(a.state_of(1).await, LockState::Locked);
        assert_eq!(a.release(1).await?, LockStatus::Ok);
        assert_eq!(a.state_of(1).await, LockState::Free);
        assert_eq!(a.acquire(1).await?, LockStatus::Ok);
        assert_eq!(a.release(1).await?, LockStatus::Ok);
        assert_eq!(a.stat(1).await?, 1);
        assert_eq!(manager.owner_of(1).await, Some("a".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_unheld_noent() -> Result<(), PaxlockError> {
        let (net, manager) = setup_server();
        let a = new_cache(&net, "a", manager, None).await;
        assert_eq!(a.release(5).await?, LockStatus::NoEnt);
        a.acquire(5).await?;
        assert_eq!(a.release(5).await?, LockStatus::Ok);
        assert_eq!(a.release(5).await?, LockStatus::NoEnt);
        assert_eq!(a.state_of(5).await, LockState::Free);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn revoke_retry_round_trip() -> Result<(), PaxlockError> {
        let (net, manager) = setup_server();
        let flushed = Arc::new(FlushRecorder::default());
        let a = new_cache(&net, "a", manager.clone(), Some(flushed.clone())).await;
        let b = new_cache(&net, "b", manager.clone(), None).await;

        a.acquire(3).await?;
        a.release(3).await?;
        assert_eq!(a.state_of(3).await, LockState::Free);

        // much shorter than the re-poll interval, so the retry callback
        // must be what wakes b up
        assert_eq!(
            b.acquire_timeout(3, Duration::from_secs(2)).await?,
            LockStatus::Ok
        );
        assert!(wait_state(&a, 3, LockState::None).await);
        assert_eq!(manager.owner_of(3).await, Some("b".into()));
        assert_eq!(*flushed.0.lock().await, vec![3]);
        assert_eq!(a.release(3).await?, LockStatus::NoEnt);
        b.release(3).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn revoke_waits_for_holder() -> Result<(), PaxlockError> {
        let (net, manager) = setup_server();
        let a = new_cache(&net, "a", manager.clone(), None).await;
        let b = new_cache(&net, "b", manager.clone(), None).await;

        a.acquire(2).await?;
        let b_bg = b.clone();
        let waiter = tokio::spawn(async move { b_bg.acquire(2).await });
        assert!(wait_state(&a, 2, LockState::Releasing).await);
        time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(manager.owner_of(2).await, Some("a".into()));

        // a local acquire must not get the revoked lock back
        assert_eq!(
            a.acquire_timeout(2, Duration::from_millis(50)).await?,
            LockStatus::Retry
        );
        assert_eq!(a.release(2).await?, LockStatus::Ok);
        assert_eq!(waiter.await??, LockStatus::Ok);
        assert_eq!(manager.owner_of(2).await, Some("b".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mutual_exclusion_stress() -> Result<(), PaxlockError> {
        let (net, manager) = setup_server();
        let holders = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for c in 0..3 {
            let cache = new_cache(&net, &format!("c{}", c), manager.clone(), None)
                .await;
            // two local callers per client
            for _ in 0..2 {
                let cache = cache.clone();
                let holders = holders.clone();
                handles.push(tokio::spawn(async move {
                    for _ in 0..15 {
                        cache.acquire(9).await?;
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                        time::sleep(Duration::from_millis(1)).await;
                        holders.fetch_sub(1, Ordering::SeqCst);
                        cache.release(9).await?;
                    }
                    Ok::<(), PaxlockError>(())
                }));
            }
        }
        for handle in handles {
            time::timeout(Duration::from_secs(30), handle).await???;
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_timeout_leaves_no_trace() -> Result<(), PaxlockError> {
        let (net, manager) = setup_server();
        let a = new_cache(&net, "a", manager.clone(), None).await;
        let slow = Arc::new(SlowServer {
            inner: manager.clone(),
            delay: Duration::from_millis(200),
        });
        let b = new_cache(&net, "b", slow, None).await;

        // cancelled while the grant is in flight: it lands as FREE
        assert_eq!(
            b.acquire_timeout(4, Duration::from_millis(50)).await?,
            LockStatus::Retry
        );
        assert!(wait_state(&b, 4, LockState::Free).await);
        assert_eq!(manager.owner_of(4).await, Some("b".into()));
        assert_eq!(b.acquire(4).await?, LockStatus::Ok);
        b.release(4).await?;

        // cancelled while waiting for a retry
        a.acquire(5).await?;
        assert_eq!(
            b.acquire_timeout(5, Duration::from_millis(400)).await?,
            LockStatus::Retry
        );
        assert_eq!(b.state_of(5).await, LockState::None);
        a.release(5).await?;
        assert_eq!(b.acquire(5).await?, LockStatus::Ok);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn revoke_while_acquiring() -> Result<(), PaxlockError> {
        let (net, manager) = setup_server();
        let slow = Arc::new(SlowServer {
            inner: manager.clone(),
            delay: Duration::from_millis(100),
        });
        let a = new_cache(&net, "a", slow, None).await;
        let a_bg = a.clone();
        let acquirer = tokio::spawn(async move { a_bg.acquire(6).await });
        assert!(wait_state(&a, 6, LockState::Acquiring).await);
        a.revoke(6).await;

        // the caller still gets its grant once, then it goes back
        assert_eq!(acquirer.await??, LockStatus::Ok);
        assert_eq!(a.state_of(6).await, LockState::Releasing);
        assert_eq!(a.release(6).await?, LockStatus::Ok);
        assert!(wait_state(&a, 6, LockState::None).await);
        assert_eq!(manager.owner_of(6).await, None);
        Ok(())
    }

    /// Server wrapper whose first acquire reply is overtaken by the retry
    /// callback that follows it.
    struct RetryFirstServer {
        inner: Arc<LockManager>,
        cache: Mutex<Option<Arc<LockClientCache>>>,
        acquires: AtomicUsize,
    }

    #[async_trait]
    impl LockServerApi for RetryFirstServer {
        async fn acquire(
            &self,
            client: &str,
            seq: SeqNum,
            lid: LockId,
        ) -> Result<LockStatus, PaxlockError> {
            if self.acquires.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(cache) = self.cache.lock().await.as_ref() {
                    cache.retry(lid).await;
                }
                return Ok(LockStatus::Retry);
            }
            self.inner.acquire(client, seq, lid).await
        }

        async fn release(
            &self,
            client: &str,
            seq: SeqNum,
            lid: LockId,
        ) -> Result<LockStatus, PaxlockError> {
            self.inner.release(client, seq, lid).await
        }

        async fn stat(
            &self,
            client: &str,
            lid: LockId,
        ) -> Result<u64, PaxlockError> {
            self.inner.stat(client, lid).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retry_before_retry_reply() -> Result<(), PaxlockError> {
        let (net, manager) = setup_server();
        let server = Arc::new(RetryFirstServer {
            inner: manager.clone(),
            cache: Mutex::new(None),
            acquires: AtomicUsize::new(0),
        });
        let a = new_cache(&net, "a", server.clone(), None).await;
        *server.cache.lock().await = Some(a.clone());

        // retry_wait_ms is 5 s, so only the early retry can explain this
        assert_eq!(
            a.acquire_timeout(11, Duration::from_millis(500)).await?,
            LockStatus::Ok
        );
        assert_eq!(server.acquires.load(Ordering::SeqCst), 2);
        assert_eq!(manager.owner_of(11).await, Some("a".into()));
        a.release(11).await?;
        *server.cache.lock().await = None;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_returns_free_locks() -> Result<(), PaxlockError> {
        let (net, manager) = setup_server();
        let flushed = Arc::new(FlushRecorder::default());
        let a = new_cache(&net, "a", manager.clone(), Some(flushed.clone())).await;
        a.acquire(7).await?;
        a.release(7).await?;
        a.acquire(8).await?;
        a.shutdown().await?;
        assert_eq!(manager.owner_of(7).await, None);
        assert_eq!(manager.owner_of(8).await, Some("a".into()));
        assert_eq!(a.state_of(7).await, LockState::None);
        assert_eq!(*flushed.0.lock().await, vec![7]);

        // closed for new acquires, but a held lock still goes back
        assert!(a.acquire(7).await.is_err());
        a.revoke(8).await;
        assert_eq!(a.state_of(8).await, LockState::Releasing);
        assert_eq!(a.release(8).await?, LockStatus::Ok);
        assert!(wait_state(&a, 8, LockState::None).await);
        assert_eq!(manager.owner_of(8).await, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn server_down_backs_off() -> Result<(), PaxlockError> {
        let net = Arc::new(LocalNet::new());
        let backup = Arc::new(LockManager::new_and_setup(
            LockManagerConfig::default(),
            Arc::new(StaticPrimary(false)),
            net.clone(),
        ));
        let a = new_cache(&net, "a", backup, None).await;
        assert_eq!(
            a.acquire_timeout(1, Duration::from_millis(100)).await?,
            LockStatus::Retry
        );
        assert!(a.stat(1).await.is_err());
        Ok(())
    }
}
