//! TCP RPC transport: a listener that serves framed requests through an
//! `RpcHandler`, and a per-call client implementing the Paxos, lock service,
//! and lock callback transport traits.

use std::net::SocketAddr;
use std::sync::Arc;

use super::messages::{read_frame, write_frame, RpcReply, RpcRequest};
use crate::client::LockClientCache;
use crate::paxos::{
    Acceptor, Ballot, Instance, PaxosTransport, PrepareReply,
};
use crate::server::{
    LockClientApi, LockId, LockServerApi, LockStatus, SeqNum,
};
use crate::utils::PaxlockError;

use async_trait::async_trait;

use bytes::BytesMut;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Serves one decoded request.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, req: RpcRequest) -> RpcReply;
}

/// Routes requests to whichever components this node hosts.
#[derive(Default)]
pub struct RpcDispatcher {
    acceptor: Option<Arc<Acceptor>>,
    lock_service: Option<Arc<dyn LockServerApi>>,
    cache: Option<Arc<LockClientCache>>,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_acceptor(mut self, acceptor: Arc<Acceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_lock_service(mut self, service: Arc<dyn LockServerApi>) -> Self {
        self.lock_service = Some(service);
        self
    }

    pub fn with_cache(mut self, cache: Arc<LockClientCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn acceptor(&self) -> Result<&Acceptor, PaxlockError> {
        self.acceptor
            .as_deref()
            .ok_or_else(|| PaxlockError::msg("no acceptor on this node"))
    }

    fn lock_service(&self) -> Result<&dyn LockServerApi, PaxlockError> {
        self.lock_service
            .as_deref()
            .ok_or_else(|| PaxlockError::msg("no lock service on this node"))
    }

    fn cache(&self, client: &str) -> Result<&LockClientCache, PaxlockError> {
        match self.cache.as_deref() {
            Some(cache) if cache.id() == client => Ok(cache),
            Some(cache) => Err(PaxlockError(format!(
                "callback for {} reached {}",
                client,
                cache.id()
            ))),
            None => Err(PaxlockError::msg("no lock cache on this node")),
        }
    }

    async fn dispatch(&self, req: RpcRequest) -> Result<RpcReply, PaxlockError> {
        Ok(match req {
            RpcRequest::Prepare {
                src,
                instance,
                ballot,
            } => RpcReply::Prepare(
                self.acceptor()?.prepare(&src, instance, ballot).await?,
            ),
            RpcRequest::Accept {
                src,
                instance,
                ballot,
                value,
            } => RpcReply::Accept(
                self.acceptor()?.accept(&src, instance, ballot, value).await?,
            ),
            RpcRequest::Decide {
                src,
                instance,
                value,
            } => {
                self.acceptor()?.decide(&src, instance, value).await?;
                RpcReply::Decide
            }
            RpcRequest::LockAcquire { client, seq, lid } => RpcReply::Lock(
                self.lock_service()?.acquire(&client, seq, lid).await?,
            ),
            RpcRequest::LockRelease { client, seq, lid } => RpcReply::Lock(
                self.lock_service()?.release(&client, seq, lid).await?,
            ),
            RpcRequest::LockStat { client, lid } => {
                RpcReply::Stat(self.lock_service()?.stat(&client, lid).await?)
            }
            RpcRequest::Revoke { client, lid } => {
                self.cache(&client)?.revoke(lid).await;
                RpcReply::Ack
            }
            RpcRequest::Retry { client, lid } => {
                self.cache(&client)?.retry(lid).await;
                RpcReply::Ack
            }
        })
    }
}

#[async_trait]
impl RpcHandler for RpcDispatcher {
    async fn handle(&self, req: RpcRequest) -> RpcReply {
        match self.dispatch(req).await {
            Ok(reply) => reply,
            Err(e) => {
                pf_debug!("request failed: {}", e);
                RpcReply::Error(e.to_string())
            }
        }
    }
}

/// Binds a TCP listener on `bind_addr`, retrying a few times.
pub async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, PaxlockError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;

        let attempt = socket.bind(bind_addr).and_then(|_| socket.listen(1024));
        match attempt {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                if retries == 0 {
                    return logged_err!("binding {} failed: {}", bind_addr, e);
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// RPC server: accepts connections and serves requests on them one at a time
/// per connection.
pub struct RpcServer {
    /// Address the listener is bound to.
    local_addr: SocketAddr,

    /// Join handle of the listener thread.
    listener_handle: JoinHandle<()>,
}

impl RpcServer {
    /// Starts serving on an already bound listener. Spawns the listener
    /// thread.
    pub fn new_and_setup(
        listener: TcpListener,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<Self, PaxlockError> {
        let local_addr = listener.local_addr()?;
        let listener_handle =
            tokio::spawn(Self::listener_thread(listener, handler));
        pf_info!("rpc server listening on {}", local_addr);

        Ok(RpcServer {
            local_addr,
            listener_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Listener thread function.
    async fn listener_thread(listener: TcpListener, handler: Arc<dyn RpcHandler>) {
        pf_debug!("listener thread spawned");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(Self::connection_thread(
                        stream,
                        peer,
                        handler.clone(),
                    ));
                }
                Err(e) => pf_warn!("error accepting connection: {}", e),
            }
        }
    }

    /// Per-connection thread function.
    async fn connection_thread(
        mut stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn RpcHandler>,
    ) {
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        loop {
            let req: RpcRequest = match read_frame(&mut stream, &mut read_buf).await {
                Ok(req) => req,
                Err(e) => {
                    pf_trace!("connection from {} ended: {}", peer, e);
                    break;
                }
            };
            let reply = handler.handle(req).await;
            if let Err(e) = write_frame(&mut stream, &reply).await {
                pf_warn!("error replying to {}: {}", peer, e);
                break;
            }
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.listener_handle.abort();
    }
}

/// RPC client that opens one connection per call.
#[derive(Debug, Clone)]
pub struct RpcClient {
    /// Bound on connect + request + reply.
    timeout: Duration,
}

impl RpcClient {
    pub fn new(timeout: Duration) -> Self {
        RpcClient { timeout }
    }

    /// Sends `req` to `addr` and waits for the reply.
    pub async fn call(
        &self,
        addr: &str,
        req: RpcRequest,
    ) -> Result<RpcReply, PaxlockError> {
        time::timeout(self.timeout, async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            write_frame(&mut stream, &req).await?;
            let mut read_buf = BytesMut::new();
            read_frame::<RpcReply, _>(&mut stream, &mut read_buf).await
        })
        .await?
    }
}

#[async_trait]
impl PaxosTransport for RpcClient {
    async fn prepare(
        &self,
        node: &str,
        src: &str,
        instance: Instance,
        ballot: Ballot,
    ) -> Result<PrepareReply, PaxlockError> {
        let req = RpcRequest::Prepare {
            src: src.into(),
            instance,
            ballot,
        };
        match self.call(node, req).await? {
            RpcReply::Prepare(reply) => Ok(reply),
            reply => Err(reply.into_error()),
        }
    }

    async fn accept(
        &self,
        node: &str,
        src: &str,
        instance: Instance,
        ballot: Ballot,
        value: String,
    ) -> Result<bool, PaxlockError> {
        let req = RpcRequest::Accept {
            src: src.into(),
            instance,
            ballot,
            value,
        };
        match self.call(node, req).await? {
            RpcReply::Accept(accepted) => Ok(accepted),
            reply => Err(reply.into_error()),
        }
    }

    async fn decide(
        &self,
        node: &str,
        src: &str,
        instance: Instance,
        value: String,
    ) -> Result<(), PaxlockError> {
        let req = RpcRequest::Decide {
            src: src.into(),
            instance,
            value,
        };
        match self.call(node, req).await? {
            RpcReply::Decide => Ok(()),
            reply => Err(reply.into_error()),
        }
    }
}

#[async_trait]
impl LockClientApi for RpcClient {
    async fn revoke(&self, client: &str, lid: LockId) -> Result<(), PaxlockError> {
        let req = RpcRequest::Revoke {
            client: client.into(),
            lid,
        };
        match self.call(client, req).await? {
            RpcReply::Ack => Ok(()),
            reply => Err(reply.into_error()),
        }
    }

    async fn retry(&self, client: &str, lid: LockId) -> Result<(), PaxlockError> {
        let req = RpcRequest::Retry {
            client: client.into(),
            lid,
        };
        match self.call(client, req).await? {
            RpcReply::Ack => Ok(()),
            reply => Err(reply.into_error()),
        }
    }
}

/// Lock service at a remote address.
#[derive(Debug, Clone)]
pub struct RemoteLockServer {
    addr: String,
    client: RpcClient,
}

impl RemoteLockServer {
    pub fn new(addr: &str, client: RpcClient) -> Self {
        RemoteLockServer {
            addr: addr.into(),
            client,
        }
    }
}

#[async_trait]
impl LockServerApi for RemoteLockServer {
    async fn acquire(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError> {
        let req = RpcRequest::LockAcquire {
            client: client.into(),
            seq,
            lid,
        };
        match self.client.call(&self.addr, req).await? {
            RpcReply::Lock(status) => Ok(status),
            reply => Err(reply.into_error()),
        }
    }

    async fn release(
        &self,
        client: &str,
        seq: SeqNum,
        lid: LockId,
    ) -> Result<LockStatus, PaxlockError> {
        let req = RpcRequest::LockRelease {
            client: client.into(),
            seq,
            lid,
        };
        match self.client.call(&self.addr, req).await? {
            RpcReply::Lock(status) => Ok(status),
            reply => Err(reply.into_error()),
        }
    }

    async fn stat(&self, client: &str, lid: LockId) -> Result<u64, PaxlockError> {
        let req = RpcRequest::LockStat {
            client: client.into(),
            lid,
        };
        match self.client.call(&self.addr, req).await? {
            RpcReply::Stat(count) => Ok(count),
            reply => Err(reply.into_error()),
        }
    }
}

#[cfg(test)]
mod tcp_tests {
    use super::*;
    use crate::client::LockClientConfig;
    use crate::paxos::test_utils::fresh_config;
    use crate::paxos::{NodeId, Proposer, ProposerConfig};
    use crate::server::{LockManager, LockManagerConfig, StaticPrimary};

    async fn local_listener() -> Result<TcpListener, PaxlockError> {
        tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await
    }

    fn rpc_client() -> RpcClient {
        RpcClient::new(Duration::from_millis(1000))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn paxos_over_tcp() -> Result<(), PaxlockError> {
        let mut listeners = vec![];
        let mut nodes: Vec<NodeId> = vec![];
        for _ in 0..3 {
            let listener = local_listener().await?;
            nodes.push(listener.local_addr()?.to_string());
            listeners.push(listener);
        }

        // third node never serves
        drop(listeners.pop());

        let mut listeners = listeners.into_iter();
        let mut acceptors = vec![];
        let mut servers = vec![];
        for i in 0..3 {
            let acc = Arc::new(
                Acceptor::new_and_setup(
                    &nodes[i],
                    fresh_config(&format!("tcp-paxos-{}", i)).await?,
                    None,
                    None,
                )
                .await?,
            );
            if let Some(listener) = listeners.next() {
                let dispatcher = RpcDispatcher::new().with_acceptor(acc.clone());
                servers.push(RpcServer::new_and_setup(
                    listener,
                    Arc::new(dispatcher),
                )?);
            }
            acceptors.push(acc);
        }

        let proposer = Proposer::new(
            &nodes[0],
            ProposerConfig::default(),
            acceptors[0].clone(),
            Arc::new(rpc_client()),
        );
        assert!(proposer.run(1, &nodes, "v1").await?);
        assert_eq!(acceptors[0].value(1).await, Some("v1".into()));
        assert_eq!(acceptors[1].value(1).await, Some("v1".into()));
        assert_eq!(acceptors[2].value(1).await, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_component_errors() -> Result<(), PaxlockError> {
        let listener = local_listener().await?;
        let addr = listener.local_addr()?.to_string();
        let _server =
            RpcServer::new_and_setup(listener, Arc::new(RpcDispatcher::new()))?;
        let client = rpc_client();
        let ballot = Ballot {
            round: 1,
            proposer: "p".into(),
        };
        assert!(client.prepare(&addr, "p", 1, ballot).await.is_err());
        assert!(client.revoke(&addr, 1).await.is_err());
        let remote = RemoteLockServer::new(&addr, client);
        assert!(remote.acquire("c", 1, 1).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_node_errors() -> Result<(), PaxlockError> {
        let listener = local_listener().await?;
        let addr = listener.local_addr()?.to_string();
        drop(listener);
        let req = RpcRequest::LockStat {
            client: "c".into(),
            lid: 1,
        };
        assert!(rpc_client().call(&addr, req).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lock_round_trip_over_tcp() -> Result<(), PaxlockError> {
        let server_listener = local_listener().await?;
        let server_addr = server_listener.local_addr()?.to_string();
        let manager = Arc::new(LockManager::new_and_setup(
            LockManagerConfig::default(),
            Arc::new(StaticPrimary(true)),
            Arc::new(rpc_client()),
        ));
        let _server = RpcServer::new_and_setup(
            server_listener,
            Arc::new(RpcDispatcher::new().with_lock_service(manager.clone())),
        )?;

        let mut caches = vec![];
        let mut client_servers = vec![];
        for _ in 0..2 {
            let listener = local_listener().await?;
            let id = listener.local_addr()?.to_string();
            let cache = Arc::new(LockClientCache::new_and_setup(
                &id,
                LockClientConfig {
                    retry_wait_ms: 5000,
                    ..Default::default()
                },
                Arc::new(RemoteLockServer::new(&server_addr, rpc_client())),
                None,
            ));
            client_servers.push(RpcServer::new_and_setup(
                listener,
                Arc::new(RpcDispatcher::new().with_cache(cache.clone())),
            )?);
            caches.push(cache);
        }

        assert_eq!(caches[0].acquire(1).await?, LockStatus::Ok);
        assert_eq!(caches[0].release(1).await?, LockStatus::Ok);
        assert_eq!(
            caches[1].acquire_timeout(1, Duration::from_secs(3)).await?,
            LockStatus::Ok
        );
        assert_eq!(manager.owner_of(1).await, Some(caches[1].id().into()));
        assert_eq!(caches[1].stat(1).await?, 2);
        caches[1].release(1).await?;
        caches[1].shutdown().await?;
        assert_eq!(manager.owner_of(1).await, None);
        Ok(())
    }
}
