//! Paxlock lock server node executable.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{self, LevelFilter};
use paxlock::{
    logger_init, pf_error, pf_info, tcp_bind_with_retry, LockReplica,
    PaxlockError, RpcClient, RpcDispatcher, RpcServer, ServerConfig,
    StaticPrimary, ME,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My node address; must appear in `--nodes`.
    #[arg(short, long)]
    me: String,

    /// Addresses of all nodes in the Paxos group (e.g.,
    /// '-n host1:port -n host2:port').
    #[arg(short, long, required = true)]
    nodes: Vec<String>,

    /// Serve lock requests as the primary.
    #[arg(short, long)]
    primary: bool,

    /// Path to TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(bind_addr)` on success
    /// or `Err(PaxlockError)` on any error.
    fn sanitize(&self) -> Result<SocketAddr, PaxlockError> {
        let bind_addr: SocketAddr = self.me.parse().map_err(|e| {
            PaxlockError::msg(format!("invalid address '{}': {}", self.me, e))
        })?;

        let mut node_set = HashSet::new();
        for node in self.nodes.iter() {
            node.parse::<SocketAddr>().map_err(|e| {
                PaxlockError::msg(format!("invalid node '{}': {}", node, e))
            })?;
            if !node_set.insert(node) {
                return Err(PaxlockError::msg(format!(
                    "duplicate node address {} given",
                    node
                )));
            }
        }

        if !node_set.contains(&self.me) {
            Err(PaxlockError::msg(format!(
                "my address {} not among nodes",
                self.me
            )))
        } else if self.nodes.len() > u8::MAX as usize {
            Err(PaxlockError::msg(format!(
                "too many nodes {}",
                self.nodes.len()
            )))
        } else if self.threads < 2 {
            Err(PaxlockError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(bind_addr)
        }
    }
}

/// Actual main function of paxlock server node.
fn server_main() -> Result<(), PaxlockError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let bind_addr = args.sanitize()?;
    let _ = ME.set(args.me.clone());

    // read in and parse config file, if given
    let config_str = match args.config.as_ref() {
        Some(path) => Some(fs::read_to_string(path)?),
        None => None,
    };
    let config = ServerConfig::parse(config_str.as_deref())?;

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-server")
            .build()?;

        // enter tokio runtime, set up the replica and its RPC server, then
        // serve until terminated
        runtime.block_on(async move {
            let listener = tcp_bind_with_retry(bind_addr, 10).await?;
            let transport = Arc::new(RpcClient::new(Duration::from_millis(
                config.proposer.rpc_timeout_ms,
            )));

            let replica = Arc::new(
                LockReplica::new_and_setup(
                    &args.me,
                    args.nodes.clone(),
                    config,
                    Arc::new(StaticPrimary(args.primary)),
                    transport.clone(),
                    transport,
                )
                .await?,
            );
            let dispatcher = RpcDispatcher::new()
                .with_acceptor(replica.acceptor())
                .with_lock_service(replica.clone());
            let _server = RpcServer::new_and_setup(listener, Arc::new(dispatcher))?;
            pf_info!("serving as {} of [{}]",
                     if args.primary { "primary" } else { "backup" },
                     args.nodes.join(","));

            rx_term.changed().await.map_err(PaxlockError::msg)?;
            pf_info!("server terminated");

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), PaxlockError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of paxlock server node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
