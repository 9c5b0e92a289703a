//! Paxlock lock client driver: repeatedly acquires and releases one lock
//! through a client lock cache and reports acquire latency.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{self, LevelFilter};
use paxlock::{
    logged_err, logger_init, pf_error, pf_info, pf_warn, tcp_bind_with_retry,
    LockClientCache, LockClientConfig, LockStatus, PaxlockError,
    RemoteLockServer, RpcClient, RpcDispatcher, RpcServer, ME,
};
use rand::Rng;
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::{self, Instant};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Lock server (primary) address.
    #[arg(short, long)]
    server: String,

    /// Local address to receive revoke/retry callbacks on. Port 0 picks a
    /// free port.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: String,

    /// Lock ID to contend on.
    #[arg(short, long, default_value_t = 1)]
    lock: u64,

    /// Number of acquire-hold-release rounds.
    #[arg(short, long, default_value_t = 10)]
    rounds: u32,

    /// Mean time to hold the lock per round in millisecs.
    #[arg(long, default_value_t = 10)]
    hold_ms: u64,

    /// Path to TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(bind_addr)` on success
    /// or `Err(PaxlockError)` on any error.
    fn sanitize(&self) -> Result<SocketAddr, PaxlockError> {
        self.server.parse::<SocketAddr>().map_err(|e| {
            PaxlockError::msg(format!("invalid server '{}': {}", self.server, e))
        })?;
        let bind_addr: SocketAddr = self.bind.parse().map_err(|e| {
            PaxlockError::msg(format!("invalid bind '{}': {}", self.bind, e))
        })?;

        if self.rounds == 0 {
            Err(PaxlockError::msg("number of rounds must be positive"))
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

/// Runs the acquire-hold-release rounds until done or terminated. Returns
/// the acquire latencies observed.
async fn drive_rounds(
    cache: &LockClientCache,
    args: &CliArgs,
    rx_term: &mut watch::Receiver<bool>,
) -> Result<Vec<Duration>, PaxlockError> {
    let mut latencies = Vec::with_capacity(args.rounds as usize);

    for round in 0..args.rounds {
        if *rx_term.borrow() {
            pf_warn!("terminated after {} rounds", round);
            break;
        }

        let start = Instant::now();
        let status = cache.acquire(args.lock).await?;
        if status != LockStatus::Ok {
            return logged_err!("acquire of lock {} got {:?}", args.lock, status);
        }
        latencies.push(start.elapsed());

        let hold = if args.hold_ms > 0 {
            rand::thread_rng().gen_range(args.hold_ms / 2..=args.hold_ms * 3 / 2)
        } else {
            0
        };
        time::sleep(Duration::from_millis(hold)).await;

        let status = cache.release(args.lock).await?;
        if status != LockStatus::Ok {
            return logged_err!("release of lock {} got {:?}", args.lock, status);
        }
    }

    Ok(latencies)
}

/// Actual main function of paxlock client driver.
fn client_main() -> Result<(), PaxlockError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let bind_addr = args.sanitize()?;

    // read in and parse config file, if given
    let config_str = match args.config.as_ref() {
        Some(path) => Some(fs::read_to_string(path)?),
        None => None,
    };
    let config = LockClientConfig::parse(config_str.as_deref())?;

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
            .thread_name("tokio-worker-client")
            .build()?;

        runtime.block_on(async move {
            // the callback listener's address doubles as my client ID
            let listener = tcp_bind_with_retry(bind_addr, 3).await?;
            let id = listener.local_addr()?.to_string();
            let _ = ME.set(id.clone());

            let rpc = RpcClient::new(Duration::from_millis(config.rpc_timeout_ms));
            let server = Arc::new(RemoteLockServer::new(&args.server, rpc));
            let cache = Arc::new(LockClientCache::new_and_setup(
                &id, config, server, None,
            ));
            let dispatcher = RpcDispatcher::new().with_cache(cache.clone());
            let _callbacks =
                RpcServer::new_and_setup(listener, Arc::new(dispatcher))?;

            let latencies = drive_rounds(&cache, &args, &mut rx_term).await?;
            if !latencies.is_empty() {
                let total: Duration = latencies.iter().sum();
                let max = latencies.iter().max().copied().unwrap_or_default();
                pf_info!("{} rounds on lock {}: avg acquire {:.2} ms, max {:.2} ms",
                         latencies.len(), args.lock,
                         total.as_secs_f64() * 1000.0 / latencies.len() as f64,
                         max.as_secs_f64() * 1000.0);
            }
            match cache.stat(args.lock).await {
                Ok(grants) => pf_info!("server granted lock {} {} times",
                                       args.lock, grants),
                Err(e) => pf_warn!("stat of lock {} failed: {}", args.lock, e),
            }

            cache.shutdown().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), PaxlockError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of paxlock client driver.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
