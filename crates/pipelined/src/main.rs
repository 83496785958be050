//! pipelined - pipeline orchestration controller daemon.
//!
//! Entry point: argument parsing, logging setup, and signal handling.

use std::path::PathBuf;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use pipelined::config::{Config, StateBackend};
use pipelined::Daemon;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "pipelined", about = "Pipeline orchestration controller")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long, env = "PIPELINED_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP API bind address.
    #[arg(long, env = "PIPELINED_HTTP_ADDR")]
    http_addr: Option<String>,

    /// Runner RPC bind address.
    #[arg(long, env = "PIPELINED_RPC_ADDR")]
    rpc_addr: Option<String>,

    /// RPC address advertised to runner containers.
    #[arg(long, env = "PIPELINED_RPC_ADVERTISE_ADDR")]
    rpc_advertise_addr: Option<String>,

    /// Root data directory for run logs.
    #[arg(long, env = "PIPELINED_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Cluster scheduler API base URL.
    #[arg(long, env = "PIPELINED_CLUSTER_ADDR")]
    cluster_addr: Option<String>,

    /// State backend: memory or cluster.
    #[arg(long, env = "PIPELINED_STATE_BACKEND", value_parser = parse_backend)]
    state_backend: Option<StateBackend>,

    /// Enable the local read cache for the cluster state backend.
    #[arg(long, env = "PIPELINED_STATE_CACHE")]
    state_cache: Option<bool>,
}

fn parse_backend(value: &str) -> Result<StateBackend, String> {
    match value {
        "memory" => Ok(StateBackend::Memory),
        "cluster" => Ok(StateBackend::Cluster),
        other => Err(format!("state backend must be 'memory' or 'cluster', got {other:?}")),
    }
}

impl Args {
    /// Flags win over the config file, which wins over defaults.
    fn into_config(self) -> Result<Config, pipelined::config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(http_addr) = self.http_addr {
            config.http_addr = http_addr;
        }
        if let Some(rpc_addr) = self.rpc_addr {
            config.rpc_addr = rpc_addr;
        }
        if let Some(advertise) = self.rpc_advertise_addr {
            config.rpc_advertise_addr = Some(advertise);
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(cluster_addr) = self.cluster_addr {
            config.cluster.addr = cluster_addr;
        }
        if let Some(backend) = self.state_backend {
            config.state.backend = backend;
        }
        if let Some(cache) = self.state_cache {
            config.state.cache = cache;
        }

        Ok(config)
    }
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                let run = daemon.run();
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => {
                        if let Err(err) = result {
                            error!("daemon error: {err}");
                        }
                    }
                    () = wait_for_shutdown_signal() => {
                        daemon.shutdown();
                        if let Err(err) = run.await {
                            error!("daemon error: {err}");
                        }
                    }
                }
            }
            Err(err) => {
                error!("failed to initialize daemon: {err}");
                std::process::exit(1);
            }
        }
    });
}

/// Wait for SIGINT or SIGTERM. SIGHUP is reserved for config reload and
/// currently ignored.
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    async fn recv(stream: &mut Option<Signal>) {
        match stream {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sighup = signal(SignalKind::hangup()).ok();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                return;
            }
            () = recv(&mut sigterm) => {
                info!("received SIGTERM");
                return;
            }
            () = recv(&mut sighup) => {
                info!("received SIGHUP; reload is not implemented, ignoring");
            }
        }
    }
}
