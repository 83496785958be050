//! pipelined - pipeline orchestration controller.
//!
//! Library components for the controller daemon: the coordinator and its
//! runners, the trigger subsystem, the state backends, and the HTTP/RPC
//! servers.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod inline;
pub mod logs;
pub mod server;
pub mod spec;
pub mod state;
pub mod trigger;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use cluster::{Cluster, HttpCluster};
use config::{Config, StateBackend};
use coordinator::{Coordinator, CoordinatorConfig};
use server::http::AppState;
use server::rpc::RpcServer;
use state::{ensure_default_namespace, kv::KvState, memory::MemoryState, State};

/// Type alias for application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// The assembled controller process.
pub struct Daemon {
    config: Config,
    state: Arc<dyn State>,
    coordinator: Arc<Coordinator>,
    rpc: RpcServer,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("http_addr", &self.config.http_addr)
            .field("rpc_addr", &self.config.rpc_addr)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Wire up state, cluster client, coordinator, and servers.
    pub async fn new(config: Config) -> AppResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let cluster: Arc<dyn Cluster> = Arc::new(HttpCluster::new(
            config.cluster.addr.clone(),
            config.cluster.token.clone(),
        ));

        let state: Arc<dyn State> = match config.state.backend {
            StateBackend::Memory => Arc::new(MemoryState::new()),
            StateBackend::Cluster => {
                Arc::new(KvState::new(Arc::clone(&cluster), config.state.cache).await)
            }
        };

        ensure_default_namespace(state.as_ref())
            .await
            .map_err(|err| eyre::eyre!("failed to seed default namespace: {err}"))?;

        let coordinator = Coordinator::new(CoordinatorConfig {
            cluster,
            state: Arc::clone(&state),
            data_dir: config.data_dir.clone(),
            rpc_addr: config.advertised_rpc_addr().to_string(),
        });

        let rpc = RpcServer::bind(&config.rpc_addr, Arc::clone(&coordinator)).await?;

        Ok(Self {
            config,
            state,
            coordinator,
            rpc,
            shutdown: CancellationToken::new(),
        })
    }

    /// Run until [`Self::shutdown`] is called, then stop gracefully:
    /// triggers drain first, then the shutdown channel releases the
    /// monitor, then HTTP, then the RPC listener. In-flight runs on the
    /// cluster are left alone.
    pub async fn run(&self) -> AppResult<()> {
        info!(
            http_addr = %self.config.http_addr,
            rpc_addr = %self.config.rpc_addr,
            "pipelined starting"
        );

        self.coordinator.start().await?;
        self.rpc.start().await;

        let http_shutdown = CancellationToken::new();
        let http_handle = server::http::serve(
            &self.config.http_addr,
            Arc::new(AppState {
                coordinator: Arc::clone(&self.coordinator),
                state: Arc::clone(&self.state),
            }),
            http_shutdown.clone(),
        )
        .await?;

        self.shutdown.cancelled().await;

        info!("pipelined shutting down");
        self.coordinator.stop().await;
        http_shutdown.cancel();
        let _ = http_handle.await;
        self.rpc.stop().await;

        Ok(())
    }

    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> &Arc<dyn State> {
        &self.state
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}
