//! Run lifecycle coordination.
//!
//! The coordinator resolves flows, mints run ids, dispatches to the
//! inline or specification runner, reconciles runner updates into the
//! state backend, and owns cancellation. It is the only writer of run
//! state for the runs it manages.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use axum::http::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use futures_util::stream::Stream;
use pipeline_core::rpc::LogType;
use pipeline_core::{
    generate_variables_map, FlowKind, JsonMap, Run, RunContext, RunId, Trigger, VariableError,
};

use crate::cluster::{Cluster, ClusterError};
use crate::inline::{InlineError, InlineRunner, InlineRunnerRequest};
use crate::logs::LogStore;
use crate::spec::{SpecError, SpecRunner, SpecRunnerRequest};
use crate::state::{State, StateError};
use crate::trigger::{self, RunFlowFn, TriggerError};

/// Capacity of the inline start-failure channel. Senders never block;
/// a dropped notification is reconciled by a later status query.
const START_FAILURE_BUFFER: usize = 10;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Variables(#[from] VariableError),
    #[error("failed to determine flow type")]
    UnknownFlowKind,
    #[error("unknown run type")]
    UnknownRunKind,
    #[error("{0} runner not found")]
    RunnerNotFound(&'static str),
    #[error("failed to start inline runner: {0}")]
    Inline(#[from] InlineError),
    #[error("failed to start spec runner: {0}")]
    Spec(#[from] SpecError),
    #[error("failed to cancel run: {0}")]
    Cancel(#[source] ClusterError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error("log read failed: {0}")]
    Logs(#[from] std::io::Error),
}

impl CoordinatorError {
    /// The HTTP status this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::State(err) => err.code(),
            Self::Variables(_) | Self::UnknownFlowKind | Self::Trigger(_) => 400,
            Self::Logs(err) if err.kind() == std::io::ErrorKind::NotFound => 404,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Registry key for inline runners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub namespace: String,
    pub id: RunId,
}

pub struct CoordinatorConfig {
    pub cluster: Arc<dyn Cluster>,
    pub state: Arc<dyn State>,
    /// Root data directory; run logs live under `<data_dir>/runs`.
    pub data_dir: PathBuf,
    /// RPC address advertised to in-container runners.
    pub rpc_addr: String,
}

pub struct Coordinator {
    cluster: Arc<dyn Cluster>,
    state: Arc<dyn State>,
    log_store: LogStore,
    rpc_addr: String,

    inline_runners: RwLock<HashMap<RunKey, Arc<InlineRunner>>>,
    spec_runners: RwLock<HashMap<RunId, Arc<SpecRunner>>>,

    start_failure_tx: mpsc::Sender<RunKey>,
    start_failure_rx: Mutex<Option<mpsc::Receiver<RunKey>>>,

    triggers: trigger::Handler,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("rpc_addr", &self.rpc_addr)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let (start_failure_tx, start_failure_rx) = mpsc::channel(START_FAILURE_BUFFER);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let triggers = trigger::Handler::new(Arc::clone(&config.state), run_flow_fn(weak.clone()));

            Self {
                cluster: config.cluster,
                state: config.state,
                log_store: LogStore::new(config.data_dir.join("runs")),
                rpc_addr: config.rpc_addr,
                inline_runners: RwLock::new(HashMap::new()),
                spec_runners: RwLock::new(HashMap::new()),
                start_failure_tx,
                start_failure_rx: Mutex::new(Some(start_failure_rx)),
                triggers,
                shutdown: CancellationToken::new(),
            }
        })
    }

    /// Start the trigger subsystem and the inline start-failure monitor.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.triggers.start().await?;

        if let Some(mut rx) = self.start_failure_rx.lock().await.take() {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                info!("starting inline start failure monitor");
                loop {
                    tokio::select! {
                        () = coordinator.shutdown.cancelled() => return,
                        key = rx.recv() => match key {
                            Some(key) => {
                                let coordinator = Arc::clone(&coordinator);
                                tokio::spawn(async move {
                                    coordinator.handle_inline_start_failure(key).await;
                                });
                            }
                            None => return,
                        },
                    }
                }
            });
        }

        Ok(())
    }

    /// Stop in-process orchestration. The trigger loop drains first, then
    /// the shutdown channel releases the monitor. In-flight runners keep
    /// going on the cluster.
    pub async fn stop(&self) {
        self.triggers.stop().await;
        self.shutdown.cancel();
    }

    // --- Run lifecycle ---

    /// Resolve the flow, merge variables, create the run record, and hand
    /// the run to the matching runner. Returns the freshly issued run id.
    pub async fn run_flow(
        &self,
        flow_id: &str,
        namespace: &str,
        trigger: &str,
        vars: JsonMap,
    ) -> Result<RunId> {
        let flow = self.state.flow_get(namespace, flow_id).await?;
        let run_vars = generate_variables_map(&flow, &vars)?;
        let run_id = RunId::new();

        match flow.kind() {
            Some(FlowKind::Inline) => {
                self.run_inline_flow(run_id.clone(), flow, trigger, run_vars)
                    .await?;
            }
            Some(FlowKind::Specification) => {
                self.run_spec_flow(run_id.clone(), flow, trigger, run_vars)
                    .await?;
            }
            None => return Err(CoordinatorError::UnknownFlowKind),
        }

        Ok(run_id)
    }

    async fn run_inline_flow(
        &self,
        run_id: RunId,
        flow: pipeline_core::Flow,
        trigger: &str,
        run_vars: JsonMap,
    ) -> Result<()> {
        let request = InlineRunnerRequest {
            cluster: Arc::clone(&self.cluster),
            run_id: run_id.clone(),
            flow: flow.clone(),
            variables: run_vars.clone(),
            rpc_addr: self.rpc_addr.clone(),
        };
        let runner = Arc::new(InlineRunner::new(&request, &self.log_store)?);

        let context = RunContext::new(run_id.clone(), trigger, &flow, run_vars);
        self.state.run_create(&context.run()).await?;

        runner.start(self.start_failure_tx.clone()).await?;

        let key = RunKey {
            namespace: flow.namespace.clone(),
            id: run_id,
        };
        self.inline_runners.write().await.insert(key, runner);
        Ok(())
    }

    async fn run_spec_flow(
        &self,
        run_id: RunId,
        flow: pipeline_core::Flow,
        trigger: &str,
        run_vars: JsonMap,
    ) -> Result<()> {
        let (update_tx, mut update_rx) = mpsc::channel(1);

        let runner = Arc::new(SpecRunner::new(SpecRunnerRequest {
            cluster: Arc::clone(&self.cluster),
            run_id: run_id.clone(),
            flow,
            trigger: trigger.to_string(),
            variables: run_vars,
            update_tx,
        }));

        if let Some(run) = runner.initial_run().await {
            self.state.run_create(&run).await?;
        }

        runner.start().await?;
        self.spec_runners
            .write()
            .await
            .insert(run_id.clone(), Arc::clone(&runner));

        // Per-run update drainer: the runner is the only producer and the
        // channel closes when its loop ends, so no update is lost.
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                if let Err(err) = state.run_update(&update).await {
                    error!(
                        run_id = %update.id,
                        error = %err,
                        "failed to update run status"
                    );
                }
            }
        });

        Ok(())
    }

    /// Cancel a run: delegate to its registered runner, then mark the
    /// stored run document cancelled.
    pub async fn cancel_run(&self, run_id: &RunId, namespace: &str) -> Result<()> {
        let mut run = self.state.run_get(namespace, run_id).await?;

        match run.kind() {
            Some(FlowKind::Inline) => {
                let runners = self.inline_runners.read().await;
                let runner = runners
                    .get(&RunKey {
                        namespace: namespace.to_string(),
                        id: run_id.clone(),
                    })
                    .ok_or(CoordinatorError::RunnerNotFound("inline"))?;
                runner.cancel().await.map_err(|err| match err {
                    InlineError::Cluster(cluster) => CoordinatorError::Cancel(cluster),
                    other => CoordinatorError::Inline(other),
                })?;
            }
            Some(FlowKind::Specification) => {
                let runners = self.spec_runners.read().await;
                let runner = runners
                    .get(run_id)
                    .ok_or(CoordinatorError::RunnerNotFound("spec"))?;
                runner.cancel().await.map_err(|err| match err {
                    SpecError::Cluster(cluster) => CoordinatorError::Cancel(cluster),
                    other => CoordinatorError::Spec(other),
                })?;
            }
            None => return Err(CoordinatorError::UnknownRunKind),
        }

        run.mark_cancelled();
        self.state.run_update(&run).await?;
        Ok(())
    }

    async fn handle_inline_start_failure(&self, key: RunKey) {
        let run = match self.state.run_get(&key.namespace, &key.id).await {
            Ok(run) => run,
            Err(err) => {
                error!(
                    run_id = %key.id,
                    namespace = %key.namespace,
                    error = %err,
                    "failed to query state for inline start failure"
                );
                return;
            }
        };

        let mut run = run;
        run.mark_failed();

        if let Err(err) = self.state.run_update(&run).await {
            error!(
                run_id = %key.id,
                namespace = %key.namespace,
                error = %err,
                "failed to update state for inline start failure"
            );
        } else {
            info!(
                run_id = %key.id,
                namespace = %key.namespace,
                "marked run failed after inline start failure"
            );
        }
    }

    // --- Triggers ---

    pub async fn create_trigger(&self, trigger: &Trigger) -> Result<()> {
        info!(
            provider = %trigger.source.provider,
            trigger_id = %trigger.id,
            "adding trigger"
        );
        self.triggers.create_trigger(trigger).await?;
        Ok(())
    }

    pub async fn delete_trigger(&self, trigger: &Trigger) -> Result<()> {
        info!(
            provider = %trigger.source.provider,
            trigger_id = %trigger.id,
            "deleting trigger"
        );
        self.triggers.delete_trigger(trigger).await?;
        Ok(())
    }

    pub fn handle_webhook(
        &self,
        trigger: &Trigger,
        headers: &HeaderMap,
        body: &[u8],
    ) -> (StatusCode, String) {
        self.triggers.handle_webhook(trigger, headers, body)
    }

    // --- Logs ---

    pub fn get_logs(
        &self,
        namespace: &str,
        run_id: &str,
        step_id: &str,
        log_type: LogType,
    ) -> Result<Vec<String>> {
        Ok(self.log_store.read(namespace, run_id, step_id, log_type)?)
    }

    pub fn stream_logs(
        &self,
        namespace: &str,
        run_id: &str,
        step_id: &str,
        log_type: LogType,
    ) -> impl Stream<Item = std::io::Result<String>> {
        self.log_store.tail(namespace, run_id, step_id, log_type)
    }

    pub fn write_logs_batch(
        &self,
        namespace: &str,
        run_id: &str,
        step_id: &str,
        log_type: LogType,
        lines: &[String],
    ) -> Result<()> {
        self.log_store
            .append_batch(namespace, run_id, step_id, log_type, lines)?;
        Ok(())
    }

    /// Persist a run document received from a runner over RPC.
    pub async fn apply_runner_update(&self, run: &Run) -> Result<()> {
        self.state.run_update(run).await?;
        Ok(())
    }
}

/// Build the run callback handed to the trigger subsystem. The weak
/// reference breaks the coordinator ↔ trigger cycle.
fn run_flow_fn(weak: Weak<Coordinator>) -> RunFlowFn {
    Arc::new(move |flow_id, namespace, trigger, vars| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(coordinator) = weak.upgrade() else {
                return Err(eyre::eyre!("coordinator has shut down"));
            };
            coordinator
                .run_flow(&flow_id, &namespace, &trigger, vars)
                .await
                .map(|_| ())
                .map_err(|err| eyre::eyre!(err.to_string()))
        })
    })
}
