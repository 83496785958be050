//! Inline runner: executes a flow's scripted steps on the cluster.
//!
//! One batch wrapper job is built and registered per run; the container
//! inside it runs `pipeline-runner`, which executes the steps and reports
//! status and logs back over RPC. This module only owns job submission,
//! the startup watch, and cancellation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pipeline_core::expr::{self, ExprError};
use pipeline_core::value::{map, Value};
use pipeline_core::{Flow, JsonMap, RunConfig, RunId};

use crate::cluster::{
    AllocationStatus, Cluster, ClusterError, Job, JobType, ReschedulePolicy, Resources,
    RestartPolicy, Task, TaskArtifact, TaskGroup, TaskTemplate,
};
use crate::coordinator::RunKey;
use crate::logs::LogStore;

/// Allocation poll cadence during the startup watch.
const ALLOC_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Name of the single task group inside every wrapper job.
const WRAPPER_GROUP_NAME: &str = "runner";

#[derive(Debug, Error)]
pub enum InlineError {
    #[error("flow has no inline block")]
    NotInline,
    #[error("failed to eval artifact option {key:?}: {source}")]
    ArtifactOption { key: String, source: ExprError },
    #[error("failed to encode runner config: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to create data dir: {0}")]
    DataDir(#[from] std::io::Error),
    #[error("failed to register job: {0}")]
    Register(#[source] ClusterError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

pub type Result<T> = std::result::Result<T, InlineError>;

pub struct InlineRunnerRequest {
    pub cluster: Arc<dyn Cluster>,
    pub run_id: RunId,
    pub flow: Flow,
    /// Merged run variables, wrapped under `var`.
    pub variables: JsonMap,
    /// Controller RPC address handed to the in-container runner.
    pub rpc_addr: String,
}

/// Lifecycle handle for one inline run.
pub struct InlineRunner {
    cluster: Arc<dyn Cluster>,
    job: Job,
    run_key: RunKey,
    cancel: CancellationToken,
}

impl std::fmt::Debug for InlineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineRunner")
            .field("run_key", &self.run_key)
            .field("job_id", &self.job.id)
            .finish()
    }
}

impl InlineRunner {
    /// Build the wrapper job and prepare the run's log directories.
    pub fn new(req: &InlineRunnerRequest, log_store: &LogStore) -> Result<Self> {
        let inline = req.flow.inline.as_ref().ok_or(InlineError::NotInline)?;

        let job = build_wrapper_job(&req.run_id, &req.flow, &req.variables, &req.rpc_addr)?;

        log_store.create_run_dirs(
            &req.flow.namespace,
            req.run_id.as_ref(),
            inline.steps.iter().map(|step| step.id.as_str()),
        )?;

        Ok(Self {
            cluster: Arc::clone(&req.cluster),
            job,
            run_key: RunKey {
                namespace: req.flow.namespace.clone(),
                id: req.run_id.clone(),
            },
            cancel: CancellationToken::new(),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    /// Register the wrapper job and watch its first allocation in the
    /// background. A startup failure posts the run key to `fail_tx`;
    /// the send is non-blocking and may drop when the channel is full.
    pub async fn start(self: &Arc<Self>, fail_tx: mpsc::Sender<RunKey>) -> Result<()> {
        self.cluster
            .register_job(&self.job)
            .await
            .map_err(InlineError::Register)?;

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            match runner.wait_for_allocation().await {
                Ok(alloc_id) => {
                    info!(
                        run_id = %runner.run_key.id,
                        nomad_job_id = %runner.job.id,
                        nomad_namespace = %runner.job.namespace,
                        nomad_alloc_id = %alloc_id,
                        "wrapper job started"
                    );
                }
                Err(StartWatch::Cancelled) => {}
                Err(StartWatch::Failed) => {
                    if fail_tx.try_send(runner.run_key.clone()).is_err() {
                        warn!(
                            run_id = %runner.run_key.id,
                            "start failure channel full; dropping notification"
                        );
                    }
                }
            }
        });

        Ok(())
    }

    /// Poll allocations every second until one runs or reaches a
    /// terminal state.
    async fn wait_for_allocation(&self) -> std::result::Result<String, StartWatch> {
        let mut interval = tokio::time::interval(ALLOC_POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Err(StartWatch::Cancelled),
                _ = interval.tick() => {}
            }

            let allocations = match self
                .cluster
                .job_allocations(&self.job.id, &self.job.namespace)
                .await
            {
                Ok(allocations) => allocations,
                Err(err) => {
                    error!(
                        nomad_job_id = %self.job.id,
                        error = %err,
                        "failed to get job allocations"
                    );
                    continue;
                }
            };

            for alloc in allocations {
                match alloc.client_status {
                    AllocationStatus::Running => return Ok(alloc.id),
                    AllocationStatus::Pending => {}
                    AllocationStatus::Unknown
                    | AllocationStatus::Failed
                    | AllocationStatus::Lost => return Err(StartWatch::Failed),
                    AllocationStatus::Complete => {}
                }
            }
        }
    }

    /// Stop the startup watch and deregister the wrapper job. Idempotent;
    /// repeated calls re-issue the deregistration only.
    pub async fn cancel(&self) -> Result<()> {
        info!(
            run_id = %self.run_key.id,
            nomad_job_id = %self.job.id,
            "cancelling inline runner"
        );

        self.cancel.cancel();
        self.cluster
            .deregister_job(&self.job.id, &self.job.namespace)
            .await?;
        Ok(())
    }
}

enum StartWatch {
    Cancelled,
    Failed,
}

/// Build the batch wrapper job for an inline flow.
///
/// Contract: one task group, one task named after the inline block, the
/// docker driver, no restarts or reschedules, the full `RunConfig`
/// embedded as `local/<run_id>/runner.json`.
fn build_wrapper_job(
    run_id: &RunId,
    flow: &Flow,
    variables: &JsonMap,
    rpc_addr: &str,
) -> Result<Job> {
    let inline = flow.inline.as_ref().ok_or(InlineError::NotInline)?;
    let base_dir = format!("local/{run_id}");

    let scope = artifact_scope(variables);
    let mut artifacts = Vec::with_capacity(inline.runner.artifacts.len());
    for artifact in &inline.runner.artifacts {
        let mut options = std::collections::BTreeMap::new();
        for (key, template) in &artifact.options {
            let evaluated =
                expr::eval_template(template, &scope).map_err(|source| {
                    InlineError::ArtifactOption {
                        key: key.clone(),
                        source,
                    }
                })?;
            options.insert(key.clone(), evaluated);
        }

        artifacts.push(TaskArtifact {
            source: artifact.source.clone(),
            destination: (!artifact.destination.is_empty())
                .then(|| format!("{base_dir}/{}", artifact.destination)),
            options,
        });
    }

    let run_config = RunConfig {
        id: run_id.clone(),
        namespace: flow.namespace.clone(),
        job_id: inline.id.clone(),
        flow: flow.clone(),
        variables: variables.clone(),
        job_steps: inline.steps.clone(),
        controller_rpc: rpc_addr.to_string(),
    };

    let config_path = format!("{base_dir}/runner.json");
    let embedded = serde_json::to_string(&run_config)?;

    let resources = (inline.runner.cpu.is_some() || inline.runner.memory.is_some()).then(|| {
        Resources {
            cpu: inline.runner.cpu,
            memory_mb: inline.runner.memory,
        }
    });

    Ok(Job {
        id: run_id.to_string(),
        name: run_id.to_string(),
        namespace: inline
            .runner
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        job_type: JobType::Batch,
        parameterized: false,
        task_groups: vec![TaskGroup {
            name: WRAPPER_GROUP_NAME.to_string(),
            restart: RestartPolicy {
                attempts: 0,
                mode: "fail".to_string(),
            },
            reschedule: ReschedulePolicy {
                attempts: 0,
                unlimited: false,
            },
            tasks: vec![Task {
                name: inline.id.clone(),
                driver: "docker".to_string(),
                config: serde_json::json!({
                    "image": inline.runner.image,
                    "command": "pipeline-runner",
                    "args": ["job", "run", "--config", config_path],
                }),
                resources,
                artifacts,
                templates: vec![TaskTemplate {
                    destination: config_path.clone(),
                    embedded,
                }],
            }],
        }],
    })
}

/// Expression scope for artifact options: only the run variables are in
/// scope at build time.
fn artifact_scope(variables: &JsonMap) -> Value {
    let vars = variables
        .get("var")
        .map(Value::from)
        .unwrap_or_else(|| map([]));
    map([("var".to_string(), vars)])
}
