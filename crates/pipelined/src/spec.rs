//! Specification runner: sequential evaluation and submission of a
//! flow's cluster job specifications.
//!
//! Specs run strictly in declaration order. A false condition or any
//! earlier failure skips a spec; submitted jobs are polled until dead and
//! judged by their allocations. Every state change is emitted as a full
//! run snapshot on the update channel, which the coordinator drains into
//! the state backend.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pipeline_core::expr::ExprError;
use pipeline_core::{
    Flow, JsonMap, Run, RunContext, RunId, RunStatus, SpecificationFlow,
};

use crate::cluster::{AllocationStatus, Cluster, ClusterError, Job, JobStatus};

/// Job status poll cadence while a spec's job is running.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("failed to connect to cluster: {0}")]
    Unreachable(#[source] ClusterError),
    #[error("spec runner already started")]
    AlreadyStarted,
    #[error("variable {variable:?} not provided for spec {spec:?}")]
    MissingVariable { variable: String, spec: String },
    #[error("failed to parse job specification: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to parse job name format: {0}")]
    NameFormat(#[source] ExprError),
    #[error("cancelled")]
    Cancelled,
    #[error("{0} allocations failed")]
    AllocationsFailed(usize),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

pub type Result<T> = std::result::Result<T, SpecError>;

pub struct SpecRunnerRequest {
    pub cluster: Arc<dyn Cluster>,
    pub run_id: RunId,
    pub flow: Flow,
    pub trigger: String,
    /// Merged run variables, wrapped under `var`.
    pub variables: JsonMap,
    /// Capacity-1 channel the coordinator drains into state.
    pub update_tx: mpsc::Sender<Run>,
}

/// Work moved into the run loop when the runner starts.
struct SpecWork {
    context: RunContext,
    flow: Flow,
    variables: JsonMap,
    update_tx: mpsc::Sender<Run>,
}

/// Lifecycle handle for one specification run.
pub struct SpecRunner {
    cluster: Arc<dyn Cluster>,
    cancel: CancellationToken,
    /// Job currently submitted on the cluster, for cancellation.
    in_progress: StdMutex<Option<(String, String)>>,
    work: Mutex<Option<SpecWork>>,
}

impl std::fmt::Debug for SpecRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecRunner").finish_non_exhaustive()
    }
}

impl SpecRunner {
    pub fn new(req: SpecRunnerRequest) -> Self {
        let context = RunContext::new(
            req.run_id,
            req.trigger,
            &req.flow,
            req.variables.clone(),
        );

        Self {
            cluster: req.cluster,
            cancel: CancellationToken::new(),
            in_progress: StdMutex::new(None),
            work: Mutex::new(Some(SpecWork {
                context,
                flow: req.flow,
                variables: req.variables,
                update_tx: req.update_tx,
            })),
        }
    }

    /// A snapshot of the initial run document, for state creation before
    /// the runner starts.
    pub async fn initial_run(&self) -> Option<Run> {
        self.work.lock().await.as_ref().map(|w| w.context.run())
    }

    /// Verify the cluster is reachable and launch the run loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.cluster.ping().await.map_err(SpecError::Unreachable)?;

        let work = self
            .work
            .lock()
            .await
            .take()
            .ok_or(SpecError::AlreadyStarted)?;

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.run(work).await;
        });

        Ok(())
    }

    /// Request cancellation: unblock the poll loop and deregister the
    /// in-progress job, when one was submitted.
    pub async fn cancel(&self) -> Result<()> {
        info!("cancelling spec runner");
        self.cancel.cancel();

        let in_progress = self.in_progress.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some((job_id, namespace)) = in_progress {
            self.cluster.deregister_job(&job_id, &namespace).await?;
        }
        Ok(())
    }

    /// The sequential run loop. The update channel closes when this
    /// returns, releasing the coordinator's drainer.
    async fn run(self: Arc<Self>, mut work: SpecWork) {
        info!("starting spec flow run");
        work.context.start_run();
        let _ = work.update_tx.send(work.context.run()).await;

        let specs = work.flow.specification.clone();
        let mut failed = false;

        for spec in &specs {
            let mut should = true;

            if let Some(condition) = &spec.condition {
                match work.context.eval_bool(condition) {
                    Ok(value) => should = value,
                    Err(err) => {
                        error!(
                            spec_id = %spec.id,
                            error = %err,
                            "failed to evaluate condition"
                        );
                        // A broken condition poisons the whole run; later
                        // specs can never be judged, so they are skipped.
                        work.context.skip_pending_children();
                        work.context.end_run(RunStatus::Failed);
                        let _ = work.update_tx.send(work.context.run()).await;
                        return;
                    }
                }
            }

            if !should || failed {
                info!(spec_id = %spec.id, "skipping spec");
                work.context.end_specification(&spec.id, RunStatus::Skipped);
                let _ = work.update_tx.send(work.context.run()).await;
                continue;
            }

            match self
                .run_spec(spec, &mut work.context, &work.variables, &work.update_tx)
                .await
            {
                Ok(()) => {
                    work.context.end_specification(&spec.id, RunStatus::Success);
                }
                Err(err) => {
                    error!(spec_id = %spec.id, error = %err, "specification run failed");
                    work.context.end_specification(&spec.id, RunStatus::Failed);
                    failed = true;
                }
            }
            let _ = work.update_tx.send(work.context.run()).await;
        }

        let end_status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        work.context.end_run(end_status);
        let _ = work.update_tx.send(work.context.run()).await;
    }

    /// Submit one spec and monitor its job to completion.
    async fn run_spec(
        &self,
        spec: &SpecificationFlow,
        context: &mut RunContext,
        variables: &JsonMap,
        update_tx: &mpsc::Sender<Run>,
    ) -> Result<()> {
        let raw = substitute_spec_variables(spec, variables)?;
        let mut job: Job = serde_json::from_str(&raw)?;

        if let Some(name_format) = &spec.job.name_format {
            let name = context
                .eval_template(name_format)
                .map_err(SpecError::NameFormat)?;
            job.id = name.clone();
            job.name = name;
        }

        job.canonicalize();

        context.start_specification(&spec.id, &job.namespace, &job.id);
        let _ = update_tx.send(context.run()).await;

        self.cluster.register_job(&job).await?;

        let mut job_id = job.id.clone();
        if job.parameterized {
            let dispatch = self.cluster.dispatch_job(&job.id, &job.namespace).await?;
            job_id = dispatch.dispatched_job_id;
        }

        if let Ok(mut in_progress) = self.in_progress.lock() {
            *in_progress = Some((job_id.clone(), job.namespace.clone()));
        }

        self.monitor_job(&job_id, &job.namespace).await
    }

    /// Poll job info every five seconds until the job is dead, then judge
    /// the outcome by its allocations. Transient API errors are logged
    /// and retried.
    async fn monitor_job(&self, job_id: &str, namespace: &str) -> Result<()> {
        let mut interval = tokio::time::interval(JOB_POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Err(SpecError::Cancelled),
                _ = interval.tick() => {}
            }

            let info = match self.cluster.job_info(job_id, namespace).await {
                Ok(info) => info,
                Err(err) => {
                    warn!(nomad_job_id = %job_id, error = %err, "failed to poll job info");
                    continue;
                }
            };

            if info.status == JobStatus::Dead {
                return self.collect_allocation_status(job_id, namespace).await;
            }
        }
    }

    /// A dead job failed if any allocation failed without a replacement.
    async fn collect_allocation_status(&self, job_id: &str, namespace: &str) -> Result<()> {
        let allocations = self.cluster.job_allocations(job_id, namespace).await?;

        let failed = allocations
            .iter()
            .filter(|alloc| {
                alloc.client_status == AllocationStatus::Failed && alloc.next_allocation.is_empty()
            })
            .count();

        if failed > 0 {
            return Err(SpecError::AllocationsFailed(failed));
        }
        Ok(())
    }
}

/// Resolve a spec's template variables from the run's `var` namespace and
/// substitute each `${param}` placeholder in the raw job document. Every
/// referenced variable must exist.
fn substitute_spec_variables(
    spec: &SpecificationFlow,
    variables: &JsonMap,
) -> Result<String> {
    let empty = JsonMap::new();
    let var_ns = match variables.get("var") {
        Some(serde_json::Value::Object(inner)) => inner,
        _ => &empty,
    };

    let mut raw = spec.job.raw.clone();
    for (param, path) in &spec.job.variables {
        let value = lookup_path(var_ns, path).ok_or_else(|| SpecError::MissingVariable {
            variable: path.clone(),
            spec: spec.id.clone(),
        })?;
        raw = raw.replace(&format!("${{{param}}}"), &render_json(value));
    }

    Ok(raw)
}

/// Dotted-path lookup inside the variable namespace.
fn lookup_path<'a>(vars: &'a JsonMap, path: &str) -> Option<&'a serde_json::Value> {
    let mut segments = path.split('.');
    let mut current = vars.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Render a variable value for placeholder substitution; strings are
/// inserted without quotes.
fn render_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
