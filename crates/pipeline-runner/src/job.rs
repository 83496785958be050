//! Inline job execution inside the wrapper container.
//!
//! Reads the `runner.json` the controller embedded into the task,
//! executes every step in order with the skip-on-failure policy, and
//! ships run documents back after each state change. The controller
//! preserves its own fields (trigger, create time, variables) when
//! persisting these documents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use pipeline_core::expr::ExprError;
use pipeline_core::rpc::JobUpdateRequest;
use pipeline_core::{RunConfig, RunContext, RunStatus};

use crate::sink::StatusSink;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode run config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("failed to evaluate condition for step {step}: {source}")]
    Condition { step: String, source: ExprError },
    #[error("failed to render script for step {step}: {source}")]
    Template { step: String, source: ExprError },
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Executes one inline run inside the wrapper container.
pub struct JobRunner<S> {
    pub(crate) cfg: RunConfig,
    pub(crate) context: RunContext,
    pub(crate) sink: Arc<S>,
    /// Task working directory; step scripts live in
    /// `<work_dir>/local/<run_id>/`.
    work_dir: PathBuf,
}

impl<S: StatusSink + 'static> JobRunner<S> {
    pub fn new(cfg: RunConfig, sink: Arc<S>, work_dir: impl Into<PathBuf>) -> Self {
        let context = RunContext::new(
            cfg.id.clone(),
            String::new(),
            &cfg.flow,
            cfg.variables.clone(),
        );

        Self {
            cfg,
            context,
            sink,
            work_dir: work_dir.into(),
        }
    }

    /// Load the run configuration from disk.
    pub fn from_file(path: &Path, sink: Arc<S>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let cfg: RunConfig = serde_json::from_str(&content)?;
        Ok(Self::new(cfg, sink, work_dir))
    }

    pub(crate) fn run_dir(&self) -> PathBuf {
        self.work_dir
            .join("local")
            .join(self.cfg.id.as_ref())
    }

    /// Execute all steps in order and report the final run status.
    ///
    /// A step failure skips every later step; a condition or template
    /// error fails the whole run with all remaining steps skipped.
    pub async fn run(mut self) -> Result<RunStatus> {
        info!(
            job_id = %self.cfg.job_id,
            run_id = %self.cfg.id,
            namespace = %self.cfg.namespace,
            "starting flow job"
        );
        self.context.start_run();
        self.send_update().await;

        let steps = self.cfg.job_steps.clone();
        let mut failed = false;

        for step in &steps {
            let mut should = true;

            if let Some(condition) = &step.condition {
                match self.context.eval_bool(condition) {
                    Ok(value) => should = value,
                    Err(source) => {
                        let err = JobError::Condition {
                            step: step.id.clone(),
                            source,
                        };
                        error!(step_id = %step.id, error = %err, "condition evaluation failed");
                        self.fail_run().await;
                        return Err(err);
                    }
                }
            }

            if !should || failed {
                info!(step_id = %step.id, "skipping step");
                self.context
                    .end_inline_step(&step.id, RunStatus::Skipped, -1);
                self.send_update().await;
                continue;
            }

            match self.execute_step(step).await {
                Ok(outcome) => {
                    self.context
                        .end_inline_step(&step.id, outcome.status, outcome.exit_code);
                    self.send_update().await;
                    if outcome.status == RunStatus::Failed {
                        failed = true;
                    }
                }
                Err(err) => {
                    error!(step_id = %step.id, error = %err, "step execution failed");
                    self.context.end_inline_step(&step.id, RunStatus::Failed, -1);
                    self.fail_run().await;
                    return Err(err);
                }
            }
        }

        let end_status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        info!(status = %end_status, "ending flow job");
        self.context.end_run(end_status);
        self.send_update().await;

        Ok(end_status)
    }

    /// Terminate the run as failed with every remaining step skipped, so
    /// the stored run never holds non-terminal children.
    async fn fail_run(&mut self) {
        self.context.skip_pending_children();
        self.context.end_run(RunStatus::Failed);
        self.send_update().await;
    }

    pub(crate) async fn send_update(&self) {
        let request = JobUpdateRequest {
            job_id: self.cfg.job_id.clone(),
            run: self.context.run(),
        };
        self.sink.job_update(&request).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LOG_BUFFER_LIMIT;
    use async_trait::async_trait;
    use pipeline_core::rpc::LogsBatchRequest;
    use pipeline_core::{
        Flow, FlowRunner, FlowStep, InlineFlow, JsonMap, Run, RunId, DEFAULT_NAMESPACE,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Sink that records every update and log batch.
    #[derive(Default)]
    struct Collector {
        runs: Mutex<Vec<Run>>,
        logs: Mutex<HashMap<(String, String), Vec<String>>>,
        batch_sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl StatusSink for Collector {
        async fn job_update(&self, req: &JobUpdateRequest) {
            self.runs.lock().unwrap().push(req.run.clone());
        }

        async fn logs_batch(&self, req: &LogsBatchRequest) {
            self.batch_sizes.lock().unwrap().push(req.logs.len());
            self.logs
                .lock()
                .unwrap()
                .entry((req.step_id.clone(), req.log_type.as_str().to_string()))
                .or_default()
                .extend(req.logs.iter().cloned());
        }
    }

    impl Collector {
        fn final_run(&self) -> Run {
            self.runs.lock().unwrap().last().cloned().expect("no updates")
        }

        fn stdout(&self, step_id: &str) -> Vec<String> {
            self.logs
                .lock()
                .unwrap()
                .get(&(step_id.to_string(), "stdout".to_string()))
                .cloned()
                .unwrap_or_default()
        }
    }

    fn config(steps: Vec<FlowStep>, variables: JsonMap) -> RunConfig {
        let flow = Flow {
            id: "ci".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            variables: Vec::new(),
            inline: Some(InlineFlow {
                id: "build".to_string(),
                runner: FlowRunner {
                    image: "alpine:3".to_string(),
                    namespace: None,
                    cpu: None,
                    memory: None,
                    artifacts: Vec::new(),
                },
                steps: steps.clone(),
            }),
            specification: Vec::new(),
        };

        RunConfig {
            id: RunId::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            job_id: "build".to_string(),
            flow,
            variables,
            job_steps: steps,
            controller_rpc: "127.0.0.1:0".to_string(),
        }
    }

    fn step(id: &str, run: &str) -> FlowStep {
        FlowStep {
            id: id.to_string(),
            condition: None,
            run: run.to_string(),
        }
    }

    fn vars(json: serde_json::Value) -> JsonMap {
        match json {
            serde_json::Value::Object(m) => m,
            _ => panic!("fixture must be an object"),
        }
    }

    #[tokio::test]
    async fn two_echo_steps_succeed_with_their_output() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Collector::default());
        let runner = JobRunner::new(
            config(
                vec![step("s1", "echo a"), step("s2", "echo b")],
                JsonMap::new(),
            ),
            Arc::clone(&sink),
            dir.path(),
        );

        let status = runner.run().await.unwrap();
        assert_eq!(status, RunStatus::Success);

        let run = sink.final_run();
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.start_time.is_some());
        assert!(run.end_time.is_some());

        let steps = run.inline_run.unwrap().steps;
        for step_state in &steps {
            assert_eq!(step_state.status, RunStatus::Success);
            assert_eq!(step_state.exit_code, 0);
            let start = step_state.start_time.unwrap();
            let end = step_state.end_time.unwrap();
            assert!(end >= start);
        }

        assert_eq!(sink.stdout("s1"), vec!["a".to_string()]);
        assert_eq!(sink.stdout("s2"), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn failing_step_halts_later_steps() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Collector::default());
        let runner = JobRunner::new(
            config(
                vec![step("s1", "exit 3"), step("s2", "echo b")],
                JsonMap::new(),
            ),
            Arc::clone(&sink),
            dir.path(),
        );

        let status = runner.run().await.unwrap();
        assert_eq!(status, RunStatus::Failed);

        let run = sink.final_run();
        assert_eq!(run.status, RunStatus::Failed);

        let steps = run.inline_run.unwrap().steps;
        assert_eq!(steps[0].status, RunStatus::Failed);
        assert_eq!(steps[0].exit_code, 3);

        assert_eq!(steps[1].status, RunStatus::Skipped);
        assert_eq!(steps[1].exit_code, -1);
        assert!(steps[1].start_time.is_none());
        assert!(steps[1].end_time.is_none());

        assert!(sink.stdout("s2").is_empty());
    }

    #[tokio::test]
    async fn false_condition_skips_only_that_step() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Collector::default());

        let mut conditional = step("s1", "echo never");
        conditional.condition = Some("1 == 2".to_string());
        let runner = JobRunner::new(
            config(vec![conditional, step("s2", "echo b")], JsonMap::new()),
            Arc::clone(&sink),
            dir.path(),
        );

        let status = runner.run().await.unwrap();
        assert_eq!(status, RunStatus::Success);

        let run = sink.final_run();
        let steps = run.inline_run.unwrap().steps;
        assert_eq!(steps[0].status, RunStatus::Skipped);
        assert_eq!(steps[1].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn condition_error_fails_the_run_with_terminal_children() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Collector::default());

        let mut broken = step("s1", "echo a");
        broken.condition = Some("not an expression at all".to_string());
        let runner = JobRunner::new(
            config(vec![broken, step("s2", "echo b")], JsonMap::new()),
            Arc::clone(&sink),
            dir.path(),
        );

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, JobError::Condition { .. }));

        let run = sink.final_run();
        assert_eq!(run.status, RunStatus::Failed);
        let steps = run.inline_run.unwrap().steps;
        assert!(steps.iter().all(|s| s.status.is_terminal()));
    }

    #[tokio::test]
    async fn step_scripts_are_templates_over_run_variables() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Collector::default());
        let runner = JobRunner::new(
            config(
                vec![step("s1", "echo ${var.word}")],
                vars(serde_json::json!({"var": {"word": "hello"}})),
            ),
            Arc::clone(&sink),
            dir.path(),
        );

        runner.run().await.unwrap();
        assert_eq!(sink.stdout("s1"), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn prior_step_status_is_visible_to_conditions() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Collector::default());

        let mut gated = step("s2", "echo gated");
        gated.condition = Some("inline.steps.s1.status == \"success\"".to_string());
        let runner = JobRunner::new(
            config(vec![step("s1", "true"), gated], JsonMap::new()),
            Arc::clone(&sink),
            dir.path(),
        );

        let status = runner.run().await.unwrap();
        assert_eq!(status, RunStatus::Success);
        assert_eq!(sink.stdout("s2"), vec!["gated".to_string()]);
    }

    #[tokio::test]
    async fn large_output_is_flushed_in_bounded_batches() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(Collector::default());
        let runner = JobRunner::new(
            config(vec![step("s1", "seq 1 120")], JsonMap::new()),
            Arc::clone(&sink),
            dir.path(),
        );

        runner.run().await.unwrap();

        let lines = sink.stdout("s1");
        assert_eq!(lines.len(), 120);
        assert_eq!(lines[0], "1");
        assert_eq!(lines[119], "120");

        let sizes = sink.batch_sizes.lock().unwrap().clone();
        assert!(sizes.iter().all(|size| *size <= LOG_BUFFER_LIMIT));
        // 120 lines cannot fit one batch.
        assert!(sizes.len() >= 2);
    }

    #[tokio::test]
    async fn from_file_decodes_the_embedded_config() {
        let dir = TempDir::new().unwrap();
        let cfg = config(vec![step("s1", "echo a")], JsonMap::new());
        let path = dir.path().join("runner.json");
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();

        let sink = Arc::new(Collector::default());
        let runner = JobRunner::from_file(&path, sink, dir.path()).unwrap();
        assert_eq!(runner.cfg.job_id, "build");

        assert!(matches!(
            JobRunner::from_file(&dir.path().join("missing.json"), Arc::new(Collector::default()), dir.path()),
            Err(JobError::Io(_))
        ));
    }
}
