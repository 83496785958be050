//! Single step execution.
//!
//! A step's `run` body is a template; the rendered script is written
//! under the run's working directory and executed with bash, with both
//! output streams batched back to the controller.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::info;

use pipeline_core::rpc::LogType;
use pipeline_core::{FlowStep, RunStatus};

use crate::job::{JobError, JobRunner};
use crate::logs::{spawn_handler, LogTarget};
use crate::sink::StatusSink;

/// Result of one executed step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepOutcome {
    pub status: RunStatus,
    pub exit_code: i32,
}

impl<S: StatusSink + 'static> JobRunner<S> {
    /// Render, write, and execute a single step script, streaming output
    /// through the log handlers until the process exits.
    pub(crate) async fn execute_step(&mut self, step: &FlowStep) -> Result<StepOutcome, JobError> {
        let script = self
            .context
            .eval_template(&step.run)
            .map_err(|source| JobError::Template {
                step: step.id.clone(),
                source,
            })?;

        let step_dir = self.run_dir();
        std::fs::create_dir_all(&step_dir)?;

        let script_path = step_dir.join(&step.id);
        std::fs::write(&script_path, script)?;

        info!(
            flow_step_id = %step.id,
            script = %script_path.display(),
            "executing flow job step"
        );

        let mut child = Command::new("bash")
            .arg(&step.id)
            .current_dir(&step_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut handlers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            handlers.push(spawn_handler(
                Arc::clone(&self.sink),
                self.log_target(&step.id, LogType::Stdout),
                stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            handlers.push(spawn_handler(
                Arc::clone(&self.sink),
                self.log_target(&step.id, LogType::Stderr),
                stderr,
            ));
        }

        self.context.start_inline_step(&step.id);
        self.send_update().await;

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);

        // Wait for the final flushes before reporting the step result so
        // log files are complete when the status lands.
        for handler in handlers {
            let _ = handler.await;
        }

        info!(
            flow_step_id = %step.id,
            exit_code = exit_code,
            "flow job step finished"
        );

        let step_status = if exit_code == 0 {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };

        Ok(StepOutcome {
            status: step_status,
            exit_code,
        })
    }

    fn log_target(&self, step_id: &str, log_type: LogType) -> LogTarget {
        LogTarget {
            namespace: self.cfg.namespace.clone(),
            run_id: self.cfg.id.clone(),
            step_id: step_id.to_string(),
            log_type,
        }
    }
}
