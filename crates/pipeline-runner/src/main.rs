//! pipeline-runner - wrapper job entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use pipeline_runner::{JobRunner, RpcSink};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "pipeline-runner", about = "Pipeline in-container step runner")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Job execution commands.
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
}

#[derive(Debug, Subcommand)]
enum JobCommand {
    /// Execute the steps described by a run configuration file.
    Run {
        /// Path to the runner.json written into the task.
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let Command::Job {
        command: JobCommand::Run { config },
    } = args.command;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        // The config carries the controller address; read it before
        // dialing the RPC connection.
        let content = match std::fs::read_to_string(&config) {
            Ok(content) => content,
            Err(err) => {
                error!(path = %config.display(), "failed to read run config: {err}");
                std::process::exit(1);
            }
        };
        let run_config: pipeline_core::RunConfig = match serde_json::from_str(&content) {
            Ok(run_config) => run_config,
            Err(err) => {
                error!("failed to decode run config: {err}");
                std::process::exit(1);
            }
        };

        let sink = match RpcSink::connect(&run_config.controller_rpc).await {
            Ok(sink) => Arc::new(sink),
            Err(err) => {
                error!(
                    addr = %run_config.controller_rpc,
                    "failed to connect to controller RPC: {err}"
                );
                std::process::exit(1);
            }
        };

        let runner = JobRunner::new(run_config, sink, ".");
        match runner.run().await {
            Ok(status) => {
                info!(status = %status, "flow job finished");
            }
            Err(err) => {
                error!("flow job failed: {err}");
                std::process::exit(1);
            }
        }
    });
}
