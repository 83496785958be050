//! pipeline-runner - in-container step executor.
//!
//! Runs inside the wrapper job the controller submits for inline flows:
//! executes the configured steps with bash and reports status and log
//! batches back over the controller RPC.

pub mod job;
pub mod logs;
pub mod sink;
mod step;

pub use job::{JobError, JobRunner};
pub use sink::{RpcSink, StatusSink};
