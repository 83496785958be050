//! Status reporting seam for the in-container runner.
//!
//! The runner reports run documents and log batches through a sink;
//! in production that sink is the controller RPC connection. Reporting
//! failures are logged, never fatal — the step keeps executing and the
//! controller reconciles on the next update.

use async_trait::async_trait;
use tracing::{debug, error};

use pipeline_core::rpc::{JobUpdateRequest, LogsBatchRequest, RpcClient};

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn job_update(&self, req: &JobUpdateRequest);
    async fn logs_batch(&self, req: &LogsBatchRequest);
}

/// Sink backed by the controller RPC connection.
#[derive(Debug)]
pub struct RpcSink {
    client: RpcClient,
}

impl RpcSink {
    pub async fn connect(addr: &str) -> Result<Self, pipeline_core::rpc::RpcError> {
        let client = RpcClient::connect(addr).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StatusSink for RpcSink {
    async fn job_update(&self, req: &JobUpdateRequest) {
        match self.client.job_update(req).await {
            Ok(()) => debug!("sent job update"),
            Err(err) => error!(error = %err, "failed to send job update"),
        }
    }

    async fn logs_batch(&self, req: &LogsBatchRequest) {
        match self.client.job_logs_batch(req).await {
            Ok(()) => debug!(lines = req.logs.len(), "sent log batch"),
            Err(err) => error!(error = %err, "failed to send log batch"),
        }
    }
}
