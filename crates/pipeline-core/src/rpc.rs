//! Runner ↔ controller RPC protocol.
//!
//! Newline-delimited JSON frames over TCP. Each request names a method
//! and carries its parameters; the controller answers with a result or an
//! error string. The client half lives here so the in-container runner
//! and the controller tests share one implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};

use crate::types::{Run, RunId};

pub const JOB_UPDATE_METHOD: &str = "Runner.JobUpdate";
pub const JOB_LOGS_BATCH_METHOD: &str = "Runner.JobLogsBatch";

/// One framed RPC request.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

/// One framed RPC response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty job ID")]
    EmptyJobId,
    #[error("empty namespace")]
    EmptyNamespace,
    #[error("empty run ID")]
    EmptyRunId,
    #[error("empty step ID")]
    EmptyStepId,
    #[error("empty logs")]
    EmptyLogs,
}

/// Log stream kind carried by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stdout,
    Stderr,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::str::FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(format!("log type must be 'stdout' or 'stderr', got {other:?}")),
        }
    }
}

/// Parameters of `Runner.JobUpdate`: the full run document to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUpdateRequest {
    pub job_id: String,
    pub run: Run,
}

impl JobUpdateRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.job_id.is_empty() {
            return Err(ProtocolError::EmptyJobId);
        }
        if self.run.namespace.is_empty() {
            return Err(ProtocolError::EmptyNamespace);
        }
        Ok(())
    }
}

/// Parameters of `Runner.JobLogsBatch`: a batch of lines for one step's
/// stdout or stderr file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsBatchRequest {
    pub namespace: String,
    pub run_id: RunId,
    pub step_id: String,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub logs: Vec<String>,
}

impl LogsBatchRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.namespace.is_empty() {
            return Err(ProtocolError::EmptyNamespace);
        }
        if self.run_id.as_ref().is_empty() {
            return Err(ProtocolError::EmptyRunId);
        }
        if self.step_id.is_empty() {
            return Err(ProtocolError::EmptyStepId);
        }
        if self.logs.is_empty() {
            return Err(ProtocolError::EmptyLogs);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] tokio_util::codec::LinesCodecError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed by controller")]
    ConnectionClosed,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("response id {got} does not match request id {want}")]
    IdMismatch { want: u64, got: u64 },
}

/// Client half of the runner RPC connection.
#[derive(Debug)]
pub struct RpcClient {
    framed: Mutex<Framed<TcpStream, LinesCodec>>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Mutex::new(Framed::new(stream, LinesCodec::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue a call and wait for the matching response.
    pub async fn call<P: Serialize>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<serde_json::Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };
        let frame = serde_json::to_string(&request)?;

        let mut framed = self.framed.lock().await;
        framed.send(frame).await?;

        let line = framed
            .next()
            .await
            .ok_or(RpcError::ConnectionClosed)??;
        let response: Response = serde_json::from_str(&line)?;

        if response.id != id {
            return Err(RpcError::IdMismatch {
                want: id,
                got: response.id,
            });
        }
        if let Some(message) = response.error {
            return Err(RpcError::Remote(message));
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    pub async fn job_update(&self, req: &JobUpdateRequest) -> Result<(), RpcError> {
        self.call(JOB_UPDATE_METHOD, req).await.map(|_| ())
    }

    pub async fn job_logs_batch(&self, req: &LogsBatchRequest) -> Result<(), RpcError> {
        self.call(JOB_LOGS_BATCH_METHOD, req).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JsonMap, RunStatus};
    use chrono::Utc;

    fn run_fixture() -> Run {
        Run {
            id: RunId::new(),
            namespace: "default".to_string(),
            flow_id: "f".to_string(),
            status: RunStatus::Running,
            trigger: "manual".to_string(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            variables: JsonMap::new(),
            inline_run: None,
            spec_run: None,
        }
    }

    #[test]
    fn job_update_requires_job_id_and_namespace() {
        let mut req = JobUpdateRequest {
            job_id: String::new(),
            run: run_fixture(),
        };
        assert!(matches!(req.validate(), Err(ProtocolError::EmptyJobId)));

        req.job_id = "build".to_string();
        req.run.namespace = String::new();
        assert!(matches!(req.validate(), Err(ProtocolError::EmptyNamespace)));

        req.run.namespace = "default".to_string();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn logs_batch_rejects_empty_fields() {
        let req = LogsBatchRequest {
            namespace: "default".to_string(),
            run_id: RunId::new(),
            step_id: "s1".to_string(),
            log_type: LogType::Stdout,
            logs: Vec::new(),
        };
        assert!(matches!(req.validate(), Err(ProtocolError::EmptyLogs)));
    }

    #[test]
    fn log_type_wire_format_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&LogType::Stderr).unwrap(),
            "\"stderr\""
        );
        let parsed: LogType = serde_json::from_str("\"stdout\"").unwrap();
        assert_eq!(parsed, LogType::Stdout);
        assert!(serde_json::from_str::<LogType>("\"other\"").is_err());
    }

    #[test]
    fn request_frame_round_trip() {
        let request = Request {
            id: 7,
            method: JOB_LOGS_BATCH_METHOD.to_string(),
            params: serde_json::json!({"namespace": "default"}),
        };
        let line = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.method, JOB_LOGS_BATCH_METHOD);
    }
}
