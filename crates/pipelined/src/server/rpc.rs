//! Runner RPC server.
//!
//! Accepts TCP connections from in-container runners and serves the
//! newline-delimited JSON protocol defined in `pipeline_core::rpc`:
//! `Runner.JobUpdate` persists run documents, `Runner.JobLogsBatch`
//! appends log lines to disk.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use pipeline_core::rpc::{
    JobUpdateRequest, LogsBatchRequest, Request, Response, JOB_LOGS_BATCH_METHOD,
    JOB_UPDATE_METHOD,
};

use crate::coordinator::Coordinator;

pub struct RpcServer {
    coordinator: Arc<Coordinator>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl RpcServer {
    /// Bind the listener; the accept loop starts with [`Self::start`].
    pub async fn bind(addr: &str, coordinator: Arc<Coordinator>) -> eyre::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(bind_addr = %local_addr, "RPC server initialized");

        Ok(Self {
            coordinator,
            local_addr,
            listener: Mutex::new(Some(listener)),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections.
    pub async fn start(&self) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };

        info!("starting RPC server");
        let coordinator = Arc::clone(&self.coordinator);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = shutdown.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote_addr = %remote, "accepted RPC connection");
                        let coordinator = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            serve_connection(coordinator, stream).await;
                            debug!(remote_addr = %remote, "RPC connection closed");
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "failed to accept RPC connection");
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    /// Close the listener; in-flight connections are abandoned.
    pub async fn stop(&self) {
        debug!("stopping RPC server");
        self.shutdown.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        info!("RPC server stopped");
    }
}

async fn serve_connection(coordinator: Arc<Coordinator>, stream: TcpStream) {
    let mut framed = Framed::new(stream, LinesCodec::new());

    while let Some(frame) = framed.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(err) => {
                debug!(error = %err, "RPC framing error");
                return;
            }
        };

        let response = handle_frame(&coordinator, &line).await;
        let Ok(encoded) = serde_json::to_string(&response) else {
            return;
        };
        if framed.send(encoded).await.is_err() {
            return;
        }
    }
}

async fn handle_frame(coordinator: &Coordinator, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return Response {
                id: 0,
                result: None,
                error: Some(format!("invalid request: {err}")),
            }
        }
    };

    let id = request.id;
    match dispatch(coordinator, &request.method, request.params).await {
        Ok(result) => Response {
            id,
            result: Some(result),
            error: None,
        },
        Err(message) => Response {
            id,
            result: None,
            error: Some(message),
        },
    }
}

async fn dispatch(
    coordinator: &Coordinator,
    method: &str,
    params: serde_json::Value,
) -> std::result::Result<serde_json::Value, String> {
    match method {
        JOB_UPDATE_METHOD => {
            let req: JobUpdateRequest =
                serde_json::from_value(params).map_err(|err| err.to_string())?;
            req.validate().map_err(|err| err.to_string())?;

            coordinator
                .apply_runner_update(&req.run)
                .await
                .map_err(|err| err.to_string())?;
            Ok(serde_json::Value::Null)
        }
        JOB_LOGS_BATCH_METHOD => {
            let req: LogsBatchRequest =
                serde_json::from_value(params).map_err(|err| err.to_string())?;
            req.validate().map_err(|err| err.to_string())?;

            coordinator
                .write_logs_batch(
                    &req.namespace,
                    req.run_id.as_ref(),
                    &req.step_id,
                    req.log_type,
                    &req.logs,
                )
                .map_err(|err| err.to_string())?;
            Ok(serde_json::Value::Null)
        }
        other => Err(format!("unknown RPC method {other:?}")),
    }
}
