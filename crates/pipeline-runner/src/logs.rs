//! Step output batching.
//!
//! Each step gets one handler per output stream. Lines buffer locally
//! and flush to the controller when fifty have accumulated or five
//! seconds have passed since the last flush, plus a final flush when the
//! stream closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use pipeline_core::rpc::{LogType, LogsBatchRequest};
use pipeline_core::RunId;

use crate::sink::StatusSink;

pub(crate) const LOG_BUFFER_LIMIT: usize = 50;
pub(crate) const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Destination of one step's output stream.
#[derive(Debug, Clone)]
pub(crate) struct LogTarget {
    pub namespace: String,
    pub run_id: RunId,
    pub step_id: String,
    pub log_type: LogType,
}

/// Read lines from a child process pipe and ship them in batches.
pub(crate) fn spawn_handler<S, R>(sink: Arc<S>, target: LogTarget, pipe: R) -> JoinHandle<()>
where
    S: StatusSink + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        let mut buffer: Vec<String> = Vec::new();
        let mut ticker = tokio::time::interval(LOG_FLUSH_INTERVAL);

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        buffer.push(line);
                        if buffer.len() >= LOG_BUFFER_LIMIT {
                            flush(sink.as_ref(), &target, &mut buffer).await;
                        }
                    }
                    Ok(None) | Err(_) => break,
                },
                _ = ticker.tick() => {
                    flush(sink.as_ref(), &target, &mut buffer).await;
                }
            }
        }

        flush(sink.as_ref(), &target, &mut buffer).await;
    })
}

async fn flush<S: StatusSink>(sink: &S, target: &LogTarget, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }

    let request = LogsBatchRequest {
        namespace: target.namespace.clone(),
        run_id: target.run_id.clone(),
        step_id: target.step_id.clone(),
        log_type: target.log_type,
        logs: std::mem::take(buffer),
    };
    sink.logs_batch(&request).await;
}
