//! Per-run disk log store.
//!
//! Step output lives under
//! `<data_dir>/<namespace>/<run_id>/<step_id>/logs/<type>.log` as
//! newline-delimited UTF-8. Batches append with `O_APPEND`; the files are
//! never mirrored into durable state.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::stream::Stream;
use pipeline_core::rpc::LogType;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Poll cadence while following a log file for new content.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LogStore {
    data_dir: PathBuf,
}

impl LogStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn step_dir(&self, namespace: &str, run_id: &str, step_id: &str) -> PathBuf {
        self.data_dir
            .join(namespace)
            .join(run_id)
            .join(step_id)
            .join("logs")
    }

    pub fn log_path(
        &self,
        namespace: &str,
        run_id: &str,
        step_id: &str,
        log_type: LogType,
    ) -> PathBuf {
        self.step_dir(namespace, run_id, step_id)
            .join(format!("{}.log", log_type.as_str()))
    }

    /// Create the per-step log directories for a run before its wrapper
    /// job is submitted.
    pub fn create_run_dirs(
        &self,
        namespace: &str,
        run_id: &str,
        step_ids: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> std::io::Result<()> {
        for step_id in step_ids {
            std::fs::create_dir_all(self.step_dir(namespace, run_id, step_id.as_ref()))?;
        }
        Ok(())
    }

    /// Append a batch of lines; each write opens the file `O_APPEND`.
    pub fn append_batch(
        &self,
        namespace: &str,
        run_id: &str,
        step_id: &str,
        log_type: LogType,
        lines: &[String],
    ) -> std::io::Result<usize> {
        let path = self.log_path(namespace, run_id, step_id, log_type);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)?;

        let mut written = 0;
        for line in lines {
            written += file.write(line.as_bytes())?;
            written += file.write(b"\n")?;
        }

        debug!(
            run_id = %run_id,
            step_id = %step_id,
            log_type = log_type.as_str(),
            bytes = written,
            "wrote log batch to disk"
        );

        Ok(written)
    }

    /// Read the full log file as lines.
    pub fn read(
        &self,
        namespace: &str,
        run_id: &str,
        step_id: &str,
        log_type: LogType,
    ) -> std::io::Result<Vec<String>> {
        let path = self.log_path(namespace, run_id, step_id, log_type);
        let content = std::fs::read_to_string(path)?;
        Ok(content.lines().map(str::to_string).collect())
    }

    /// Follow the log file, yielding existing lines and then new ones as
    /// they are appended. The stream runs until the consumer drops it.
    pub fn tail(
        &self,
        namespace: &str,
        run_id: &str,
        step_id: &str,
        log_type: LogType,
    ) -> impl Stream<Item = std::io::Result<String>> {
        let path = self.log_path(namespace, run_id, step_id, log_type);

        futures_util::stream::unfold(TailState::new(path), |mut state| async move {
            loop {
                if let Some(line) = state.pending.pop_front() {
                    return Some((Ok(line), state));
                }

                match state.read_new().await {
                    Ok(0) => tokio::time::sleep(TAIL_POLL_INTERVAL).await,
                    Ok(_) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        // File not written yet; keep waiting for it.
                        tokio::time::sleep(TAIL_POLL_INTERVAL).await;
                    }
                    Err(err) => return Some((Err(err), state)),
                }
            }
        })
    }
}

struct TailState {
    path: PathBuf,
    offset: u64,
    partial: String,
    pending: VecDeque<String>,
}

impl TailState {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: String::new(),
            pending: VecDeque::new(),
        }
    }

    /// Read any bytes appended since the last poll, splitting complete
    /// lines into the pending queue. Returns the number of bytes read.
    async fn read_new(&mut self) -> std::io::Result<usize> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        if metadata.len() <= self.offset {
            return Ok(0);
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(self.offset)).await?;

        let mut buffer = Vec::new();
        let read = file.read_to_end(&mut buffer).await?;
        self.offset += read as u64;

        self.partial.push_str(&String::from_utf8_lossy(&buffer));
        while let Some(newline) = self.partial.find('\n') {
            let line = self.partial[..newline].to_string();
            self.partial.drain(..=newline);
            self.pending.push_back(line);
        }

        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tempfile::TempDir;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn append_then_read_round_trips_lines() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());

        store
            .append_batch("default", "run-1", "s1", LogType::Stdout, &lines(&["a", "b"]))
            .unwrap();
        store
            .append_batch("default", "run-1", "s1", LogType::Stdout, &lines(&["c"]))
            .unwrap();

        let read = store
            .read("default", "run-1", "s1", LogType::Stdout)
            .unwrap();
        assert_eq!(read, lines(&["a", "b", "c"]));
    }

    #[test]
    fn stdout_and_stderr_are_separate_files() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());

        store
            .append_batch("default", "run-1", "s1", LogType::Stdout, &lines(&["out"]))
            .unwrap();
        store
            .append_batch("default", "run-1", "s1", LogType::Stderr, &lines(&["err"]))
            .unwrap();

        assert_eq!(
            store.read("default", "run-1", "s1", LogType::Stdout).unwrap(),
            lines(&["out"])
        );
        assert_eq!(
            store.read("default", "run-1", "s1", LogType::Stderr).unwrap(),
            lines(&["err"])
        );
    }

    #[test]
    fn create_run_dirs_prepares_step_layout() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());

        store
            .create_run_dirs("default", "run-1", ["s1", "s2"])
            .unwrap();

        assert!(dir.path().join("default/run-1/s1/logs").is_dir());
        assert!(dir.path().join("default/run-1/s2/logs").is_dir());
    }

    #[tokio::test]
    async fn tail_follows_appended_content() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());

        store
            .append_batch("default", "run-1", "s1", LogType::Stdout, &lines(&["first"]))
            .unwrap();

        let mut stream =
            Box::pin(store.tail("default", "run-1", "s1", LogType::Stdout));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "first");

        store
            .append_batch("default", "run-1", "s1", LogType::Stdout, &lines(&["second"]))
            .unwrap();

        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("tail should observe the appended line")
            .unwrap()
            .unwrap();
        assert_eq!(second, "second");
    }
}
