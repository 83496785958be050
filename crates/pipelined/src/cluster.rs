//! Cluster scheduler seam.
//!
//! The controller only ever talks to the cluster through the [`Cluster`]
//! trait: job registration and monitoring for the runners, and the
//! key–value variables surface for the persistent state backend. A thin
//! HTTP adapter implements it against a real scheduler; [`StubCluster`]
//! is the in-memory implementation used by tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("cluster API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("job not found: {0}")]
    JobNotFound(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

// --- Job model ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Batch,
    #[default]
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Dead,
}

/// Client-side status of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationStub {
    pub id: String,
    pub client_status: AllocationStatus,
    /// Id of the replacement allocation, when the scheduler rescheduled
    /// this one. Empty if no replacement exists.
    #[serde(default)]
    pub next_allocation: String,
}

/// A job document submitted to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "type", default)]
    pub job_type: JobType,
    #[serde(default)]
    pub parameterized: bool,
    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,
}

impl Job {
    /// Fill the fields the scheduler would default.
    pub fn canonicalize(&mut self) {
        if self.namespace.is_empty() {
            self.namespace = "default".to_string();
        }
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub reschedule: ReschedulePolicy,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub attempts: u32,
    pub mode: String,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            mode: "fail".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReschedulePolicy {
    pub attempts: u32,
    pub unlimited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<TaskArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TaskTemplate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskArtifact {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// File rendered into the task's working directory before it starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub destination: String,
    pub embedded: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub namespace: String,
    pub status: JobStatus,
    #[serde(default)]
    pub parameterized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub dispatched_job_id: String,
}

/// One entry in the cluster's key–value variables store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterVariable {
    pub path: String,
    pub items: BTreeMap<String, String>,
}

// --- Trait ---

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;

    async fn register_job(&self, job: &Job) -> Result<()>;
    async fn deregister_job(&self, id: &str, namespace: &str) -> Result<()>;
    async fn dispatch_job(&self, id: &str, namespace: &str) -> Result<DispatchResponse>;
    async fn job_info(&self, id: &str, namespace: &str) -> Result<JobInfo>;
    async fn job_allocations(&self, id: &str, namespace: &str) -> Result<Vec<AllocationStub>>;

    async fn get_variable(&self, path: &str) -> Result<Option<ClusterVariable>>;
    async fn put_variable(&self, variable: &ClusterVariable) -> Result<()>;
    async fn delete_variable(&self, path: &str) -> Result<()>;
    /// List variable paths under a prefix.
    async fn list_variables(&self, prefix: &str) -> Result<Vec<String>>;
}

// --- HTTP adapter ---

/// `reqwest`-backed [`Cluster`] implementation against the scheduler's
/// HTTP API.
#[derive(Debug)]
pub struct HttpCluster {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpCluster {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.header("X-Cluster-Token", token);
        }
        builder
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClusterError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Cluster for HttpCluster {
    async fn ping(&self) -> Result<()> {
        let response = self.request(reqwest::Method::GET, "/v1/status").send().await?;
        Self::check(response).await.map(|_| ())
    }

    async fn register_job(&self, job: &Job) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/v1/jobs")
            .json(job)
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn deregister_job(&self, id: &str, namespace: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/v1/job/{id}"))
            .query(&[("namespace", namespace)])
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn dispatch_job(&self, id: &str, namespace: &str) -> Result<DispatchResponse> {
        let response = self
            .request(reqwest::Method::POST, &format!("/v1/job/{id}/dispatch"))
            .query(&[("namespace", namespace)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn job_info(&self, id: &str, namespace: &str) -> Result<JobInfo> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/job/{id}"))
            .query(&[("namespace", namespace)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClusterError::JobNotFound(id.to_string()));
        }
        Ok(Self::check(response).await?.json().await?)
    }

    async fn job_allocations(&self, id: &str, namespace: &str) -> Result<Vec<AllocationStub>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/job/{id}/allocations"))
            .query(&[("namespace", namespace)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_variable(&self, path: &str) -> Result<Option<ClusterVariable>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/var/{path}"))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.json().await?))
    }

    async fn put_variable(&self, variable: &ClusterVariable) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/v1/var/{}", variable.path))
            .json(variable)
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn delete_variable(&self, path: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/v1/var/{path}"))
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn list_variables(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/vars")
            .query(&[("prefix", prefix)])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

// --- In-memory stub ---

#[derive(Debug, Default)]
struct StubClusterState {
    jobs: HashMap<String, JobInfo>,
    allocations: HashMap<String, Vec<AllocationStub>>,
    registered: Vec<Job>,
    deregistered: Vec<String>,
    dispatched: Vec<String>,
    dispatch_counter: u64,
    variables: BTreeMap<String, ClusterVariable>,
    fail_register: bool,
}

/// In-memory cluster used by tests and local development mode.
///
/// Job statuses and allocations are programmable; every register,
/// deregister, and dispatch call is recorded.
#[derive(Debug, Default)]
pub struct StubCluster {
    state: Mutex<StubClusterState>,
}

impl StubCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_job_status(&self, id: &str, namespace: &str, status: JobStatus) {
        let mut state = self.state.lock().unwrap();
        state
            .jobs
            .entry(id.to_string())
            .and_modify(|info| info.status = status)
            .or_insert(JobInfo {
                id: id.to_string(),
                namespace: namespace.to_string(),
                status,
                parameterized: false,
            });
    }

    pub fn set_parameterized(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.jobs.get_mut(id) {
            info.parameterized = true;
        }
    }

    pub fn set_allocations(&self, id: &str, allocations: Vec<AllocationStub>) {
        let mut state = self.state.lock().unwrap();
        state.allocations.insert(id.to_string(), allocations);
    }

    pub fn fail_next_register(&self) {
        self.state.lock().unwrap().fail_register = true;
    }

    pub fn registered_jobs(&self) -> Vec<Job> {
        self.state.lock().unwrap().registered.clone()
    }

    pub fn deregistered_jobs(&self) -> Vec<String> {
        self.state.lock().unwrap().deregistered.clone()
    }

    pub fn dispatched_jobs(&self) -> Vec<String> {
        self.state.lock().unwrap().dispatched.clone()
    }
}

#[async_trait]
impl Cluster for StubCluster {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn register_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_register {
            state.fail_register = false;
            return Err(ClusterError::Api {
                status: 500,
                message: "register rejected".to_string(),
            });
        }
        state.registered.push(job.clone());
        // Keep a pre-programmed status if the test installed one.
        let parameterized = job.parameterized;
        state
            .jobs
            .entry(job.id.clone())
            .or_insert(JobInfo {
                id: job.id.clone(),
                namespace: job.namespace.clone(),
                status: JobStatus::Pending,
                parameterized,
            });
        Ok(())
    }

    async fn deregister_job(&self, id: &str, _namespace: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deregistered.push(id.to_string());
        if let Some(info) = state.jobs.get_mut(id) {
            info.status = JobStatus::Dead;
        }
        Ok(())
    }

    async fn dispatch_job(&self, id: &str, namespace: &str) -> Result<DispatchResponse> {
        let mut state = self.state.lock().unwrap();
        state.dispatch_counter += 1;
        let dispatched_id = format!("{id}/dispatch-{}", state.dispatch_counter);
        state.dispatched.push(dispatched_id.clone());
        state.jobs.insert(
            dispatched_id.clone(),
            JobInfo {
                id: dispatched_id.clone(),
                namespace: namespace.to_string(),
                status: JobStatus::Pending,
                parameterized: false,
            },
        );
        Ok(DispatchResponse {
            dispatched_job_id: dispatched_id,
        })
    }

    async fn job_info(&self, id: &str, _namespace: &str) -> Result<JobInfo> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::JobNotFound(id.to_string()))
    }

    async fn job_allocations(&self, id: &str, _namespace: &str) -> Result<Vec<AllocationStub>> {
        let state = self.state.lock().unwrap();
        Ok(state.allocations.get(id).cloned().unwrap_or_default())
    }

    async fn get_variable(&self, path: &str) -> Result<Option<ClusterVariable>> {
        let state = self.state.lock().unwrap();
        Ok(state.variables.get(path).cloned())
    }

    async fn put_variable(&self, variable: &ClusterVariable) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .variables
            .insert(variable.path.clone(), variable.clone());
        Ok(())
    }

    async fn delete_variable(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.variables.remove(path);
        Ok(())
    }

    async fn list_variables(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .variables
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }
}
