//! Persistent state backends.
//!
//! The controller stores namespaces, flows, triggers, and runs behind the
//! [`State`] trait. Two implementations exist: [`memory::MemoryState`]
//! for development and tests, and [`kv::KvState`] which externalizes
//! state into the cluster's key–value variables service.

pub mod kv;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use pipeline_core::{
    Flow, FlowStub, Namespace, NamespaceStub, Run, RunId, RunStub, Trigger, TriggerStub,
    DEFAULT_NAMESPACE,
};

/// Structured state error; the code mirrors the HTTP status the API
/// surfaces for it.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Internal(String),
}

impl StateError {
    pub fn code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Invalid(_) => 400,
            Self::Internal(_) => 500,
        }
    }
}

impl From<crate::cluster::ClusterError> for StateError {
    fn from(err: crate::cluster::ClusterError) -> Self {
        Self::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

/// CRUD surface per entity kind. List operations accept the wildcard
/// namespace `*`; `run_update` preserves the controller-owned fields of
/// the previous revision (create time, trigger, variables).
#[async_trait]
pub trait State: Send + Sync {
    async fn namespace_create(&self, namespace: &Namespace) -> Result<()>;
    async fn namespace_get(&self, name: &str) -> Result<Namespace>;
    async fn namespace_delete(&self, name: &str) -> Result<()>;
    async fn namespace_list(&self) -> Result<Vec<NamespaceStub>>;

    async fn flow_create(&self, flow: &Flow) -> Result<()>;
    async fn flow_get(&self, namespace: &str, id: &str) -> Result<Flow>;
    async fn flow_delete(&self, namespace: &str, id: &str) -> Result<()>;
    async fn flow_list(&self, namespace: &str) -> Result<Vec<FlowStub>>;

    async fn trigger_create(&self, trigger: &Trigger) -> Result<()>;
    async fn trigger_get(&self, namespace: &str, id: &str) -> Result<Trigger>;
    async fn trigger_delete(&self, namespace: &str, id: &str) -> Result<()>;
    async fn trigger_list(&self, namespace: &str) -> Result<Vec<TriggerStub>>;

    async fn run_create(&self, run: &Run) -> Result<()>;
    async fn run_get(&self, namespace: &str, id: &RunId) -> Result<Run>;
    async fn run_update(&self, run: &Run) -> Result<()>;
    async fn run_delete(&self, namespace: &str, id: &RunId) -> Result<()>;
    async fn run_list(&self, namespace: &str) -> Result<Vec<RunStub>>;
}

/// Seed the implicit `default` namespace; idempotent.
pub async fn ensure_default_namespace(state: &dyn State) -> Result<()> {
    let namespace = Namespace {
        id: DEFAULT_NAMESPACE.to_string(),
        description: "Default namespace".to_string(),
    };
    match state.namespace_create(&namespace).await {
        Ok(()) | Err(StateError::Conflict(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Composite key for flows and triggers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct NamespacedKey {
    pub namespace: String,
    pub id: String,
}

impl NamespacedKey {
    pub fn new(namespace: &str, id: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
        }
    }
}
