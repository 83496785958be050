//! Core entities shared between the controller and the in-container runner.
//!
//! These are the objects persisted by the state backends and carried over
//! the runner RPC: namespaces, flows, triggers, and runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Map type used for user-supplied variables throughout the system.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// The implicit namespace every deployment carries. It cannot be deleted.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Wildcard namespace, valid only on list operations.
pub const WILDCARD_NAMESPACE: &str = "*";

/// Unique identifier for a run.
///
/// Uses `UUIDv7` so ids sort lexicographically by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validation failure on a submitted object; all problems are collected
/// before the object is rejected.
#[derive(Debug, Error)]
#[error("{}", .messages.join("; "))]
pub struct ValidationError {
    pub messages: Vec<String>,
}

impl ValidationError {
    fn check(messages: Vec<String>) -> Result<(), Self> {
        if messages.is_empty() {
            Ok(())
        } else {
            Err(Self { messages })
        }
    }
}

// --- Status ---

/// Lifecycle status shared by runs, inline steps, and spec entries.
///
/// `Skipped` only ever appears on children (steps/specs), never on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Namespace ---

/// Tenant partition key for flows, triggers, and runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceStub {
    pub id: String,
    pub description: String,
}

impl Namespace {
    pub fn stub(&self) -> NamespaceStub {
        NamespaceStub {
            id: self.id.clone(),
            description: self.description.clone(),
        }
    }
}

// --- Flow ---

/// Flow kind, derived from which definition block is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    Inline,
    Specification,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Specification => "specification",
        }
    }
}

/// Declarative pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub namespace: String,
    #[serde(default, rename = "variable")]
    pub variables: Vec<FlowVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<InlineFlow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specification: Vec<SpecificationFlow>,
}

/// Input variable declared by a flow.
///
/// `name` may be flat (`"region"`) or namespaced (`"build.image"`); the
/// shape decides how caller input is merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowVariable {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub var_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
}

/// Scripted flow definition executed inside a single runner container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineFlow {
    pub id: String,
    pub runner: FlowRunner,
    #[serde(rename = "step")]
    pub steps: Vec<FlowStep>,
}

/// Runner container requirements for an inline flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunner {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, rename = "artifact", skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<RunnerArtifact>,
}

/// Remote artifact fetched into the runner task before steps execute.
///
/// Option values are template expressions evaluated against the run's
/// variables before job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerArtifact {
    pub source: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// One shell script inside an inline flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub run: String,
}

/// One ordered entry of a specification flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecificationFlow {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub job: JobSpecification,
}

/// Full cluster job definition carried by a specification entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpecification {
    /// The job document itself, with `${param}` placeholders.
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_format: Option<String>,
    /// Parameter name to variable path within the run's `var` namespace.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStub {
    pub id: String,
    pub namespace: String,
    pub kind: Option<FlowKind>,
}

impl Flow {
    pub fn kind(&self) -> Option<FlowKind> {
        if self.inline.is_some() {
            Some(FlowKind::Inline)
        } else if !self.specification.is_empty() {
            Some(FlowKind::Specification)
        } else {
            None
        }
    }

    pub fn stub(&self) -> FlowStub {
        FlowStub {
            id: self.id.clone(),
            namespace: self.namespace.clone(),
            kind: self.kind(),
        }
    }

    /// Static validation against the namespace the request targeted.
    pub fn validate(&self, req_namespace: &str) -> Result<(), ValidationError> {
        let mut messages = Vec::new();

        if self.id.is_empty() {
            messages.push("flow ID cannot be empty".to_string());
        }
        if self.namespace != req_namespace {
            messages.push(format!(
                "flow namespace {:?} does not match request namespace {:?}",
                self.namespace, req_namespace
            ));
        }
        if self.kind().is_none() {
            messages.push("flow must define either an inline block or specifications".to_string());
        }
        if self.inline.is_some() && !self.specification.is_empty() {
            messages.push("flow cannot define both inline and specifications".to_string());
        }
        for variable in &self.variables {
            if variable.name.split('.').count() > 2 || variable.name.is_empty() {
                messages.push(format!("invalid variable name: {}", variable.name));
            }
        }

        ValidationError::check(messages)
    }
}

// --- Trigger ---

/// Source provider that fires a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerProvider {
    Cron,
    GitWebhook,
}

impl TriggerProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::GitWebhook => "git-webhook",
        }
    }
}

impl std::fmt::Display for TriggerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored object that causes flows to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub namespace: String,
    pub flow: String,
    pub source: TriggerSource,
}

/// Provider binding; `config` is opaque to the state layer and decoded by
/// the provider implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSource {
    pub id: String,
    pub provider: TriggerProvider,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerStub {
    pub id: String,
    pub namespace: String,
    pub flow: String,
}

impl Trigger {
    pub fn stub(&self) -> TriggerStub {
        TriggerStub {
            id: self.id.clone(),
            namespace: self.namespace.clone(),
            flow: self.flow.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut messages = Vec::new();

        if self.id.is_empty() {
            messages.push("trigger ID cannot be empty".to_string());
        }
        if self.namespace.is_empty() {
            messages.push("namespace cannot be empty".to_string());
        }
        if self.flow.is_empty() {
            messages.push("flow cannot be empty".to_string());
        }
        if self.source.config.is_null() {
            messages.push("trigger source config cannot be empty".to_string());
        }

        ValidationError::check(messages)
    }
}

// --- Run ---

/// One execution instance of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub namespace: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub trigger: String,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variables: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_run: Option<InlineRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_run: Option<SpecRun>,
}

/// Tracked state of an inline flow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineRun {
    pub id: String,
    pub steps: Vec<InlineStepState>,
}

/// Tracked state of one inline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineStepState {
    pub id: String,
    pub status: RunStatus,
    /// Process exit code; -1 until the step has actually run.
    pub exit_code: i32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

/// Tracked state of a specification flow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecRun {
    pub specs: Vec<SpecState>,
}

/// Tracked state of one submitted specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecState {
    pub id: String,
    #[serde(default)]
    pub nomad_job_id: String,
    #[serde(default)]
    pub nomad_job_namespace: String,
    pub status: RunStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStub {
    pub id: RunId,
    pub namespace: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub trigger: String,
    pub create_time: DateTime<Utc>,
}

impl Run {
    pub fn kind(&self) -> Option<FlowKind> {
        if self.inline_run.is_some() {
            Some(FlowKind::Inline)
        } else if self.spec_run.is_some() {
            Some(FlowKind::Specification)
        } else {
            None
        }
    }

    pub fn stub(&self) -> RunStub {
        RunStub {
            id: self.id.clone(),
            namespace: self.namespace.clone(),
            flow_id: self.flow_id.clone(),
            status: self.status,
            trigger: self.trigger.clone(),
            create_time: self.create_time,
        }
    }

    /// Flip the run and any non-terminal children to cancelled.
    ///
    /// Monotonic: children that already reached a terminal status keep it.
    pub fn mark_cancelled(&mut self) {
        let now = Utc::now();

        self.status = RunStatus::Cancelled;
        self.end_time = Some(now);

        if let Some(inline) = &mut self.inline_run {
            for step in &mut inline.steps {
                if matches!(step.status, RunStatus::Pending | RunStatus::Running) {
                    step.status = RunStatus::Cancelled;
                    step.end_time = Some(now);
                }
            }
        }

        if let Some(spec_run) = &mut self.spec_run {
            for spec in &mut spec_run.specs {
                if matches!(spec.status, RunStatus::Pending | RunStatus::Running) {
                    spec.status = RunStatus::Cancelled;
                    spec.end_time = Some(now);
                }
            }
        }
    }

    /// Mark the run failed without touching child records.
    pub fn mark_failed(&mut self) {
        self.status = RunStatus::Failed;
        self.end_time = Some(Utc::now());
    }
}
