pub mod context;
pub mod expr;
pub mod rpc;
pub mod runconfig;
pub mod types;
pub mod value;
pub mod vars;

pub use context::RunContext;
pub use runconfig::RunConfig;
pub use types::{
    Flow, FlowKind, FlowRunner, FlowStep, FlowStub, FlowVariable, InlineFlow, InlineRun,
    InlineStepState, JobSpecification, JsonMap, Namespace, NamespaceStub, Run, RunId, RunStatus,
    RunStub, RunnerArtifact, SpecRun, SpecState, SpecificationFlow, Trigger, TriggerProvider,
    TriggerSource, TriggerStub, ValidationError, DEFAULT_NAMESPACE, WILDCARD_NAMESPACE,
};
pub use value::Value;
pub use vars::{generate_variables_map, VariableError};
