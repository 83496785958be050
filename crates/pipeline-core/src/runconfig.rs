//! Wrapper-job run configuration.
//!
//! The controller embeds this document as `runner.json` inside the
//! wrapper job; the in-container runner reads it to know what to execute
//! and where to report.

use serde::{Deserialize, Serialize};

use crate::types::{Flow, FlowStep, JsonMap, RunId};

/// Everything the in-container runner needs for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub id: RunId,
    pub namespace: String,
    /// The inline block id; used as the wrapper task name and in updates.
    pub job_id: String,
    pub flow: Flow,
    /// Merged variables, wrapped under `var`.
    pub variables: JsonMap,
    pub job_steps: Vec<FlowStep>,
    /// Controller RPC address (`host:port`) to report status and logs to.
    pub controller_rpc: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlowRunner, InlineFlow, DEFAULT_NAMESPACE};

    #[test]
    fn run_config_round_trips_through_json() {
        let steps = vec![FlowStep {
            id: "s1".to_string(),
            condition: None,
            run: "echo hello".to_string(),
        }];
        let config = RunConfig {
            id: RunId::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            job_id: "build".to_string(),
            flow: Flow {
                id: "ci".to_string(),
                namespace: DEFAULT_NAMESPACE.to_string(),
                variables: Vec::new(),
                inline: Some(InlineFlow {
                    id: "build".to_string(),
                    runner: FlowRunner {
                        image: "alpine:3".to_string(),
                        namespace: None,
                        cpu: Some(500),
                        memory: Some(256),
                        artifacts: Vec::new(),
                    },
                    steps: steps.clone(),
                }),
                specification: Vec::new(),
            },
            variables: JsonMap::new(),
            job_steps: steps,
            controller_rpc: "10.0.0.1:8181".to_string(),
        };

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: RunConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, config.id);
        assert_eq!(decoded.job_id, "build");
        assert_eq!(decoded.job_steps.len(), 1);
        assert_eq!(decoded.controller_rpc, "10.0.0.1:8181");
    }
}
