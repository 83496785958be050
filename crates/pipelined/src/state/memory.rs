//! In-memory state backend for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use pipeline_core::{
    Flow, FlowStub, Namespace, NamespaceStub, Run, RunId, RunStub, Trigger, TriggerStub,
    WILDCARD_NAMESPACE,
};

use super::{NamespacedKey, Result, State, StateError};

/// Four maps behind per-entity locks; composite `(namespace, id)` keys.
#[derive(Debug, Default)]
pub struct MemoryState {
    namespaces: RwLock<HashMap<String, Namespace>>,
    flows: RwLock<HashMap<NamespacedKey, Flow>>,
    triggers: RwLock<HashMap<NamespacedKey, Trigger>>,
    runs: RwLock<HashMap<NamespacedKey, Run>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl State for MemoryState {
    async fn namespace_create(&self, namespace: &Namespace) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        if namespaces.contains_key(&namespace.id) {
            return Err(StateError::Conflict("namespace already exists".to_string()));
        }
        namespaces.insert(namespace.id.clone(), namespace.clone());
        Ok(())
    }

    async fn namespace_get(&self, name: &str) -> Result<Namespace> {
        self.namespaces
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::NotFound("namespace not found".to_string()))
    }

    async fn namespace_delete(&self, name: &str) -> Result<()> {
        // Flows are checked first; triggers depend on flows so they cannot
        // reference a namespace without one.
        {
            let flows = self.flows.read().await;
            if flows.values().any(|flow| flow.namespace == name) {
                return Err(StateError::Conflict(
                    "cannot delete in-use namespace".to_string(),
                ));
            }
        }

        let mut namespaces = self.namespaces.write().await;
        if namespaces.remove(name).is_none() {
            return Err(StateError::NotFound("namespace not found".to_string()));
        }
        Ok(())
    }

    async fn namespace_list(&self) -> Result<Vec<NamespaceStub>> {
        Ok(self
            .namespaces
            .read()
            .await
            .values()
            .map(Namespace::stub)
            .collect())
    }

    async fn flow_create(&self, flow: &Flow) -> Result<()> {
        let key = NamespacedKey::new(&flow.namespace, &flow.id);
        let mut flows = self.flows.write().await;
        if flows.contains_key(&key) {
            return Err(StateError::Conflict("flow already exists".to_string()));
        }
        flows.insert(key, flow.clone());
        Ok(())
    }

    async fn flow_get(&self, namespace: &str, id: &str) -> Result<Flow> {
        self.flows
            .read()
            .await
            .get(&NamespacedKey::new(namespace, id))
            .cloned()
            .ok_or_else(|| StateError::NotFound("flow not found".to_string()))
    }

    async fn flow_delete(&self, namespace: &str, id: &str) -> Result<()> {
        {
            let triggers = self.triggers.read().await;
            if triggers
                .values()
                .any(|trigger| trigger.flow == id && trigger.namespace == namespace)
            {
                return Err(StateError::Conflict(
                    "cannot delete flow with linked trigger".to_string(),
                ));
            }
        }

        let mut flows = self.flows.write().await;
        if flows.remove(&NamespacedKey::new(namespace, id)).is_none() {
            return Err(StateError::NotFound("flow not found".to_string()));
        }
        Ok(())
    }

    async fn flow_list(&self, namespace: &str) -> Result<Vec<FlowStub>> {
        Ok(self
            .flows
            .read()
            .await
            .values()
            .filter(|flow| namespace == WILDCARD_NAMESPACE || flow.namespace == namespace)
            .map(Flow::stub)
            .collect())
    }

    async fn trigger_create(&self, trigger: &Trigger) -> Result<()> {
        let key = NamespacedKey::new(&trigger.namespace, &trigger.id);
        let mut triggers = self.triggers.write().await;
        if triggers.contains_key(&key) {
            return Err(StateError::Conflict("trigger already exists".to_string()));
        }
        triggers.insert(key, trigger.clone());
        Ok(())
    }

    async fn trigger_get(&self, namespace: &str, id: &str) -> Result<Trigger> {
        self.triggers
            .read()
            .await
            .get(&NamespacedKey::new(namespace, id))
            .cloned()
            .ok_or_else(|| StateError::NotFound("trigger not found".to_string()))
    }

    async fn trigger_delete(&self, namespace: &str, id: &str) -> Result<()> {
        let mut triggers = self.triggers.write().await;
        if triggers
            .remove(&NamespacedKey::new(namespace, id))
            .is_none()
        {
            return Err(StateError::NotFound("trigger not found".to_string()));
        }
        Ok(())
    }

    async fn trigger_list(&self, namespace: &str) -> Result<Vec<TriggerStub>> {
        Ok(self
            .triggers
            .read()
            .await
            .values()
            .filter(|trigger| namespace == WILDCARD_NAMESPACE || trigger.namespace == namespace)
            .map(Trigger::stub)
            .collect())
    }

    async fn run_create(&self, run: &Run) -> Result<()> {
        let key = NamespacedKey::new(&run.namespace, run.id.as_ref());
        let mut runs = self.runs.write().await;
        if runs.contains_key(&key) {
            return Err(StateError::Conflict("run already exists".to_string()));
        }
        runs.insert(key, run.clone());
        Ok(())
    }

    async fn run_get(&self, namespace: &str, id: &RunId) -> Result<Run> {
        self.runs
            .read()
            .await
            .get(&NamespacedKey::new(namespace, id.as_ref()))
            .cloned()
            .ok_or_else(|| StateError::NotFound("run not found".to_string()))
    }

    async fn run_update(&self, run: &Run) -> Result<()> {
        let key = NamespacedKey::new(&run.namespace, run.id.as_ref());
        let mut runs = self.runs.write().await;

        let mut updated = run.clone();
        if let Some(previous) = runs.get(&key) {
            // These fields are controller-generated; runner-sent documents
            // must not rewrite them.
            updated.create_time = previous.create_time;
            updated.trigger = previous.trigger.clone();
            updated.variables = previous.variables.clone();
        }

        runs.insert(key, updated);
        Ok(())
    }

    async fn run_delete(&self, namespace: &str, id: &RunId) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs
            .remove(&NamespacedKey::new(namespace, id.as_ref()))
            .is_none()
        {
            return Err(StateError::NotFound("run not found".to_string()));
        }
        Ok(())
    }

    async fn run_list(&self, namespace: &str) -> Result<Vec<RunStub>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|run| namespace == WILDCARD_NAMESPACE || run.namespace == namespace)
            .map(Run::stub)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pipeline_core::{JsonMap, RunStatus, TriggerProvider, TriggerSource, DEFAULT_NAMESPACE};

    fn namespace(id: &str) -> Namespace {
        Namespace {
            id: id.to_string(),
            description: String::new(),
        }
    }

    fn flow(namespace: &str, id: &str) -> Flow {
        Flow {
            id: id.to_string(),
            namespace: namespace.to_string(),
            variables: Vec::new(),
            inline: None,
            specification: Vec::new(),
        }
    }

    fn trigger(namespace: &str, id: &str, flow: &str) -> Trigger {
        Trigger {
            id: id.to_string(),
            namespace: namespace.to_string(),
            flow: flow.to_string(),
            source: TriggerSource {
                id: "src".to_string(),
                provider: TriggerProvider::Cron,
                config: serde_json::json!({"crons": ["0 * * * * *"]}),
            },
        }
    }

    fn run(namespace: &str) -> Run {
        Run {
            id: RunId::new(),
            namespace: namespace.to_string(),
            flow_id: "f".to_string(),
            status: RunStatus::Pending,
            trigger: "manual".to_string(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            variables: JsonMap::new(),
            inline_run: None,
            spec_run: None,
        }
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let state = MemoryState::new();
        state.namespace_create(&namespace("team-a")).await.unwrap();
        state.flow_create(&flow("team-a", "f1")).await.unwrap();

        let fetched = state.flow_get("team-a", "f1").await.unwrap();
        assert_eq!(fetched.id, "f1");
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let state = MemoryState::new();
        state.flow_create(&flow("default", "f1")).await.unwrap();
        let err = state.flow_create(&flow("default", "f1")).await.unwrap_err();
        assert_eq!(err.code(), 409);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let state = MemoryState::new();
        let err = state.flow_get("default", "nope").await.unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[tokio::test]
    async fn namespace_delete_fails_while_flows_reference_it() {
        let state = MemoryState::new();
        state.namespace_create(&namespace("team-a")).await.unwrap();
        state.flow_create(&flow("team-a", "f1")).await.unwrap();

        let err = state.namespace_delete("team-a").await.unwrap_err();
        assert_eq!(err.code(), 409);

        state.flow_delete("team-a", "f1").await.unwrap();
        state.namespace_delete("team-a").await.unwrap();
    }

    #[tokio::test]
    async fn flow_delete_fails_while_triggers_reference_it() {
        let state = MemoryState::new();
        state.flow_create(&flow("default", "f1")).await.unwrap();
        state
            .trigger_create(&trigger("default", "t1", "f1"))
            .await
            .unwrap();

        let err = state.flow_delete("default", "f1").await.unwrap_err();
        assert_eq!(err.code(), 409);

        state.trigger_delete("default", "t1").await.unwrap();
        state.flow_delete("default", "f1").await.unwrap();
    }

    #[tokio::test]
    async fn same_id_in_different_namespaces_is_allowed() {
        let state = MemoryState::new();
        state.flow_create(&flow("team-a", "f1")).await.unwrap();
        state.flow_create(&flow("team-b", "f1")).await.unwrap();

        let team_a = state.flow_list("team-a").await.unwrap();
        assert_eq!(team_a.len(), 1);
        let all = state.flow_list(WILDCARD_NAMESPACE).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn run_update_preserves_controller_fields() {
        let state = MemoryState::new();
        let mut original = run(DEFAULT_NAMESPACE);
        original
            .variables
            .insert("region".to_string(), serde_json::json!("eu"));
        state.run_create(&original).await.unwrap();

        // Simulate a runner-side document that drifted on owned fields.
        let mut update = original.clone();
        update.status = RunStatus::Running;
        update.trigger = "spoofed".to_string();
        update.variables = JsonMap::new();
        update.create_time = Utc::now();
        state.run_update(&update).await.unwrap();

        let stored = state
            .run_get(DEFAULT_NAMESPACE, &original.id)
            .await
            .unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(stored.trigger, "manual");
        assert_eq!(stored.create_time, original.create_time);
        assert_eq!(stored.variables.get("region").unwrap(), "eu");
    }

    #[tokio::test]
    async fn ensure_default_namespace_is_idempotent() {
        let state = MemoryState::new();
        super::super::ensure_default_namespace(&state).await.unwrap();
        super::super::ensure_default_namespace(&state).await.unwrap();
        assert!(state.namespace_get(DEFAULT_NAMESPACE).await.is_ok());
    }

    #[tokio::test]
    async fn run_list_filters_by_namespace() {
        let state = MemoryState::new();
        state.run_create(&run("default")).await.unwrap();
        state.run_create(&run("team-a")).await.unwrap();

        assert_eq!(state.run_list("default").await.unwrap().len(), 1);
        assert_eq!(state.run_list(WILDCARD_NAMESPACE).await.unwrap().len(), 2);
    }
}
