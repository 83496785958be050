//! State backend persisting into the cluster's key–value variables.
//!
//! Entities are serialized as JSON under
//! `nomad-pipeline/{namespaces|flows|runs|triggers}/<namespace>/<id>`,
//! each stored as a variable with a single `data` item. An optional
//! read-through cache is hydrated at startup by prefix listing; when it
//! is enabled every read is served locally and writes update it
//! synchronously under the entity lock. The contract assumes a single
//! writing controller.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use async_trait::async_trait;
use pipeline_core::{
    Flow, FlowStub, Namespace, NamespaceStub, Run, RunId, RunStub, Trigger, TriggerStub,
    WILDCARD_NAMESPACE,
};

use crate::cluster::{Cluster, ClusterVariable};

use super::{NamespacedKey, Result, State, StateError};

const PATH_PREFIX: &str = "nomad-pipeline";

fn namespace_path(name: &str) -> String {
    format!("{PATH_PREFIX}/namespaces/{name}")
}

fn flow_path(namespace: &str, id: &str) -> String {
    format!("{PATH_PREFIX}/flows/{namespace}/{id}")
}

fn run_path(namespace: &str, id: &str) -> String {
    format!("{PATH_PREFIX}/runs/{namespace}/{id}")
}

fn trigger_path(namespace: &str, id: &str) -> String {
    format!("{PATH_PREFIX}/triggers/{namespace}/{id}")
}

fn encode<T: Serialize>(path: &str, data: &T) -> Result<ClusterVariable> {
    let json = serde_json::to_string(data)
        .map_err(|e| StateError::Internal(format!("failed to encode object: {e}")))?;
    let mut items = BTreeMap::new();
    items.insert("data".to_string(), json);
    Ok(ClusterVariable {
        path: path.to_string(),
        items,
    })
}

fn decode<T: DeserializeOwned>(variable: &ClusterVariable) -> Result<T> {
    let data = variable
        .items
        .get("data")
        .ok_or_else(|| StateError::Internal("variable missing 'data' item".to_string()))?;
    serde_json::from_str(data)
        .map_err(|e| StateError::Internal(format!("failed to decode object: {e}")))
}

#[derive(Debug, Default)]
struct Cache {
    namespaces: RwLock<HashMap<String, Namespace>>,
    flows: RwLock<HashMap<NamespacedKey, Flow>>,
    triggers: RwLock<HashMap<NamespacedKey, Trigger>>,
    runs: RwLock<HashMap<NamespacedKey, Run>>,
}

/// Cluster KV backed [`State`] implementation.
pub struct KvState {
    cluster: Arc<dyn Cluster>,
    cache: Option<Cache>,
}

impl std::fmt::Debug for KvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvState")
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl KvState {
    pub async fn new(cluster: Arc<dyn Cluster>, enable_cache: bool) -> Self {
        let state = Self {
            cluster,
            cache: enable_cache.then(Cache::default),
        };

        if state.cache.is_some() {
            if let Err(err) = state.load_cache().await {
                warn!(error = %err, "failed to load initial state cache");
            }
        }

        state
    }

    async fn load_cache(&self) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };

        let namespaces: Vec<Namespace> =
            self.fetch_prefix(&format!("{PATH_PREFIX}/namespaces/")).await?;
        {
            let mut cached = cache.namespaces.write().await;
            for namespace in namespaces {
                cached.insert(namespace.id.clone(), namespace);
            }
        }

        let flows: Vec<Flow> = self.fetch_prefix(&format!("{PATH_PREFIX}/flows/")).await?;
        {
            let mut cached = cache.flows.write().await;
            for flow in flows {
                cached.insert(NamespacedKey::new(&flow.namespace, &flow.id), flow);
            }
        }

        let triggers: Vec<Trigger> =
            self.fetch_prefix(&format!("{PATH_PREFIX}/triggers/")).await?;
        {
            let mut cached = cache.triggers.write().await;
            for trigger in triggers {
                cached.insert(NamespacedKey::new(&trigger.namespace, &trigger.id), trigger);
            }
        }

        let runs: Vec<Run> = self.fetch_prefix(&format!("{PATH_PREFIX}/runs/")).await?;
        {
            let mut cached = cache.runs.write().await;
            for run in runs {
                cached.insert(NamespacedKey::new(&run.namespace, run.id.as_ref()), run);
            }
        }

        debug!("state cache loaded");
        Ok(())
    }

    /// Fetch and decode every variable under a prefix, skipping entries
    /// that fail to load.
    async fn fetch_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let paths = self.cluster.list_variables(prefix).await?;
        let mut decoded = Vec::with_capacity(paths.len());

        for path in paths {
            let Some(variable) = self.cluster.get_variable(&path).await? else {
                continue;
            };
            match decode(&variable) {
                Ok(value) => decoded.push(value),
                Err(err) => {
                    warn!(path = %path, error = %err, "failed to decode stored object");
                }
            }
        }

        Ok(decoded)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.cluster.get_variable(path).await?.is_some())
    }

    async fn get_decoded<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.cluster.get_variable(path).await? {
            Some(variable) => Ok(Some(decode(&variable)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl State for KvState {
    async fn namespace_create(&self, namespace: &Namespace) -> Result<()> {
        let path = namespace_path(&namespace.id);

        if let Some(cache) = &self.cache {
            let mut cached = cache.namespaces.write().await;
            if cached.contains_key(&namespace.id) {
                return Err(StateError::Conflict("namespace already exists".to_string()));
            }
            self.cluster.put_variable(&encode(&path, namespace)?).await?;
            cached.insert(namespace.id.clone(), namespace.clone());
        } else {
            if self.exists(&path).await? {
                return Err(StateError::Conflict("namespace already exists".to_string()));
            }
            self.cluster.put_variable(&encode(&path, namespace)?).await?;
        }

        Ok(())
    }

    async fn namespace_get(&self, name: &str) -> Result<Namespace> {
        if let Some(cache) = &self.cache {
            return cache
                .namespaces
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| StateError::NotFound("namespace not found".to_string()));
        }

        self.get_decoded(&namespace_path(name))
            .await?
            .ok_or_else(|| StateError::NotFound("namespace not found".to_string()))
    }

    async fn namespace_delete(&self, name: &str) -> Result<()> {
        let in_use = if let Some(cache) = &self.cache {
            cache
                .flows
                .read()
                .await
                .values()
                .any(|flow| flow.namespace == name)
        } else {
            !self
                .cluster
                .list_variables(&format!("{PATH_PREFIX}/flows/{name}/"))
                .await?
                .is_empty()
        };
        if in_use {
            return Err(StateError::Conflict(
                "cannot delete in-use namespace".to_string(),
            ));
        }

        let path = namespace_path(name);
        if let Some(cache) = &self.cache {
            let mut cached = cache.namespaces.write().await;
            if !cached.contains_key(name) {
                return Err(StateError::NotFound("namespace not found".to_string()));
            }
            self.cluster.delete_variable(&path).await?;
            cached.remove(name);
        } else {
            if !self.exists(&path).await? {
                return Err(StateError::NotFound("namespace not found".to_string()));
            }
            self.cluster.delete_variable(&path).await?;
        }

        Ok(())
    }

    async fn namespace_list(&self) -> Result<Vec<NamespaceStub>> {
        if let Some(cache) = &self.cache {
            return Ok(cache
                .namespaces
                .read()
                .await
                .values()
                .map(Namespace::stub)
                .collect());
        }

        let namespaces: Vec<Namespace> =
            self.fetch_prefix(&format!("{PATH_PREFIX}/namespaces/")).await?;
        Ok(namespaces.iter().map(Namespace::stub).collect())
    }

    async fn flow_create(&self, flow: &Flow) -> Result<()> {
        let path = flow_path(&flow.namespace, &flow.id);
        let key = NamespacedKey::new(&flow.namespace, &flow.id);

        if let Some(cache) = &self.cache {
            let mut cached = cache.flows.write().await;
            if cached.contains_key(&key) {
                return Err(StateError::Conflict("flow already exists".to_string()));
            }
            self.cluster.put_variable(&encode(&path, flow)?).await?;
            cached.insert(key, flow.clone());
        } else {
            if self.exists(&path).await? {
                return Err(StateError::Conflict("flow already exists".to_string()));
            }
            self.cluster.put_variable(&encode(&path, flow)?).await?;
        }

        Ok(())
    }

    async fn flow_get(&self, namespace: &str, id: &str) -> Result<Flow> {
        if let Some(cache) = &self.cache {
            return cache
                .flows
                .read()
                .await
                .get(&NamespacedKey::new(namespace, id))
                .cloned()
                .ok_or_else(|| StateError::NotFound("flow not found".to_string()));
        }

        self.get_decoded(&flow_path(namespace, id))
            .await?
            .ok_or_else(|| StateError::NotFound("flow not found".to_string()))
    }

    async fn flow_delete(&self, namespace: &str, id: &str) -> Result<()> {
        let referenced = if let Some(cache) = &self.cache {
            cache
                .triggers
                .read()
                .await
                .values()
                .any(|trigger| trigger.flow == id && trigger.namespace == namespace)
        } else {
            let triggers: Vec<Trigger> = self
                .fetch_prefix(&format!("{PATH_PREFIX}/triggers/{namespace}/"))
                .await?;
            triggers.iter().any(|trigger| trigger.flow == id)
        };
        if referenced {
            return Err(StateError::Conflict(
                "cannot delete flow with linked trigger".to_string(),
            ));
        }

        let path = flow_path(namespace, id);
        if let Some(cache) = &self.cache {
            let mut cached = cache.flows.write().await;
            let key = NamespacedKey::new(namespace, id);
            if !cached.contains_key(&key) {
                return Err(StateError::NotFound("flow not found".to_string()));
            }
            self.cluster.delete_variable(&path).await?;
            cached.remove(&key);
        } else {
            if !self.exists(&path).await? {
                return Err(StateError::NotFound("flow not found".to_string()));
            }
            self.cluster.delete_variable(&path).await?;
        }

        Ok(())
    }

    async fn flow_list(&self, namespace: &str) -> Result<Vec<FlowStub>> {
        if let Some(cache) = &self.cache {
            return Ok(cache
                .flows
                .read()
                .await
                .values()
                .filter(|flow| namespace == WILDCARD_NAMESPACE || flow.namespace == namespace)
                .map(Flow::stub)
                .collect());
        }

        let prefix = if namespace == WILDCARD_NAMESPACE {
            format!("{PATH_PREFIX}/flows/")
        } else {
            format!("{PATH_PREFIX}/flows/{namespace}/")
        };
        let flows: Vec<Flow> = self.fetch_prefix(&prefix).await?;
        Ok(flows.iter().map(Flow::stub).collect())
    }

    async fn trigger_create(&self, trigger: &Trigger) -> Result<()> {
        let path = trigger_path(&trigger.namespace, &trigger.id);
        let key = NamespacedKey::new(&trigger.namespace, &trigger.id);

        if let Some(cache) = &self.cache {
            let mut cached = cache.triggers.write().await;
            if cached.contains_key(&key) {
                return Err(StateError::Conflict("trigger already exists".to_string()));
            }
            self.cluster.put_variable(&encode(&path, trigger)?).await?;
            cached.insert(key, trigger.clone());
        } else {
            if self.exists(&path).await? {
                return Err(StateError::Conflict("trigger already exists".to_string()));
            }
            self.cluster.put_variable(&encode(&path, trigger)?).await?;
        }

        Ok(())
    }

    async fn trigger_get(&self, namespace: &str, id: &str) -> Result<Trigger> {
        if let Some(cache) = &self.cache {
            return cache
                .triggers
                .read()
                .await
                .get(&NamespacedKey::new(namespace, id))
                .cloned()
                .ok_or_else(|| StateError::NotFound("trigger not found".to_string()));
        }

        self.get_decoded(&trigger_path(namespace, id))
            .await?
            .ok_or_else(|| StateError::NotFound("trigger not found".to_string()))
    }

    async fn trigger_delete(&self, namespace: &str, id: &str) -> Result<()> {
        let path = trigger_path(namespace, id);

        if let Some(cache) = &self.cache {
            let mut cached = cache.triggers.write().await;
            let key = NamespacedKey::new(namespace, id);
            if !cached.contains_key(&key) {
                return Err(StateError::NotFound("trigger not found".to_string()));
            }
            self.cluster.delete_variable(&path).await?;
            cached.remove(&key);
        } else {
            if !self.exists(&path).await? {
                return Err(StateError::NotFound("trigger not found".to_string()));
            }
            self.cluster.delete_variable(&path).await?;
        }

        Ok(())
    }

    async fn trigger_list(&self, namespace: &str) -> Result<Vec<TriggerStub>> {
        if let Some(cache) = &self.cache {
            return Ok(cache
                .triggers
                .read()
                .await
                .values()
                .filter(|t| namespace == WILDCARD_NAMESPACE || t.namespace == namespace)
                .map(Trigger::stub)
                .collect());
        }

        let prefix = if namespace == WILDCARD_NAMESPACE {
            format!("{PATH_PREFIX}/triggers/")
        } else {
            format!("{PATH_PREFIX}/triggers/{namespace}/")
        };
        let triggers: Vec<Trigger> = self.fetch_prefix(&prefix).await?;
        Ok(triggers.iter().map(Trigger::stub).collect())
    }

    async fn run_create(&self, run: &Run) -> Result<()> {
        let path = run_path(&run.namespace, run.id.as_ref());
        let key = NamespacedKey::new(&run.namespace, run.id.as_ref());

        if let Some(cache) = &self.cache {
            let mut cached = cache.runs.write().await;
            if cached.contains_key(&key) {
                return Err(StateError::Conflict("run already exists".to_string()));
            }
            self.cluster.put_variable(&encode(&path, run)?).await?;
            cached.insert(key, run.clone());
        } else {
            if self.exists(&path).await? {
                return Err(StateError::Conflict("run already exists".to_string()));
            }
            self.cluster.put_variable(&encode(&path, run)?).await?;
        }

        Ok(())
    }

    async fn run_get(&self, namespace: &str, id: &RunId) -> Result<Run> {
        if let Some(cache) = &self.cache {
            return cache
                .runs
                .read()
                .await
                .get(&NamespacedKey::new(namespace, id.as_ref()))
                .cloned()
                .ok_or_else(|| StateError::NotFound("run not found".to_string()));
        }

        self.get_decoded(&run_path(namespace, id.as_ref()))
            .await?
            .ok_or_else(|| StateError::NotFound("run not found".to_string()))
    }

    async fn run_update(&self, run: &Run) -> Result<()> {
        let path = run_path(&run.namespace, run.id.as_ref());
        let key = NamespacedKey::new(&run.namespace, run.id.as_ref());

        if let Some(cache) = &self.cache {
            let mut cached = cache.runs.write().await;

            let mut updated = run.clone();
            if let Some(previous) = cached.get(&key) {
                updated.create_time = previous.create_time;
                updated.trigger = previous.trigger.clone();
                updated.variables = previous.variables.clone();
            }

            self.cluster.put_variable(&encode(&path, &updated)?).await?;
            cached.insert(key, updated);
        } else {
            let mut updated = run.clone();
            if let Some(previous) = self.get_decoded::<Run>(&path).await? {
                updated.create_time = previous.create_time;
                updated.trigger = previous.trigger.clone();
                updated.variables = previous.variables.clone();
            }
            self.cluster.put_variable(&encode(&path, &updated)?).await?;
        }

        Ok(())
    }

    async fn run_delete(&self, namespace: &str, id: &RunId) -> Result<()> {
        let path = run_path(namespace, id.as_ref());

        if let Some(cache) = &self.cache {
            let mut cached = cache.runs.write().await;
            let key = NamespacedKey::new(namespace, id.as_ref());
            if !cached.contains_key(&key) {
                return Err(StateError::NotFound("run not found".to_string()));
            }
            self.cluster.delete_variable(&path).await?;
            cached.remove(&key);
        } else {
            if !self.exists(&path).await? {
                return Err(StateError::NotFound("run not found".to_string()));
            }
            self.cluster.delete_variable(&path).await?;
        }

        Ok(())
    }

    async fn run_list(&self, namespace: &str) -> Result<Vec<RunStub>> {
        if let Some(cache) = &self.cache {
            return Ok(cache
                .runs
                .read()
                .await
                .values()
                .filter(|run| namespace == WILDCARD_NAMESPACE || run.namespace == namespace)
                .map(Run::stub)
                .collect());
        }

        let prefix = if namespace == WILDCARD_NAMESPACE {
            format!("{PATH_PREFIX}/runs/")
        } else {
            format!("{PATH_PREFIX}/runs/{namespace}/")
        };
        let runs: Vec<Run> = self.fetch_prefix(&prefix).await?;
        Ok(runs.iter().map(Run::stub).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StubCluster;
    use chrono::Utc;
    use pipeline_core::{JsonMap, RunStatus, TriggerProvider, TriggerSource, DEFAULT_NAMESPACE};

    fn flow(namespace: &str, id: &str) -> Flow {
        Flow {
            id: id.to_string(),
            namespace: namespace.to_string(),
            variables: Vec::new(),
            inline: None,
            specification: Vec::new(),
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

    #[test]
    fn codec_round_trip_preserves_entities() {
        let original = flow("default", "f1");
        let variable = encode(&flow_path("default", "f1"), &original).unwrap();
        let decoded: Flow = decode(&variable).unwrap();
        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.namespace, original.namespace);
    }

    #[tokio::test]
    async fn uncached_reads_hit_the_kv_store() {
        let cluster = Arc::new(StubCluster::new());
        let writer = KvState::new(Arc::clone(&cluster) as Arc<dyn Cluster>, false).await;
        let reader = KvState::new(cluster as Arc<dyn Cluster>, false).await;

        writer.flow_create(&flow("default", "f1")).await.unwrap();

        // A second uncached instance observes the write immediately.
        let fetched = reader.flow_get("default", "f1").await.unwrap();
        assert_eq!(fetched.id, "f1");
    }

    #[tokio::test]
    async fn cache_is_hydrated_from_existing_variables() {
        let cluster = Arc::new(StubCluster::new());
        let seed = KvState::new(Arc::clone(&cluster) as Arc<dyn Cluster>, false).await;
        seed.flow_create(&flow("default", "f1")).await.unwrap();
        seed.run_create(&run("default")).await.unwrap();

        let cached = KvState::new(cluster as Arc<dyn Cluster>, true).await;
        assert!(cached.flow_get("default", "f1").await.is_ok());
        assert_eq!(cached.run_list("default").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wildcard_list_spans_namespaces() {
        let cluster = Arc::new(StubCluster::new());
        let state = KvState::new(cluster as Arc<dyn Cluster>, false).await;

        state.flow_create(&flow("team-a", "f1")).await.unwrap();
        state.flow_create(&flow("team-b", "f1")).await.unwrap();

        assert_eq!(state.flow_list("team-a").await.unwrap().len(), 1);
        assert_eq!(
            state.flow_list(WILDCARD_NAMESPACE).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn duplicate_create_conflicts_with_and_without_cache() {
        for enable_cache in [false, true] {
            let cluster = Arc::new(StubCluster::new());
            let state = KvState::new(cluster as Arc<dyn Cluster>, enable_cache).await;

            state.flow_create(&flow("default", "f1")).await.unwrap();
            let err = state.flow_create(&flow("default", "f1")).await.unwrap_err();
            assert_eq!(err.code(), 409, "cache={enable_cache}");
        }
    }

    #[tokio::test]
    async fn delete_guards_apply_in_kv_backend() {
        let cluster = Arc::new(StubCluster::new());
        let state = KvState::new(cluster as Arc<dyn Cluster>, false).await;

        let namespace = Namespace {
            id: "team-a".to_string(),
            description: String::new(),
        };
        state.namespace_create(&namespace).await.unwrap();
        state.flow_create(&flow("team-a", "f1")).await.unwrap();
        state
            .trigger_create(&Trigger {
                id: "t1".to_string(),
                namespace: "team-a".to_string(),
                flow: "f1".to_string(),
                source: TriggerSource {
                    id: "src".to_string(),
                    provider: TriggerProvider::Cron,
                    config: serde_json::json!({"crons": ["0 * * * * *"]}),
                },
            })
            .await
            .unwrap();

        assert_eq!(state.namespace_delete("team-a").await.unwrap_err().code(), 409);
        assert_eq!(
            state.flow_delete("team-a", "f1").await.unwrap_err().code(),
            409
        );

        state.trigger_delete("team-a", "t1").await.unwrap();
        state.flow_delete("team-a", "f1").await.unwrap();
        state.namespace_delete("team-a").await.unwrap();
    }

    #[tokio::test]
    async fn run_update_preserves_controller_fields() {
        for enable_cache in [false, true] {
            let cluster = Arc::new(StubCluster::new());
            let state = KvState::new(cluster as Arc<dyn Cluster>, enable_cache).await;

            let mut original = run(DEFAULT_NAMESPACE);
            original
                .variables
                .insert("region".to_string(), serde_json::json!("eu"));
            state.run_create(&original).await.unwrap();

            let mut update = original.clone();
            update.status = RunStatus::Success;
            update.trigger = "spoofed".to_string();
            update.variables = JsonMap::new();
            state.run_update(&update).await.unwrap();

            let stored = state
                .run_get(DEFAULT_NAMESPACE, &original.id)
                .await
                .unwrap();
            assert_eq!(stored.status, RunStatus::Success, "cache={enable_cache}");
            assert_eq!(stored.trigger, "manual", "cache={enable_cache}");
            assert_eq!(
                stored.variables.get("region").unwrap(),
                "eu",
                "cache={enable_cache}"
            );
        }
    }
}
