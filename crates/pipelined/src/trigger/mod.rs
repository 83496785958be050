//! Trigger subsystem: cron schedules and git webhooks.
//!
//! Both providers funnel into the coordinator through an injected run
//! function, which breaks the reference cycle between the coordinator
//! and the trigger handler.

pub mod git;
pub mod schedule;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use pipeline_core::{JsonMap, Trigger, TriggerProvider};

use crate::state::State;

/// Callback used by trigger providers to launch a flow:
/// `(flow_id, namespace, trigger_id, variables)`.
pub type RunFlowFn =
    Arc<dyn Fn(String, String, String, JsonMap) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger config is empty")]
    EmptyConfig,
    #[error("failed to decode trigger config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("failed to parse cron expression {expression:?}: {message}")]
    Cron { expression: String, message: String },
    #[error("trigger {0} not found")]
    NotFound(String),
    #[error("failed to list triggers: {0}")]
    State(#[from] crate::state::StateError),
}

pub type Result<T> = std::result::Result<T, TriggerError>;

/// Routes trigger registration and webhook delivery to the provider
/// implementations.
pub struct Handler {
    schedule: schedule::CronScheduler,
    git: git::GitWebhook,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

impl Handler {
    pub fn new(state: Arc<dyn State>, run_fn: RunFlowFn) -> Self {
        Self {
            schedule: schedule::CronScheduler::new(state, Arc::clone(&run_fn)),
            git: git::GitWebhook::new(run_fn),
        }
    }

    /// Hydrate stored cron triggers and start the scheduling loop.
    pub async fn start(&self) -> Result<()> {
        self.schedule.start().await
    }

    pub async fn stop(&self) {
        self.schedule.stop().await;
    }

    /// Register a trigger with its provider. Webhook triggers have no
    /// scheduler-side state; persistence alone is enough.
    pub async fn create_trigger(&self, trigger: &Trigger) -> Result<()> {
        match trigger.source.provider {
            TriggerProvider::GitWebhook => Ok(()),
            TriggerProvider::Cron => self.schedule.create_trigger(trigger).await,
        }
    }

    pub async fn delete_trigger(&self, trigger: &Trigger) -> Result<()> {
        match trigger.source.provider {
            TriggerProvider::GitWebhook => Ok(()),
            TriggerProvider::Cron => self.schedule.delete_trigger(trigger).await,
        }
    }

    /// Deliver an incoming webhook request to the trigger's provider.
    pub fn handle_webhook(
        &self,
        trigger: &Trigger,
        headers: &HeaderMap,
        body: &[u8],
    ) -> (StatusCode, String) {
        debug!(trigger_id = %trigger.id, provider = %trigger.source.provider, "handling webhook");
        match trigger.source.provider {
            TriggerProvider::GitWebhook => self.git.handle(trigger, headers, body),
            TriggerProvider::Cron => (
                StatusCode::BAD_REQUEST,
                "unsupported trigger provider".to_string(),
            ),
        }
    }
}
