//! Git webhook dispatcher.
//!
//! Validates incoming provider payloads, extracts the commit metadata
//! into run variables under `trigger.*`, and launches the flow without
//! holding the HTTP response open.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error};

use pipeline_core::{JsonMap, Trigger};

use super::RunFlowFn;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";

/// Decoded config of a git-webhook trigger.
#[derive(Debug, Deserialize)]
pub struct GitTriggerConfig {
    pub provider: String,
    pub repository: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

pub struct GitWebhook {
    run_fn: RunFlowFn,
}

impl std::fmt::Debug for GitWebhook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitWebhook").finish_non_exhaustive()
    }
}

impl GitWebhook {
    pub fn new(run_fn: RunFlowFn) -> Self {
        Self { run_fn }
    }

    /// Handle one webhook delivery for the trigger. The returned status
    /// and body complete the HTTP exchange; flow execution continues in
    /// the background.
    pub fn handle(
        &self,
        trigger: &Trigger,
        headers: &HeaderMap,
        body: &[u8],
    ) -> (StatusCode, String) {
        let config: GitTriggerConfig =
            match serde_json::from_value(trigger.source.config.clone()) {
                Ok(config) => config,
                Err(err) => {
                    error!(
                        trigger_id = %trigger.id,
                        error = %err,
                        "failed to decode trigger config"
                    );
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "failed to decode trigger config".to_string(),
                    );
                }
            };

        let payload = match config.provider.as_str() {
            "github" => match handle_github(&config, headers, body) {
                Ok(payload) => payload,
                Err(message) => return (StatusCode::BAD_REQUEST, message),
            },
            _ => {
                return (
                    StatusCode::BAD_REQUEST,
                    "unsupported git provider".to_string(),
                )
            }
        };

        if !config.events.iter().any(|event| event == &payload.event) {
            debug!(
                trigger_id = %trigger.id,
                event = %payload.event,
                "event type not configured, ignoring"
            );
            return (
                StatusCode::OK,
                "event type not configured, ignored".to_string(),
            );
        }

        if !config.branches.is_empty() {
            let branch = payload
                .branch
                .strip_prefix("refs/heads/")
                .unwrap_or(&payload.branch);
            if !config.branches.iter().any(|configured| configured == branch) {
                debug!(
                    trigger_id = %trigger.id,
                    branch = %branch,
                    "branch not configured, ignoring"
                );
                return (StatusCode::OK, "branch not configured, ignored".to_string());
            }
        }

        let run_fn = Arc::clone(&self.run_fn);
        let flow = trigger.flow.clone();
        let namespace = trigger.namespace.clone();
        let trigger_id = trigger.id.clone();
        tokio::spawn(async move {
            if let Err(err) = run_fn(flow.clone(), namespace, trigger_id.clone(), payload.vars).await
            {
                error!(
                    trigger_id = %trigger_id,
                    flow_id = %flow,
                    error = %err,
                    "failed to execute flow from webhook"
                );
            }
        });

        (
            StatusCode::OK,
            "webhook processed successfully".to_string(),
        )
    }
}

struct WebhookPayload {
    event: String,
    branch: String,
    vars: JsonMap,
}

fn handle_github(
    config: &GitTriggerConfig,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<WebhookPayload, String> {
    if let Some(secret) = config.secret.as_deref().filter(|s| !s.is_empty()) {
        if !verify_signature(secret, headers, body) {
            return Err("invalid payload signature".to_string());
        }
    }

    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if event_type != "push" {
        return Err(format!("unsupported GitHub event type: {event_type}"));
    }

    let event: GithubPushEvent =
        serde_json::from_slice(body).map_err(|err| format!("failed to parse payload: {err}"))?;

    let branch = event.git_ref.clone();
    let vars = build_github_vars(&event);

    Ok(WebhookPayload {
        event: event_type.to_string(),
        branch,
        vars,
    })
}

/// Constant-time HMAC-SHA256 check of the `X-Hub-Signature-256` header.
fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(value) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Some(hex_signature) = value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[derive(Debug, Deserialize)]
struct GithubPushEvent {
    #[serde(rename = "ref", default)]
    git_ref: String,
    #[serde(default)]
    after: String,
    #[serde(default)]
    before: String,
    #[serde(default)]
    repository: Option<GithubRepository>,
    #[serde(default)]
    pusher: Option<GithubPusher>,
    #[serde(default)]
    head_commit: Option<GithubCommit>,
}

#[derive(Debug, Deserialize)]
struct GithubRepository {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    owner: Option<GithubOwner>,
    #[serde(default)]
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct GithubOwner {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Deserialize)]
struct GithubPusher {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct GithubCommit {
    #[serde(default)]
    message: String,
    #[serde(default)]
    author: Option<GithubAuthor>,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct GithubAuthor {
    #[serde(default)]
    name: String,
}

/// Extract the run variables a push event provides, wrapped under the
/// `trigger` namespace.
fn build_github_vars(event: &GithubPushEvent) -> JsonMap {
    let mut vars = JsonMap::new();
    vars.insert("git_ref".to_string(), event.git_ref.clone().into());
    vars.insert("git_sha".to_string(), event.after.clone().into());
    vars.insert("git_before".to_string(), event.before.clone().into());
    vars.insert(
        "git_repository".to_string(),
        event
            .repository
            .as_ref()
            .map(|repo| repo.full_name.clone())
            .unwrap_or_default()
            .into(),
    );
    vars.insert(
        "git_pusher".to_string(),
        event
            .pusher
            .as_ref()
            .map(|pusher| pusher.name.clone())
            .unwrap_or_default()
            .into(),
    );

    if let Some(repository) = &event.repository {
        vars.insert("git_repo_name".to_string(), repository.name.clone().into());
        vars.insert(
            "git_repo_owner".to_string(),
            repository
                .owner
                .as_ref()
                .map(|owner| owner.login.clone())
                .unwrap_or_default()
                .into(),
        );
        vars.insert("git_repo_url".to_string(), repository.html_url.clone().into());
    }

    if let Some(commit) = &event.head_commit {
        vars.insert("git_commit_message".to_string(), commit.message.clone().into());
        vars.insert(
            "git_commit_author".to_string(),
            commit
                .author
                .as_ref()
                .map(|author| author.name.clone())
                .unwrap_or_default()
                .into(),
        );
        vars.insert("git_commit_url".to_string(), commit.url.clone().into());
    }

    let mut wrapped = JsonMap::new();
    wrapped.insert("trigger".to_string(), serde_json::Value::Object(vars));
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{TriggerProvider, TriggerSource};
    use tokio::sync::mpsc;

    type Launch = (String, String, String, JsonMap);

    fn webhook() -> (GitWebhook, mpsc::UnboundedReceiver<Launch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let run_fn: RunFlowFn = Arc::new(move |flow, namespace, trigger, vars| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((flow, namespace, trigger, vars));
                Ok(())
            })
        });
        (GitWebhook::new(run_fn), rx)
    }

    fn trigger(config: serde_json::Value) -> Trigger {
        Trigger {
            id: "on-push".to_string(),
            namespace: "default".to_string(),
            flow: "ci".to_string(),
            source: TriggerSource {
                id: "src".to_string(),
                provider: TriggerProvider::GitWebhook,
                config,
            },
        }
    }

    fn push_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "before": "def456",
            "repository": {
                "full_name": "org/repo",
                "name": "repo",
                "owner": {"login": "org"},
                "html_url": "https://example.com/org/repo"
            },
            "pusher": {"name": "octocat"},
            "head_commit": {
                "message": "fix build",
                "author": {"name": "octocat"},
                "url": "https://example.com/org/repo/commit/abc123"
            }
        }))
        .unwrap()
    }

    fn push_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_HEADER, "push".parse().unwrap());
        headers
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    async fn recv_launch(rx: &mut mpsc::UnboundedReceiver<Launch>) -> Launch {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("flow should have been launched")
            .unwrap()
    }

    #[tokio::test]
    async fn push_event_launches_the_flow_with_git_variables() {
        let (webhook, mut rx) = webhook();
        let trigger = trigger(serde_json::json!({
            "provider": "github",
            "repository": "org/repo",
            "events": ["push"]
        }));

        let (status, _) = webhook.handle(&trigger, &push_headers(), &push_body());
        assert_eq!(status, StatusCode::OK);

        let (flow, namespace, trigger_id, vars) = recv_launch(&mut rx).await;
        assert_eq!(flow, "ci");
        assert_eq!(namespace, "default");
        assert_eq!(trigger_id, "on-push");

        let git = vars.get("trigger").unwrap().as_object().unwrap();
        assert_eq!(git.get("git_ref").unwrap(), "refs/heads/main");
        assert_eq!(git.get("git_sha").unwrap(), "abc123");
        assert_eq!(git.get("git_before").unwrap(), "def456");
        assert_eq!(git.get("git_repository").unwrap(), "org/repo");
        assert_eq!(git.get("git_pusher").unwrap(), "octocat");
        assert_eq!(git.get("git_repo_owner").unwrap(), "org");
        assert_eq!(git.get("git_commit_message").unwrap(), "fix build");
    }

    #[tokio::test]
    async fn valid_signature_is_accepted_and_invalid_rejected() {
        let (webhook, mut rx) = webhook();
        let secret = "hunter2";
        let trigger = trigger(serde_json::json!({
            "provider": "github",
            "repository": "org/repo",
            "secret": secret,
            "events": ["push"]
        }));
        let body = push_body();

        let mut headers = push_headers();
        headers.insert(SIGNATURE_HEADER, sign(secret, &body).parse().unwrap());
        let (status, _) = webhook.handle(&trigger, &headers, &body);
        assert_eq!(status, StatusCode::OK);
        recv_launch(&mut rx).await;

        let mut bad_headers = push_headers();
        bad_headers.insert(
            SIGNATURE_HEADER,
            sign("wrong-secret", &body).parse().unwrap(),
        );
        let (status, message) = webhook.handle(&trigger, &bad_headers, &body);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(message.contains("signature"));
    }

    #[tokio::test]
    async fn missing_signature_with_secret_is_rejected() {
        let (webhook, _rx) = webhook();
        let trigger = trigger(serde_json::json!({
            "provider": "github",
            "repository": "org/repo",
            "secret": "hunter2",
            "events": ["push"]
        }));

        let (status, _) = webhook.handle(&trigger, &push_headers(), &push_body());
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_provider_is_a_bad_request() {
        let (webhook, _rx) = webhook();
        let trigger = trigger(serde_json::json!({
            "provider": "sourcehut",
            "repository": "org/repo"
        }));

        let (status, message) = webhook.handle(&trigger, &push_headers(), &push_body());
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(message.contains("unsupported git provider"));
    }

    #[tokio::test]
    async fn non_push_events_are_rejected() {
        let (webhook, _rx) = webhook();
        let trigger = trigger(serde_json::json!({
            "provider": "github",
            "repository": "org/repo",
            "events": ["push"]
        }));

        let mut headers = HeaderMap::new();
        headers.insert(EVENT_HEADER, "issues".parse().unwrap());
        let (status, message) = webhook.handle(&trigger, &headers, &push_body());
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(message.contains("unsupported GitHub event type"));
    }

    #[tokio::test]
    async fn unconfigured_event_type_is_acknowledged_without_launch() {
        let (webhook, mut rx) = webhook();
        let trigger = trigger(serde_json::json!({
            "provider": "github",
            "repository": "org/repo",
            "events": ["release"]
        }));

        let (status, message) = webhook.handle(&trigger, &push_headers(), &push_body());
        assert_eq!(status, StatusCode::OK);
        assert!(message.contains("ignored"));

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unconfigured_branch_is_acknowledged_without_launch() {
        let (webhook, mut rx) = webhook();
        let trigger = trigger(serde_json::json!({
            "provider": "github",
            "repository": "org/repo",
            "events": ["push"],
            "branches": ["release"]
        }));

        let (status, message) = webhook.handle(&trigger, &push_headers(), &push_body());
        assert_eq!(status, StatusCode::OK);
        assert!(message.contains("branch not configured"));

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payload_is_a_bad_request() {
        let (webhook, _rx) = webhook();
        let trigger = trigger(serde_json::json!({
            "provider": "github",
            "repository": "org/repo",
            "events": ["push"]
        }));

        let (status, _) = webhook.handle(&trigger, &push_headers(), b"not json");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
