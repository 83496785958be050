//! End-to-end tests of the HTTP API against the in-memory state backend
//! and the stub cluster.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use pipelined::cluster::{Cluster, JobStatus, StubCluster};
use pipelined::coordinator::{Coordinator, CoordinatorConfig};
use pipelined::server::http::{create_router, AppState};
use pipelined::state::memory::MemoryState;
use pipelined::state::{ensure_default_namespace, State};

struct TestApp {
    router: Router,
    cluster: Arc<StubCluster>,
    _dir: TempDir,
}

async fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(StubCluster::new());
    let state = Arc::new(MemoryState::new());
    ensure_default_namespace(state.as_ref()).await.unwrap();

    let coordinator = Coordinator::new(CoordinatorConfig {
        cluster: Arc::clone(&cluster) as Arc<dyn Cluster>,
        state: Arc::clone(&state) as Arc<dyn State>,
        data_dir: dir.path().to_path_buf(),
        rpc_addr: "127.0.0.1:8181".to_string(),
    });
    coordinator.start().await.unwrap();

    let router = create_router(Arc::new(AppState {
        coordinator,
        state: state as Arc<dyn State>,
    }));

    TestApp {
        router,
        cluster,
        _dir: dir,
    }
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, json)
}

fn inline_flow_body(id: &str) -> serde_json::Value {
    serde_json::json!({
        "flow": {
            "id": id,
            "namespace": "default",
            "inline": {
                "id": "build",
                "runner": {"image": "alpine:3"},
                "step": [
                    {"id": "s1", "run": "echo a"},
                    {"id": "s2", "run": "echo b"}
                ]
            }
        }
    })
}

fn spec_flow_body(id: &str, job_id: &str) -> serde_json::Value {
    serde_json::json!({
        "flow": {
            "id": id,
            "namespace": "default",
            "specification": [{
                "id": "a",
                "job": {
                    "raw": format!("{{\"id\": \"{job_id}\", \"type\": \"batch\", \"task_groups\": []}}")
                }
            }]
        }
    })
}

// --- Namespaces ---

#[tokio::test]
async fn namespace_crud_round_trip() {
    let app = test_app().await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/v1/namespaces",
        Some(serde_json::json!({"namespace": {"id": "team-a", "description": "Team A"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["namespace"]["id"], "team-a");

    let (status, body) = send(&app.router, "GET", "/v1/namespaces/team-a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["namespace"]["description"], "Team A");

    let (status, body) = send(&app.router, "GET", "/v1/namespaces", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["namespaces"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app.router, "DELETE", "/v1/namespaces/team-a", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn default_namespace_cannot_be_deleted() {
    let app = test_app().await;
    let (status, body) = send(&app.router, "DELETE", "/v1/namespaces/default", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("cannot delete default namespace"));
}

#[tokio::test]
async fn duplicate_namespace_conflicts() {
    let app = test_app().await;
    let body = serde_json::json!({"namespace": {"id": "team-a"}});
    let (status, _) = send(&app.router, "POST", "/v1/namespaces", Some(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, error) = send(&app.router, "POST", "/v1/namespaces", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"]["code"], 409);
}

// --- Flows ---

#[tokio::test]
async fn flow_create_get_delete_round_trip() {
    let app = test_app().await;

    let (status, _) = send(
        &app.router,
        "POST",
        "/v1/flows",
        Some(inline_flow_body("ci")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app.router, "GET", "/v1/flows/ci", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["flow"]["id"], "ci");
    assert_eq!(body["flow"]["inline"]["step"].as_array().unwrap().len(), 2);

    let (status, body) = send(&app.router, "GET", "/v1/flows", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["flows"][0]["kind"], "inline");

    let (status, _) = send(&app.router, "DELETE", "/v1/flows/ci", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app.router, "GET", "/v1/flows/ci", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn flow_namespace_mismatch_is_a_bad_request() {
    let app = test_app().await;
    let mut body = inline_flow_body("ci");
    body["flow"]["namespace"] = serde_json::json!("team-a");

    let (status, error) = send(&app.router, "POST", "/v1/flows", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .contains("does not match request namespace"));
}

#[tokio::test]
async fn flow_create_in_unknown_namespace_is_not_found() {
    let app = test_app().await;
    let (status, _) = send(
        &app.router,
        "POST",
        "/v1/flows?namespace=ghost",
        Some(inline_flow_body("ci")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wildcard_namespace_only_allowed_on_list() {
    let app = test_app().await;

    let (status, _) = send(&app.router, "GET", "/v1/flows?namespace=*", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, error) = send(&app.router, "GET", "/v1/flows/ci?namespace=*", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .contains("wildcard namespace not allowed"));
}

// --- Runs ---

#[tokio::test]
async fn run_flow_returns_a_fresh_run_id() {
    let app = test_app().await;
    send(
        &app.router,
        "POST",
        "/v1/flows",
        Some(inline_flow_body("ci")),
    )
    .await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/v1/flows/ci/run",
        Some(serde_json::json!({"variables": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app.router, "GET", &format!("/v1/runs/{run_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["status"], "pending");
    assert_eq!(body["run"]["trigger"], "manual");
    assert_eq!(body["run"]["flow_id"], "ci");

    // The wrapper job was registered on the cluster.
    assert_eq!(app.cluster.registered_jobs().len(), 1);
}

#[tokio::test]
async fn missing_required_variable_is_a_bad_request_and_creates_no_run() {
    let app = test_app().await;
    let mut body = inline_flow_body("ci");
    body["flow"]["variable"] = serde_json::json!([{"name": "x", "required": true}]);
    send(&app.router, "POST", "/v1/flows", Some(body)).await;

    let (status, error) = send(
        &app.router,
        "POST",
        "/v1/flows/ci/run",
        Some(serde_json::json!({"variables": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .contains("missing required variable: x"));

    let (_, runs) = send(&app.router, "GET", "/v1/runs", None).await;
    assert_eq!(runs["runs"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn spec_flow_runs_to_success_through_the_api() {
    let app = test_app().await;
    app.cluster.set_job_status("a-job", "default", JobStatus::Dead);

    send(
        &app.router,
        "POST",
        "/v1/flows",
        Some(spec_flow_body("deploy", "a-job")),
    )
    .await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/v1/flows/deploy/run",
        Some(serde_json::json!({"variables": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = body["run_id"].as_str().unwrap().to_string();

    // Poll the API until the run reaches a terminal state.
    let mut last = serde_json::Value::Null;
    for _ in 0..500 {
        let (_, body) = send(&app.router, "GET", &format!("/v1/runs/{run_id}"), None).await;
        last = body["run"].clone();
        if last["status"] == "success" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(last["status"], "success");
    assert_eq!(last["spec_run"]["specs"][0]["status"], "success");
    assert_eq!(last["spec_run"]["specs"][0]["nomad_job_id"], "a-job");
}

#[tokio::test]
async fn cancel_unknown_run_is_not_found() {
    let app = test_app().await;
    let (status, _) = send(&app.router, "PUT", "/v1/runs/nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn run_logs_require_step_and_type() {
    let app = test_app().await;
    send(
        &app.router,
        "POST",
        "/v1/flows",
        Some(inline_flow_body("ci")),
    )
    .await;
    let (_, body) = send(
        &app.router,
        "POST",
        "/v1/flows/ci/run",
        Some(serde_json::json!({"variables": {}})),
    )
    .await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, error) = send(
        &app.router,
        "GET",
        &format!("/v1/runs/{run_id}/logs?type=stdout"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .contains("step_id"));

    let (status, _) = send(
        &app.router,
        "GET",
        &format!("/v1/runs/{run_id}/logs?step_id=s1&type=tty"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn run_logs_return_appended_lines() {
    let app = test_app().await;
    send(
        &app.router,
        "POST",
        "/v1/flows",
        Some(inline_flow_body("ci")),
    )
    .await;
    let (_, body) = send(
        &app.router,
        "POST",
        "/v1/flows/ci/run",
        Some(serde_json::json!({"variables": {}})),
    )
    .await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    // Log batches normally arrive via the runner RPC; write directly here.
    let coordinator_dir = app._dir.path().join("runs/default").join(&run_id);
    assert!(coordinator_dir.join("s1/logs").is_dir());
    std::fs::write(coordinator_dir.join("s1/logs/stdout.log"), "a\nb\n").unwrap();

    let (status, body) = send(
        &app.router,
        "GET",
        &format!("/v1/runs/{run_id}/logs?step_id=s1&type=stdout&tail=false"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logs"], serde_json::json!(["a", "b"]));
}

// --- Triggers ---

#[tokio::test]
async fn trigger_create_requires_an_existing_flow() {
    let app = test_app().await;

    let (status, _) = send(
        &app.router,
        "POST",
        "/v1/triggers",
        Some(serde_json::json!({
            "trigger": {
                "id": "nightly",
                "namespace": "default",
                "flow": "ghost",
                "source": {
                    "id": "src",
                    "provider": "cron",
                    "config": {"crons": ["0 0 3 * * *"]}
                }
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn trigger_with_invalid_cron_is_rolled_back() {
    let app = test_app().await;
    send(
        &app.router,
        "POST",
        "/v1/flows",
        Some(inline_flow_body("ci")),
    )
    .await;

    let (status, _) = send(
        &app.router,
        "POST",
        "/v1/triggers",
        Some(serde_json::json!({
            "trigger": {
                "id": "broken",
                "namespace": "default",
                "flow": "ci",
                "source": {
                    "id": "src",
                    "provider": "cron",
                    "config": {"crons": ["not a cron"]}
                }
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Rolled back: the trigger is gone and the flow is deletable.
    let (status, _) = send(&app.router, "GET", "/v1/triggers/broken", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app.router, "DELETE", "/v1/flows/ci", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn flow_with_trigger_cannot_be_deleted() {
    let app = test_app().await;
    send(
        &app.router,
        "POST",
        "/v1/flows",
        Some(inline_flow_body("ci")),
    )
    .await;

    let (status, _) = send(
        &app.router,
        "POST",
        "/v1/triggers",
        Some(serde_json::json!({
            "trigger": {
                "id": "nightly",
                "namespace": "default",
                "flow": "ci",
                "source": {
                    "id": "src",
                    "provider": "cron",
                    "config": {"crons": ["0 0 3 * * *"]}
                }
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, error) = send(&app.router, "DELETE", "/v1/flows/ci", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .contains("linked trigger"));

    let (status, _) = send(&app.router, "DELETE", "/v1/triggers/nightly", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app.router, "DELETE", "/v1/flows/ci", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn webhook_on_a_cron_trigger_is_a_bad_request() {
    let app = test_app().await;
    send(
        &app.router,
        "POST",
        "/v1/flows",
        Some(inline_flow_body("ci")),
    )
    .await;
    send(
        &app.router,
        "POST",
        "/v1/triggers",
        Some(serde_json::json!({
            "trigger": {
                "id": "nightly",
                "namespace": "default",
                "flow": "ci",
                "source": {
                    "id": "src",
                    "provider": "cron",
                    "config": {"crons": ["0 0 3 * * *"]}
                }
            }
        })),
    )
    .await;

    let (status, error) = send(
        &app.router,
        "POST",
        "/v1/triggers/nightly/webhooks",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .contains("not configured for git webhooks"));
}

#[tokio::test]
async fn github_webhook_launches_the_flow() {
    let app = test_app().await;
    app.cluster.set_job_status("a-job", "default", JobStatus::Dead);
    send(
        &app.router,
        "POST",
        "/v1/flows",
        Some(spec_flow_body("deploy", "a-job")),
    )
    .await;
    send(
        &app.router,
        "POST",
        "/v1/triggers",
        Some(serde_json::json!({
            "trigger": {
                "id": "on-push",
                "namespace": "default",
                "flow": "deploy",
                "source": {
                    "id": "src",
                    "provider": "git-webhook",
                    "config": {
                        "provider": "github",
                        "repository": "org/repo",
                        "events": ["push"]
                    }
                }
            }
        })),
    )
    .await;

    let payload = serde_json::json!({
        "ref": "refs/heads/main",
        "after": "abc123",
        "before": "def456",
        "repository": {"full_name": "org/repo", "name": "repo",
                       "owner": {"login": "org"}, "html_url": "https://example.com"},
        "pusher": {"name": "octocat"}
    });

    let request = Request::builder()
        .method("POST")
        .uri("/v1/triggers/on-push/webhooks")
        .header("content-type", "application/json")
        .header("x-github-event", "push")
        .body(Body::from(serde_json::to_string(&payload).unwrap()))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The launched run carries the webhook's trigger id and variables.
    let mut found = None;
    for _ in 0..500 {
        let (_, body) = send(&app.router, "GET", "/v1/runs", None).await;
        if let Some(stub) = body["runs"].as_array().and_then(|runs| runs.first()) {
            if stub["status"] == "success" {
                found = Some(stub.clone());
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stub = found.expect("webhook should have started a run");
    assert_eq!(stub["trigger"], "on-push");

    let run_id = stub["id"].as_str().unwrap();
    let (_, body) = send(&app.router, "GET", &format!("/v1/runs/{run_id}"), None).await;
    assert_eq!(body["run"]["variables"]["trigger.git_sha"], "abc123");
}

#[tokio::test]
async fn error_body_shape_is_stable() {
    let app = test_app().await;
    let (status, body) = send(&app.router, "GET", "/v1/flows/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 404);
    assert!(body["error"]["message"].is_string());
}
