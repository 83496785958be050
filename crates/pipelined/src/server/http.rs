//! HTTP API: a thin JSON adapter over the coordinator and state backend.
//!
//! All endpoints live under `/v1` and take a `namespace` query parameter
//! (`default` when absent; `*` only on list endpoints). Errors are
//! `{"error": {"message", "code"}}` bodies with the matching status.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use pipeline_core::rpc::LogType;
use pipeline_core::{
    Flow, JsonMap, Namespace, RunId, Trigger, TriggerProvider, DEFAULT_NAMESPACE,
    WILDCARD_NAMESPACE,
};

use crate::coordinator::Coordinator;
use crate::state::State as StateStore;

/// Per-request timeout; long-lived log tails opt out via streaming.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared state for HTTP handlers.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub state: Arc<dyn StateStore>,
}

/// Build the `/v1` router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/namespaces", post(create_namespace).get(list_namespaces))
        .route(
            "/namespaces/{name}",
            get(get_namespace).delete(delete_namespace),
        )
        .route("/flows", post(create_flow).get(list_flows))
        .route("/flows/{id}", get(get_flow).delete(delete_flow))
        .route("/flows/{id}/run", post(run_flow))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run).delete(delete_run))
        .route("/runs/{id}/cancel", put(cancel_run))
        .route("/runs/{id}/logs", get(get_run_logs))
        .route("/triggers", post(create_trigger).get(list_triggers))
        .route("/triggers/{id}", get(get_trigger).delete(delete_trigger))
        .route("/triggers/{id}/webhooks", post(handle_webhook))
        .with_state(state);

    Router::new()
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

/// Serve the API until the shutdown token fires.
pub async fn serve(
    addr: &str,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> eyre::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(bind_addr = %listener.local_addr()?, "HTTP server listening");

    let router = create_router(state);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
    });

    Ok(handle)
}

// --- Errors ---

/// API error; serialized as `{"error": {"message", "code"}}`.
#[derive(Debug)]
pub struct ApiError {
    message: String,
    code: u16,
}

impl ApiError {
    fn new(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(message, 400)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": {"message": self.message, "code": self.code}
        });
        (status, Json(body)).into_response()
    }
}

impl From<crate::state::StateError> for ApiError {
    fn from(err: crate::state::StateError) -> Self {
        Self::new(err.to_string(), err.code())
    }
}

impl From<crate::coordinator::CoordinatorError> for ApiError {
    fn from(err: crate::coordinator::CoordinatorError) -> Self {
        Self::new(err.to_string(), err.status_code())
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// --- Namespace handling ---

#[derive(Debug, Default, Deserialize)]
struct NamespaceQuery {
    #[serde(default)]
    namespace: Option<String>,
}

/// Resolve and check the request's target namespace. The wildcard is
/// only a valid value on list endpoints and is never a stored object.
async fn resolve_namespace(
    state: &dyn StateStore,
    query: &NamespaceQuery,
    allow_wildcard: bool,
) -> ApiResult<String> {
    let namespace = query
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

    if namespace == WILDCARD_NAMESPACE {
        if allow_wildcard {
            return Ok(namespace);
        }
        return Err(ApiError::bad_request("wildcard namespace not allowed here"));
    }

    state.namespace_get(&namespace).await?;
    Ok(namespace)
}

// --- Namespaces ---

#[derive(Debug, Deserialize)]
struct NamespaceCreateReq {
    namespace: Namespace,
}

async fn create_namespace(
    State(app): State<Arc<AppState>>,
    Json(req): Json<NamespaceCreateReq>,
) -> ApiResult<impl IntoResponse> {
    if req.namespace.id.is_empty() {
        return Err(ApiError::bad_request("namespace ID cannot be empty"));
    }
    if req.namespace.id == WILDCARD_NAMESPACE {
        return Err(ApiError::bad_request("wildcard namespace not allowed here"));
    }

    app.state.namespace_create(&req.namespace).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"namespace": req.namespace})),
    ))
}

async fn list_namespaces(State(app): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let namespaces = app.state.namespace_list().await?;
    Ok(Json(serde_json::json!({"namespaces": namespaces})))
}

async fn get_namespace(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let namespace = app.state.namespace_get(&name).await?;
    Ok(Json(serde_json::json!({"namespace": namespace})))
}

async fn delete_namespace(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if name == DEFAULT_NAMESPACE {
        return Err(ApiError::bad_request("cannot delete default namespace"));
    }

    app.state.namespace_delete(&name).await?;
    Ok(Json(serde_json::json!({})))
}

// --- Flows ---

#[derive(Debug, Deserialize)]
struct FlowCreateReq {
    flow: Flow,
}

async fn create_flow(
    State(app): State<Arc<AppState>>,
    Query(query): Query<NamespaceQuery>,
    Json(req): Json<FlowCreateReq>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;

    req.flow
        .validate(&namespace)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    app.state.flow_create(&req.flow).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"flow": req.flow})),
    ))
}

async fn list_flows(
    State(app): State<Arc<AppState>>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, true).await?;
    let flows = app.state.flow_list(&namespace).await?;
    Ok(Json(serde_json::json!({"flows": flows})))
}

async fn get_flow(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;
    let flow = app.state.flow_get(&namespace, &id).await?;
    Ok(Json(serde_json::json!({"flow": flow})))
}

async fn delete_flow(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;
    app.state.flow_delete(&namespace, &id).await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
struct FlowRunReq {
    #[serde(default)]
    variables: JsonMap,
}

async fn run_flow(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<NamespaceQuery>,
    Json(req): Json<FlowRunReq>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;

    let run_id = app
        .coordinator
        .run_flow(&id, &namespace, "manual", req.variables)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"run_id": run_id})),
    ))
}

// --- Runs ---

async fn list_runs(
    State(app): State<Arc<AppState>>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, true).await?;
    let runs = app.state.run_list(&namespace).await?;
    Ok(Json(serde_json::json!({"runs": runs})))
}

async fn get_run(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;
    let run = app
        .state
        .run_get(&namespace, &RunId::from_string(id))
        .await?;
    Ok(Json(serde_json::json!({"run": run})))
}

async fn delete_run(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;
    app.state
        .run_delete(&namespace, &RunId::from_string(id))
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn cancel_run(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;
    app.coordinator
        .cancel_run(&RunId::from_string(id), &namespace)
        .await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
struct RunLogsQuery {
    #[serde(default)]
    namespace: Option<String>,
    step_id: Option<String>,
    #[serde(rename = "type")]
    log_type: Option<String>,
    #[serde(default)]
    tail: Option<bool>,
}

async fn get_run_logs(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RunLogsQuery>,
) -> ApiResult<Response> {
    let namespace_query = NamespaceQuery {
        namespace: query.namespace.clone(),
    };
    let namespace = resolve_namespace(app.state.as_ref(), &namespace_query, false).await?;

    let step_id = query
        .step_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("step_id not provided"))?;
    let log_type: LogType = query
        .log_type
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("type not provided"))?
        .parse()
        .map_err(ApiError::bad_request)?;

    if query.tail.unwrap_or(false) {
        let stream = app
            .coordinator
            .stream_logs(&namespace, &id, step_id, log_type)
            .map(|line| line.map(|l| Bytes::from(format!("{l}\n"))));

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from_stream(stream))
            .map_err(|err| ApiError::new(err.to_string(), 500))?;
        return Ok(response);
    }

    let logs = app.coordinator.get_logs(&namespace, &id, step_id, log_type)?;
    Ok(Json(serde_json::json!({"logs": logs})).into_response())
}

// --- Triggers ---

#[derive(Debug, Deserialize)]
struct TriggerCreateReq {
    trigger: Trigger,
}

async fn create_trigger(
    State(app): State<Arc<AppState>>,
    Query(query): Query<NamespaceQuery>,
    Json(req): Json<TriggerCreateReq>,
) -> ApiResult<impl IntoResponse> {
    let _namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;

    req.trigger
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    // Refuse dangling references up front.
    app.state
        .flow_get(&req.trigger.namespace, &req.trigger.flow)
        .await?;

    app.state.trigger_create(&req.trigger).await?;

    // Scheduling can still fail (e.g. a bad cron expression); roll the
    // stored trigger back so state and scheduler stay consistent.
    if let Err(err) = app.coordinator.create_trigger(&req.trigger).await {
        if let Err(delete_err) = app
            .state
            .trigger_delete(&req.trigger.namespace, &req.trigger.id)
            .await
        {
            return Err(ApiError::new(
                format!(
                    "failed to schedule trigger: {err}; additionally failed to roll back trigger creation: {delete_err}"
                ),
                500,
            ));
        }
        return Err(err.into());
    }

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"trigger": req.trigger})),
    ))
}

async fn list_triggers(
    State(app): State<Arc<AppState>>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, true).await?;
    let triggers = app.state.trigger_list(&namespace).await?;
    Ok(Json(serde_json::json!({"triggers": triggers})))
}

async fn get_trigger(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;
    let trigger = app.state.trigger_get(&namespace, &id).await?;
    Ok(Json(serde_json::json!({"trigger": trigger})))
}

async fn delete_trigger(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> ApiResult<impl IntoResponse> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;

    let trigger = app.state.trigger_get(&namespace, &id).await?;
    app.state.trigger_delete(&namespace, &id).await?;

    app.coordinator
        .delete_trigger(&trigger)
        .await
        .map_err(|err| {
            ApiError::new(format!("trigger deleted but failed to unschedule: {err}"), 500)
        })?;

    Ok(Json(serde_json::json!({})))
}

async fn handle_webhook(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<NamespaceQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let namespace = resolve_namespace(app.state.as_ref(), &query, false).await?;
    let trigger = app.state.trigger_get(&namespace, &id).await?;

    if trigger.source.provider != TriggerProvider::GitWebhook {
        return Err(ApiError::bad_request(format!(
            "trigger {} is not configured for git webhooks",
            trigger.id
        )));
    }

    let (status, message) = app.coordinator.handle_webhook(&trigger, &headers, &body);
    Ok((status, message).into_response())
}
