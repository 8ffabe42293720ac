//! Loopback HTTP control plane for the local agent.
//!
//! Everything is JSON in and JSON out. Validation failures are 400 with an
//! `{error}` body and no state change; a task submission whose target is
//! offline is 202 with the scheduled retry time. `/health` and the agent
//! card stay public even when an API key guards the rest.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use kizuna_p2p::{
    BridgeHandle, Manifest, NewTask, P2pError, Priority, TaskStatus, TaskType,
    tasks::TaskRecord,
};

use crate::{
    a2a,
    auth::{bearer_token, keys_match},
    store::{BlobDrive, MemoryLog},
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub bridge: BridgeHandle,
    pub log: Arc<dyn MemoryLog>,
    pub drive: Arc<dyn BlobDrive>,
    pub api_key: Option<Arc<String>>,
    /// Advertised JSON-RPC endpoint, shown on the agent card.
    pub rpc_url: Arc<String>,
}

/// Build the full control-plane router.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/.well-known/agent-card.json", get(a2a::agent_card));

    let protected = Router::new()
        .route("/identity", get(identity))
        .route("/manifest", get(manifest_get).put(manifest_put))
        .route("/peers", get(peers))
        .route("/inbox", get(inbox))
        .route("/broadcast", post(broadcast))
        .route("/memory/append", post(memory_append))
        .route("/memory", get(memory_read))
        .route("/storage/put", post(storage_put))
        .route("/storage/list", get(storage_list))
        .route("/storage/get/:name", get(storage_get))
        .route("/topics", get(topics_list))
        .route("/topics/join", post(topics_join))
        .route("/topics/leave", post(topics_leave))
        .route("/entropy", post(entropy_toggle))
        .route("/task/request", post(task_request))
        .route("/task/respond", post(task_respond))
        .route("/task/status/:id", get(task_status))
        .route("/task/retry/:id", post(task_retry))
        .route("/tasks", get(tasks_all))
        .route("/tasks/queued", get(tasks_queued))
        .route("/tasks/failed", get(tasks_failed))
        .route("/capabilities/search", get(capability_search))
        .route("/stats", get(stats))
        .route("/a2a/v1", post(a2a::handle_rpc))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Auth middleware ───────────────────────────────────────────────────────────

async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    let authorized = bearer_token(request.headers())
        .is_some_and(|provided| keys_match(expected, provided));
    if !authorized {
        return ApiError(StatusCode::UNAUTHORIZED, "unauthorized".into()).into_response();
    }
    next.run(request).await
}

// ── Error plumbing ────────────────────────────────────────────────────────────

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<P2pError> for ApiError {
    fn from(e: P2pError) -> Self {
        let status = match &e {
            P2pError::InvalidTask(_) | P2pError::DefaultTopic => StatusCode::BAD_REQUEST,
            P2pError::TaskNotFound(_)
            | P2pError::PeerNotFound(_)
            | P2pError::TopicNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl From<crate::error::NodeError> for ApiError {
    fn from(e: crate::error::NodeError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

/// Deserialise a request body, mapping failures to 400 rather than the
/// extractor's default rejection.
fn parse_body<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| bad_request(format!("invalid request body: {e}")))
}

// ── Identity & manifest ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "shortId": state.bridge.short_id(),
        "uptimeMs": state.bridge.stats().uptime_ms,
    }))
}

async fn identity(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "publicKey": state.bridge.public_key_hex(),
        "shortId": state.bridge.short_id(),
        "manifest": state.bridge.manifest(),
    }))
}

async fn manifest_get(State(state): State<AppState>) -> Json<Manifest> {
    Json(state.bridge.manifest())
}

async fn manifest_put(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let manifest: Manifest = parse_body(body)?;
    let delivered = state.bridge.set_manifest(manifest.clone()).await?;
    Ok(Json(json!({ "manifest": manifest, "rebroadcastTo": delivered })))
}

// ── Peers, inbox, broadcast ───────────────────────────────────────────────────

async fn peers(State(state): State<AppState>) -> Json<Value> {
    let peers = state.bridge.peers();
    Json(json!({ "count": peers.len(), "peers": peers }))
}

async fn inbox(State(state): State<AppState>) -> Json<Value> {
    let messages = state.bridge.drain_inbox();
    Json(json!({ "count": messages.len(), "messages": messages }))
}

async fn broadcast(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let content = body
        .get("content")
        .cloned()
        .ok_or_else(|| bad_request("content is required"))?;
    let delivered = state.bridge.broadcast(content).await?;
    Ok(Json(json!({ "delivered": delivered, "loopback": true })))
}

async fn capability_search(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let query = params
        .get("q")
        .filter(|q| !q.is_empty())
        .ok_or_else(|| bad_request("query parameter q is required"))?;
    let matches = state.bridge.search_capabilities(query);
    Ok(Json(json!({ "query": query, "matches": matches })))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let stats = state.bridge.stats();
    Json(json!({
        "startedAt": stats.started_at,
        "uptimeMs": stats.uptime_ms,
        "observedPeers": stats.observed_peers,
        "connectedPeers": state.bridge.peer_count(),
    }))
}

// ── Memory & storage (external collaborators) ─────────────────────────────────

async fn memory_append(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let entry = body
        .get("entry")
        .cloned()
        .ok_or_else(|| bad_request("entry is required"))?;
    let index = state.log.append(entry).await?;
    Ok(Json(json!({ "index": index })))
}

async fn memory_read(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let limit = match params.get("limit") {
        Some(raw) => Some(
            raw.parse::<usize>()
                .map_err(|_| bad_request("limit must be a non-negative integer"))?,
        ),
        None => None,
    };
    let entries = state.log.read(limit).await?;
    Ok(Json(json!({ "count": entries.len(), "entries": entries })))
}

async fn storage_put(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| bad_request("name is required"))?;
    let data = body
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_request("data (base64) is required"))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|_| bad_request("data is not valid base64"))?;
    let size = bytes.len();
    state.drive.put(name, bytes).await?;
    Ok(Json(json!({ "name": name, "size": size })))
}

async fn storage_list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let files = state.drive.list().await?;
    Ok(Json(json!({ "count": files.len(), "files": files })))
}

async fn storage_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let bytes = state
        .drive
        .get(&name)
        .await?
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("no such file: {name}")))?;
    Ok(Json(json!({
        "name": name,
        "size": bytes.len(),
        "data": base64::engine::general_purpose::STANDARD.encode(bytes),
    })))
}

// ── Topics & entropy ──────────────────────────────────────────────────────────

async fn topics_list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "topics": state.bridge.topics() }))
}

async fn topics_join(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| bad_request("name is required"))?;
    let secret = body.get("secret").and_then(Value::as_str);
    let hash = state.bridge.join_topic(name, secret).await?;
    Ok(Json(json!({ "name": name, "topicHash": hash })))
}

async fn topics_leave(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| bad_request("name is required"))?;
    let left = state.bridge.leave_topic(name).await?;
    Ok(Json(json!({ "name": name, "left": left })))
}

async fn entropy_toggle(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let enabled = body
        .get("enabled")
        .and_then(Value::as_bool)
        .ok_or_else(|| bad_request("enabled (boolean) is required"))?;
    state.bridge.set_entropy(enabled);
    Ok(Json(json!({ "enabled": enabled })))
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct TaskRequestBody {
    description: String,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    task_type: Option<TaskType>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    deadline: Option<i64>,
}

async fn task_request(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let body: TaskRequestBody = parse_body(body)?;
    let outcome = state
        .bridge
        .submit_task(NewTask {
            description: body.description,
            context: body.context,
            priority: body.priority.unwrap_or_default(),
            task_type: body.task_type.unwrap_or_default(),
            target: body.target,
            deadline: body.deadline,
            context_id: None,
            a2a_source: false,
        })
        .await?;

    let task = &outcome.task;
    if outcome.queued {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "task_id": task.task_id,
                "status": task.status,
                "nextRetryTime": task.next_retry_time,
                "message": "accepted for retry",
            })),
        )
            .into_response());
    }
    Ok(Json(json!({
        "task_id": task.task_id,
        "status": task.status,
        "target": task.target,
        "delivered": outcome.delivered,
    }))
    .into_response())
}

#[derive(serde::Deserialize)]
struct TaskRespondBody {
    task_id: Uuid,
    status: TaskStatus,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

async fn task_respond(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let body: TaskRespondBody = parse_body(body)?;
    let updated = state
        .bridge
        .respond_task(body.task_id, body.status, body.result, body.error)
        .await?;
    Ok(Json(json!({ "task_id": updated.task_id, "status": updated.status })))
}

async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task_id: Uuid = id
        .parse()
        .map_err(|_| bad_request("id is not a valid task id"))?;
    let record = state
        .bridge
        .task_record(task_id)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("no such task: {task_id}")))?;
    Ok(Json(task_record_json(record)?))
}

async fn task_retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task_id: Uuid = id
        .parse()
        .map_err(|_| bad_request("id is not a valid task id"))?;
    let task = state.bridge.retry_task(task_id)?;
    Ok(Json(json!({
        "task_id": task.task_id,
        "status": task.status,
        "nextRetryTime": task.next_retry_time,
    })))
}

async fn tasks_all(State(state): State<AppState>) -> Json<Value> {
    let tables = state.bridge.tasks();
    Json(json!({
        "sent": tables.sent_snapshot(),
        "received": tables.received_snapshot(),
        "queued": tables.queued_snapshot(),
        "failed": tables.dead_snapshot(),
    }))
}

async fn tasks_queued(State(state): State<AppState>) -> Json<Value> {
    let queued = state.bridge.tasks().queued_snapshot();
    Json(json!({ "count": queued.len(), "tasks": queued }))
}

async fn tasks_failed(State(state): State<AppState>) -> Json<Value> {
    let failed = state.bridge.tasks().dead_snapshot();
    Json(json!({ "count": failed.len(), "tasks": failed }))
}

/// Tag a record with the table it came from.
fn task_record_json(record: TaskRecord) -> Result<Value, ApiError> {
    let internal = |e: serde_json::Error| {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    };
    let (mut value, direction) = match record {
        TaskRecord::Sent(task) => (serde_json::to_value(task).map_err(internal)?, "sent"),
        TaskRecord::Received(task) => (serde_json::to_value(task).map_err(internal)?, "received"),
        TaskRecord::Dead(letter) => (serde_json::to_value(letter).map_err(internal)?, "failed"),
    };
    value["direction"] = Value::String(direction.to_string());
    Ok(value)
}
