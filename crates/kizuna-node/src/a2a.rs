//! A2A gateway: agent-card discovery plus a JSON-RPC 2.0 projection of the
//! task engine.
//!
//! The gateway never owns task state — it reads and writes the same tables
//! as the rest of the control plane and re-expresses them under the external
//! schema. JSON-RPC errors always ride on HTTP 200.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};
use uuid::Uuid;

use kizuna_p2p::{
    DeadLetter, Manifest, NewTask, P2pError, Priority, ReceivedTask, SentTask, TaskStatus,
    TaskType,
};

use crate::http::AppState;

/// A2A protocol revision declared on the agent card.
pub const PROTOCOL_VERSION: &str = "0.3.0";
/// KTP revision declared in the card's extension block.
pub const KTP_PROTOCOL: &str = "KTP/1.0";

// ── JSON-RPC error codes ──────────────────────────────────────────────────────

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const TASK_NOT_FOUND: i64 = -32001;
pub const TASK_NOT_CANCELABLE: i64 = -32002;
pub const UNSUPPORTED_OPERATION: i64 = -32003;

const SUPPORTED_METHODS: [&str; 3] = ["message/send", "tasks/get", "tasks/list"];

struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }
}

fn ok_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn err_response(id: Value, error: RpcError) -> Value {
    let mut body = json!({ "code": error.code, "message": error.message });
    if let Some(data) = error.data {
        body["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": body })
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// `POST /a2a/v1` — JSON-RPC 2.0 dispatch.
pub async fn handle_rpc(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let request: Value = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(_) => {
            let error = RpcError::new(PARSE_ERROR, "Parse error");
            return (StatusCode::OK, Json(err_response(Value::Null, error)));
        }
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        let error = RpcError::new(INVALID_REQUEST, "Invalid Request: jsonrpc must be \"2.0\"");
        return (StatusCode::OK, Json(err_response(id, error)));
    }
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        let error = RpcError::new(INVALID_REQUEST, "Invalid Request: missing method");
        return (StatusCode::OK, Json(err_response(id, error)));
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let result = match method {
        "message/send" => message_send(&state, params).await,
        "tasks/get" => tasks_get(&state, params),
        "tasks/list" => Ok(tasks_list(&state, params)),
        "tasks/cancel" => tasks_cancel(&state, params),
        "message/stream" | "tasks/resubscribe" => Err(RpcError::new(
            UNSUPPORTED_OPERATION,
            "Streaming is not supported by this agent",
        )),
        other => Err(RpcError {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {other}"),
            data: Some(json!({ "supported": SUPPORTED_METHODS })),
        }),
    };

    let response = match result {
        Ok(result) => ok_response(id, result),
        Err(error) => err_response(id, error),
    };
    (StatusCode::OK, Json(response))
}

// ── Methods ───────────────────────────────────────────────────────────────────

/// Turn an A2A message into a KTP task; text parts become the description,
/// everything else rides along as opaque context.
async fn message_send(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let message = params
        .get("message")
        .ok_or_else(|| RpcError::invalid_params("missing message"))?;
    if !message.get("role").is_some_and(Value::is_string) {
        return Err(RpcError::invalid_params("message.role must be a string"));
    }
    let parts = message
        .get("parts")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::invalid_params("message.parts must be an array"))?;

    let text_parts: Vec<&str> = parts
        .iter()
        .filter(|p| p.get("kind").and_then(Value::as_str) == Some("text"))
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text_parts.is_empty() {
        return Err(RpcError::invalid_params(
            "message must contain at least one text part",
        ));
    }
    let description = text_parts.join("\n");

    let opaque_parts: Vec<Value> = parts
        .iter()
        .filter(|p| p.get("kind").and_then(Value::as_str) != Some("text"))
        .cloned()
        .collect();
    let context = json!({ "a2aMessage": message, "dataParts": opaque_parts });

    let task = NewTask {
        description,
        context: Some(context),
        priority: Priority::default(),
        task_type: TaskType::General,
        target: params
            .get("target")
            .and_then(Value::as_str)
            .map(str::to_string),
        deadline: None,
        context_id: message
            .get("contextId")
            .and_then(Value::as_str)
            .map(str::to_string),
        a2a_source: true,
    };

    let outcome = state.bridge.submit_task(task).await.map_err(|e| match e {
        P2pError::InvalidTask(message) => RpcError::invalid_params(message),
        e => RpcError::new(INTERNAL_ERROR, e.to_string()),
    })?;
    Ok(project_sent(&outcome.task))
}

fn tasks_get(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let task_id = task_id_param(&params)?;
    project_record(state, task_id)
        .ok_or_else(|| RpcError::new(TASK_NOT_FOUND, "Task not found"))
}

fn tasks_cancel(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let task_id = task_id_param(&params)?;
    match project_record(state, task_id) {
        Some(_) => Err(RpcError::new(
            TASK_NOT_CANCELABLE,
            "KTP tasks cannot be canceled once submitted",
        )),
        None => Err(RpcError::new(TASK_NOT_FOUND, "Task not found")),
    }
}

/// All three tables merged, newest first, optionally filtered by A2A state
/// and/or contextId.
fn tasks_list(state: &AppState, params: Value) -> Value {
    let state_filter = params.get("state").and_then(Value::as_str);
    let context_filter = params.get("contextId").and_then(Value::as_str);

    let tables = state.bridge.tasks();
    let mut tasks: Vec<(i64, Value)> = Vec::new();
    tasks.extend(
        tables
            .sent_snapshot()
            .iter()
            .map(|t| (t.created_at, project_sent(t))),
    );
    tasks.extend(
        tables
            .received_snapshot()
            .iter()
            .map(|t| (t.created_at, project_received(t))),
    );
    tasks.extend(
        tables
            .dead_snapshot()
            .iter()
            .map(|l| (l.task.created_at, project_dead(l))),
    );
    tasks.sort_by_key(|(created_at, _)| std::cmp::Reverse(*created_at));

    let tasks: Vec<Value> = tasks
        .into_iter()
        .map(|(_, task)| task)
        .filter(|task| {
            state_filter.is_none_or(|want| task["status"]["state"] == want)
                && context_filter.is_none_or(|want| task["contextId"] == want)
        })
        .collect();
    json!({ "tasks": tasks, "count": tasks.len() })
}

fn task_id_param(params: &Value) -> Result<Uuid, RpcError> {
    params
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params("missing task id"))?
        .parse()
        .map_err(|_| RpcError::invalid_params("id is not a valid task id"))
}

fn project_record(state: &AppState, task_id: Uuid) -> Option<Value> {
    use kizuna_p2p::tasks::TaskRecord;
    match state.bridge.task_record(task_id)? {
        TaskRecord::Sent(task) => Some(project_sent(&task)),
        TaskRecord::Received(task) => Some(project_received(&task)),
        TaskRecord::Dead(letter) => Some(project_dead(&letter)),
    }
}

// ── Projection ────────────────────────────────────────────────────────────────

fn a2a_state(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "submitted",
        TaskStatus::QueuedForRetry | TaskStatus::Accepted | TaskStatus::InProgress => "working",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Rejected => "rejected",
    }
}

fn iso8601(ms: i64) -> Value {
    match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms) {
        Some(ts) => Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        None => Value::Null,
    }
}

fn status_object(status: TaskStatus, created_at: i64, note: Option<&Value>) -> Value {
    let mut object = json!({
        "state": a2a_state(status),
        "timestamp": iso8601(created_at),
    });
    if let Some(note) = note {
        let text = match note {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        object["message"] = json!({
            "kind": "message",
            "role": "agent",
            "parts": [{ "kind": "text", "text": text }],
        });
    }
    object
}

fn artifacts(task_id: Uuid, result: Option<&Value>) -> Value {
    match result {
        Some(Value::String(text)) => json!([{
            "artifactId": format!("artifact-{task_id}"),
            "parts": [{ "kind": "text", "text": text }],
        }]),
        Some(data) => json!([{
            "artifactId": format!("artifact-{task_id}"),
            "parts": [{ "kind": "data", "data": data }],
        }]),
        None => json!([]),
    }
}

fn history(task_id: Uuid, role: &str, description: &str) -> Value {
    json!([{
        "kind": "message",
        "messageId": format!("msg-{task_id}"),
        "taskId": task_id,
        "role": role,
        "parts": [{ "kind": "text", "text": description }],
    }])
}

fn task_object(
    task_id: Uuid,
    context_id: Option<&str>,
    status: Value,
    artifacts: Value,
    history: Value,
    metadata: Value,
) -> Value {
    json!({
        "kind": "task",
        "id": task_id,
        "contextId": context_id.map_or_else(|| task_id.to_string(), str::to_string),
        "status": status,
        "artifacts": artifacts,
        "history": history,
        "metadata": metadata,
    })
}

pub(crate) fn project_sent(task: &SentTask) -> Value {
    task_object(
        task.task_id,
        task.context_id.as_deref(),
        status_object(task.status, task.created_at, task.error.as_ref()),
        artifacts(task.task_id, task.result.as_ref()),
        history(task.task_id, "user", &task.payload.description),
        json!({
            "direction": "sent",
            "target": task.target,
            "taskType": task.task_type,
            "ktpStatus": task.status,
            "createdAt": task.created_at,
            "completedAt": task.completed_at,
            "deadline": task.deadline,
        }),
    )
}

pub(crate) fn project_received(task: &ReceivedTask) -> Value {
    task_object(
        task.task_id,
        None,
        status_object(task.status, task.created_at, task.error.as_ref()),
        artifacts(task.task_id, task.result.as_ref()),
        history(task.task_id, "assistant", &task.payload.description),
        json!({
            "direction": "received",
            "from": task.from_short_id,
            "taskType": task.task_type,
            "ktpStatus": task.status,
            "createdAt": task.created_at,
            "completedAt": task.completed_at,
            "deadline": task.deadline,
        }),
    )
}

pub(crate) fn project_dead(letter: &DeadLetter) -> Value {
    let task = &letter.task;
    let reason = Value::String(letter.failure_reason.clone());
    task_object(
        task.task_id,
        task.context_id.as_deref(),
        status_object(task.status, task.created_at, Some(&reason)),
        artifacts(task.task_id, task.result.as_ref()),
        history(task.task_id, "user", &task.payload.description),
        json!({
            "direction": "failed",
            "target": task.target,
            "taskType": task.task_type,
            "ktpStatus": task.status,
            "createdAt": task.created_at,
            "completedAt": task.completed_at,
            "deadline": task.deadline,
            "failedAt": letter.failed_at,
        }),
    )
}

// ── Agent card ────────────────────────────────────────────────────────────────

/// `GET /.well-known/agent-card.json` — never requires auth.
pub async fn agent_card(State(state): State<AppState>) -> Json<Value> {
    Json(build_agent_card(
        &state.bridge.manifest(),
        &state.bridge.short_id(),
        &state.rpc_url,
        state.api_key.is_some(),
    ))
}

fn build_agent_card(manifest: &Manifest, short_id: &str, url: &str, secured: bool) -> Value {
    let skills: Vec<Value> = manifest
        .skills
        .iter()
        .map(|skill| {
            json!({
                "id": skill,
                "name": skill,
                "description": format!("{skill} capability"),
                "inputModes": ["text/plain"],
                "outputModes": ["text/plain"],
            })
        })
        .collect();

    let mut card = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "name": manifest.agent_id,
        "description": format!(
            "Kizuna bridge node for the \"{}\" agent (role: {})",
            manifest.agent_id, manifest.role
        ),
        "url": url,
        "preferredTransport": "JSONRPC",
        "capabilities": { "streaming": false, "pushNotifications": false },
        "defaultInputModes": ["text/plain"],
        "defaultOutputModes": ["text/plain"],
        "skills": skills,
        "extensions": {
            "kizuna": {
                "shortId": short_id,
                "role": manifest.role,
                "protocol": KTP_PROTOCOL,
            }
        },
    });
    if secured {
        card["securitySchemes"] = json!({
            "bearer": { "type": "http", "scheme": "bearer" }
        });
        card["security"] = json!([{ "bearer": [] }]);
    }
    card
}

#[cfg(test)]
mod tests {
    use super::*;
    use kizuna_p2p::TaskPayload;

    fn sent_task(status: TaskStatus) -> SentTask {
        SentTask {
            task_id: Uuid::new_v4(),
            target: "bb11cc22".into(),
            status,
            payload: TaskPayload {
                description: "Do X".into(),
                context: None,
                priority: Priority::Medium,
            },
            task_type: TaskType::General,
            created_at: 1_700_000_000_000,
            deadline: None,
            result: None,
            error: None,
            attempt_count: 1,
            last_attempt_at: None,
            next_retry_time: None,
            responder: None,
            completed_at: None,
            context_id: None,
            a2a_source: true,
        }
    }

    #[test]
    fn state_mapping_matches_the_schema() {
        assert_eq!(a2a_state(TaskStatus::Pending), "submitted");
        assert_eq!(a2a_state(TaskStatus::QueuedForRetry), "working");
        assert_eq!(a2a_state(TaskStatus::Accepted), "working");
        assert_eq!(a2a_state(TaskStatus::InProgress), "working");
        assert_eq!(a2a_state(TaskStatus::Completed), "completed");
        assert_eq!(a2a_state(TaskStatus::Failed), "failed");
        assert_eq!(a2a_state(TaskStatus::Rejected), "rejected");
    }

    #[test]
    fn sent_projection_carries_history_and_metadata() {
        let task = sent_task(TaskStatus::Pending);
        let projected = project_sent(&task);
        assert_eq!(projected["kind"], "task");
        assert_eq!(projected["status"]["state"], "submitted");
        assert_eq!(projected["metadata"]["direction"], "sent");
        assert_eq!(projected["history"][0]["role"], "user");
        assert_eq!(projected["history"][0]["parts"][0]["text"], "Do X");
        // contextId defaults to the task id.
        assert_eq!(projected["contextId"], task.task_id.to_string());
        assert_eq!(projected["artifacts"], json!([]));
    }

    #[test]
    fn string_results_become_text_artifacts() {
        let mut task = sent_task(TaskStatus::Completed);
        task.result = Some(Value::String("all done".into()));
        let projected = project_sent(&task);
        assert_eq!(projected["artifacts"][0]["parts"][0]["kind"], "text");
        assert_eq!(projected["artifacts"][0]["parts"][0]["text"], "all done");
    }

    #[test]
    fn structured_results_become_data_artifacts() {
        let mut task = sent_task(TaskStatus::Completed);
        task.result = Some(json!({ "ok": true }));
        let projected = project_sent(&task);
        assert_eq!(projected["artifacts"][0]["parts"][0]["kind"], "data");
        assert_eq!(projected["artifacts"][0]["parts"][0]["data"]["ok"], true);
    }

    #[test]
    fn dead_letters_project_failure_reason() {
        let letter = DeadLetter {
            task: {
                let mut task = sent_task(TaskStatus::Failed);
                task.status = TaskStatus::Failed;
                task
            },
            failure_reason: "Peer offline after 3 attempts".into(),
            failed_at: 1_700_000_100_000,
        };
        let projected = project_dead(&letter);
        assert_eq!(projected["status"]["state"], "failed");
        assert_eq!(projected["metadata"]["direction"], "failed");
        assert_eq!(
            projected["status"]["message"]["parts"][0]["text"],
            "Peer offline after 3 attempts"
        );
    }

    #[test]
    fn agent_card_projects_skills_and_security() {
        let manifest = Manifest {
            role: "researcher".into(),
            skills: vec!["summarisation".into()],
            agent_id: "ada".into(),
            specs: None,
        };
        let card = build_agent_card(&manifest, "ab12cd34", "http://127.0.0.1:3000/a2a/v1", true);
        assert_eq!(card["name"], "ada");
        assert_eq!(card["capabilities"]["streaming"], false);
        assert_eq!(card["skills"][0]["id"], "summarisation");
        assert_eq!(
            card["skills"][0]["description"],
            "summarisation capability"
        );
        assert_eq!(card["extensions"]["kizuna"]["protocol"], "KTP/1.0");
        assert_eq!(card["securitySchemes"]["bearer"]["scheme"], "bearer");

        let open = build_agent_card(&manifest, "ab12cd34", "http://x/a2a/v1", false);
        assert!(open.get("securitySchemes").is_none());
    }
}
