//! Wire-protocol types for kizuna peers.
//!
//! The wire format is one JSON object per frame. Two shapes exist: the bare
//! unsigned heartbeat `{"type":"ping"}` and the signed envelope, whose
//! `content` string parses to one of the inner messages below. Unknown inner
//! `type`s are carried through as opaque chat so newer peers can talk past
//! older ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::SignedEnvelope;

/// The bare heartbeat frame, written every 2.5 s per live peer.
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;

// ── Manifest ──────────────────────────────────────────────────────────────────

/// A peer's self-declared capabilities, exchanged on handshake and
/// re-broadcast on any local change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Free-form role, e.g. `"researcher"` or `"code-reviewer"`.
    pub role: String,
    /// Ordered capability tags.
    pub skills: Vec<String>,
    /// Display name used for task targeting.
    pub agent_id: String,
    /// Opaque extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs: Option<Value>,
}

// ── Task enums ────────────────────────────────────────────────────────────────

/// Closed task-type enum; inputs outside it are rejected at validation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    General,
    Analysis,
    CodeReview,
    Research,
    Test,
    Other,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Lifecycle state of a task, shared by both sides of the protocol.
///
/// `Pending` and `QueuedForRetry` only ever appear on the sender side; the
/// remaining states travel in `task_response` messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    QueuedForRetry,
    Accepted,
    InProgress,
    Completed,
    Failed,
    Rejected,
}

impl TaskStatus {
    /// Terminal tasks are never touched by the retry reaper.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Rejected
        )
    }
}

/// What a task asks for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub priority: Priority,
}

// ── Inner messages ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequestMsg {
    pub task_id: Uuid,
    #[serde(default)]
    pub task_type: TaskType,
    pub payload: TaskPayload,
    #[serde(default)]
    pub deadline: Option<i64>,
    /// Short id of the requester.
    pub sender: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResponseMsg {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    /// Short id of the responder.
    pub responder: String,
}

/// The content of a verified envelope, dispatched by its `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Handshake { manifest: Manifest },
    TaskRequest(TaskRequestMsg),
    TaskResponse(TaskResponseMsg),
    /// Forward-compatibility arm: any other `type` is delivered to the inbox
    /// as-is.
    Chat(Value),
}

impl PeerMessage {
    /// Serialise to the inner-content string that gets signed.
    pub fn to_content(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            PeerMessage::Handshake { manifest } => {
                serde_json::json!({ "type": "handshake", "manifest": manifest })
            }
            PeerMessage::TaskRequest(msg) => tagged(msg, "task_request")?,
            PeerMessage::TaskResponse(msg) => tagged(msg, "task_response")?,
            PeerMessage::Chat(v) => v.clone(),
        };
        serde_json::to_string(&value)
    }

    /// Dispatch a parsed content value.
    ///
    /// Known types with malformed bodies are an error (the caller drops the
    /// frame); unknown or missing types fall through to [`PeerMessage::Chat`].
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        match value.get("type").and_then(Value::as_str) {
            Some("handshake") => {
                let manifest = serde_json::from_value(
                    value.get("manifest").cloned().unwrap_or(Value::Null),
                )?;
                Ok(PeerMessage::Handshake { manifest })
            }
            Some("task_request") => Ok(PeerMessage::TaskRequest(serde_json::from_value(
                value.clone(),
            )?)),
            Some("task_response") => Ok(PeerMessage::TaskResponse(serde_json::from_value(
                value.clone(),
            )?)),
            _ => Ok(PeerMessage::Chat(value.clone())),
        }
    }
}

fn tagged<T: Serialize>(msg: &T, tag: &str) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(msg)?;
    value["type"] = Value::String(tag.to_string());
    Ok(value)
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One parsed wire frame.
#[derive(Debug)]
pub enum Frame {
    Ping,
    Envelope(SignedEnvelope),
}

impl Frame {
    /// Parse a raw frame. Returns `None` for malformed JSON and for unsigned
    /// non-ping frames, both of which are dropped.
    pub fn parse(line: &str) -> Option<Frame> {
        let value: Value = serde_json::from_str(line).ok()?;
        if value.get("signature").is_some() && value.get("senderKey").is_some() {
            return serde_json::from_value(value).ok().map(Frame::Envelope);
        }
        if value.get("type").and_then(Value::as_str) == Some("ping") {
            return Some(Frame::Ping);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_frame_parses() {
        assert!(matches!(Frame::parse(PING_FRAME), Some(Frame::Ping)));
    }

    #[test]
    fn malformed_json_is_dropped() {
        assert!(Frame::parse("{not json").is_none());
    }

    #[test]
    fn unsigned_non_ping_is_dropped() {
        assert!(Frame::parse(r#"{"type":"CHAT","text":"hi"}"#).is_none());
    }

    #[test]
    fn task_request_content_round_trip() {
        let msg = PeerMessage::TaskRequest(TaskRequestMsg {
            task_id: Uuid::new_v4(),
            task_type: TaskType::Research,
            payload: TaskPayload {
                description: "survey the field".into(),
                context: Some(serde_json::json!({ "depth": 2 })),
                priority: Priority::High,
            },
            deadline: Some(1_700_000_000_000),
            sender: "ab12cd34".into(),
        });
        let content = msg.to_content().unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["type"], "task_request");
        assert_eq!(PeerMessage::from_value(&value).unwrap(), msg);
    }

    #[test]
    fn unknown_type_lands_in_chat() {
        let value = serde_json::json!({ "type": "CHAT", "text": "hello" });
        match PeerMessage::from_value(&value).unwrap() {
            PeerMessage::Chat(v) => assert_eq!(v["text"], "hello"),
            other => panic!("wrong arm: {other:?}"),
        }
    }

    #[test]
    fn known_type_with_bad_body_is_an_error() {
        let value = serde_json::json!({ "type": "task_request", "payload": 42 });
        assert!(PeerMessage::from_value(&value).is_err());
    }
}
