//! The Kizuna Task Protocol engine: sent/received/dead-letter tables and the
//! state transitions between them.
//!
//! Everything here is synchronous and lock-scoped; delivery, signing and
//! scheduling live with the node and the retry reaper. The sent and
//! dead-letter tables are disjoint: promotion moves an entry, never copies
//! it.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::P2pError,
    overlay::now_ms,
    protocol::types::{Priority, TaskPayload, TaskStatus, TaskType},
};

/// Retry budget per task.
pub const MAX_ATTEMPTS: u32 = 3;
/// Exponential backoff base.
pub const RETRY_BASE_MS: i64 = 5_000;
/// Backoff ceiling.
pub const RETRY_CAP_MS: i64 = 60_000;

/// Validation ceiling for a task description.
pub const MAX_DESCRIPTION_BYTES: usize = 10_000;
/// Validation ceiling for the serialised context.
pub const MAX_CONTEXT_BYTES: usize = 50_000;

/// `min(base · 2^attempts, cap)`.
pub fn backoff_ms(attempts: u32, base: i64, cap: i64) -> i64 {
    let factor = 1i64 << attempts.min(30);
    base.saturating_mul(factor).min(cap)
}

// ── Records ───────────────────────────────────────────────────────────────────

/// A task this node delegated to a peer.
#[derive(Debug, Clone, Serialize)]
pub struct SentTask {
    pub task_id: Uuid,
    /// Short id, agent name, or `"*"` for broadcast.
    pub target: String,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub task_type: TaskType,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    pub deadline: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    #[serde(rename = "attemptCount")]
    pub attempt_count: u32,
    #[serde(rename = "lastAttemptAt")]
    pub last_attempt_at: Option<i64>,
    #[serde(rename = "nextRetryTime")]
    pub next_retry_time: Option<i64>,
    /// Short id of the peer that answered.
    pub responder: Option<String>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<i64>,
    #[serde(rename = "contextId")]
    pub context_id: Option<String>,
    #[serde(rename = "a2aSource")]
    pub a2a_source: bool,
}

/// A task a peer delegated to this node.
#[derive(Debug, Clone, Serialize)]
pub struct ReceivedTask {
    pub task_id: Uuid,
    /// Full hex key of the requester.
    pub from: String,
    #[serde(rename = "fromShortId")]
    pub from_short_id: String,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub task_type: TaskType,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    pub deadline: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<i64>,
}

/// A sent task that exhausted its retries or passed its deadline.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    #[serde(flatten)]
    pub task: SentTask,
    #[serde(rename = "failureReason")]
    pub failure_reason: String,
    #[serde(rename = "failedAt")]
    pub failed_at: i64,
}

/// Any record a task id can resolve to.
#[derive(Debug, Clone)]
pub enum TaskRecord {
    Sent(SentTask),
    Received(ReceivedTask),
    Dead(DeadLetter),
}

/// A validated submission, ready to become a [`SentTask`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub description: String,
    pub context: Option<Value>,
    pub priority: Priority,
    pub task_type: TaskType,
    pub target: Option<String>,
    pub deadline: Option<i64>,
    pub context_id: Option<String>,
    pub a2a_source: bool,
}

impl NewTask {
    /// Enforce the submission limits.
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.description.trim().is_empty() {
            return Err(P2pError::InvalidTask("description is required".into()));
        }
        if self.description.len() > MAX_DESCRIPTION_BYTES {
            return Err(P2pError::InvalidTask(format!(
                "description exceeds {MAX_DESCRIPTION_BYTES} bytes"
            )));
        }
        if let Some(context) = &self.context {
            let serialised = serde_json::to_string(context)?;
            if serialised.len() > MAX_CONTEXT_BYTES {
                return Err(P2pError::InvalidTask(format!(
                    "context exceeds {MAX_CONTEXT_BYTES} bytes"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn into_sent(self, task_id: Uuid, now: i64) -> SentTask {
        SentTask {
            task_id,
            target: self.target.unwrap_or_else(|| "*".to_string()),
            status: TaskStatus::Pending,
            payload: TaskPayload {
                description: self.description,
                context: self.context,
                priority: self.priority,
            },
            task_type: self.task_type,
            created_at: now,
            deadline: self.deadline,
            result: None,
            error: None,
            attempt_count: 0,
            last_attempt_at: None,
            next_retry_time: None,
            responder: None,
            completed_at: None,
            context_id: self.context_id,
            a2a_source: self.a2a_source,
        }
    }
}

/// A queued task due for another delivery attempt.
#[derive(Debug, Clone)]
pub(crate) struct RetryCandidate {
    pub task_id: Uuid,
    pub target: String,
    pub attempt_count: u32,
}

// ── Tables ────────────────────────────────────────────────────────────────────

/// All three task tables, each behind its own mutex.
#[derive(Default)]
pub struct TaskTables {
    sent: Mutex<HashMap<Uuid, SentTask>>,
    received: Mutex<HashMap<Uuid, ReceivedTask>>,
    dead: Mutex<HashMap<Uuid, DeadLetter>>,
}

impl TaskTables {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Sender side ──────────────────────────────────────────────────────────

    pub fn record_sent(&self, task: SentTask) {
        self.sent.lock().unwrap().insert(task.task_id, task);
    }

    pub fn get_sent(&self, task_id: Uuid) -> Option<SentTask> {
        self.sent.lock().unwrap().get(&task_id).cloned()
    }

    /// Apply a `task_response` from a peer. Terminal tasks are left alone.
    pub fn apply_response(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<Value>,
        responder: &str,
    ) -> Option<SentTask> {
        let mut sent = self.sent.lock().unwrap();
        let task = sent.get_mut(&task_id)?;
        if task.status.is_terminal() {
            return None;
        }
        task.status = status;
        task.result = result;
        task.error = error;
        task.responder = Some(responder.to_string());
        task.next_retry_time = None;
        if status.is_terminal() {
            task.completed_at = Some(now_ms());
        }
        Some(task.clone())
    }

    /// Put a sent task on the retry queue with its first backoff delay.
    pub fn queue_for_retry(&self, task_id: Uuid, now: i64, delay_ms: i64) -> Option<SentTask> {
        let mut sent = self.sent.lock().unwrap();
        let task = sent.get_mut(&task_id)?;
        task.status = TaskStatus::QueuedForRetry;
        task.attempt_count = 1;
        task.last_attempt_at = Some(now);
        task.next_retry_time = Some(now + delay_ms);
        Some(task.clone())
    }

    /// Mark a first delivery attempt on a live peer.
    pub fn mark_delivered(&self, task_id: Uuid, now: i64) {
        let mut sent = self.sent.lock().unwrap();
        if let Some(task) = sent.get_mut(&task_id) {
            task.status = TaskStatus::Pending;
            task.attempt_count = task.attempt_count.max(1);
            task.last_attempt_at = Some(now);
            task.next_retry_time = None;
        }
    }

    // ── Retry reaper support ─────────────────────────────────────────────────

    /// Non-terminal sent tasks whose deadline has passed.
    pub(crate) fn expired_deadlines(&self, now: i64) -> Vec<Uuid> {
        let sent = self.sent.lock().unwrap();
        sent.values()
            .filter(|t| !t.status.is_terminal())
            .filter(|t| t.deadline.is_some_and(|d| d < now))
            .map(|t| t.task_id)
            .collect()
    }

    /// Queued tasks whose `next_retry_time` has arrived.
    pub(crate) fn due_retries(&self, now: i64) -> Vec<RetryCandidate> {
        let sent = self.sent.lock().unwrap();
        sent.values()
            .filter(|t| t.status == TaskStatus::QueuedForRetry)
            .filter(|t| t.next_retry_time.is_some_and(|at| at <= now))
            .map(|t| RetryCandidate {
                task_id: t.task_id,
                target: t.target.clone(),
                attempt_count: t.attempt_count,
            })
            .collect()
    }

    /// Re-delivery succeeded: back to `pending`, waiting on the peer.
    pub(crate) fn mark_retry_sent(&self, task_id: Uuid, now: i64) {
        let mut sent = self.sent.lock().unwrap();
        if let Some(task) = sent.get_mut(&task_id) {
            task.status = TaskStatus::Pending;
            task.last_attempt_at = Some(now);
            task.next_retry_time = None;
        }
    }

    /// Target still offline: burn an attempt and reschedule.
    pub(crate) fn reschedule_retry(&self, task_id: Uuid, next_retry_time: i64) {
        let mut sent = self.sent.lock().unwrap();
        if let Some(task) = sent.get_mut(&task_id) {
            if task.status == TaskStatus::QueuedForRetry {
                task.attempt_count += 1;
                task.next_retry_time = Some(next_retry_time);
            }
        }
    }

    /// Move a sent task to the dead-letter table.
    pub fn dead_letter(&self, task_id: Uuid, reason: &str) -> Option<DeadLetter> {
        let mut task = self.sent.lock().unwrap().remove(&task_id)?;
        task.status = TaskStatus::Failed;
        task.next_retry_time = None;
        let letter = DeadLetter {
            task,
            failure_reason: reason.to_string(),
            failed_at: now_ms(),
        };
        self.dead
            .lock()
            .unwrap()
            .insert(task_id, letter.clone());
        Some(letter)
    }

    /// Manual requeue of a dead-lettered task: attempts reset, retry due now.
    pub fn requeue_dead(&self, task_id: Uuid, now: i64) -> Result<SentTask, P2pError> {
        let letter = self
            .dead
            .lock()
            .unwrap()
            .remove(&task_id)
            .ok_or(P2pError::TaskNotFound(task_id))?;
        let mut task = letter.task;
        task.status = TaskStatus::QueuedForRetry;
        task.attempt_count = 0;
        task.next_retry_time = Some(now);
        task.result = None;
        task.error = None;
        self.sent.lock().unwrap().insert(task_id, task.clone());
        Ok(task)
    }

    // ── Receiver side ────────────────────────────────────────────────────────

    /// Install an inbound task. Returns `false` on a duplicate `task_id`
    /// (re-delivery of a request we already hold).
    pub fn install_received(&self, task: ReceivedTask) -> bool {
        let mut received = self.received.lock().unwrap();
        if received.contains_key(&task.task_id) {
            return false;
        }
        received.insert(task.task_id, task);
        true
    }

    pub fn get_received(&self, task_id: Uuid) -> Option<ReceivedTask> {
        self.received.lock().unwrap().get(&task_id).cloned()
    }

    /// The local agent answered an inbound task.
    pub fn respond_received(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<ReceivedTask, P2pError> {
        let mut received = self.received.lock().unwrap();
        let task = received
            .get_mut(&task_id)
            .ok_or(P2pError::TaskNotFound(task_id))?;
        task.status = status;
        task.result = result;
        task.error = error;
        if status.is_terminal() {
            task.completed_at = Some(now_ms());
        }
        Ok(task.clone())
    }

    // ── Views ────────────────────────────────────────────────────────────────

    pub fn get_dead(&self, task_id: Uuid) -> Option<DeadLetter> {
        self.dead.lock().unwrap().get(&task_id).cloned()
    }

    /// Resolve a task id across all three tables: sent, received, dead.
    pub fn lookup(&self, task_id: Uuid) -> Option<TaskRecord> {
        if let Some(task) = self.get_sent(task_id) {
            return Some(TaskRecord::Sent(task));
        }
        if let Some(task) = self.get_received(task_id) {
            return Some(TaskRecord::Received(task));
        }
        self.get_dead(task_id).map(TaskRecord::Dead)
    }

    pub fn sent_snapshot(&self) -> Vec<SentTask> {
        let mut tasks: Vec<SentTask> = self.sent.lock().unwrap().values().cloned().collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        tasks
    }

    pub fn received_snapshot(&self) -> Vec<ReceivedTask> {
        let mut tasks: Vec<ReceivedTask> =
            self.received.lock().unwrap().values().cloned().collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        tasks
    }

    pub fn queued_snapshot(&self) -> Vec<SentTask> {
        self.sent_snapshot()
            .into_iter()
            .filter(|t| t.status == TaskStatus::QueuedForRetry)
            .collect()
    }

    pub fn dead_snapshot(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> = self.dead.lock().unwrap().values().cloned().collect();
        letters.sort_by_key(|l| std::cmp::Reverse(l.task.created_at));
        letters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(target: &str) -> NewTask {
        NewTask {
            description: "do the thing".into(),
            context: None,
            priority: Priority::Medium,
            task_type: TaskType::General,
            target: Some(target.into()),
            deadline: None,
            context_id: None,
            a2a_source: false,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_ms(1, RETRY_BASE_MS, RETRY_CAP_MS), 10_000);
        assert_eq!(backoff_ms(2, RETRY_BASE_MS, RETRY_CAP_MS), 20_000);
        assert_eq!(backoff_ms(3, RETRY_BASE_MS, RETRY_CAP_MS), 40_000);
        assert_eq!(backoff_ms(4, RETRY_BASE_MS, RETRY_CAP_MS), 60_000);
        assert_eq!(backoff_ms(20, RETRY_BASE_MS, RETRY_CAP_MS), 60_000);
    }

    #[test]
    fn oversized_description_is_rejected() {
        let mut task = new_task("*");
        task.description = "x".repeat(MAX_DESCRIPTION_BYTES + 1);
        assert!(task.validate().is_err());
    }

    #[test]
    fn empty_description_is_rejected() {
        let mut task = new_task("*");
        task.description = "   ".into();
        assert!(task.validate().is_err());
    }

    #[test]
    fn oversized_context_is_rejected() {
        let mut task = new_task("*");
        task.context = Some(serde_json::json!({
            "blob": "y".repeat(MAX_CONTEXT_BYTES)
        }));
        assert!(task.validate().is_err());
    }

    #[test]
    fn queue_then_exhaust_moves_to_dead_letter() {
        let tables = TaskTables::new();
        let id = Uuid::new_v4();
        let now = now_ms();
        tables.record_sent(new_task("ghost").into_sent(id, now));
        tables.queue_for_retry(id, now, 10_000);

        let queued = tables.get_sent(id).unwrap();
        assert_eq!(queued.status, TaskStatus::QueuedForRetry);
        assert_eq!(queued.attempt_count, 1);
        assert_eq!(queued.next_retry_time, Some(now + 10_000));

        tables.reschedule_retry(id, now + 20_000);
        tables.reschedule_retry(id, now + 40_000);
        assert_eq!(tables.get_sent(id).unwrap().attempt_count, MAX_ATTEMPTS);

        let letter = tables
            .dead_letter(id, "Peer offline after 3 attempts")
            .unwrap();
        assert_eq!(letter.task.status, TaskStatus::Failed);
        assert!(tables.get_sent(id).is_none(), "tables must stay disjoint");
        assert!(tables.queued_snapshot().is_empty());
        assert_eq!(tables.dead_snapshot().len(), 1);
    }

    #[test]
    fn requeue_resets_the_retry_budget() {
        let tables = TaskTables::new();
        let id = Uuid::new_v4();
        let now = now_ms();
        tables.record_sent(new_task("ghost").into_sent(id, now));
        tables.queue_for_retry(id, now, 10_000);
        tables.dead_letter(id, "Deadline exceeded");

        let task = tables.requeue_dead(id, now).unwrap();
        assert_eq!(task.status, TaskStatus::QueuedForRetry);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.next_retry_time, Some(now));
        assert!(tables.get_dead(id).is_none());
        assert!(tables.get_sent(id).is_some());
    }

    #[test]
    fn responses_do_not_touch_terminal_tasks() {
        let tables = TaskTables::new();
        let id = Uuid::new_v4();
        tables.record_sent(new_task("aa11bb22").into_sent(id, now_ms()));

        let done = tables
            .apply_response(
                id,
                TaskStatus::Completed,
                Some(serde_json::json!({ "ok": true })),
                None,
                "aa11bb22",
            )
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.responder.as_deref(), Some("aa11bb22"));

        let again = tables.apply_response(id, TaskStatus::InProgress, None, None, "aa11bb22");
        assert!(again.is_none(), "terminal tasks are immutable");
        assert_eq!(
            tables.get_sent(id).unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn duplicate_received_install_is_ignored() {
        let tables = TaskTables::new();
        let id = Uuid::new_v4();
        let task = ReceivedTask {
            task_id: id,
            from: "key".into(),
            from_short_id: "deadbeef".into(),
            status: TaskStatus::Pending,
            payload: TaskPayload {
                description: "inbound".into(),
                context: None,
                priority: Priority::Medium,
            },
            task_type: TaskType::General,
            created_at: now_ms(),
            deadline: None,
            result: None,
            error: None,
            completed_at: None,
        };
        assert!(tables.install_received(task.clone()));
        assert!(!tables.install_received(task));
    }

    #[test]
    fn expired_deadline_is_reported_once_dead_lettered() {
        let tables = TaskTables::new();
        let id = Uuid::new_v4();
        let now = now_ms();
        let mut task = new_task("*").into_sent(id, now);
        task.deadline = Some(now - 1);
        tables.record_sent(task);

        assert_eq!(tables.expired_deadlines(now), vec![id]);
        tables.dead_letter(id, "Deadline exceeded");
        assert!(tables.expired_deadlines(now).is_empty());
    }
}
