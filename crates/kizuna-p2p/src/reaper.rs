//! Background reapers: peer timeout, entropy-driven churn, task retry.
//!
//! Each reaper is one spawned loop on a fixed ticker, cancelled by the
//! node's shutdown token. Missed ticks are skipped, never bunched.

use std::sync::{atomic::Ordering, Arc};

use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::{
    identity::short_id_of,
    node::{NodeEvent, Shared},
    overlay::now_ms,
    protocol::types::{PeerMessage, TaskRequestMsg, TaskStatus},
    tasks::{backoff_ms, RetryCandidate, MAX_ATTEMPTS},
};

pub(crate) fn spawn_all(shared: &Arc<Shared>) {
    tokio::spawn(timeout_reaper(Arc::clone(shared)));
    tokio::spawn(entropy_reaper(Arc::clone(shared)));
    tokio::spawn(retry_reaper(Arc::clone(shared)));
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Evict peers that have gone silent past the idle ceiling.
async fn timeout_reaper(shared: Arc<Shared>) {
    let mut tick = ticker(shared.timing.timeout_tick);
    let max_idle_ms = shared.timing.peer_timeout.as_millis() as i64;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tick.tick() => {
                for key in shared.peers.evict_idle(max_idle_ms) {
                    tracing::warn!(peer = %short_id_of(&key), "peer timed out, evicting");
                    shared.emit(NodeEvent::PeerDisconnected { key });
                }
            }
        }
    }
}

/// Fault injection: when enabled, each peer survives a tick with p = 0.5.
async fn entropy_reaper(shared: Arc<Shared>) {
    let mut tick = ticker(shared.timing.entropy_tick);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tick.tick() => {
                if !shared.entropy.load(Ordering::Relaxed) {
                    continue;
                }
                for key in shared.peers.keys() {
                    if rand::random::<f64>() < shared.timing.entropy_probability
                        && shared.peers.remove(&key)
                    {
                        tracing::info!(peer = %short_id_of(&key), "entropy reaper dropped peer");
                        shared.emit(NodeEvent::PeerDisconnected { key });
                    }
                }
            }
        }
    }
}

/// Dead-letter expired tasks and re-deliver queued ones whose time has come.
async fn retry_reaper(shared: Arc<Shared>) {
    let mut tick = ticker(shared.timing.retry_tick);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tick.tick() => retry_pass(&shared).await,
        }
    }
}

async fn retry_pass(shared: &Arc<Shared>) {
    let now = now_ms();

    for task_id in shared.tasks.expired_deadlines(now) {
        if shared.tasks.dead_letter(task_id, "Deadline exceeded").is_some() {
            tracing::warn!(task_id = %task_id, "task dead-lettered: deadline exceeded");
            shared.emit(NodeEvent::TaskUpdated {
                task_id,
                status: TaskStatus::Failed,
            });
        }
    }

    for candidate in shared.tasks.due_retries(now) {
        match shared.peers.resolve(&candidate.target) {
            Some(peer_key) => redeliver(shared, candidate, &peer_key, now).await,
            None => miss(shared, candidate, now),
        }
    }
}

/// The target came back: re-sign the original request (same task id) and
/// send it to the resolved peer.
async fn redeliver(shared: &Arc<Shared>, candidate: RetryCandidate, peer_key: &str, now: i64) {
    let Some(task) = shared.tasks.get_sent(candidate.task_id) else {
        return;
    };
    if task.status != TaskStatus::QueuedForRetry {
        return;
    }

    let message = PeerMessage::TaskRequest(TaskRequestMsg {
        task_id: task.task_id,
        task_type: task.task_type,
        payload: task.payload.clone(),
        deadline: task.deadline,
        sender: shared.identity.short_id(),
    });
    let frame = message
        .to_content()
        .and_then(|content| serde_json::to_string(&shared.identity.sign(content)));
    let frame = match frame {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(task_id = %task.task_id, "could not encode retry: {e}");
            return;
        }
    };

    match shared.peers.send_json(peer_key, &frame).await {
        Ok(()) => {
            shared.tasks.mark_retry_sent(task.task_id, now);
            tracing::info!(
                task_id = %task.task_id,
                peer = %short_id_of(peer_key),
                "queued task re-delivered"
            );
            shared.emit(NodeEvent::TaskUpdated {
                task_id: task.task_id,
                status: TaskStatus::Pending,
            });
        }
        // The peer died between resolution and write; treat it as a miss.
        Err(_) => miss(shared, candidate, now),
    }
}

/// The target is still offline: exhaust the budget or reschedule.
fn miss(shared: &Arc<Shared>, candidate: RetryCandidate, now: i64) {
    if candidate.attempt_count >= MAX_ATTEMPTS {
        let reason = format!("Peer offline after {} attempts", candidate.attempt_count);
        if shared
            .tasks
            .dead_letter(candidate.task_id, &reason)
            .is_some()
        {
            tracing::warn!(task_id = %candidate.task_id, "task dead-lettered: {reason}");
            shared.emit(NodeEvent::TaskUpdated {
                task_id: candidate.task_id,
                status: TaskStatus::Failed,
            });
        }
        return;
    }

    let attempts = candidate.attempt_count + 1;
    let delay = backoff_ms(
        attempts,
        shared.timing.retry_base.as_millis() as i64,
        shared.timing.retry_cap.as_millis() as i64,
    );
    shared.tasks.reschedule_retry(candidate.task_id, now + delay);
    tracing::debug!(
        task_id = %candidate.task_id,
        attempts,
        delay_ms = delay,
        "retry target offline, rescheduled"
    );
}
