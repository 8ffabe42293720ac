//! Bridge node assembly.
//!
//! `BridgeNode` wires the overlay, peer table, task engine and reapers
//! together; obtain a [`BridgeHandle`] before calling `run()` so the control
//! plane can operate on the node while the accept loop runs inside a spawned
//! task. All components are constructed here and handed around explicitly —
//! there are no process-wide tables.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::{BridgeConfig, BridgeTiming},
    error::P2pError,
    identity::NodeIdentity,
    inbox::{Inbox, InboxMessage},
    overlay::{now_ms, ConnectionSource, Topics, TopicView, DEFAULT_TOPIC},
    peer::{PeerRegistry, PeerView},
    protocol::types::{Manifest, PeerMessage, TaskRequestMsg, TaskResponseMsg, TaskStatus},
    reaper, session,
    tasks::{backoff_ms, NewTask, ReceivedTask, SentTask, TaskRecord, TaskTables},
};

/// Events emitted to embedders (and the integration tests).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected { key: String },
    PeerDisconnected { key: String },
    HandshakeReceived { key: String, agent_id: String },
    TaskReceived { task_id: Uuid, from: String },
    TaskUpdated { task_id: Uuid, status: TaskStatus },
    InboxMessage { from: String },
}

/// Everything the sessions, reapers and control plane share.
pub(crate) struct Shared {
    pub identity: NodeIdentity,
    pub manifest: Mutex<Manifest>,
    pub peers: PeerRegistry,
    pub tasks: TaskTables,
    pub inbox: Inbox,
    pub topics: Topics,
    pub source: Arc<dyn ConnectionSource>,
    pub events: broadcast::Sender<NodeEvent>,
    pub entropy: AtomicBool,
    pub started_at: i64,
    pub timing: BridgeTiming,
    pub cancel: CancellationToken,
}

impl Shared {
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }
}

/// Result of a task submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub task: SentTask,
    /// `true` when no live peer matched and the task went on the retry queue.
    pub queued: bool,
    /// Peers the request was written to.
    pub delivered: usize,
}

/// Node counters surfaced on the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct StatsView {
    #[serde(rename = "startedAt")]
    pub started_at: i64,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: i64,
    /// Every peer id ever observed, including self.
    #[serde(rename = "observedPeers")]
    pub observed_peers: Vec<String>,
}

// ── Node ──────────────────────────────────────────────────────────────────────

pub struct BridgeNode {
    shared: Arc<Shared>,
    startup_topics: Vec<String>,
}

impl BridgeNode {
    pub fn new(
        config: BridgeConfig,
        identity: NodeIdentity,
        source: Arc<dyn ConnectionSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let peers = PeerRegistry::new();
        peers.observe(identity.public_key_hex());

        let shared = Arc::new(Shared {
            identity,
            manifest: Mutex::new(config.manifest),
            peers,
            tasks: TaskTables::new(),
            inbox: Inbox::new(config.inbox_capacity),
            topics: Topics::new(),
            source,
            events,
            entropy: AtomicBool::new(false),
            started_at: now_ms(),
            timing: config.timing,
            cancel: CancellationToken::new(),
        });
        Self {
            shared,
            startup_topics: config.topics,
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Join the default topic, start the reapers, then accept peers until
    /// shutdown.
    pub async fn run(self) -> Result<(), P2pError> {
        let handle = self.handle();
        handle.join_topic(DEFAULT_TOPIC, None).await?;
        for name in &self.startup_topics {
            handle.join_topic(name, None).await?;
        }

        reaper::spawn_all(&self.shared);
        tracing::info!(
            short_id = %self.shared.identity.short_id(),
            "bridge node running"
        );

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                peer = self.shared.source.next_peer() => match peer {
                    Some(peer) => session::start_session(Arc::clone(&self.shared), peer).await,
                    None => break,
                }
            }
        }

        self.shared.cancel.cancel();
        self.shared.peers.clear();
        tracing::info!("bridge node stopped");
        Ok(())
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to a running [`BridgeNode`].
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl BridgeHandle {
    // ── Identity & manifest ──────────────────────────────────────────────────

    pub fn public_key_hex(&self) -> String {
        self.shared.identity.public_key_hex().to_string()
    }

    pub fn short_id(&self) -> String {
        self.shared.identity.short_id()
    }

    pub fn manifest(&self) -> Manifest {
        self.shared.manifest.lock().unwrap().clone()
    }

    /// Replace the local manifest and re-broadcast a signed handshake to
    /// every live peer. Returns how many peers received it.
    pub async fn set_manifest(&self, manifest: Manifest) -> Result<usize, P2pError> {
        *self.shared.manifest.lock().unwrap() = manifest.clone();
        let content = PeerMessage::Handshake { manifest }.to_content()?;
        let frame = serde_json::to_string(&self.shared.identity.sign(content))?;
        Ok(self.shared.peers.broadcast_json(&frame).await)
    }

    // ── Peers, inbox, events ─────────────────────────────────────────────────

    pub fn peers(&self) -> Vec<PeerView> {
        self.shared.peers.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    pub fn search_capabilities(&self, query: &str) -> Vec<PeerView> {
        self.shared.peers.search_capabilities(query)
    }

    pub fn drain_inbox(&self) -> Vec<InboxMessage> {
        self.shared.inbox.drain()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> StatsView {
        StatsView {
            started_at: self.shared.started_at,
            uptime_ms: now_ms() - self.shared.started_at,
            observed_peers: self.shared.peers.observed(),
        }
    }

    // ── Broadcast ────────────────────────────────────────────────────────────

    /// Sign `content`, fan it out to every live peer, and append a loopback
    /// copy to the local inbox before returning.
    pub async fn broadcast(&self, content: Value) -> Result<usize, P2pError> {
        let serialised = serde_json::to_string(&content)?;
        let frame = serde_json::to_string(&self.shared.identity.sign(serialised))?;
        let delivered = self.shared.peers.broadcast_json(&frame).await;
        self.shared.inbox.push(
            self.shared.identity.public_key_hex(),
            &self.shared.identity.short_id(),
            content,
        );
        Ok(delivered)
    }

    // ── Topics ───────────────────────────────────────────────────────────────

    /// Join a topic (idempotent) and return its hash, hex-encoded.
    pub async fn join_topic(&self, name: &str, secret: Option<&str>) -> Result<String, P2pError> {
        let (hash, fresh) = self.shared.topics.join(name, secret);
        if fresh {
            if let Err(e) = self.shared.source.join(hash).await {
                if name != DEFAULT_TOPIC {
                    let _ = self.shared.topics.leave(name);
                }
                return Err(e);
            }
            tracing::info!(topic = name, "joined topic");
        }
        Ok(hex::encode(hash))
    }

    /// Advisory leave; refuses the default topic. Existing sessions survive.
    pub async fn leave_topic(&self, name: &str) -> Result<bool, P2pError> {
        match self.shared.topics.leave(name)? {
            Some(hash) => {
                if let Err(e) = self.shared.source.leave(hash).await {
                    tracing::warn!(topic = name, "overlay leave failed: {e}");
                }
                tracing::info!(topic = name, "left topic");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn topics(&self) -> Vec<TopicView> {
        self.shared.topics.list()
    }

    // ── Entropy toggle ───────────────────────────────────────────────────────

    pub fn set_entropy(&self, enabled: bool) {
        self.shared.entropy.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled, "entropy reaper toggled");
    }

    pub fn entropy_enabled(&self) -> bool {
        self.shared.entropy.load(Ordering::Relaxed)
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    /// Validate and dispatch a new task.
    ///
    /// A named target that resolves to a live peer gets the request
    /// immediately; an unresolved target puts the task on the retry queue.
    /// No target (or `"*"`) broadcasts to every live peer.
    pub async fn submit_task(&self, new: NewTask) -> Result<SubmitOutcome, P2pError> {
        new.validate()?;
        let now = now_ms();
        let task_id = Uuid::new_v4();
        let mut task = new.into_sent(task_id, now);
        if task.context_id.is_none() {
            task.context_id = Some(task_id.to_string());
        }
        let target = task.target.clone();

        let message = PeerMessage::TaskRequest(TaskRequestMsg {
            task_id,
            task_type: task.task_type,
            payload: task.payload.clone(),
            deadline: task.deadline,
            sender: self.shared.identity.short_id(),
        });
        let frame = serde_json::to_string(
            &self.shared.identity.sign(message.to_content()?),
        )?;

        self.shared.tasks.record_sent(task);

        let (queued, delivered) = if target == "*" {
            let delivered = self.shared.peers.broadcast_json(&frame).await;
            self.shared.tasks.mark_delivered(task_id, now);
            tracing::info!(task_id = %task_id, delivered, "task broadcast");
            (false, delivered)
        } else {
            let sent = match self.shared.peers.resolve(&target) {
                Some(peer_key) => self.shared.peers.send_json(&peer_key, &frame).await.is_ok(),
                None => false,
            };
            if sent {
                self.shared.tasks.mark_delivered(task_id, now);
                tracing::info!(task_id = %task_id, target = %target, "task delivered");
                (false, 1)
            } else {
                let delay = backoff_ms(
                    1,
                    self.shared.timing.retry_base.as_millis() as i64,
                    self.shared.timing.retry_cap.as_millis() as i64,
                );
                self.shared.tasks.queue_for_retry(task_id, now, delay);
                tracing::info!(
                    task_id = %task_id,
                    target = %target,
                    retry_in_ms = delay,
                    "target offline, task queued for retry"
                );
                (true, 0)
            }
        };

        let task = self
            .shared
            .tasks
            .get_sent(task_id)
            .ok_or(P2pError::TaskNotFound(task_id))?;
        Ok(SubmitOutcome {
            task,
            queued,
            delivered,
        })
    }

    /// Answer an inbound task and mirror the response to the requester.
    ///
    /// Delivery is fire-and-forget: if the requester disconnected, the
    /// response is lost and they are expected to reissue before the deadline.
    pub async fn respond_task(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Result<ReceivedTask, P2pError> {
        if matches!(status, TaskStatus::Pending | TaskStatus::QueuedForRetry) {
            return Err(P2pError::InvalidTask(
                "status must be one of accepted, rejected, in_progress, completed, failed".into(),
            ));
        }
        let updated = self
            .shared
            .tasks
            .respond_received(task_id, status, result.clone(), error.clone())?;

        let message = PeerMessage::TaskResponse(TaskResponseMsg {
            task_id,
            status,
            result,
            error,
            responder: self.shared.identity.short_id(),
        });
        let frame = serde_json::to_string(
            &self.shared.identity.sign(message.to_content()?),
        )?;
        if let Err(e) = self.shared.peers.send_json(&updated.from, &frame).await {
            tracing::debug!(
                task_id = %task_id,
                "task response not delivered (requester offline): {e}"
            );
        }
        Ok(updated)
    }

    /// Promote a dead-lettered task back onto the retry queue.
    pub fn retry_task(&self, task_id: Uuid) -> Result<SentTask, P2pError> {
        let task = self.shared.tasks.requeue_dead(task_id, now_ms())?;
        tracing::info!(task_id = %task_id, "dead-lettered task requeued");
        self.shared.emit(NodeEvent::TaskUpdated {
            task_id,
            status: task.status,
        });
        Ok(task)
    }

    pub fn task_record(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.shared.tasks.lookup(task_id)
    }

    pub fn tasks(&self) -> &TaskTables {
        &self.shared.tasks
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }
}
