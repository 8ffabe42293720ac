//! Multi-node integration tests.
//!
//! All tests run entirely in-process over a shared `MemoryDht` hub — no
//! sockets, no external DHT. Reaper and heartbeat intervals are shrunk so a
//! full retry cycle fits in a test run.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::time::timeout;

use kizuna_p2p::{
    overlay::topic_hash,
    protocol::framing::write_frame,
    BridgeConfig, BridgeHandle, BridgeNode, BridgeTiming, ConnectionSource, Manifest, MemoryDht,
    NewTask, NodeEvent, NodeIdentity, Priority, TaskStatus, TaskType, DEFAULT_TOPIC,
};

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn manifest(name: &str) -> Manifest {
    Manifest {
        role: "generalist".into(),
        skills: vec!["chat".into()],
        agent_id: name.into(),
        specs: None,
    }
}

fn fast_timing() -> BridgeTiming {
    BridgeTiming {
        heartbeat_interval: Duration::from_millis(50),
        peer_timeout: Duration::from_millis(400),
        timeout_tick: Duration::from_millis(100),
        entropy_tick: Duration::from_millis(50),
        entropy_probability: 0.5,
        retry_tick: Duration::from_millis(50),
        retry_base: Duration::from_millis(100),
        retry_cap: Duration::from_millis(1000),
    }
}

fn new_task(description: &str, target: Option<&str>) -> NewTask {
    NewTask {
        description: description.into(),
        context: None,
        priority: Priority::Medium,
        task_type: TaskType::General,
        target: target.map(str::to_string),
        deadline: None,
        context_id: None,
        a2a_source: false,
    }
}

/// Start a node on the hub and return its handle (the tempdir keeps the
/// identity file alive for the test's duration).
async fn spawn_node(
    hub: &Arc<MemoryDht>,
    name: &str,
) -> (BridgeHandle, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let identity = NodeIdentity::load_or_create(dir.path()).unwrap();
    let overlay = Arc::new(hub.connect(identity.public_key_hex()));

    let mut config = BridgeConfig::new(manifest(name));
    config.timing = fast_timing();
    let node = BridgeNode::new(config, identity, overlay);
    let handle = node.handle();
    tokio::spawn(node.run());
    (handle, dir)
}

/// Poll until `check` holds, failing the test after five seconds.
async fn wait_until<F: Fn() -> bool>(label: &str, check: F) {
    timeout(Duration::from_secs(5), async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {label}"));
}

/// Wait for the first matching event from a broadcast receiver.
async fn wait_for_event<F>(
    rx: &mut tokio::sync::broadcast::Receiver<NodeEvent>,
    matcher: F,
    label: &str,
) where
    F: Fn(&NodeEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(ev) if matcher(&ev) => return,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed waiting for {label}: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {label}"));
}

/// Both sides see each other's handshake.
async fn wait_connected(a: &BridgeHandle, b: &BridgeHandle) {
    let (a, b) = (a.clone(), b.clone());
    wait_until("peers to exchange handshakes", move || {
        let sees = |x: &BridgeHandle, key: &str| {
            x.peers()
                .iter()
                .any(|p| p.key == key && p.manifest.is_some())
        };
        sees(&a, &b.public_key_hex()) && sees(&b, &a.public_key_hex())
    })
    .await;
}

// ── Chat & loopback ───────────────────────────────────────────────────────────

#[tokio::test]
async fn two_node_chat_with_loopback() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;
    let (b, _db) = spawn_node(&hub, "bob").await;
    wait_connected(&a, &b).await;

    let mut b_events = b.subscribe_events();
    a.broadcast(json!({ "type": "CHAT", "text": "hi" }))
        .await
        .unwrap();

    // Loopback copy is synchronous with the broadcast call.
    let own = a.drain_inbox();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].sender, a.public_key_hex());
    assert_eq!(own[0].content["text"], "hi");
    assert!(a.drain_inbox().is_empty(), "drain must empty the inbox");

    wait_for_event(
        &mut b_events,
        |ev| matches!(ev, NodeEvent::InboxMessage { .. }),
        "chat delivery to bob",
    )
    .await;
    let inbox = b.drain_inbox();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].content["type"], "CHAT");
    assert_eq!(inbox[0].content["text"], "hi");
    assert_eq!(inbox[0].sender, a.public_key_hex());
}

// ── Task delegation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn task_happy_path() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;
    let (b, _db) = spawn_node(&hub, "bob").await;
    wait_connected(&a, &b).await;

    let outcome = a
        .submit_task(new_task("compute x", Some(&b.short_id())))
        .await
        .unwrap();
    assert!(!outcome.queued);
    assert_eq!(outcome.task.status, TaskStatus::Pending);
    let task_id = outcome.task.task_id;

    let b2 = b.clone();
    wait_until("bob to receive the task", move || {
        b2.tasks().get_received(task_id).is_some()
    })
    .await;
    let inbox = b.drain_inbox();
    assert!(inbox.iter().any(|m| m.content["type"] == "task_request"));

    b.respond_task(
        task_id,
        TaskStatus::Completed,
        Some(json!({ "ok": true })),
        None,
    )
    .await
    .unwrap();

    let a2 = a.clone();
    wait_until("alice to see completion", move || {
        a2.tasks()
            .get_sent(task_id)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    })
    .await;
    let done = a.tasks().get_sent(task_id).unwrap();
    assert_eq!(done.result, Some(json!({ "ok": true })));
    assert_eq!(done.responder, Some(b.short_id()));
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn task_to_offline_target_queues_then_delivers() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;

    let outcome = a
        .submit_task(new_task("find the ghost", Some("ghost")))
        .await
        .unwrap();
    assert!(outcome.queued);
    let task = &outcome.task;
    assert_eq!(task.status, TaskStatus::QueuedForRetry);
    assert_eq!(task.attempt_count, 1);
    // First backoff step: base · 2^1.
    assert_eq!(task.next_retry_time, Some(task.created_at + 200));
    let task_id = task.task_id;

    // A peer named "ghost" comes online; the reaper re-delivers the same id.
    let (c, _dc) = spawn_node(&hub, "ghost").await;
    wait_connected(&a, &c).await;

    let c2 = c.clone();
    wait_until("ghost to receive the queued task", move || {
        c2.tasks().get_received(task_id).is_some()
    })
    .await;
    let a2 = a.clone();
    wait_until("task back to pending", move || {
        a2.tasks()
            .get_sent(task_id)
            .is_some_and(|t| t.status == TaskStatus::Pending)
    })
    .await;
}

#[tokio::test]
async fn retry_exhaustion_dead_letters_the_task() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;

    let outcome = a
        .submit_task(new_task("unreachable", Some("nobody")))
        .await
        .unwrap();
    assert!(outcome.queued);
    let task_id = outcome.task.task_id;

    let a2 = a.clone();
    wait_until("task to reach the dead-letter table", move || {
        a2.tasks().get_dead(task_id).is_some()
    })
    .await;

    let letter = a.tasks().get_dead(task_id).unwrap();
    assert_eq!(letter.failure_reason, "Peer offline after 3 attempts");
    assert_eq!(letter.task.attempt_count, 3);
    assert!(a.tasks().queued_snapshot().is_empty());
    assert!(a.tasks().get_sent(task_id).is_none());
}

#[tokio::test]
async fn past_deadline_is_dead_lettered_regardless_of_attempts() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;

    let mut task = new_task("too late", Some("ghost"));
    task.deadline = Some(wall_clock_ms() - 1_000);
    let outcome = a.submit_task(task).await.unwrap();
    let task_id = outcome.task.task_id;

    let a2 = a.clone();
    wait_until("deadline dead-letter", move || {
        a2.tasks().get_dead(task_id).is_some()
    })
    .await;
    assert_eq!(
        a.tasks().get_dead(task_id).unwrap().failure_reason,
        "Deadline exceeded"
    );
}

#[tokio::test]
async fn dead_letter_requeue_restores_the_task() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;

    let outcome = a
        .submit_task(new_task("second chance", Some("nobody")))
        .await
        .unwrap();
    let task_id = outcome.task.task_id;
    let a2 = a.clone();
    wait_until("exhaustion", move || a2.tasks().get_dead(task_id).is_some()).await;

    let requeued = a.retry_task(task_id).unwrap();
    assert_eq!(requeued.status, TaskStatus::QueuedForRetry);
    assert_eq!(requeued.attempt_count, 0);
    assert!(a.tasks().get_dead(task_id).is_none());
}

// ── Signature handling ────────────────────────────────────────────────────────

#[tokio::test]
async fn tampered_signature_is_dropped_but_session_survives() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;

    // A hand-rolled peer that speaks the wire format directly.
    let dir = tempfile::tempdir().unwrap();
    let identity = NodeIdentity::load_or_create(dir.path()).unwrap();
    let overlay = hub.connect(identity.public_key_hex());
    overlay.join(topic_hash(DEFAULT_TOPIC, None)).await.unwrap();
    let mut peer = overlay.next_peer().await.unwrap();

    let mut a_events = a.subscribe_events();

    // First a frame whose signature has one flipped byte…
    let mut bad = identity.sign(r#"{"type":"CHAT","text":"forged"}"#.to_string());
    let mut sig = hex::decode(&bad.signature).unwrap();
    sig[0] ^= 0x01;
    bad.signature = hex::encode(sig);
    write_frame(&mut peer.stream, &serde_json::to_string(&bad).unwrap())
        .await
        .unwrap();

    // …then a valid one from the same peer.
    let good = identity.sign(r#"{"type":"CHAT","text":"legit"}"#.to_string());
    write_frame(&mut peer.stream, &serde_json::to_string(&good).unwrap())
        .await
        .unwrap();

    wait_for_event(
        &mut a_events,
        |ev| matches!(ev, NodeEvent::InboxMessage { .. }),
        "the valid frame",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let inbox = a.drain_inbox();
    assert_eq!(inbox.len(), 1, "only the valid frame may be delivered");
    assert_eq!(inbox[0].content["text"], "legit");
}

// ── Reapers ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn silent_peer_is_evicted_while_live_peer_stays() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;
    let (b, _db) = spawn_node(&hub, "bob").await;
    wait_connected(&a, &b).await;

    // A peer that connects and then never writes anything.
    let overlay = hub.connect("00silent00");
    overlay.join(topic_hash(DEFAULT_TOPIC, None)).await.unwrap();
    let _peer = overlay.next_peer().await.unwrap();

    let a2 = a.clone();
    wait_until("silent peer installed", move || a2.peer_count() == 2).await;

    let a2 = a.clone();
    wait_until("silent peer evicted", move || a2.peer_count() == 1).await;
    assert!(
        a.peers().iter().all(|p| p.key != "00silent00"),
        "the heartbeating peer must survive"
    );
}

#[tokio::test]
async fn entropy_reaper_churns_peers_when_enabled() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;
    let (b, _db) = spawn_node(&hub, "bob").await;
    wait_connected(&a, &b).await;

    assert!(!a.entropy_enabled());
    a.set_entropy(true);

    let a2 = a.clone();
    wait_until("entropy to drop the peer", move || a2.peer_count() == 0).await;
}

// ── Manifest & topics ─────────────────────────────────────────────────────────

#[tokio::test]
async fn manifest_change_rebroadcasts_to_live_peers() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;
    let (b, _db) = spawn_node(&hub, "bob").await;
    wait_connected(&a, &b).await;

    let mut updated = manifest("bob");
    updated.skills = vec!["vhdl".into(), "pcb-layout".into()];
    let delivered = b.set_manifest(updated).await.unwrap();
    assert_eq!(delivered, 1);

    let (a2, b_key) = (a.clone(), b.public_key_hex());
    wait_until("alice to see the new manifest", move || {
        a2.peers().iter().any(|p| {
            p.key == b_key
                && p.manifest
                    .as_ref()
                    .is_some_and(|m| m.skills.contains(&"vhdl".to_string()))
        })
    })
    .await;

    let found = a.search_capabilities("VHDL");
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].manifest.as_ref().unwrap().agent_id,
        "bob"
    );
}

#[tokio::test]
async fn topic_bookkeeping_via_handle() {
    let hub = MemoryDht::new();
    let (a, _da) = spawn_node(&hub, "alice").await;

    let a2 = a.clone();
    wait_until("default topic joined", move || {
        a2.topics().iter().any(|t| t.name == DEFAULT_TOPIC)
    })
    .await;

    let hash = a.join_topic("lab", Some("s3cret")).await.unwrap();
    assert_eq!(hash.len(), 64);
    // Idempotent re-join keeps the original hash.
    assert_eq!(a.join_topic("lab", None).await.unwrap(), hash);

    assert!(a.leave_topic("lab").await.unwrap());
    assert!(!a.leave_topic("lab").await.unwrap());
    assert!(a.leave_topic(DEFAULT_TOPIC).await.is_err());
}
