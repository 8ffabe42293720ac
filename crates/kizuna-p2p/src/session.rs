//! Per-peer session lifecycle.
//!
//! Each live peer owns two tasks: a heartbeat timer and a receive loop. Both
//! exit when the session's cancellation token fires; teardown removes the
//! peer entry exactly once regardless of which side noticed the death first.
//!
//! Attribution rule: session-level state (lastSeen, manifest, the table
//! entry) is keyed by the transport-authenticated key, while inbox and task
//! records carry the envelope's `senderKey` — trust is per-envelope, so a
//! frame signed by a key other than the session's still stands on its own
//! signature.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::ReadHalf;
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::{
    envelope::SignedEnvelope,
    identity::short_id_of,
    node::{NodeEvent, Shared},
    overlay::{now_ms, NewPeer, PeerStream},
    peer::SharedWriter,
    protocol::{
        framing::{frame_codec, write_frame},
        types::{Frame, PeerMessage, TaskRequestMsg, TaskResponseMsg, TaskStatus, PING_FRAME},
    },
    tasks::ReceivedTask,
};

/// Bring up a session for a freshly connected peer.
pub(crate) async fn start_session(shared: Arc<Shared>, peer: NewPeer) {
    let key = peer.public_key_hex;
    let short = short_id_of(&key);
    let (read_half, write_half) = tokio::io::split(peer.stream);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));

    // Handshake goes out before the peer is installed: a stream that cannot
    // take our first write never becomes a table entry.
    let manifest = shared.manifest.lock().unwrap().clone();
    let handshake = match (PeerMessage::Handshake { manifest }).to_content() {
        Ok(content) => shared.identity.sign(content),
        Err(e) => {
            tracing::warn!(peer = %short, "could not build handshake: {e}");
            return;
        }
    };
    let frame = match serde_json::to_string(&handshake) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(peer = %short, "could not encode handshake: {e}");
            return;
        }
    };
    {
        let mut w = writer.lock().await;
        if let Err(e) = write_frame(&mut *w, &frame).await {
            tracing::debug!(peer = %short, "handshake write failed: {e}");
            return;
        }
    }

    let cancel = shared.cancel.child_token();
    let session = shared.peers.insert(&key, Arc::clone(&writer), cancel.clone());
    shared.emit(NodeEvent::PeerConnected { key: key.clone() });
    tracing::info!(peer = %short, "peer session established");

    tokio::spawn(heartbeat_loop(
        Arc::clone(&shared),
        key.clone(),
        session,
        writer,
        cancel.clone(),
    ));
    tokio::spawn(receive_loop(shared, key, session, read_half, cancel));
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    key: String,
    session: u64,
    writer: SharedWriter,
    cancel: CancellationToken,
) {
    let interval = shared.timing.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let failed = {
                    let mut w = writer.lock().await;
                    write_frame(&mut *w, PING_FRAME).await.is_err()
                };
                if failed {
                    tracing::debug!(peer = %short_id_of(&key), "heartbeat write failed");
                    teardown(&shared, &key, session);
                    return;
                }
            }
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    key: String,
    session: u64,
    read_half: ReadHalf<PeerStream>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(read_half, frame_codec());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(line)) => handle_frame(&shared, &key, &line),
                Some(Err(e)) => {
                    tracing::debug!(peer = %short_id_of(&key), "stream error: {e}");
                    break;
                }
                None => break,
            }
        }
    }
    teardown(&shared, &key, session);
}

/// Remove the peer entry and cancel its tasks. Safe to call from either
/// loop; a session that has already been replaced leaves the new entry
/// alone.
fn teardown(shared: &Shared, key: &str, session: u64) {
    if shared.peers.remove_session(key, session) {
        shared.emit(NodeEvent::PeerDisconnected {
            key: key.to_string(),
        });
        tracing::info!(peer = %short_id_of(key), "peer session closed");
    }
}

fn handle_frame(shared: &Arc<Shared>, session_key: &str, line: &str) {
    let Some(frame) = Frame::parse(line) else {
        tracing::debug!(peer = %short_id_of(session_key), "dropping malformed frame");
        return;
    };
    shared.peers.touch(session_key);

    let envelope = match frame {
        Frame::Ping => return,
        Frame::Envelope(envelope) => envelope,
    };
    if !envelope.verify() {
        tracing::warn!(
            peer = %short_id_of(session_key),
            "dropping frame with invalid signature"
        );
        return;
    }

    let value: Value = match serde_json::from_str(&envelope.content) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(peer = %short_id_of(session_key), "envelope content is not JSON: {e}");
            return;
        }
    };
    let message = match PeerMessage::from_value(&value) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(peer = %short_id_of(session_key), "malformed message body: {e}");
            return;
        }
    };

    match message {
        PeerMessage::Handshake { manifest } => {
            let agent_id = manifest.agent_id.clone();
            shared.peers.set_manifest(session_key, manifest);
            shared.emit(NodeEvent::HandshakeReceived {
                key: session_key.to_string(),
                agent_id,
            });
        }
        PeerMessage::TaskRequest(request) => on_task_request(shared, &envelope, request, value),
        PeerMessage::TaskResponse(response) => on_task_response(shared, response),
        PeerMessage::Chat(content) => {
            let sender_short = short_id_of(&envelope.sender_key);
            shared.inbox.push(&envelope.sender_key, &sender_short, content);
            shared.emit(NodeEvent::InboxMessage {
                from: envelope.sender_key.clone(),
            });
        }
    }
}

fn on_task_request(
    shared: &Arc<Shared>,
    envelope: &SignedEnvelope,
    request: TaskRequestMsg,
    content: Value,
) {
    let from = envelope.sender_key.clone();
    let from_short = short_id_of(&from);
    let task = ReceivedTask {
        task_id: request.task_id,
        from: from.clone(),
        from_short_id: from_short.clone(),
        status: TaskStatus::Pending,
        payload: request.payload,
        task_type: request.task_type,
        created_at: now_ms(),
        deadline: request.deadline,
        result: None,
        error: None,
        completed_at: None,
    };
    if !shared.tasks.install_received(task) {
        tracing::debug!(task_id = %request.task_id, "duplicate task_request ignored");
        return;
    }
    shared.inbox.push(&from, &from_short, content);
    shared.emit(NodeEvent::TaskReceived {
        task_id: request.task_id,
        from,
    });
    tracing::info!(task_id = %request.task_id, from = %from_short, "task received");
}

fn on_task_response(shared: &Arc<Shared>, response: TaskResponseMsg) {
    let updated = shared.tasks.apply_response(
        response.task_id,
        response.status,
        response.result,
        response.error,
        &response.responder,
    );
    match updated {
        Some(task) => {
            shared.emit(NodeEvent::TaskUpdated {
                task_id: task.task_id,
                status: task.status,
            });
            tracing::info!(
                task_id = %task.task_id,
                status = ?task.status,
                responder = %response.responder,
                "task response applied"
            );
        }
        None => {
            tracing::debug!(
                task_id = %response.task_id,
                "task_response for unknown or terminal task ignored"
            );
        }
    }
}
