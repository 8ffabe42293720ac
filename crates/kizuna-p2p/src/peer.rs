//! The live peer table and the set of every peer ever observed.
//!
//! One entry exists per owning session. All mutation goes through this type,
//! under a single mutex that is never held across an await; per-peer socket
//! writes are serialised by the entry's own writer mutex.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::Serialize;
use tokio::io::WriteHalf;
use tokio_util::sync::CancellationToken;

use crate::{
    error::P2pError,
    identity::short_id_of,
    overlay::{now_ms, PeerStream},
    protocol::{framing::write_frame, types::Manifest},
};

/// Shared, write-serialised handle to a peer's outbound half.
pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<PeerStream>>>;

struct PeerEntry {
    /// Distinguishes the owning session from a replaced predecessor.
    session: u64,
    short_id: String,
    manifest: Option<Manifest>,
    /// ms wall-clock of the last inbound frame; non-decreasing.
    last_seen: i64,
    connected_at: i64,
    writer: SharedWriter,
    /// Cancels the session's receive loop and heartbeat.
    cancel: CancellationToken,
}

/// A peer as reported on the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    pub key: String,
    #[serde(rename = "shortId")]
    pub short_id: String,
    pub manifest: Option<Manifest>,
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
    #[serde(rename = "connectedAt")]
    pub connected_at: i64,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerEntry>>,
    /// Every peer id ever seen, including self. Grows monotonically.
    observed: Mutex<HashSet<String>>,
    next_session: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a peer entry, replacing (and tearing down) any previous
    /// session for the same key. Returns the session number the owning
    /// tasks must present at teardown.
    pub(crate) fn insert(&self, key: &str, writer: SharedWriter, cancel: CancellationToken) -> u64 {
        let now = now_ms();
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let entry = PeerEntry {
            session,
            short_id: short_id_of(key),
            manifest: None,
            last_seen: now,
            connected_at: now,
            writer,
            cancel,
        };
        let previous = self.peers.lock().unwrap().insert(key.to_string(), entry);
        if let Some(old) = previous {
            old.cancel.cancel();
        }
        self.observe(key);
        session
    }

    /// Remove a peer, cancelling its session tasks. Idempotent; returns
    /// whether an entry existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.peers.lock().unwrap().remove(key);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Session-owned removal: a dying session may only take down the entry
    /// it installed, not a replacement that took the key over.
    pub(crate) fn remove_session(&self, key: &str, session: u64) -> bool {
        let removed = {
            let mut peers = self.peers.lock().unwrap();
            match peers.get(key) {
                Some(entry) if entry.session == session => peers.remove(key),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Record an inbound frame from `key`.
    pub fn touch(&self, key: &str) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(entry) = peers.get_mut(key) {
            entry.last_seen = entry.last_seen.max(now_ms());
        }
    }

    pub fn set_manifest(&self, key: &str, manifest: Manifest) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(entry) = peers.get_mut(key) {
            entry.manifest = Some(manifest);
        }
    }

    /// Track a peer id in the observed set (monotonically growing).
    pub fn observe(&self, key: &str) {
        self.observed.lock().unwrap().insert(key.to_string());
    }

    pub fn observed(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.observed.lock().unwrap().iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.peers.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<PeerView> {
        let peers = self.peers.lock().unwrap();
        let mut views: Vec<PeerView> = peers
            .iter()
            .map(|(key, entry)| PeerView {
                key: key.clone(),
                short_id: entry.short_id.clone(),
                manifest: entry.manifest.clone(),
                last_seen: entry.last_seen,
                connected_at: entry.connected_at,
            })
            .collect();
        views.sort_by(|a, b| a.short_id.cmp(&b.short_id));
        views
    }

    /// Resolve a task target to a full peer key: short id first, then
    /// case-insensitive `agent_id`.
    pub fn resolve(&self, target: &str) -> Option<String> {
        let peers = self.peers.lock().unwrap();
        if let Some((key, _)) = peers.iter().find(|(_, e)| e.short_id == target) {
            return Some(key.clone());
        }
        peers
            .iter()
            .find(|(_, e)| {
                e.manifest
                    .as_ref()
                    .is_some_and(|m| m.agent_id.eq_ignore_ascii_case(target))
            })
            .map(|(key, _)| key.clone())
    }

    /// Case-insensitive substring search over manifests' skills and role.
    pub fn search_capabilities(&self, query: &str) -> Vec<PeerView> {
        let needle = query.to_lowercase();
        self.snapshot()
            .into_iter()
            .filter(|view| {
                view.manifest.as_ref().is_some_and(|m| {
                    m.role.to_lowercase().contains(&needle)
                        || m.skills.iter().any(|s| s.to_lowercase().contains(&needle))
                })
            })
            .collect()
    }

    /// Peers idle longer than `max_idle_ms`, removed and returned.
    pub fn evict_idle(&self, max_idle_ms: i64) -> Vec<String> {
        let now = now_ms();
        let expired: Vec<String> = {
            let peers = self.peers.lock().unwrap();
            peers
                .iter()
                .filter(|(_, e)| now - e.last_seen > max_idle_ms)
                .map(|(k, _)| k.clone())
                .collect()
        };
        expired.iter().for_each(|key| {
            self.remove(key);
        });
        expired
    }

    /// Clone of a peer's writer handle, for a send outside the table lock.
    pub(crate) fn writer(&self, key: &str) -> Option<SharedWriter> {
        self.peers
            .lock()
            .unwrap()
            .get(key)
            .map(|e| Arc::clone(&e.writer))
    }

    /// Write one frame to a single peer.
    pub(crate) async fn send_json(&self, key: &str, json: &str) -> Result<(), P2pError> {
        let writer = self
            .writer(key)
            .ok_or_else(|| P2pError::PeerNotFound(key.to_string()))?;
        let mut writer = writer.lock().await;
        write_frame(&mut *writer, json).await?;
        Ok(())
    }

    /// Write one frame to every live peer; returns how many succeeded.
    pub(crate) async fn broadcast_json(&self, json: &str) -> usize {
        let mut delivered = 0;
        for key in self.keys() {
            match self.send_json(&key, json).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(peer = %short_id_of(&key), "broadcast write failed: {e}"),
            }
        }
        delivered
    }

    /// Tear down every session (shutdown path).
    pub fn clear(&self) {
        for key in self.keys() {
            self.remove(&key);
        }
    }
}
