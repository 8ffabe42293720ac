//! In-memory `ConnectionSource` — zero networking, suitable for tests, local
//! demos, and any scenario where all nodes run in one process.
//!
//! A shared [`MemoryDht`] hub stands in for the real DHT: when a node joins a
//! topic hash it is paired with every current member over a
//! `tokio::io::duplex` stream, and each side receives a [`NewPeer`] carrying
//! the other's public key — the same contract a real overlay adapter
//! provides after its transport handshake.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::P2pError;

use super::{ConnectionSource, NewPeer};

/// Buffer size of each in-memory stream half.
const STREAM_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct HubInner {
    /// topic hash → member keys.
    members: HashMap<[u8; 32], HashSet<String>>,
    /// node key → channel surfacing its new peers.
    inboxes: HashMap<String, mpsc::UnboundedSender<NewPeer>>,
    /// unordered pairs already connected (a real overlay dedups dials too).
    paired: HashSet<(String, String)>,
}

/// Shared in-process hub. Every node's [`MemoryOverlay`] holds an `Arc` to
/// the same hub so that joins observe each other.
#[derive(Default)]
pub struct MemoryDht {
    inner: Mutex<HubInner>,
}

impl MemoryDht {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and return its overlay endpoint.
    pub fn connect(self: &Arc<Self>, public_key_hex: &str) -> MemoryOverlay {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .inboxes
            .insert(public_key_hex.to_string(), tx);
        MemoryOverlay {
            hub: Arc::clone(self),
            key: public_key_hex.to_string(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn join(&self, key: &str, topic: [u8; 32]) {
        let mut inner = self.inner.lock().unwrap();
        let members = inner.members.entry(topic).or_default();
        let peers: Vec<String> = members
            .iter()
            .filter(|k| k.as_str() != key)
            .cloned()
            .collect();
        members.insert(key.to_string());

        for other in peers {
            let pair = ordered_pair(key, &other);
            if !inner.paired.insert(pair) {
                continue;
            }
            let (ours, theirs) = tokio::io::duplex(STREAM_CAPACITY);
            if let Some(tx) = inner.inboxes.get(key) {
                let _ = tx.send(NewPeer {
                    public_key_hex: other.clone(),
                    stream: Box::new(ours),
                });
            }
            if let Some(tx) = inner.inboxes.get(&other) {
                let _ = tx.send(NewPeer {
                    public_key_hex: key.to_string(),
                    stream: Box::new(theirs),
                });
            }
        }
    }

    fn leave(&self, key: &str, topic: [u8; 32]) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(members) = inner.members.get_mut(&topic) {
            members.remove(key);
        }
    }
}

fn ordered_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// One node's endpoint on a [`MemoryDht`] hub.
pub struct MemoryOverlay {
    hub: Arc<MemoryDht>,
    key: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<NewPeer>>,
}

#[async_trait]
impl ConnectionSource for MemoryOverlay {
    async fn join(&self, topic_hash: [u8; 32]) -> Result<(), P2pError> {
        self.hub.join(&self.key, topic_hash);
        Ok(())
    }

    async fn leave(&self, topic_hash: [u8; 32]) -> Result<(), P2pError> {
        self.hub.leave(&self.key, topic_hash);
        Ok(())
    }

    async fn next_peer(&self) -> Option<NewPeer> {
        self.rx.lock().await.recv().await
    }
}
