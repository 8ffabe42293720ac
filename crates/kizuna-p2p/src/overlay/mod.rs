//! Overlay connection management.
//!
//! `ConnectionSource` is the single seam between the node and whatever DHT
//! transport provides discovery (an in-memory hub for tests and demos, a real
//! DHT adapter in deployment). The source owns dialing and accepting; the
//! node only ever sees authenticated duplex streams.

pub mod memory;

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::P2pError;

/// The topic every node joins at startup and may never leave.
pub const DEFAULT_TOPIC: &str = "kizuna:global";

/// Hex length of the topic-hash prefix shown in listings.
const HASH_PREFIX_LEN: usize = 16;

// ── Streams ───────────────────────────────────────────────────────────────────

/// Object-safe duplex stream bound.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// One boxed peer stream as handed out by the connection source.
pub type PeerStream = Box<dyn Duplex>;

/// A freshly connected peer: the DHT layer has already authenticated the
/// remote key against the transport.
pub struct NewPeer {
    pub public_key_hex: String,
    pub stream: PeerStream,
}

// ── Connection source ─────────────────────────────────────────────────────────

/// Backend-agnostic overlay interface.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    /// Announce interest in a topic hash. The source begins pairing this node
    /// with other members; both inbound accepts and outbound dials surface
    /// through [`ConnectionSource::next_peer`].
    async fn join(&self, topic_hash: [u8; 32]) -> Result<(), P2pError>;

    /// Advisory: stop announcing on a topic. Existing sessions are untouched.
    async fn leave(&self, topic_hash: [u8; 32]) -> Result<(), P2pError>;

    /// Next authenticated peer stream, or `None` once the source shuts down.
    async fn next_peer(&self) -> Option<NewPeer>;
}

// ── Topic hashing & registry ──────────────────────────────────────────────────

/// `SHA-256(name)` for a public topic, `SHA-256(name + ":" + secret)` for a
/// private one.
pub fn topic_hash(name: &str, secret: Option<&str>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    match secret {
        Some(secret) => hasher.update(format!("{name}:{secret}")),
        None => hasher.update(name),
    }
    hasher.finalize().into()
}

#[derive(Debug, Clone)]
struct TopicInfo {
    hash: [u8; 32],
    has_secret: bool,
    joined_at: i64,
}

/// A joined topic as reported on the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct TopicView {
    pub name: String,
    pub private: bool,
    #[serde(rename = "joinedAt")]
    pub joined_at: i64,
    #[serde(rename = "hashPrefix")]
    pub hash_prefix: String,
}

/// Bookkeeping of joined topics. Join/leave on the wire is the source's job;
/// this table only records membership.
#[derive(Default)]
pub struct Topics {
    inner: Mutex<HashMap<String, TopicInfo>>,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join. Idempotent: re-joining returns the existing hash
    /// without rehashing a possibly different secret.
    pub fn join(&self, name: &str, secret: Option<&str>) -> ([u8; 32], bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.get(name) {
            return (info.hash, false);
        }
        let hash = topic_hash(name, secret);
        inner.insert(
            name.to_string(),
            TopicInfo {
                hash,
                has_secret: secret.is_some(),
                joined_at: now_ms(),
            },
        );
        (hash, true)
    }

    /// Remove a topic. Leaving the default topic is refused.
    pub fn leave(&self, name: &str) -> Result<Option<[u8; 32]>, P2pError> {
        if name == DEFAULT_TOPIC {
            return Err(P2pError::DefaultTopic);
        }
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.remove(name).map(|info| info.hash))
    }

    pub fn list(&self) -> Vec<TopicView> {
        let inner = self.inner.lock().unwrap();
        let mut topics: Vec<TopicView> = inner
            .iter()
            .map(|(name, info)| TopicView {
                name: name.clone(),
                private: info.has_secret,
                joined_at: info.joined_at,
                hash_prefix: hex::encode(info.hash)[..HASH_PREFIX_LEN].to_string(),
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_and_private_hashes_differ() {
        let public = topic_hash("agents", None);
        let private = topic_hash("agents", Some("s3cret"));
        assert_ne!(public, private);
        assert_eq!(private, topic_hash("agents", Some("s3cret")));
    }

    #[test]
    fn join_is_idempotent() {
        let topics = Topics::new();
        let (first, fresh) = topics.join("room", Some("a"));
        assert!(fresh);
        // A second join with a different secret still reports the original hash.
        let (second, fresh) = topics.join("room", Some("b"));
        assert!(!fresh);
        assert_eq!(first, second);
    }

    #[test]
    fn default_topic_cannot_be_left() {
        let topics = Topics::new();
        topics.join(DEFAULT_TOPIC, None);
        assert!(matches!(
            topics.leave(DEFAULT_TOPIC),
            Err(P2pError::DefaultTopic)
        ));
        assert_eq!(topics.list().len(), 1);
    }

    #[test]
    fn leave_unknown_topic_reports_false() {
        let topics = Topics::new();
        assert!(topics.leave("ghost").unwrap().is_none());
    }
}
