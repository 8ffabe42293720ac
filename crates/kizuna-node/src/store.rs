//! External storage collaborators.
//!
//! The shared "memory" log and the blob "storage" drive live outside the
//! core; the control plane only ever talks to them through these traits.
//! The in-memory implementations back tests and single-process deployments;
//! a real deployment wires adapters for its log/drive stack here.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::NodeError;

/// Append-only shared memory log.
#[async_trait]
pub trait MemoryLog: Send + Sync + 'static {
    /// Append one entry, returning its index.
    async fn append(&self, entry: Value) -> Result<u64, NodeError>;

    /// Read the newest `limit` entries (all of them when `None`), oldest
    /// first.
    async fn read(&self, limit: Option<usize>) -> Result<Vec<Value>, NodeError>;
}

/// A stored blob's listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct BlobInfo {
    pub name: String,
    pub size: usize,
}

/// Mutable named-blob storage.
#[async_trait]
pub trait BlobDrive: Send + Sync + 'static {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), NodeError>;
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, NodeError>;
    async fn list(&self) -> Result<Vec<BlobInfo>, NodeError>;
}

// ── In-memory implementations ─────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryLog {
    entries: Mutex<Vec<Value>>,
}

impl InMemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MemoryLog for InMemoryLog {
    async fn append(&self, entry: Value) -> Result<u64, NodeError> {
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry);
        Ok((entries.len() - 1) as u64)
    }

    async fn read(&self, limit: Option<usize>) -> Result<Vec<Value>, NodeError> {
        let entries = self.entries.lock().unwrap();
        let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
        Ok(entries[skip..].to_vec())
    }
}

#[derive(Default)]
pub struct InMemoryDrive {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryDrive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl BlobDrive for InMemoryDrive {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), NodeError> {
        self.blobs
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, NodeError> {
        Ok(self.blobs.lock().unwrap().get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<BlobInfo>, NodeError> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .map(|(name, bytes)| BlobInfo {
                name: name.clone(),
                size: bytes.len(),
            })
            .collect())
    }
}
