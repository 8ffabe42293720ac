use std::time::Duration;

use crate::protocol::types::Manifest;

/// Configuration for a bridge node.
pub struct BridgeConfig {
    /// The local manifest advertised in handshakes.
    pub manifest: Manifest,
    /// Topics to join at startup, in addition to the default topic.
    pub topics: Vec<String>,
    /// Inbox bound; oldest messages are dropped beyond it.
    pub inbox_capacity: usize,
    /// Heartbeat / reaper cadence. Production uses the defaults; tests
    /// shrink them to keep runs fast.
    pub timing: BridgeTiming,
}

impl BridgeConfig {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            topics: Vec::new(),
            inbox_capacity: 1000,
            timing: BridgeTiming::default(),
        }
    }
}

/// Intervals and budgets for the heartbeat and the three reapers.
#[derive(Debug, Clone)]
pub struct BridgeTiming {
    /// Bare-ping cadence per peer.
    pub heartbeat_interval: Duration,
    /// Idle ceiling before the timeout reaper evicts a peer.
    pub peer_timeout: Duration,
    /// Timeout-reaper tick.
    pub timeout_tick: Duration,
    /// Entropy-reaper tick.
    pub entropy_tick: Duration,
    /// Per-peer drop probability per entropy tick.
    pub entropy_probability: f64,
    /// Retry-reaper tick.
    pub retry_tick: Duration,
    /// Exponential backoff base.
    pub retry_base: Duration,
    /// Backoff ceiling.
    pub retry_cap: Duration,
}

impl Default for BridgeTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(2500),
            peer_timeout: Duration::from_secs(10),
            timeout_tick: Duration::from_secs(5),
            entropy_tick: Duration::from_secs(30),
            entropy_probability: 0.5,
            retry_tick: Duration::from_secs(5),
            retry_base: Duration::from_millis(crate::tasks::RETRY_BASE_MS as u64),
            retry_cap: Duration::from_millis(crate::tasks::RETRY_CAP_MS as u64),
        }
    }
}
