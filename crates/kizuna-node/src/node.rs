//! Node startup: identity, bridge, storage collaborators, HTTP server.
//!
//! # Startup sequence
//!
//! 1. Load or create the Ed25519 identity in the data directory.
//! 2. Connect an overlay endpoint and build the `BridgeNode`.
//! 3. Spawn the bridge (accept loop + reapers).
//! 4. Bind the control plane — loopback only, unless an API key is set.
//! 5. Serve until Ctrl-C, then shut the bridge down.

use std::sync::Arc;

use tracing::info;

use kizuna_p2p::{
    BridgeConfig, BridgeHandle, BridgeNode, ConnectionSource, MemoryDht, NodeIdentity,
};

use crate::{
    config::NodeConfig,
    http::{self, AppState},
    store::{InMemoryDrive, InMemoryLog},
};

/// Start a node with the in-process overlay and in-memory collaborators.
///
/// A deployment with a real DHT and log/drive stack calls
/// [`run_with_overlay`] with its own adapters instead.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let data_dir = config.data_dir();
    let identity = NodeIdentity::load_or_create(&data_dir)?;
    let hub = MemoryDht::new();
    let overlay = Arc::new(hub.connect(identity.public_key_hex()));
    run_with_overlay(config, identity, overlay).await
}

pub async fn run_with_overlay(
    config: NodeConfig,
    identity: NodeIdentity,
    overlay: Arc<dyn ConnectionSource>,
) -> anyhow::Result<()> {
    info!(
        short_id = %identity.short_id(),
        agent_id = %config.manifest().agent_id,
        "node identity loaded"
    );

    let mut bridge_config = BridgeConfig::new(config.manifest());
    bridge_config.topics = config.topics.clone();
    bridge_config.inbox_capacity = config.inbox_capacity;

    let node = BridgeNode::new(bridge_config, identity, overlay);
    let bridge = node.handle();
    tokio::spawn(async move {
        if let Err(e) = node.run().await {
            tracing::error!("bridge node error: {e}");
        }
    });

    let state = AppState {
        bridge: bridge.clone(),
        log: InMemoryLog::new(),
        drive: InMemoryDrive::new(),
        api_key: config.api_key.clone().map(Arc::new),
        rpc_url: Arc::new(rpc_url(&config)),
    };
    let app = http::router(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, auth = config.api_key.is_some(), "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(bridge))
        .await?;
    Ok(())
}

/// The JSON-RPC endpoint advertised on the agent card. A wildcard bind is
/// advertised under the machine hostname so remote callers get a reachable
/// URL.
fn rpc_url(config: &NodeConfig) -> String {
    let host = match config.bind_host().as_str() {
        "0.0.0.0" => hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "127.0.0.1".to_string()),
        other => other.to_string(),
    };
    format!("http://{host}:{}/a2a/v1", config.port)
}

async fn shutdown_signal(bridge: BridgeHandle) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    bridge.shutdown();
}
