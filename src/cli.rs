use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Kizuna — a peer-to-peer bridge node for AI agents.
///
/// The node joins DHT topics, keeps signed sessions with peers, and exposes
/// a loopback HTTP API for the local agent (task delegation, inbox, shared
/// memory and storage, A2A discovery).
#[derive(Parser, Debug)]
#[command(name = "kizuna", version, about)]
pub struct Cli {
    /// Path to the node config file (YAML).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (otherwise KIZUNA_LOG / RUST_LOG apply).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the bridge node (default when no subcommand is given).
    Start,

    /// Print the node's public key and short id.
    ///
    /// Generates and persists a fresh identity on first use.
    Identity,

    /// Print the effective configuration and exit.
    Config,
}
