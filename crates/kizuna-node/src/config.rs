//! Node configuration loaded from YAML with environment overrides.
//!
//! All defaults are production-safe: the control plane binds loopback only
//! unless an API key is configured, in which case it binds all interfaces
//! and every sensitive endpoint requires the bearer key.
//!
//! Environment overrides (applied after the file):
//! `KIZUNA_DATA_DIR`, `KIZUNA_PORT`, `KIZUNA_BIND`, `KIZUNA_API_KEY`,
//! `KIZUNA_AGENT_ID`.
//!
//! # Example config
//! ```yaml
//! port: 3000
//! data_dir: "/var/lib/kizuna"
//! api_key: "change-me"
//! agent:
//!   agent_id: "research-agent"
//!   role: "researcher"
//!   skills: ["literature-review", "summarisation"]
//! topics:
//!   - "lab:alpha"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kizuna_p2p::Manifest;

use crate::error::NodeError;

fn default_port() -> u16 {
    3000
}
fn default_role() -> String {
    "generalist".to_string()
}
fn default_inbox_capacity() -> usize {
    1000
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory for the identity file. Defaults to `~/.kizuna`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Control-plane port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Explicit bind host. When unset: loopback without an API key,
    /// `0.0.0.0` with one.
    #[serde(default)]
    pub bind: Option<String>,

    /// Bearer key for the control plane. Optional; enabling it also widens
    /// the bind host.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub agent: AgentConfig,

    /// Topics to join at startup, in addition to the default topic.
    #[serde(default)]
    pub topics: Vec<String>,

    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            port: default_port(),
            bind: None,
            api_key: None,
            agent: AgentConfig::default(),
            topics: Vec::new(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

/// The local agent's advertised identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Display name; defaults to the machine hostname.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub specs: Option<Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            role: default_role(),
            skills: Vec::new(),
            specs: None,
        }
    }
}

/// Load the config: defaults, then the YAML file (if any), then environment.
pub fn load(path: Option<&Path>) -> Result<NodeConfig, NodeError> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                NodeError::Config(format!("reading {}: {e}", path.display()))
            })?;
            serde_yaml::from_str(&text)
                .map_err(|e| NodeError::Config(format!("parsing {}: {e}", path.display())))?
        }
        None => NodeConfig::default(),
    };
    apply_env(&mut config);
    Ok(config)
}

fn apply_env(config: &mut NodeConfig) {
    if let Ok(dir) = std::env::var("KIZUNA_DATA_DIR") {
        config.data_dir = Some(PathBuf::from(dir));
    }
    if let Ok(port) = std::env::var("KIZUNA_PORT") {
        match port.parse() {
            Ok(port) => config.port = port,
            Err(_) => tracing::warn!("ignoring unparseable KIZUNA_PORT={port}"),
        }
    }
    if let Ok(bind) = std::env::var("KIZUNA_BIND") {
        config.bind = Some(bind);
    }
    if let Ok(key) = std::env::var("KIZUNA_API_KEY") {
        if !key.is_empty() {
            config.api_key = Some(key);
        }
    }
    if let Ok(agent_id) = std::env::var("KIZUNA_AGENT_ID") {
        config.agent.agent_id = Some(agent_id);
    }
}

impl NodeConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".kizuna")
        })
    }

    /// Loopback-only unless an API key is configured or an explicit bind
    /// host overrides it.
    pub fn bind_host(&self) -> String {
        if let Some(bind) = &self.bind {
            return bind.clone();
        }
        if self.api_key.is_some() {
            "0.0.0.0".to_string()
        } else {
            "127.0.0.1".to_string()
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host(), self.port)
    }

    /// The manifest advertised in handshakes, with the hostname as the
    /// fallback display name.
    pub fn manifest(&self) -> Manifest {
        let agent_id = self.agent.agent_id.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "kizuna-agent".to_string())
        });
        Manifest {
            role: self.agent.role.clone(),
            skills: self.agent.skills.clone(),
            agent_id,
            specs: self.agent.specs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_loopback() {
        let config = NodeConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:3000");
    }

    #[test]
    fn api_key_widens_the_bind() {
        let config = NodeConfig {
            api_key: Some("k".into()),
            ..NodeConfig::default()
        };
        assert_eq!(config.bind_host(), "0.0.0.0");
    }

    #[test]
    fn explicit_bind_wins() {
        let config = NodeConfig {
            bind: Some("10.0.0.5".into()),
            api_key: Some("k".into()),
            ..NodeConfig::default()
        };
        assert_eq!(config.bind_host(), "10.0.0.5");
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
port: 4100
agent:
  agent_id: "tester"
  role: "qa"
  skills: ["tests"]
topics: ["lab:alpha"]
"#;
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 4100);
        assert_eq!(config.manifest().agent_id, "tester");
        assert_eq!(config.topics, vec!["lab:alpha".to_string()]);
        assert_eq!(config.inbox_capacity, 1000);
    }
}
