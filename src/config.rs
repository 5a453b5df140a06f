use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::graph::GraphType;
use crate::store::Identity;
use crate::types::{COORD_COLLECTION_NAME, DEFAULT_HEARTBEAT_INTERVAL_SEC, DEFAULT_PEER_LOG_SIZE};

pub const LICENSE_ENV: &str = "CMESH_LICENSE";
pub const APP_ID_ENV: &str = "CMESH_APP_ID";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub peer: PeerSettings,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Per-peer settings: endpoints, credentials, output location and timing knobs.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PeerSettings {
    pub device_name: String,
    pub coord_addr: String,
    pub coord_port: u16,
    pub coord_collection: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub output_dir: PathBuf,
    // Wait after Reporting -> Shutdown so the final state can propagate
    pub report_propagation_ms: u64,
    // None waits forever for the coordinator
    pub plan_wait_timeout_ms: Option<u64>,
    pub license: Option<String>,
    pub app_id: Option<String>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            device_name: "peer".to_string(),
            coord_addr: "127.0.0.1".to_string(),
            coord_port: 4001,
            coord_collection: COORD_COLLECTION_NAME.to_string(),
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 4010,
            output_dir: PathBuf::from("output"),
            report_propagation_ms: 2000,
            plan_wait_timeout_ms: None,
            license: None,
            app_id: None,
        }
    }
}

impl PeerSettings {
    pub fn report_propagation(&self) -> Duration {
        Duration::from_millis(self.report_propagation_ms)
    }

    pub fn plan_wait_timeout(&self) -> Option<Duration> {
        self.plan_wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn identity(&self) -> Result<Identity, ConfigError> {
        self.resolve_identity(|key| std::env::var(key).ok())
    }

    /// Configured values win; otherwise fall back to `env`.
    pub fn resolve_identity(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Identity, ConfigError> {
        let pick = |configured: &Option<String>, key: &'static str, name: &'static str| {
            configured
                .clone()
                .or_else(|| env(key))
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingCredential { name, env: key })
        };
        Ok(Identity {
            license: pick(&self.license, LICENSE_ENV, "license")?,
            app_id: pick(&self.app_id, APP_ID_ENV, "app_id")?,
        })
    }
}

/// Shape of a local mesh run, consumed by the in-process coordinator.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MeshConfig {
    pub peers: usize,
    pub test_duration_sec: u32,
    pub min_msg_delay_ms: u32,
    pub max_msg_delay_ms: u32,
    pub peer_log_size: usize,
    pub heartbeat_interval_sec: u32,
    pub start_delay_sec: u64,
    pub graph: GraphType,
    pub max_degree: usize,
    pub seed: Option<u64>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            peers: 2,
            test_duration_sec: 10,
            min_msg_delay_ms: 10,
            max_msg_delay_ms: 500,
            peer_log_size: DEFAULT_PEER_LOG_SIZE,
            heartbeat_interval_sec: DEFAULT_HEARTBEAT_INTERVAL_SEC,
            start_delay_sec: 2,
            graph: GraphType::Complete,
            max_degree: 3,
            seed: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.peer
            .coord_addr
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::Invalid(format!("coord_addr {:?}: {}", self.peer.coord_addr, e)))?;
        let mesh = &self.mesh;
        if mesh.peers == 0 {
            return Err(ConfigError::Invalid("mesh.peers must be at least 1".into()));
        }
        if mesh.peer_log_size == 0 {
            return Err(ConfigError::Invalid("mesh.peer_log_size must be at least 1".into()));
        }
        if mesh.min_msg_delay_ms > mesh.max_msg_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "mesh.min_msg_delay_ms ({}) exceeds mesh.max_msg_delay_ms ({})",
                mesh.min_msg_delay_ms, mesh.max_msg_delay_ms
            )));
        }
        if mesh.graph == GraphType::SpanningTree && mesh.max_degree == 0 {
            return Err(ConfigError::Invalid(
                "mesh.max_degree must be at least 1 for a spanning_tree graph".into(),
            ));
        }
        if mesh.heartbeat_interval_sec == 0 {
            return Err(ConfigError::Invalid("mesh.heartbeat_interval_sec must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value: {0}")]
    Invalid(String),
    #[error("Missing {name}: set it in the config file or {env} in the environment")]
    MissingCredential { name: &'static str, env: &'static str },
}
