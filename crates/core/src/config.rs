use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Stable identifier for this Agent. Auto-generated on first `run` and
    /// persisted back to config.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// A dedicated farm machine accepts work regardless of local load.
    #[serde(default)]
    pub dedicated: bool,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Address peers should use to reach this Agent. Defaults to
    /// `<host>:<port>` of the network transport.
    #[serde(default)]
    pub advertise_address: Option<String>,
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            tick_interval_ms: default_tick_interval_ms(),
            dedicated: false,
            drain_timeout_secs: default_drain_timeout_secs(),
            advertise_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_staging_timeout_secs")]
    pub staging_timeout_secs: u64,
}

fn default_max_entries() -> usize {
    4096
}

fn default_max_bytes() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_chunk_size() -> usize {
    256 * 1024
}

fn default_staging_timeout_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            chunk_size: default_chunk_size(),
            staging_timeout_secs: default_staging_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Consecutive failed liveness probes before a connection is reclaimed.
    #[serde(default = "default_max_probe_failures")]
    pub max_probe_failures: u32,
}

fn default_max_connections() -> usize {
    64
}

fn default_max_probe_failures() -> u32 {
    3
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_probe_failures: default_max_probe_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_executor_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_executor_timeout_secs() -> u64 {
    3600
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_executor_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_hosted_retention_secs")]
    pub hosted_retention_secs: u64,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

fn default_max_retries() -> u32 {
    2
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_hosted_retention_secs() -> u64 {
    600
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            hosted_retention_secs: default_hosted_retention_secs(),
            executor: ExecutorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_coordinator_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Consecutive failed pings after which the cached roster is dropped.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_coordinator_timeout_secs() -> u64 {
    5
}

fn default_max_failures() -> u32 {
    3
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: None,
            ping_interval_secs: default_ping_interval_secs(),
            request_timeout_secs: default_coordinator_timeout_secs(),
            max_failures: default_max_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// CPU busy percentage above which the Agent is Busy.
    #[serde(default = "default_busy_threshold")]
    pub busy_threshold: f32,
}

fn default_sample_interval_ms() -> u64 {
    1000
}

fn default_window_size() -> usize {
    10
}

fn default_busy_threshold() -> f32 {
    80.0
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            window_size: default_window_size(),
            busy_threshold: default_busy_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Hex-encoded ed25519 public key that signs farm binaries.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Expected signer fingerprint. Every component must match it.
    #[serde(default)]
    pub pinned_identity: Option<String>,
    #[serde(default)]
    pub components: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default)]
    pub local_socket: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_retries")]
    pub bind_retries: u32,
    #[serde(default = "default_bind_backoff_ms")]
    pub bind_backoff_ms: u64,
    #[serde(default = "default_transport_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18800
}

fn default_bind_retries() -> u32 {
    5
}

fn default_bind_backoff_ms() -> u64 {
    200
}

fn default_transport_timeout_secs() -> u64 {
    30
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            local_socket: None,
            host: default_host(),
            port: default_port(),
            bind_retries: default_bind_retries(),
            bind_backoff_ms: default_bind_backoff_ms(),
            request_timeout_secs: default_transport_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub connections: ConnectionsConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.tick_interval_ms == 0 {
            return Err(Error::Config("agent.tickIntervalMs must be > 0".into()));
        }
        if self.performance.window_size == 0 {
            return Err(Error::Config("performance.windowSize must be > 0".into()));
        }
        if !(0.0..=100.0).contains(&self.performance.busy_threshold) {
            return Err(Error::Config(
                "performance.busyThreshold must be within 0..=100".into(),
            ));
        }
        if self.cache.chunk_size == 0 {
            return Err(Error::Config("cache.chunkSize must be > 0".into()));
        }
        if self.connections.max_connections == 0 {
            return Err(Error::Config("connections.maxConnections must be > 0".into()));
        }
        Ok(())
    }

    /// Returns the persisted agent id, generating and storing one if absent.
    /// The caller is responsible for saving the config afterwards.
    pub fn ensure_agent_id(&mut self) -> (String, bool) {
        match &self.agent.agent_id {
            Some(id) if !id.trim().is_empty() => (id.clone(), false),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                self.agent.agent_id = Some(id.clone());
                (id, true)
            }
        }
    }

    pub fn cache_dir(&self, paths: &Paths) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(|| paths.cache_dir())
    }

    pub fn local_socket(&self, paths: &Paths) -> PathBuf {
        self.transport
            .local_socket
            .clone()
            .unwrap_or_else(|| paths.local_socket())
    }

    pub fn network_bind(&self) -> String {
        format!("{}:{}", self.transport.host, self.transport.port)
    }

    /// The address peers and the coordinator should use for this Agent.
    pub fn advertise_address(&self) -> String {
        if let Some(addr) = &self.agent.advertise_address {
            return addr.clone();
        }
        let host = if self.transport.host == "0.0.0.0" {
            "127.0.0.1"
        } else {
            self.transport.host.as_str()
        };
        format!("{}:{}", host, self.transport.port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.agent.tick_interval_ms)
    }
}
