//! Configuration loading and types for quorumd.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: node identity, transport security, cluster membership
//! behaviour, the consensus store process, the status listener, and
//! logging.  Command-line flags override individual fields after loading.

use garde::Validate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Node identity and cluster wiring.
    #[serde(default)]
    pub node: NodeConfig,

    /// Transport security for membership RPCs and the store.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Membership client and reconciliation settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Consensus store process settings.
    #[serde(default)]
    pub store: StoreProcessConfig,

    /// Status HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Node identity and how it reaches the rest of the cluster.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NodeConfig {
    /// Human-readable member name, unique within the cluster.
    #[serde(default = "default_name")]
    #[garde(length(min = 1, max = 128), pattern(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$"))]
    pub name: String,

    /// Persistent data directory owned by the consensus store.
    #[serde(default = "default_data_dir")]
    #[garde(skip)]
    pub data_dir: PathBuf,

    /// Comma-separated URLs the store listens on for clients.
    #[serde(default = "default_client_urls")]
    #[garde(length(min = 1))]
    pub client_urls: String,

    /// Comma-separated URLs the store listens on for peers.
    #[serde(default = "default_peer_urls")]
    #[garde(length(min = 1))]
    pub peer_urls: String,

    /// Client URLs advertised to the cluster (defaults to `client_urls`).
    #[serde(default)]
    #[garde(skip)]
    pub advertise_client_urls: String,

    /// Peer URLs advertised to the cluster (defaults to `peer_urls`).
    #[serde(default)]
    #[garde(skip)]
    pub advertise_peer_urls: String,

    /// Initial cluster used when founding a cluster
    /// (defaults to `name=advertise_peer_url` for each peer URL).
    #[serde(default)]
    #[garde(skip)]
    pub initial_cluster: String,

    /// Comma-separated client endpoints of an existing cluster to join.
    /// Empty means this node founds a new cluster.
    #[serde(default)]
    #[garde(skip)]
    pub join: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            client_urls: default_client_urls(),
            peer_urls: default_peer_urls(),
            advertise_client_urls: String::new(),
            advertise_peer_urls: String::new(),
            initial_cluster: String::new(),
            join: String::new(),
        }
    }
}

impl NodeConfig {
    /// Advertised peer URLs as a list.
    pub fn advertise_peer_url_list(&self) -> Vec<String> {
        split_urls(&self.advertise_peer_urls)
    }

    /// Advertised client URLs as a list.
    pub fn advertise_client_url_list(&self) -> Vec<String> {
        split_urls(&self.advertise_client_urls)
    }

    /// Join target endpoints as a list (empty when founding).
    pub fn join_endpoints(&self) -> Vec<String> {
        split_urls(&self.join)
    }
}

/// Credential paths for TLS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct SecurityConfig {
    /// PEM file with the trusted certificate authority.
    #[serde(default)]
    pub cacert_path: Option<PathBuf>,

    /// PEM file with this node's certificate.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// PEM file with this node's PKCS#8 private key.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// What to do when the cluster's recorded peer URLs differ from ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// Log the mismatch and carry on.
    #[default]
    Report,
    /// Use the cluster's recorded URLs as this node's effective advertise URLs.
    Adopt,
    /// Push the configured URLs to the cluster with a member update.
    UpdateRemote,
}

/// Membership client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Connect timeout for membership RPCs, in milliseconds.
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Whole-request timeout for membership RPCs, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Advertise peer URL reconciliation policy.
    #[serde(default)]
    pub reconcile: ReconcilePolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reconcile: ReconcilePolicy::default(),
        }
    }
}

impl ClusterConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Consensus store process settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreProcessConfig {
    /// Path or name of the store executable.
    #[serde(default = "default_store_binary")]
    pub binary: String,

    /// Extra command-line arguments appended verbatim.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Interval between readiness probes, in milliseconds.
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,
}

impl Default for StoreProcessConfig {
    fn default() -> Self {
        Self {
            binary: default_store_binary(),
            extra_args: Vec::new(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
        }
    }
}

/// Status HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Whether to serve the status endpoints at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_name() -> String {
    "default".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/default.quorumd")
}

fn default_client_urls() -> String {
    "http://127.0.0.1:2379".to_string()
}

fn default_peer_urls() -> String {
    "http://127.0.0.1:2380".to_string()
}

fn default_dial_timeout_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_store_binary() -> String {
    "etcd".to_string()
}

fn default_ready_poll_interval_ms() -> u64 {
    200
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9479
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Derived values ----------------------------------------------------------

/// Split a comma-separated URL list, dropping blanks.
pub fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Fill values derived from other fields.
    ///
    /// Advertise URLs fall back to the listen URLs and the initial cluster
    /// falls back to this node alone.
    pub fn adjust(&mut self) {
        let node = &mut self.node;
        if node.advertise_client_urls.trim().is_empty() {
            node.advertise_client_urls = node.client_urls.clone();
        }
        if node.advertise_peer_urls.trim().is_empty() {
            node.advertise_peer_urls = node.peer_urls.clone();
        }
        if node.initial_cluster.trim().is_empty() {
            node.initial_cluster = node
                .advertise_peer_url_list()
                .iter()
                .map(|url| format!("{}={}", node.name, url))
                .collect::<Vec<_>>()
                .join(",");
        }
    }

    /// Validate field constraints.  Call after [`Config::adjust`].
    pub fn validate(&self) -> anyhow::Result<()> {
        self.node
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid node configuration: {e}"))?;
        if self.node.advertise_peer_url_list().is_empty() {
            anyhow::bail!("node.advertise_peer_urls must name at least one URL");
        }
        if self.cluster.dial_timeout_ms == 0 || self.cluster.request_timeout_ms == 0 {
            anyhow::bail!("cluster timeouts must be greater than zero");
        }
        match self.logging.format.as_str() {
            "text" | "json" => Ok(()),
            other => anyhow::bail!("logging.format must be 'text' or 'json', got '{other}'"),
        }
    }
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}
