use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use crate::flow::PolicyType;

/// Shortest commit interval the aggregator accepts.
pub const MIN_COMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Top-level configuration for flowkeeper.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Name of the node this agent runs on, stamped into flow records.
    #[serde(default)]
    pub node_name: String,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Connection tracking and flow export configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Flow ingestion and ClickHouse commit configuration.
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

/// Connection tracking and flow export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// UDP address datapath flow events are received on. Default: "127.0.0.1:4739".
    #[serde(default = "default_event_listen_addr")]
    pub listen_addr: String,

    /// Maximum time a flow stays unreported while active. Default: 60s.
    #[serde(default = "default_active_flow_timeout", with = "humantime_serde")]
    pub active_flow_timeout: Duration,

    /// Time without updates after which a flow is considered finished. Default: 15s.
    #[serde(default = "default_inactive_flow_timeout", with = "humantime_serde")]
    pub inactive_flow_timeout: Duration,

    /// How often due connections are exported. Default: 1s.
    #[serde(default = "default_export_interval", with = "humantime_serde")]
    pub export_interval: Duration,

    /// Agent to aggregator transport.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Static metadata used to enrich flows.
    #[serde(default)]
    pub metadata: MetadataConfig,
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Aggregator ingest URL (e.g. "http://aggregator:4740/v1/flows").
    #[serde(default)]
    pub address: String,

    /// Request body compression (none, gzip). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_transport_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Static service, interface and policy rule tables.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub services: Vec<ServiceEntry>,

    #[serde(default)]
    pub interfaces: Vec<InterfaceEntry>,

    #[serde(default)]
    pub policy_rules: Vec<PolicyRuleEntry>,
}

/// A service frontend (cluster IP, port, protocol).
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub address: IpAddr,
    pub port: u16,

    /// TCP, UDP or SCTP. Default: TCP.
    #[serde(default = "default_service_protocol")]
    pub protocol: String,

    pub namespace: String,
    pub name: String,

    /// Service port name. Defaults to the port number.
    #[serde(default)]
    pub port_name: String,
}

/// A local pod interface.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceEntry {
    pub ip: IpAddr,
    pub pod_name: String,
    pub pod_namespace: String,

    #[serde(default)]
    pub node_name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A network policy rule reported by the datapath by UUID.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRuleEntry {
    pub uuid: Uuid,
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub rule_name: String,

    #[serde(default)]
    pub policy_type: PolicyType,
}

/// Flow ingestion and ClickHouse commit configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// HTTP ingest listen address. Default: ":4740".
    #[serde(default = "default_ingest_listen_addr")]
    pub listen_addr: String,

    /// Maximum buffered records; oldest are dropped beyond this. Default: 524288.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Native protocol URL. Default: "tcp://localhost:9000".
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// Log every statement sent to ClickHouse. Default: false.
    #[serde(default)]
    pub debug: bool,

    /// LZ4 compression on the native protocol. Default: true.
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Interval between batch commits (minimum 1s). Default: 8s.
    #[serde(default = "default_commit_interval", with = "humantime_serde")]
    pub commit_interval: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_listen_addr() -> String {
    "127.0.0.1:4739".to_string()
}

fn default_active_flow_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_inactive_flow_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_export_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_transport_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_service_protocol() -> String {
    "TCP".to_string()
}

fn default_ingest_listen_addr() -> String {
    ":4740".to_string()
}

fn default_queue_capacity() -> usize {
    1 << 19
}

fn default_database_url() -> String {
    "tcp://localhost:9000".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_commit_interval() -> Duration {
    Duration::from_secs(8)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node_name: String::new(),
            health: HealthConfig::default(),
            agent: AgentConfig::default(),
            aggregator: AggregatorConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_event_listen_addr(),
            active_flow_timeout: default_active_flow_timeout(),
            inactive_flow_timeout: default_inactive_flow_timeout(),
            export_interval: default_export_interval(),
            transport: TransportConfig::default(),
            metadata: MetadataConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            compression: default_compression(),
            timeout: default_transport_timeout(),
            headers: BTreeMap::new(),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_ingest_listen_addr(),
            queue_capacity: default_queue_capacity(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            username: String::new(),
            password: String::new(),
            database: default_database(),
            debug: false,
            compress: true,
            commit_interval: default_commit_interval(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.agent.validate()?;
        self.aggregator.validate()?;
        Ok(())
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.active_flow_timeout.is_zero() {
            bail!("agent.active_flow_timeout must be positive");
        }

        if self.inactive_flow_timeout.is_zero() {
            bail!("agent.inactive_flow_timeout must be positive");
        }

        if self.export_interval.is_zero() {
            bail!("agent.export_interval must be positive");
        }

        if self.export_interval >= self.active_flow_timeout {
            bail!(
                "agent.export_interval ({:?}) must be shorter than agent.active_flow_timeout ({:?})",
                self.export_interval,
                self.active_flow_timeout
            );
        }

        match self.transport.compression.as_str() {
            "none" | "gzip" => {}
            other => bail!("invalid compression type: {other}"),
        }

        for svc in &self.metadata.services {
            if crate::metadata::protocol_number(&svc.protocol).is_none() {
                bail!(
                    "service {}/{} has unsupported protocol {}",
                    svc.namespace,
                    svc.name,
                    svc.protocol
                );
            }
        }

        Ok(())
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("aggregator.queue_capacity must be positive");
        }

        self.clickhouse.validate()
    }
}

impl ClickHouseConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.database_url.starts_with("tcp://") {
            bail!(
                "aggregator.clickhouse.database_url must use the tcp:// scheme, got {}",
                self.database_url
            );
        }

        if self.database.is_empty() {
            bail!("aggregator.clickhouse.database is required");
        }

        self.dsn()?;

        if self.commit_interval < MIN_COMMIT_INTERVAL {
            bail!(
                "aggregator.clickhouse.commit_interval must be at least {:?}, got {:?}",
                MIN_COMMIT_INTERVAL,
                self.commit_interval
            );
        }

        Ok(())
    }

    /// Builds a clickhouse-rs compatible DSN from configuration.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?compression=lz4|none`.
    /// Credentials are percent-encoded.
    pub fn dsn(&self) -> Result<String> {
        let mut url = Url::parse(&self.database_url)
            .with_context(|| format!("parsing database_url {}", self.database_url))?;
        if url.host_str().map_or(true, str::is_empty) {
            bail!("database_url {} has no host", self.database_url);
        }

        if !self.username.is_empty() {
            url.set_username(&self.username)
                .map_err(|()| anyhow!("database_url {} cannot carry credentials", self.database_url))?;
            if !self.password.is_empty() {
                url.set_password(Some(&self.password))
                    .map_err(|()| anyhow!("database_url {} cannot carry credentials", self.database_url))?;
            }
        }

        url.set_path(&format!("/{}", self.database));
        url.set_query(Some(if self.compress {
            "compression=lz4"
        } else {
            "compression=none"
        }));

        Ok(url.to_string())
    }
}
