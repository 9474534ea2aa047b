use crate::engine::plan::PlanId;
use crate::error::ConfigError;
use log::{debug, info};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the message bus host
pub const CONTROL_HOST_ENV: &str = "CONTROL_HOST";

/// Upper bound of interval settings, keeps timestamp arithmetic in range
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Seconds as a calendar duration, saturating at `MAX_INTERVAL_SECS`
fn calendar_secs(secs: u64) -> chrono::Duration {
    let bounded = i64::try_from(secs.min(MAX_INTERVAL_SECS)).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(bounded).unwrap_or(chrono::Duration::MAX)
}

/// Complete coordinator configuration
///
/// Every section falls back to its defaults when omitted from the TOML file,
/// so an empty file is a valid configuration for the stock installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub fleet: FleetConfig,
    pub connection: ConnectionConfig,
    pub signatures: SignatureConfig,
    pub restart: RestartPolicy,
    pub supervisor: SupervisorConfig,
    pub bus: BusConfig,
    pub engine: EngineConfig,
    pub plan: PlanConfig,
    pub local_services: LocalServicesConfig,
}

/// One edge node of the installation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetNode {
    pub name: String,
    /// Candidate addresses, tried in order
    pub hosts: Vec<String>,
    /// Remote login user
    #[serde(default = "default_user")]
    pub user: String,
    /// Private key used instead of the agent/default identities
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_user() -> String {
    "pi".to_string()
}

impl FleetNode {
    pub fn new(name: &str, hosts: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            user: default_user(),
            identity_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub nodes: Vec<FleetNode>,
    /// Player services watched for audio underruns
    pub underrun_services: Vec<String>,
    /// Encoder services watched for buffer overruns and restarted on failure
    pub overrun_services: Vec<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            nodes: vec![
                FleetNode::new(
                    "sculpture1",
                    &["sculpture1.local", "sculpture1", "192.168.8.158"],
                ),
                FleetNode::new(
                    "sculpture2",
                    &["sculpture2.local", "sculpture2", "192.168.8.155"],
                ),
                FleetNode::new(
                    "sculpture3",
                    &["sculpture3.local", "sculpture3", "192.168.8.157"],
                ),
            ],
            underrun_services: vec!["player-live".to_string(), "player-loop".to_string()],
            overrun_services: vec!["darkice".to_string()],
        }
    }
}

impl FleetConfig {
    /// All services a node is expected to expose
    pub fn all_services(&self) -> Vec<String> {
        let mut services = self.underrun_services.clone();
        for service in &self.overrun_services {
            if !services.contains(service) {
                services.push(service.clone());
            }
        }
        services
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_secs: u64,
    /// Minimum delay before a dead stream is reconnected
    pub retry_interval_secs: u64,
    /// Run the echo probe after connecting
    pub probe: bool,
    /// Ask systemd for every monitored service's status after connecting
    pub verify_services: bool,
    pub probe_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Path of the `ssh` executable
    pub ssh_binary: PathBuf,
    /// Directory holding the multiplexing control sockets
    pub control_dir: PathBuf,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            retry_interval_secs: 30,
            probe: true,
            verify_services: true,
            probe_timeout_secs: 5,
            heartbeat_interval_secs: 30,
            ssh_binary: PathBuf::from("ssh"),
            control_dir: std::env::temp_dir(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Back-off before a dead stream is reconnected, as a calendar duration
    pub fn retry_backoff(&self) -> chrono::Duration {
        calendar_secs(self.retry_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Failure signatures, as case-insensitive regular expressions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignatureConfig {
    pub underrun: Vec<String>,
    pub overrun: Vec<String>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            underrun: vec![
                r"Audio device underrun detected\.".to_string(),
                r"\[ao/pulse\] audio end or underrun".to_string(),
                r"\[cplayer\] restarting audio after underrun".to_string(),
                r"audio underrun".to_string(),
                r"buffer underrun".to_string(),
                r"ao_pulse.*underrun".to_string(),
            ],
            overrun: vec![r"buffer overrun".to_string()],
        }
    }
}

/// Thresholds and limits of the self-healing restart protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    /// Consecutive overruns that trigger a restart
    pub overrun_threshold: u32,
    /// Occurrences inside the spam window that latch spam detection
    pub spam_threshold: usize,
    pub spam_window_secs: u64,
    pub command_timeout_secs: u64,
    pub graceful_retries: u32,
    pub retry_delay_secs: u64,
    /// Prefix remote service commands with sudo
    pub use_sudo: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            cooldown_secs: 60,
            overrun_threshold: 5,
            spam_threshold: 10,
            spam_window_secs: 30,
            command_timeout_secs: 10,
            graceful_retries: 3,
            retry_delay_secs: 2,
            use_sudo: true,
        }
    }
}

impl RestartPolicy {
    pub fn cooldown(&self) -> chrono::Duration {
        calendar_secs(self.cooldown_secs)
    }

    pub fn spam_window(&self) -> chrono::Duration {
        calendar_secs(self.spam_window_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub interval_secs: u64,
    /// Interval of plan reconciliation and status/summary publishing
    pub status_interval_secs: u64,
    /// Horizon of the "recent" counts in published summaries
    pub summary_horizon_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            status_interval_secs: 30,
            summary_horizon_secs: 3600,
        }
    }
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn summary_horizon(&self) -> chrono::Duration {
        calendar_secs(self.summary_horizon_secs)
    }
}

/// Message bus connection and topic layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub source: String,
    pub topics: BusTopics,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "fleetwatch".to_string(),
            keep_alive_secs: 60,
            source: "server-agent".to_string(),
            topics: BusTopics::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusTopics {
    pub command: String,
    pub broadcast: String,
    pub audio_command: String,
    pub status: String,
    pub plan: String,
    pub underruns: String,
    pub darkice: String,
    pub audio_status: String,
}

impl Default for BusTopics {
    fn default() -> Self {
        Self {
            command: "server/cmd".to_string(),
            broadcast: "system/broadcast".to_string(),
            audio_command: "system/audio/cmd".to_string(),
            status: "system/status".to_string(),
            plan: "system/plan".to_string(),
            underruns: "system/underruns".to_string(),
            darkice: "system/darkice".to_string(),
            audio_status: "system/audio/status".to_string(),
        }
    }
}

impl BusTopics {
    pub fn underrun_summary(&self) -> String {
        format!("{}/summary", self.underruns)
    }

    pub fn connectivity(&self) -> String {
        format!("{}/connectivity", self.underruns)
    }

    pub fn overrun_event(&self) -> String {
        format!("{}/overrun", self.darkice)
    }

    pub fn restart_outcome(&self) -> String {
        format!("{}/restart", self.darkice)
    }

    pub fn overrun_summary(&self) -> String {
        format!("{}/summary", self.darkice)
    }

    /// Topics the coordinator subscribes to
    pub fn inbound(&self) -> Vec<String> {
        vec![
            self.command.clone(),
            self.broadcast.clone(),
            self.audio_command.clone(),
        ]
    }
}

/// Mixing engine control socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1234,
            timeout_secs: 5,
        }
    }
}

impl EngineConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanConfig {
    pub state_file: PathBuf,
    pub default_plan: String,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/tmp/current_plan.json"),
            default_plan: "A1".to_string(),
        }
    }
}

/// Services on the coordinator host that may be restarted over the bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalServicesConfig {
    pub allowed: Vec<String>,
    /// Service whose restart requires the plan to be pushed again
    pub engine_service: String,
    pub resync_delay_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for LocalServicesConfig {
    fn default() -> Self {
        Self {
            allowed: vec!["icecast2".to_string(), "liquidsoap".to_string()],
            engine_service: "liquidsoap".to_string(),
            resync_delay_secs: 2,
            command_timeout_secs: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fleet: FleetConfig::default(),
            connection: ConnectionConfig::default(),
            signatures: SignatureConfig::default(),
            restart: RestartPolicy::default(),
            supervisor: SupervisorConfig::default(),
            bus: BusConfig::default(),
            engine: EngineConfig::default(),
            plan: PlanConfig::default(),
            local_services: LocalServicesConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read, a TOML error
    /// if it does not parse, and `ConfigError::ValidationError` if a value is
    /// out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&contents)?;
        info!(
            "Loaded configuration from {} ({} nodes)",
            path.display(),
            config.fleet.nodes.len()
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides (`CONTROL_HOST` for the bus host)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var(CONTROL_HOST_ENV) {
            if !host.trim().is_empty() {
                debug!("Bus host overridden by {}: {}", CONTROL_HOST_ENV, host);
                self.bus.host = host;
            }
        }
    }

    /// Check value ranges and that every signature compiles
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.nodes.is_empty() {
            return Err(ConfigError::ValidationError(
                "fleet.nodes must list at least one node".to_string(),
            ));
        }

        for node in &self.fleet.nodes {
            if node.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "fleet node name must not be empty".to_string(),
                ));
            }
            if node.hosts.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "fleet node '{}' has no candidate hosts",
                    node.name
                )));
            }
        }

        let mut names: Vec<&str> = self.fleet.nodes.iter().map(|n| n.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.fleet.nodes.len() {
            return Err(ConfigError::ValidationError(
                "fleet node names must be unique".to_string(),
            ));
        }

        if self.signatures.underrun.is_empty() || self.signatures.overrun.is_empty() {
            return Err(ConfigError::ValidationError(
                "signatures.underrun and signatures.overrun must not be empty".to_string(),
            ));
        }

        for pattern in self
            .signatures
            .underrun
            .iter()
            .chain(self.signatures.overrun.iter())
        {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    ConfigError::ValidationError(format!("invalid signature '{}': {}", pattern, e))
                })?;
        }

        if self.restart.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "restart.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.restart.overrun_threshold == 0 || self.restart.spam_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "restart thresholds must be greater than 0".to_string(),
            ));
        }
        if self.restart.graceful_retries == 0 {
            return Err(ConfigError::ValidationError(
                "restart.graceful_retries must be greater than 0".to_string(),
            ));
        }

        if self.supervisor.interval_secs == 0 || self.supervisor.status_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor intervals must be greater than 0".to_string(),
            ));
        }
        if self.connection.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connection.heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }

        for (name, secs) in [
            ("restart.cooldown_secs", self.restart.cooldown_secs),
            ("restart.spam_window_secs", self.restart.spam_window_secs),
            ("supervisor.interval_secs", self.supervisor.interval_secs),
            ("supervisor.status_interval_secs", self.supervisor.status_interval_secs),
            ("supervisor.summary_horizon_secs", self.supervisor.summary_horizon_secs),
            ("connection.retry_interval_secs", self.connection.retry_interval_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(ConfigError::ValidationError(format!(
                    "{} must not exceed {} seconds",
                    name, MAX_INTERVAL_SECS
                )));
            }
        }

        PlanId::parse(&self.plan.default_plan).map_err(|_| {
            ConfigError::ValidationError(format!(
                "plan.default_plan '{}' is not a known plan",
                self.plan.default_plan
            ))
        })?;

        Ok(())
    }
}
