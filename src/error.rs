use thiserror::Error;

/// Errors raised while opening or using a remote shell session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No candidate address reachable for node {node} (tried {attempted})")]
    Exhausted { node: String, attempted: usize },

    #[error("Unknown fleet node: {0}")]
    UnknownNode(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Liveness probe failed: {0}")]
    ProbeFailed(String),

    #[error("Remote command timed out: {0}")]
    CommandTimeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Reasons a log stream reader stops
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Remote log process for {node}/{service} ended")]
    Terminated { node: String, service: String },

    #[error("Failed to start log follow: {0}")]
    Start(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Policy rejections and execution failures of the restart protocol
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RestartError {
    #[error("Restart cooldown active for {node}/{service} ({remaining_secs}s remaining)")]
    CooldownBlocked {
        node: String,
        service: String,
        remaining_secs: i64,
    },

    #[error("Max restart attempts ({max_attempts}) reached for {node}/{service}")]
    AttemptLimitReached {
        node: String,
        service: String,
        max_attempts: u32,
    },

    #[error("All restart strategies failed for {node}/{service}: {reason}")]
    ExecutionFailed {
        node: String,
        service: String,
        reason: String,
    },
}

/// Errors talking to the mixing engine control socket
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to connect to mixing engine at {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Mixing engine command timed out: {0}")]
    Timeout(String),

    #[error("Mixing engine returned no response to: {0}")]
    EmptyResponse(String),

    #[error("Mixing engine response to '{command}' exceeds {limit} bytes")]
    ResponseTooLong { command: String, limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors applying or persisting a plan
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Invalid plan '{0}'")]
    Invalid(String),

    #[error("Failed to persist plan state: {0}")]
    Persist(String),

    #[error("Mixing engine rejected plan change: {0}")]
    Engine(#[from] EngineError),
}

/// Errors restarting a service on the coordinator host
#[derive(Error, Debug)]
pub enum LocalServiceError {
    #[error("Service '{0}' may not be restarted over the bus")]
    NotAllowed(String),

    #[error("Restart of {service} failed: {reason}")]
    CommandFailed { service: String, reason: String },

    #[error("Restart of {0} timed out")]
    Timeout(String),
}

/// Errors decoding inbound bus messages
#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("Unrecognized command on {topic}: {payload}")]
    Unrecognized { topic: String, payload: String },

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Errors publishing to the message bus
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Failed to publish to {topic}: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Publish to {topic} timed out after {timeout:?}")]
    Timeout {
        topic: String,
        timeout: std::time::Duration,
    },

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
