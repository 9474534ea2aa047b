//! Core event types shared across the coordinator
//!
//! This module defines the identities of monitored streams and the payloads
//! published for detected failures and restart outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Class of failure a monitored stream is watching for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Audio playback buffer starvation on a player service
    Underrun,
    /// Encoder/streaming buffer overflow on an encoder service
    BufferOverrun,
}

impl FailureCategory {
    /// Capacity of the rolling window of recent occurrences for this category
    pub fn window_capacity(self) -> usize {
        match self {
            FailureCategory::Underrun => 100,
            FailureCategory::BufferOverrun => 50,
        }
    }

    /// Short label used in log lines
    pub fn label(self) -> &'static str {
        match self {
            FailureCategory::Underrun => "underrun",
            FailureCategory::BufferOverrun => "buffer overrun",
        }
    }
}

/// A (node, service) pair; the unit restarts are serialized on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub node: String,
    pub service: String,
}

impl ServiceKey {
    pub fn new(node: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.service)
    }
}

/// Identity of one monitored log stream: (node, service, category)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub node: String,
    pub service: String,
    pub category: FailureCategory,
}

impl StreamKey {
    pub fn new(
        node: impl Into<String>,
        service: impl Into<String>,
        category: FailureCategory,
    ) -> Self {
        Self {
            node: node.into(),
            service: service.into(),
            category,
        }
    }

    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.node.clone(), self.service.clone())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.node, self.service, self.category.label())
    }
}

/// Published when a log line matches a failure signature
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureEvent {
    pub system: String,
    pub service: String,
    pub category: FailureCategory,
    pub timestamp: Timestamp,
    pub log_line: String,
    pub total_count: u64,
    /// Occurrences inside the spam-detection window
    pub recent_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_overruns: Option<u32>,
    pub spam_detected: bool,
    pub restart_attempts: u32,
    pub source: String,
}

/// Restart strategy tier that brought a service back
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// `systemctl restart`
    Graceful,
    /// `systemctl stop` followed by `systemctl start`
    StopStart,
    /// forced kill followed by `systemctl start`
    ForceKill,
}

impl fmt::Display for RestartStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestartStrategy::Graceful => "systemctl restart",
            RestartStrategy::StopStart => "stop/start",
            RestartStrategy::ForceKill => "force kill/start",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestartStatus {
    Success,
    Failure,
}

/// Published after every executed restart
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartOutcome {
    pub system: String,
    pub service: String,
    pub timestamp: Timestamp,
    pub status: RestartStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RestartStrategy>,
    pub attempt: u32,
    pub message: String,
    pub source: String,
}

impl RestartOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RestartStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_serialization() {
        assert_eq!(
            serde_json::to_string(&FailureCategory::Underrun).unwrap(),
            "\"underrun\""
        );
        assert_eq!(
            serde_json::to_string(&FailureCategory::BufferOverrun).unwrap(),
            "\"buffer_overrun\""
        );
    }

    #[test]
    fn test_window_capacities() {
        assert_eq!(FailureCategory::Underrun.window_capacity(), 100);
        assert_eq!(FailureCategory::BufferOverrun.window_capacity(), 50);
    }

    #[test]
    fn test_stream_key_display() {
        let key = StreamKey::new("sculpture1", "darkice", FailureCategory::BufferOverrun);
        assert_eq!(key.to_string(), "sculpture1/darkice (buffer overrun)");
        assert_eq!(key.service_key(), ServiceKey::new("sculpture1", "darkice"));
    }

    #[test]
    fn test_underrun_event_omits_consecutive_count() {
        let event = FailureEvent {
            system: "sculpture2".to_string(),
            service: "player-live".to_string(),
            category: FailureCategory::Underrun,
            timestamp: Utc::now(),
            log_line: "audio underrun".to_string(),
            total_count: 3,
            recent_count: 1,
            consecutive_overruns: None,
            spam_detected: false,
            restart_attempts: 0,
            source: "fleetwatch".to_string(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("consecutive_overruns").is_none());
        assert_eq!(json["system"], "sculpture2");

        let back: FailureEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_restart_outcome_serialization() {
        let outcome = RestartOutcome {
            system: "sculpture1".to_string(),
            service: "darkice".to_string(),
            timestamp: Utc::now(),
            status: RestartStatus::Success,
            strategy: Some(RestartStrategy::StopStart),
            attempt: 2,
            message: "darkice service restarted successfully".to_string(),
            source: "fleetwatch".to_string(),
        };

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["strategy"], "stop_start");
        assert!(outcome.is_success());
    }
}
