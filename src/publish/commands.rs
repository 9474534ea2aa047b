//! Inbound bus messages
//!
//! Every message is decoded once, at the boundary, into a tagged variant.
//! Shapes that match no known command become `CommandError::Unrecognized`.

use crate::config::BusTopics;
use crate::error::CommandError;
use serde_json::{Map, Value};

/// Engine audio parameters settable over the bus, in application order
pub const AUDIO_PARAMETERS: [&str; 10] = [
    "compress_ratio",
    "compress_threshold",
    "attack_time",
    "release_time",
    "highpass_freq",
    "lowpass_freq",
    "delay_time",
    "delay_feedback",
    "gate_threshold",
    "normalize_target",
];

/// Default service of a remote restart request
pub const DEFAULT_RESTART_SERVICE: &str = "darkice";

/// Default mode of a plan broadcast
pub const DEFAULT_PLAN_MODE: &str = "live";

/// Commands on the coordinator command topic
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    /// Restart a service on the coordinator host
    RestartLocal { service: String },
    UnderrunSummary,
    OverrunSummary,
    /// Manual restart of a service on a fleet node
    RemoteRestart { system: String, service: String },
}

/// Plan selection broadcast to the whole installation
#[derive(Debug, Clone, PartialEq)]
pub struct PlanBroadcast {
    pub plan: String,
    pub mode: String,
}

/// Audio processing commands for the mixing engine
#[derive(Debug, Clone, PartialEq)]
pub enum AudioCommand {
    ProcessingToggle(bool),
    GetProcessingStatus,
    Reset,
    /// (parameter, value) pairs; parameter is one of `AUDIO_PARAMETERS`
    SetParameters(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Command(ServerCommand),
    Broadcast(PlanBroadcast),
    Audio(AudioCommand),
}

impl InboundMessage {
    /// Decode a raw message received on `topic`
    ///
    /// # Errors
    ///
    /// * `CommandError::Malformed` - payload is not a JSON object, or a known
    ///   command lacks a required field
    /// * `CommandError::Unrecognized` - topic or shape is unknown
    pub fn decode(topics: &BusTopics, topic: &str, payload: &[u8]) -> Result<Self, CommandError> {
        let text = String::from_utf8_lossy(payload);
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| CommandError::Malformed(format!("invalid JSON on {}: {}", topic, e)))?;
        let data = value.as_object().ok_or_else(|| {
            CommandError::Malformed(format!("expected a JSON object on {}", topic))
        })?;

        let unrecognized = || CommandError::Unrecognized {
            topic: topic.to_string(),
            payload: text.to_string(),
        };

        if topic == topics.command {
            decode_server_command(data)?
                .map(InboundMessage::Command)
                .ok_or_else(unrecognized)
        } else if topic == topics.broadcast {
            decode_broadcast(data)
                .map(InboundMessage::Broadcast)
                .ok_or_else(unrecognized)
        } else if topic == topics.audio_command {
            decode_audio(data)
                .map(InboundMessage::Audio)
                .ok_or_else(unrecognized)
        } else {
            Err(unrecognized())
        }
    }
}

/// A flag key is set when present and not explicitly `false`/`null`
fn flag(data: &Map<String, Value>, key: &str) -> bool {
    !matches!(data.get(key), None | Some(Value::Bool(false)) | Some(Value::Null))
}

fn string_field(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn decode_server_command(
    data: &Map<String, Value>,
) -> Result<Option<ServerCommand>, CommandError> {
    if let Some(service) = data.get("restart") {
        let service = service.as_str().ok_or_else(|| {
            CommandError::Malformed("restart expects a service name".to_string())
        })?;
        return Ok(Some(ServerCommand::RestartLocal {
            service: service.to_string(),
        }));
    }
    if flag(data, "underrun_summary") {
        return Ok(Some(ServerCommand::UnderrunSummary));
    }
    if flag(data, "darkice_summary") {
        return Ok(Some(ServerCommand::OverrunSummary));
    }
    if flag(data, "darkice_restart") {
        let system = string_field(data, "system").ok_or_else(|| {
            CommandError::Malformed("darkice_restart requires a system".to_string())
        })?;
        let service =
            string_field(data, "service").unwrap_or_else(|| DEFAULT_RESTART_SERVICE.to_string());
        return Ok(Some(ServerCommand::RemoteRestart { system, service }));
    }
    Ok(None)
}

fn decode_broadcast(data: &Map<String, Value>) -> Option<PlanBroadcast> {
    let plan = string_field(data, "plan")?;
    let mode = string_field(data, "mode").unwrap_or_else(|| DEFAULT_PLAN_MODE.to_string());
    Some(PlanBroadcast { plan, mode })
}

fn decode_audio(data: &Map<String, Value>) -> Option<AudioCommand> {
    if let Some(toggle) = data.get("processing_toggle") {
        let enable = match toggle {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            Value::String(s) => matches!(s.as_str(), "true" | "on" | "enable" | "1"),
            _ => false,
        };
        return Some(AudioCommand::ProcessingToggle(enable));
    }
    if flag(data, "get_processing_status") {
        return Some(AudioCommand::GetProcessingStatus);
    }
    if flag(data, "reset") {
        return Some(AudioCommand::Reset);
    }

    let parameters: Vec<(String, String)> = AUDIO_PARAMETERS
        .iter()
        .filter_map(|param| {
            let value = match data.get(*param)? {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((param.to_string(), value))
        })
        .collect();

    if parameters.is_empty() {
        None
    } else {
        Some(AudioCommand::SetParameters(parameters))
    }
}
