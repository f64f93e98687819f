use serde::{Deserialize, Serialize};
use std::fmt;

fn default_safe_mode() -> bool {
    true
}

/// Incoming `POST /run` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(alias = "command")]
    pub cmd: String,
    #[serde(default = "default_safe_mode", alias = "safeMode")]
    pub safe_mode: bool,
}

impl CommandRequest {
    pub fn new(cmd: impl Into<String>, safe_mode: bool) -> Self {
        Self {
            cmd: cmd.into(),
            safe_mode,
        }
    }
}

/// Wire shape returned by `POST /run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub output: String,
    /// Elapsed wall-clock seconds, millisecond precision.
    pub time: f64,
    pub succeeded: bool,
    pub status: String,
}

/// Named telemetry channel with its own delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Logs,
    Stats,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Logs, Topic::Stats];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Logs => "logs",
            Topic::Stats => "stats",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "msg")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEvent {
    #[serde(rename = "cpu")]
    pub cpu_percent: f64,
    #[serde(rename = "memory")]
    pub memory_percent: f64,
    pub timestamp: String,
}

/// A single frame pushed to streaming subscribers.
///
/// Serialises as `{"type":"log","msg":..}` or
/// `{"type":"stats","cpu":..,"memory":..,"timestamp":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Log(LogEvent),
    Stats(StatsEvent),
}

impl TelemetryEvent {
    pub fn log(message: impl Into<String>) -> Self {
        TelemetryEvent::Log(LogEvent {
            message: message.into(),
        })
    }

    pub fn topic(&self) -> Topic {
        match self {
            TelemetryEvent::Log(_) => Topic::Logs,
            TelemetryEvent::Stats(_) => Topic::Stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_event_wire_shape() {
        let ev = TelemetryEvent::log("hello");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v, serde_json::json!({"type": "log", "msg": "hello"}));
        assert_eq!(ev.topic(), Topic::Logs);
    }

    #[test]
    fn stats_event_wire_shape() {
        let ev = TelemetryEvent::Stats(StatsEvent {
            cpu_percent: 12.5,
            memory_percent: 40.0,
            timestamp: "2024-01-01 00:00:00".to_string(),
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "stats");
        assert_eq!(v["cpu"], 12.5);
        assert_eq!(v["memory"], 40.0);
        assert_eq!(v["timestamp"], "2024-01-01 00:00:00");
        assert_eq!(ev.topic(), Topic::Stats);
    }

    #[test]
    fn request_safe_mode_defaults_on() {
        let req: CommandRequest = serde_json::from_str(r#"{"cmd": "ls"}"#).unwrap();
        assert!(req.safe_mode);

        let req: CommandRequest =
            serde_json::from_str(r#"{"cmd": "rm x", "safe_mode": false}"#).unwrap();
        assert!(!req.safe_mode);
    }
}
