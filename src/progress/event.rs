//! Progress event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Tag of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Transport-level greeting, sent once per connection.
    Connected,
    Progress,
    /// Keepalive emitted when a session has been idle for the ping interval.
    Ping,
    /// Terminal event: the subscription completes after delivering it.
    End,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::Progress => "progress",
            EventType::Ping => "ping",
            EventType::End => "end",
            EventType::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of streamed status for a session.
///
/// `sequence_index` is assigned by the hub, strictly increasing and gapless
/// per session; it doubles as the resume cursor for reconnecting clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
    pub sequence_index: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.event_type == EventType::End
    }
}

/// Point-in-time view of one hub session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSession {
    pub session_id: String,
    pub is_active: bool,
    pub last_event_time: Option<DateTime<Utc>>,
    /// Index the next published event will receive.
    pub next_index: u64,
    /// Oldest index still held in the backlog.
    pub first_index: u64,
    pub backlog: usize,
    pub subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event = ProgressEvent {
            event_type: EventType::Progress,
            data: json!({"stage": "fetch"}),
            sequence_index: 7,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["data"]["stage"], "fetch");
        assert_eq!(value["sequence_index"], 7);
    }

    #[test]
    fn test_only_end_is_terminal() {
        let mut event = ProgressEvent {
            event_type: EventType::Error,
            data: Value::Null,
            sequence_index: 0,
            timestamp: Utc::now(),
        };
        assert!(!event.is_terminal());
        event.event_type = EventType::End;
        assert!(event.is_terminal());
    }
}
