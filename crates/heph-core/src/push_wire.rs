use crate::{deserialize_optional_id, StatsDelta, SuggestionStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// One text frame on the push channel.
///
/// The payload normally lives under `data`; producers that flatten their
/// fields next to `type` are accepted too.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl PushFrame {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            event_id: None,
            timestamp: None,
            extra: Map::new(),
        }
    }

    fn payload(&self) -> Value {
        match &self.data {
            Value::Object(_) => self.data.clone(),
            _ => Value::Object(self.extra.clone()),
        }
    }

    /// Converts the frame into a typed event. Unknown event types yield `Ok(None)`.
    pub fn to_event(&self) -> Result<Option<PushEvent>, FrameError> {
        let Some(topic) = EventTopic::from_wire_name(&self.event_type) else {
            return Ok(None);
        };
        let payload = self.payload();
        let event = match topic {
            EventTopic::StatsUpdate => PushEvent::StatsUpdate(self.parse_payload(payload)?),
            EventTopic::TaskCreated => PushEvent::TaskCreated(self.parse_payload(payload)?),
            EventTopic::AgentCreated => PushEvent::AgentCreated(self.parse_payload(payload)?),
            EventTopic::SuggestionStatus => {
                PushEvent::SuggestionChanged(self.parse_payload(payload)?)
            }
        };
        Ok(Some(event))
    }

    fn parse_payload<T: DeserializeOwned>(&self, payload: Value) -> Result<T, FrameError> {
        serde_json::from_value(payload).map_err(|err| FrameError::Payload {
            event_type: self.event_type.clone(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    StatsUpdate,
    TaskCreated,
    AgentCreated,
    SuggestionStatus,
}

impl EventTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::StatsUpdate => "stats_update",
            EventTopic::TaskCreated => "task_created",
            EventTopic::AgentCreated => "agent_created",
            EventTopic::SuggestionStatus => "suggestion_status",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name.trim() {
            "stats_update" => Some(EventTopic::StatsUpdate),
            "task_created" => Some(EventTopic::TaskCreated),
            "agent_created" => Some(EventTopic::AgentCreated),
            "suggestion_created" | "suggestion_updated" | "suggestion_approved"
            | "suggestion_rejected" | "suggestion_status" => Some(EventTopic::SuggestionStatus),
            _ => None,
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCreatedPayload {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub agent_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentCreatedPayload {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuggestionChangedPayload {
    #[serde(
        default,
        alias = "suggestion_id",
        deserialize_with = "deserialize_optional_id"
    )]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<SuggestionStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    StatsUpdate(StatsDelta),
    TaskCreated(TaskCreatedPayload),
    AgentCreated(AgentCreatedPayload),
    SuggestionChanged(SuggestionChangedPayload),
}

impl PushEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            PushEvent::StatsUpdate(_) => EventTopic::StatsUpdate,
            PushEvent::TaskCreated(_) => EventTopic::TaskCreated,
            PushEvent::AgentCreated(_) => EventTopic::AgentCreated,
            PushEvent::SuggestionChanged(_) => EventTopic::SuggestionStatus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("invalid {event_type} payload: {reason}")]
    Payload { event_type: String, reason: String },
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}
