use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

pub mod push_wire;

/// Maximum number of records kept in the recent-activity feed.
pub const ACTIVITY_LOG_CAP: usize = 10;
pub const TASK_DESCRIPTION_PREVIEW_CHARS: usize = 50;
pub const AGENT_ID_PREVIEW_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatCounters {
    #[serde(default)]
    pub active_agents: u64,
    #[serde(default)]
    pub running_tasks: u64,
    #[serde(default)]
    pub queued_tasks: u64,
    #[serde(default)]
    pub total_memories: u64,
    #[serde(default)]
    pub stuck_agents: u64,
}

/// Full dashboard payload as served by `GET /api/dashboard/stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub counters: StatCounters,
    #[serde(default, deserialize_with = "deserialize_activity_feed")]
    pub recent_activity: Vec<ActivityRecord>,
}

/// Partial counter patch. Absent (or null) fields leave the current value alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_agents: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_tasks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_tasks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_memories: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_agents: Option<u64>,
}

impl StatsDelta {
    /// Overwrites every field the delta carries. Returns whether anything changed.
    pub fn apply_to(&self, counters: &mut StatCounters) -> bool {
        let before = *counters;
        if let Some(value) = self.active_agents {
            counters.active_agents = value;
        }
        if let Some(value) = self.running_tasks {
            counters.running_tasks = value;
        }
        if let Some(value) = self.queued_tasks {
            counters.queued_tasks = value;
        }
        if let Some(value) = self.total_memories {
            counters.total_memories = value;
        }
        if let Some(value) = self.stuck_agents {
            counters.stuck_agents = value;
        }
        before != *counters
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivityKind {
    TaskCreated,
    AgentCreated,
    Other(String),
}

impl ActivityKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActivityKind::TaskCreated => "task_created",
            ActivityKind::AgentCreated => "agent_created",
            ActivityKind::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ActivityKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "task_created" | "task-created" => ActivityKind::TaskCreated,
            "agent_created" | "agent-created" => ActivityKind::AgentCreated,
            _ => ActivityKind::Other(value),
        }
    }
}

impl From<ActivityKind> for String {
    fn from(value: ActivityKind) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: ActivityKind,
    #[serde(default)]
    pub message: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        rename = "agent_id",
        alias = "origin_agent_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub origin_agent_id: Option<String>,
}

impl ActivityRecord {
    pub fn task_created(
        id: impl Into<String>,
        description: Option<&str>,
        agent_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let preview = truncate_chars(
            description.unwrap_or_default(),
            TASK_DESCRIPTION_PREVIEW_CHARS,
        );
        Self {
            id: id.into(),
            kind: ActivityKind::TaskCreated,
            message: format!("New task created: {preview}"),
            timestamp,
            origin_agent_id: agent_id,
        }
    }

    pub fn agent_created(
        id: impl Into<String>,
        agent_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let short = truncate_chars(
            agent_id.as_deref().unwrap_or("unknown"),
            AGENT_ID_PREVIEW_CHARS,
        );
        Self {
            id: id.into(),
            kind: ActivityKind::AgentCreated,
            message: format!("Agent {short} spawned"),
            timestamp,
            origin_agent_id: agent_id,
        }
    }
}

/// Keeps at most `max` characters, appending `...` only when something was cut.
pub fn truncate_chars(input: &str, max: usize) -> String {
    let mut chars = input.chars();
    let kept: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{kept}...")
    } else {
        kept
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedTask {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SuggestionStatus::Approved | SuggestionStatus::Rejected)
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "pending" => Ok(SuggestionStatus::Pending),
            "approved" => Ok(SuggestionStatus::Approved),
            "rejected" => Ok(SuggestionStatus::Rejected),
            other => Err(format!("Unknown suggestion status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub phase_id: String,
    pub suggestion_text: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub status: SuggestionStatus,
}

/// Deserialize an ID that can be either a string or a number into a String
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

pub fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Decodes the feed entry by entry. A null feed is empty and entries that do
/// not decode are skipped, so one bad record never costs the counters.
fn deserialize_activity_feed<'de, D>(deserializer: D) -> Result<Vec<ActivityRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    let records = entries
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(event = "activity_entry_skipped", index, error = %err);
                None
            }
        })
        .collect();
    Ok(records)
}

/// Accepts RFC 3339, naive ISO-8601 (read as UTC) or epoch milliseconds.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => parse_timestamp(&s).map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| serde::de::Error::custom("invalid epoch millis")),
        _ => Err(serde::de::Error::custom("expected string or number for timestamp")),
    }
}

pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = input.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|err| format!("invalid timestamp '{input}': {err}"))
}
