//! Alert events as delivered to handlers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Severity of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    #[default]
    Ok,
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Ok => "OK",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// One series of a query result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Vec<serde_json::Value>>,
}

/// Data points that triggered an alert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub series: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// State of an alert at one point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventState {
    pub id: String,
    pub message: String,
    pub details: String,
    pub time: DateTime<Utc>,
    pub duration: Duration,
    pub level: Level,
}

/// What the alert was evaluated over
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventData {
    /// Measurement name
    pub name: String,
    pub task_name: String,
    /// Group-by tags as `key=value,...`, or `nil` without grouping
    pub group: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub recoverable: bool,
    pub result: QueryResult,
}

/// An alert event handed to a [`Handler`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub topic: String,
    pub state: EventState,
    pub data: EventData,
    pub previous_state: EventState,
}

impl Event {
    /// The payload sent to external systems
    pub fn alert_data(&self) -> Data {
        Data {
            id: self.state.id.clone(),
            message: self.state.message.clone(),
            details: self.state.details.clone(),
            time: self.state.time,
            duration: self.state.duration.as_nanos().min(i64::MAX as u128) as i64,
            level: self.state.level,
            data: self.data.result.clone(),
            previous_level: self.previous_state.level,
            recoverable: self.data.recoverable,
        }
    }
}

/// Serialised form of an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    pub id: String,
    pub message: String,
    pub details: String,
    pub time: DateTime<Utc>,
    /// Nanoseconds
    pub duration: i64,
    pub level: Level,
    pub data: QueryResult,
    pub previous_level: Level,
    pub recoverable: bool,
}

/// Receives alert events
#[async_trait]
pub trait Handler: Send + Sync {
    /// Deliver `event`. Failures are reported, never returned.
    async fn handle(&self, event: &Event);
}
