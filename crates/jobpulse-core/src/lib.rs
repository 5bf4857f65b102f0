use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[cfg(feature = "logging")]
pub mod logging;
pub mod normalize;
pub mod progress;
pub mod stream;
pub mod topics;
pub mod wire;

pub const JOB_TOPIC_PREFIX: &str = "job:";
pub const CONVERSATION_TOPIC_PREFIX: &str = "conversation:";

pub fn job_topic(job_id: &str) -> String {
    format!("{JOB_TOPIC_PREFIX}{job_id}")
}

pub fn conversation_topic(conversation_id: &str) -> String {
    format!("{CONVERSATION_TOPIC_PREFIX}{conversation_id}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Queued,
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    /// Maps a producer-specific status label onto the canonical status set.
    /// Unknown labels count as in-flight work.
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "idle" => JobStatus::Idle,
            "queued" | "pending" | "waiting" | "scheduled" | "submitted" => JobStatus::Queued,
            "complete" | "completed" | "done" | "succeeded" | "success" => JobStatus::Complete,
            "error" | "failed" | "failure" | "cancelled" | "canceled" => JobStatus::Error,
            _ => JobStatus::Processing,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retries_left: Option<u32>,
}

impl JobSnapshot {
    pub fn is_tracking(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
    Finalized,
    Error,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Streaming => "streaming",
            StreamState::Finalized => "finalized",
            StreamState::Error => "error",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEntry {
    pub status: ToolStatus,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamSnapshot {
    pub state: StreamState,
    #[serde(default)]
    pub message_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolEntry>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StreamSnapshot {
    pub fn is_streaming(&self) -> bool {
        self.state == StreamState::Streaming
    }

    pub fn running_tools(&self) -> impl Iterator<Item = &str> {
        self.tools
            .iter()
            .filter(|(_, entry)| entry.status == ToolStatus::Running)
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn has_body(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("Unknown method: {other}")),
        }
    }
}

/// A write captured by a caller, before it has been assigned an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewAction {
    pub target: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: Value,
}

impl NewAction {
    pub fn new(target: impl Into<String>, method: HttpMethod, payload: Value) -> Self {
        Self {
            target: target.into(),
            method,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: String,
    pub target: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedAction {
    pub fn from_new(action: NewAction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target: action.target,
            method: action.method,
            payload: action.payload,
            enqueued_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error(String),
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Idle => "idle",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Synced => "synced",
            QueueStatus::Error(_) => "error",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::Error(message) => write!(f, "error: {message}"),
            other => f.write_str(other.as_str()),
        }
    }
}
