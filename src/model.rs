use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Answers keyed by question id. Opaque to the sync layer.
pub type Payload = Map<String, Value>;

/// A finalized survey submission.
///
/// Serializes to exactly the wire shape the remote endpoint expects. The local
/// sync state (`synced`, `synced_at`) never leaves the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Client-generated and stable across retries. Empty means "assign one on save".
    #[serde(default)]
    pub response_id: String,
    pub survey_id: String,
    pub session_id: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
    /// Device metadata (user agent, app version, ...), passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub device: Payload,
    #[serde(default, skip_serializing)]
    pub synced: bool,
    #[serde(default, skip_serializing)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Response {
    /// Finalize a new response now, with a fresh time-ordered id.
    pub fn new(survey_id: impl Into<String>, session_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            response_id: new_response_id(),
            survey_id: survey_id.into(),
            session_id: session_id.into(),
            payload,
            submitted_at: Utc::now(),
            device: Map::new(),
            synced: false,
            synced_at: None,
        }
    }

    pub fn with_id(mut self, response_id: impl Into<String>) -> Self {
        self.response_id = response_id.into();
        self
    }

    pub fn with_device(mut self, device: Payload) -> Self {
        self.device = device;
        self
    }
}

pub fn new_response_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// An in-progress response, one per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub session_id: String,
    pub survey_id: Option<String>,
    pub answers: Payload,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOperation {
    CreateResponse,
    BatchSync,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::CreateResponse => "create-response",
            SyncOperation::BatchSync => "batch-sync",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create-response" => Ok(SyncOperation::CreateResponse),
            "batch-sync" => Ok(SyncOperation::BatchSync),
            other => Err(Error::InvalidInput(format!("unknown sync operation: {other}"))),
        }
    }
}

/// Queue entry state. `InFlight` only ever exists in memory during a processor run;
/// the database stores `pending` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InFlight => "in-flight",
            QueueStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "in-flight" => Ok(QueueStatus::InFlight),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown queue status: {other}"))),
        }
    }
}

/// Snapshot of the response data taken at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncPayload {
    Single(Response),
    Batch(Vec<Response>),
}

impl SyncPayload {
    pub fn operation(&self) -> SyncOperation {
        match self {
            SyncPayload::Single(_) => SyncOperation::CreateResponse,
            SyncPayload::Batch(_) => SyncOperation::BatchSync,
        }
    }

    pub fn responses(&self) -> &[Response] {
        match self {
            SyncPayload::Single(r) => std::slice::from_ref(r),
            SyncPayload::Batch(rs) => rs,
        }
    }

    pub fn response_ids(&self) -> Vec<String> {
        self.responses().iter().map(|r| r.response_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncQueueEntry {
    pub id: i64,
    pub operation: SyncOperation,
    pub payload: SyncPayload,
    pub retries: u32,
    pub last_error: Option<String>,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Counts consumed by the status display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_responses: u64,
    pub synced_responses: u64,
    pub unsynced_responses: u64,
    pub drafts: u64,
    pub sync_queue: u64,
}
