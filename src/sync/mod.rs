pub mod backoff;
pub mod monitor;
pub mod processor;
pub mod remote;

use serde::Serialize;

use crate::model::SyncQueueEntry;

/// What started a processor run. Recorded in `sync_runs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Manual,
    Reconnect,
    Interval,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Manual => "manual",
            TriggerReason::Reconnect => "reconnect",
            TriggerReason::Interval => "interval",
        }
    }
}

/// Aggregate result of one `process_queue` run, for UI reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub status: SyncStatus,
    /// Entries in the snapshot that were sent.
    pub attempted: u64,
    pub succeeded: u64,
    /// Failed attempts, including those that were parked.
    pub failed: u64,
    /// Entries parked as permanently failed during this run.
    pub dead_lettered: u64,
    /// Responses confirmed by the server and marked synced.
    pub responses_synced: u64,
}

impl ProcessSummary {
    /// Derive the overall status from the counts.
    pub fn finish(mut self) -> Self {
        self.status = if self.attempted == 0 {
            SyncStatus::Idle
        } else if self.failed == 0 {
            SyncStatus::Success
        } else if self.succeeded > 0 || self.responses_synced > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        };
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    /// Nothing was pending.
    #[default]
    Idle,
    Success,
    PartialFailure,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Success => "completed",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Progress callbacks for a processor run. All methods default to no-ops.
pub trait SyncProgress: Send + Sync {
    fn on_run_start(&self, _pending: usize) {}
    /// The entry is now in flight.
    fn on_entry_start(&self, _entry: &SyncQueueEntry, _index: usize, _total: usize) {}
    fn on_entry_synced(&self, _entry: &SyncQueueEntry) {}
    fn on_entry_failed(&self, _entry: &SyncQueueEntry, _error: &str, _parked: bool) {}
    fn on_run_complete(&self, _summary: &ProcessSummary) {}
}

/// Progress reporter that ignores every event.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
