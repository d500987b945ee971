use std::time::Duration;

use super::SyncStatus;

/// Stretches the periodic sync interval after runs that made no progress.
///
/// The delay doubles for each consecutive failed run and is capped at `max`.
/// Any run that syncs something (or finds nothing to do) resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    /// Delay before the next periodic run.
    pub fn delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.failures.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Feed a run outcome. Returns the delay to wait before the next run.
    pub fn record(&mut self, status: SyncStatus) -> Duration {
        match status {
            SyncStatus::Failed => {
                self.failures = self.failures.saturating_add(1);
                log::warn!(
                    "Sync run failed ({} in a row). Next periodic attempt in {}s",
                    self.failures,
                    self.delay().as_secs()
                );
            }
            SyncStatus::Idle | SyncStatus::Success | SyncStatus::PartialFailure => self.reset(),
        }
        self.delay()
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
