use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{QueueStatus, SyncPayload, SyncQueueEntry};
use crate::store::LocalStore;
use crate::sync::remote::RemoteEndpoint;
use crate::sync::{ProcessSummary, SyncProgress, TriggerReason};

/// Drains the sync queue against a remote endpoint.
///
/// A run takes a snapshot of the pending entries and walks it oldest first,
/// giving each entry exactly one attempt. Entries appended while the run is
/// going wait for the next run. Only one run can be active per processor.
pub struct Processor {
    store: LocalStore,
    max_retries: u32,
    running: Mutex<()>,
}

impl Processor {
    pub fn new(store: LocalStore, max_retries: u32) -> Self {
        Self {
            store,
            max_retries: max_retries.max(1),
            running: Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Run the queue once. Fails with `Error::ProcessorBusy` if a run is already
    /// active, and with a storage error if the local database fails mid-run.
    /// Remote failures never fail the run; they are recorded on the entries.
    pub async fn process_queue(
        &self,
        remote: &dyn RemoteEndpoint,
        trigger: TriggerReason,
        progress: &dyn SyncProgress,
    ) -> Result<ProcessSummary> {
        let _guard = self.running.try_lock().map_err(|_| Error::ProcessorBusy)?;

        let snapshot = self.store.list_pending().await?;
        progress.on_run_start(snapshot.len());
        if snapshot.is_empty() {
            log::debug!("Sync queue empty ({} trigger)", trigger.as_str());
            let summary = ProcessSummary::default().finish();
            progress.on_run_complete(&summary);
            return Ok(summary);
        }

        log::info!(
            "Processing {} queued entries ({} trigger)",
            snapshot.len(),
            trigger.as_str()
        );
        let run_id = self.store.begin_run(trigger.as_str()).await?;

        let total = snapshot.len();
        let mut summary = ProcessSummary::default();
        let mut aborted = None;
        for (index, mut entry) in snapshot.into_iter().enumerate() {
            entry.status = QueueStatus::InFlight;
            progress.on_entry_start(&entry, index, total);
            summary.attempted += 1;
            if let Err(e) = self.attempt(&entry, remote, &mut summary, progress).await {
                log::error!("Stopping sync run at entry {}: {e}", entry.id);
                aborted = Some(e);
                break;
            }
        }

        let summary = summary.finish();
        let error_message = aborted.as_ref().map(|e| e.to_string());
        if let Err(e) = self
            .store
            .finish_run(run_id, &summary, error_message)
            .await
        {
            log::warn!("Failed to record sync run {run_id}: {e}");
        }
        if let Some(e) = aborted {
            return Err(e);
        }

        log::info!(
            "Sync run finished: {} attempted, {} succeeded, {} failed, {} parked",
            summary.attempted,
            summary.succeeded,
            summary.failed,
            summary.dead_lettered
        );
        progress.on_run_complete(&summary);
        Ok(summary)
    }

    /// One attempt for one entry. Only local storage errors propagate.
    async fn attempt(
        &self,
        entry: &SyncQueueEntry,
        remote: &dyn RemoteEndpoint,
        summary: &mut ProcessSummary,
        progress: &dyn SyncProgress,
    ) -> Result<()> {
        match &entry.payload {
            SyncPayload::Single(response) => match remote.upsert(response).await {
                Ok(()) => {
                    let marked = self
                        .store
                        .complete_entry(entry.id, vec![response.response_id.clone()])
                        .await?;
                    summary.succeeded += 1;
                    summary.responses_synced += marked;
                    log::debug!("Synced response {} (entry {})", response.response_id, entry.id);
                    progress.on_entry_synced(entry);
                    Ok(())
                }
                Err(e) => self.fail(entry, &e.to_string(), e.is_retryable(), summary, progress).await,
            },
            SyncPayload::Batch(responses) => match remote.upsert_batch(responses).await {
                Ok(results) if results.len() != responses.len() => {
                    let message = format!(
                        "batch reply had {} results for {} responses",
                        results.len(),
                        responses.len()
                    );
                    self.fail(entry, &message, true, summary, progress).await
                }
                Ok(results) => {
                    let mut accepted = Vec::new();
                    let mut remaining = Vec::new();
                    let mut errors = Vec::new();
                    for (response, result) in responses.iter().zip(results) {
                        if result.ok {
                            accepted.push(response.response_id.clone());
                        } else {
                            errors.push(format!(
                                "{}: {}",
                                response.response_id,
                                result.error.as_deref().unwrap_or("rejected")
                            ));
                            remaining.push(response.clone());
                        }
                    }

                    if remaining.is_empty() {
                        let marked = self.store.complete_entry(entry.id, accepted).await?;
                        summary.succeeded += 1;
                        summary.responses_synced += marked;
                        log::debug!("Synced batch entry {} ({marked} responses)", entry.id);
                        progress.on_entry_synced(entry);
                        return Ok(());
                    }

                    let message = format!(
                        "{} of {} responses not accepted: {}",
                        remaining.len(),
                        responses.len(),
                        errors.join("; ")
                    );
                    if !accepted.is_empty() {
                        summary.responses_synced +=
                            self.store.settle_batch(entry.id, accepted, remaining).await?;
                    }
                    self.fail(entry, &message, true, summary, progress).await
                }
                Err(e) => self.fail(entry, &e.to_string(), e.is_retryable(), summary, progress).await,
            },
        }
    }

    async fn fail(
        &self,
        entry: &SyncQueueEntry,
        message: &str,
        retryable: bool,
        summary: &mut ProcessSummary,
        progress: &dyn SyncProgress,
    ) -> Result<()> {
        let status = if retryable {
            self.store
                .record_failure(entry.id, message, self.max_retries)
                .await?
        } else {
            self.store
                .mark_failed(entry.id, message)
                .await?
                .then_some(QueueStatus::Failed)
        };
        // Cleared or dropped while the request was in flight.
        let Some(status) = status else {
            log::info!("Queue entry {} was removed during the run: {message}", entry.id);
            return Ok(());
        };

        let parked = status == QueueStatus::Failed;
        summary.failed += 1;
        if parked {
            summary.dead_lettered += 1;
            log::warn!(
                "Parked queue entry {} ({}) for manual review: {message}",
                entry.id,
                entry.operation
            );
        } else {
            log::info!(
                "Queue entry {} failed (attempt {}/{}), will retry: {message}",
                entry.id,
                entry.retries + 1,
                self.max_retries
            );
        }
        progress.on_entry_failed(entry, message, parked);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Payload, Response, StoreStats};
    use crate::storage::Database;
    use crate::sync::remote::ItemResult;
    use crate::sync::{NoopProgress, SyncStatus};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::Notify;

    #[derive(Clone, Copy)]
    enum Outcome {
        Offline,
        Reject(u16),
    }

    /// Accepts everything except the ids it was told to fail, and records the
    /// order in which ids arrive.
    #[derive(Default)]
    struct StubRemote {
        outcomes: StdMutex<HashMap<String, Outcome>>,
        calls: StdMutex<Vec<String>>,
        /// Saved through this store during the first call.
        enqueue_during_call: StdMutex<Option<(LocalStore, Response)>>,
        /// Wiped during the first call.
        clear_during_call: StdMutex<Option<LocalStore>>,
    }

    impl StubRemote {
        fn failing(pairs: &[(&str, Outcome)]) -> Self {
            let stub = Self::default();
            {
                let mut outcomes = stub.outcomes.lock().unwrap();
                for (id, outcome) in pairs {
                    outcomes.insert(id.to_string(), *outcome);
                }
            }
            stub
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn outcome(&self, id: &str) -> Option<Outcome> {
            self.outcomes.lock().unwrap().get(id).copied()
        }

        async fn side_effect(&self) {
            let pending = self.enqueue_during_call.lock().unwrap().take();
            if let Some((store, response)) = pending {
                store.save_response(response).await.unwrap();
            }
            let cleared = self.clear_during_call.lock().unwrap().take();
            if let Some(store) = cleared {
                store.clear_all().await.unwrap();
            }
        }
    }

    #[async_trait]
    impl RemoteEndpoint for StubRemote {
        async fn upsert(&self, response: &Response) -> Result<()> {
            self.calls.lock().unwrap().push(response.response_id.clone());
            self.side_effect().await;
            match self.outcome(&response.response_id) {
                None => Ok(()),
                Some(Outcome::Offline) => Err(Error::Network("connection refused".into())),
                Some(Outcome::Reject(status)) => Err(Error::RemoteRejection {
                    status,
                    message: "rejected".into(),
                }),
            }
        }

        async fn upsert_batch(&self, responses: &[Response]) -> Result<Vec<ItemResult>> {
            let ids: Vec<String> = responses.iter().map(|r| r.response_id.clone()).collect();
            self.calls.lock().unwrap().push(ids.join(","));
            Ok(responses
                .iter()
                .map(|r| match self.outcome(&r.response_id) {
                    None => ItemResult::ok(&r.response_id),
                    Some(_) => ItemResult::failed(&r.response_id, "survey closed"),
                })
                .collect())
        }
    }

    async fn setup() -> LocalStore {
        LocalStore::new(Database::open_memory().await.unwrap())
    }

    fn response(id: &str) -> Response {
        let payload: Payload = json!({"q1": id}).as_object().unwrap().clone();
        Response::new("s1", format!("sess-{id}"), payload).with_id(id)
    }

    #[tokio::test]
    async fn test_end_to_end_sync_clears_queue() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::default();

        store.save_response(response("r1")).await.unwrap();
        let summary = processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();

        assert_eq!(summary.status, SyncStatus::Success);
        assert_eq!(summary.responses_synced, 1);
        assert_eq!(
            store.stats().await.unwrap(),
            StoreStats {
                total_responses: 1,
                synced_responses: 1,
                unsynced_responses: 0,
                drafts: 0,
                sync_queue: 0,
            }
        );
        assert!(store.get_response("r1").await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn test_processes_oldest_first() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::default();

        for id in ["c", "a", "b"] {
            store.save_response(response(id)).await.unwrap();
        }
        processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();

        assert_eq!(remote.calls(), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_entries() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::failing(&[("r2", Outcome::Offline)]);

        for id in ["r1", "r2", "r3"] {
            store.save_response(response(id)).await.unwrap();
        }
        let summary = processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();

        assert_eq!(remote.calls(), vec!["r1", "r2", "r3"]);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.status, SyncStatus::PartialFailure);

        let queue = store.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].payload.response_ids(), vec!["r2"]);
        assert_eq!(queue[0].retries, 1);
        assert_eq!(queue[0].status, QueueStatus::Pending);
        assert!(queue[0].last_error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_one_attempt_per_entry_per_run() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::failing(&[("r1", Outcome::Offline)]);

        store.save_response(response("r1")).await.unwrap();
        processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();
        processor
            .process_queue(&remote, TriggerReason::Interval, &NoopProgress)
            .await
            .unwrap();

        assert_eq!(remote.calls().len(), 2);
        assert_eq!(store.list_queue().await.unwrap()[0].retries, 2);
    }

    #[tokio::test]
    async fn test_retry_cap_parks_entry() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 3);
        let remote = StubRemote::failing(&[("r1", Outcome::Offline)]);

        store.save_response(response("r1")).await.unwrap();
        let mut last = ProcessSummary::default();
        for _ in 0..3 {
            last = processor
                .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
                .await
                .unwrap();
        }
        assert_eq!(last.dead_lettered, 1);

        // Parked: no further attempts, but still visible and still unsynced.
        let summary = processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();
        assert_eq!(summary.status, SyncStatus::Idle);
        assert_eq!(remote.calls().len(), 3);

        let entry = &store.list_queue().await.unwrap()[0];
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.retries, 3);
        assert_eq!(store.stats().await.unwrap().unsynced_responses, 1);

        // Manual retry puts it back in line.
        store.retry_failed(Some(entry.id)).await.unwrap();
        remote.outcomes.lock().unwrap().clear();
        let summary = processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(store.stats().await.unwrap().sync_queue, 0);
    }

    #[tokio::test]
    async fn test_permanent_rejection_parks_immediately() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::failing(&[("bad", Outcome::Reject(422)), ("busy", Outcome::Reject(503))]);

        store.save_response(response("bad")).await.unwrap();
        store.save_response(response("busy")).await.unwrap();
        let summary = processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.dead_lettered, 1);
        let queue = store.list_queue().await.unwrap();
        assert_eq!(queue[0].status, QueueStatus::Failed);
        assert_eq!(queue[1].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_entries_added_mid_run_wait_for_next_run() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::default();
        *remote.enqueue_during_call.lock().unwrap() = Some((store.clone(), response("late")));

        store.save_response(response("r1")).await.unwrap();
        let summary = processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();

        assert_eq!(summary.attempted, 1);
        assert_eq!(remote.calls(), vec!["r1"]);
        let queue = store.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].payload.response_ids(), vec!["late"]);
        assert_eq!(queue[0].retries, 0);
    }

    #[tokio::test]
    async fn test_batch_partial_success_narrows_entry() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::failing(&[("b", Outcome::Offline)]);

        store
            .save_responses(vec![response("a"), response("b"), response("c")])
            .await
            .unwrap();
        let summary = processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();

        assert_eq!(summary.responses_synced, 2);
        assert_eq!(summary.status, SyncStatus::PartialFailure);
        let queue = store.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].payload.response_ids(), vec!["b"]);
        assert_eq!(queue[0].retries, 1);
        assert!(queue[0].last_error.as_deref().unwrap().contains("survey closed"));
        assert_eq!(store.stats().await.unwrap().synced_responses, 2);

        // Narrowed entry resends only the outstanding response.
        remote.outcomes.lock().unwrap().clear();
        processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();
        assert_eq!(remote.calls(), vec!["a,b,c", "b"]);
        assert_eq!(store.stats().await.unwrap().sync_queue, 0);
    }

    /// Holds the first request open until released.
    struct GatedRemote {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RemoteEndpoint for GatedRemote {
        async fn upsert(&self, _response: &Response) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn upsert_batch(&self, responses: &[Response]) -> Result<Vec<ItemResult>> {
            Ok(responses.iter().map(|r| ItemResult::ok(&r.response_id)).collect())
        }
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_busy() {
        let store = setup().await;
        let processor = Arc::new(Processor::new(store.clone(), 5));
        let remote = Arc::new(GatedRemote {
            entered: Notify::new(),
            release: Notify::new(),
        });

        store.save_response(response("r1")).await.unwrap();
        let first = {
            let processor = processor.clone();
            let remote = remote.clone();
            tokio::spawn(async move {
                processor
                    .process_queue(remote.as_ref(), TriggerReason::Reconnect, &NoopProgress)
                    .await
            })
        };

        remote.entered.notified().await;
        assert!(processor.is_running());
        let second = processor
            .process_queue(remote.as_ref(), TriggerReason::Manual, &NoopProgress)
            .await;
        assert!(matches!(second, Err(Error::ProcessorBusy)));

        remote.release.notify_one();
        let summary = first.await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_runs_are_recorded() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::failing(&[("r2", Outcome::Offline)]);

        store.save_response(response("r1")).await.unwrap();
        store.save_response(response("r2")).await.unwrap();
        processor
            .process_queue(&remote, TriggerReason::Reconnect, &NoopProgress)
            .await
            .unwrap();

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, "reconnect");
        assert_eq!(runs[0].status, "partial_failure");
        assert_eq!(runs[0].attempted, 2);
        assert_eq!(runs[0].failed, 1);
    }

    #[tokio::test]
    async fn test_local_commit_failure_aborts_run() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::default();

        store.save_response(response("r1")).await.unwrap();
        store.save_response(response("r2")).await.unwrap();
        store
            .db()
            .writer()
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER no_dequeue BEFORE DELETE ON sync_queue
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
                )
            })
            .await
            .unwrap();

        let err = processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)), "got {err:?}");
        // The run stopped at the first entry.
        assert_eq!(remote.calls(), vec!["r1"]);

        let runs = store.recent_runs(1).await.unwrap();
        assert_eq!(runs[0].attempted, 1);
        assert!(runs[0].error_message.is_some());

        assert!(!store.get_response("r1").await.unwrap().unwrap().synced);
        assert_eq!(store.list_queue().await.unwrap().len(), 2);
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_entry_removed_mid_run_is_not_counted() {
        let store = setup().await;
        let processor = Processor::new(store.clone(), 5);
        let remote = StubRemote::failing(&[("r1", Outcome::Offline)]);
        *remote.clear_during_call.lock().unwrap() = Some(store.clone());

        store.save_response(response("r1")).await.unwrap();
        let summary = processor
            .process_queue(&remote, TriggerReason::Manual, &NoopProgress)
            .await
            .unwrap();

        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.dead_lettered, 0);
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
    }
}
