use chrono::Utc;

use crate::error::{Error, Result};
use crate::model::{
    new_response_id, Draft, Payload, QueueStatus, Response, StoreStats, SyncPayload,
    SyncQueueEntry,
};
use crate::storage::repository::{self, SyncRun};
use crate::storage::Database;
use crate::sync::ProcessSummary;

/// The device-side source of truth for responses, drafts, and the sync queue.
///
/// Every method is one short transaction on the writer (or one query on the
/// reader). Storage failures come back as `Error::Storage` and nothing is
/// assumed to have been written.
#[derive(Clone)]
pub struct LocalStore {
    db: Database,
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ── Responses ────────────────────────────────────────────────

    /// Finalize a response: write it unsynced, drop the session's draft, and
    /// append a create-response snapshot to the queue, all in one transaction.
    /// Returns as soon as the write is durable; never touches the network.
    pub async fn save_response(&self, mut response: Response) -> Result<String> {
        prepare_for_save(&mut response)?;
        let response_id = response.response_id.clone();

        let queue_id = self
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                if repository::response_exists(&tx, &response.response_id)? {
                    return Ok::<Option<i64>, rusqlite::Error>(None);
                }
                repository::insert_response(&tx, &response)?;
                repository::delete_draft(&tx, &response.session_id)?;
                let queue_id = repository::insert_queue_entry(
                    &tx,
                    &SyncPayload::Single(response),
                    &Utc::now(),
                )?;
                tx.commit()?;
                Ok(Some(queue_id))
            })
            .await?;

        match queue_id {
            Some(queue_id) => {
                log::debug!("Saved response {response_id}, queued as entry {queue_id}");
                Ok(response_id)
            }
            None => Err(Error::Conflict(format!(
                "response {response_id} was already finalized"
            ))),
        }
    }

    /// Finalize several responses at once behind a single batch-sync entry.
    pub async fn save_responses(&self, mut responses: Vec<Response>) -> Result<Vec<String>> {
        if responses.is_empty() {
            return Ok(Vec::new());
        }
        for response in &mut responses {
            prepare_for_save(response)?;
        }
        let ids: Vec<String> = responses.iter().map(|r| r.response_id.clone()).collect();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != ids.len() {
            return Err(Error::InvalidInput("duplicate response_id in batch".into()));
        }

        let outcome = self
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                for response in &responses {
                    if repository::response_exists(&tx, &response.response_id)? {
                        return Ok::<std::result::Result<i64, String>, rusqlite::Error>(Err(
                            response.response_id.clone(),
                        ));
                    }
                    repository::insert_response(&tx, response)?;
                    repository::delete_draft(&tx, &response.session_id)?;
                }
                let queue_id = repository::insert_queue_entry(
                    &tx,
                    &SyncPayload::Batch(responses),
                    &Utc::now(),
                )?;
                tx.commit()?;
                Ok(Ok(queue_id))
            })
            .await?;

        match outcome {
            Ok(queue_id) => {
                log::debug!("Saved {} responses, queued as batch entry {queue_id}", ids.len());
                Ok(ids)
            }
            Err(existing) => Err(Error::Conflict(format!(
                "response {existing} was already finalized"
            ))),
        }
    }

    pub async fn get_response(&self, response_id: &str) -> Result<Option<Response>> {
        let response_id = response_id.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_response(conn, &response_id))
            .await?)
    }

    pub async fn list_unsynced_responses(&self) -> Result<Vec<Response>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_unsynced_responses(conn))
            .await?)
    }

    /// Record a confirmed upload. A missing record is not an error: the cache may
    /// have been cleared while the request was in flight.
    pub async fn mark_synced(&self, response_id: &str) -> Result<()> {
        let id = response_id.to_string();
        let found = self
            .db
            .writer()
            .call(move |conn| repository::mark_synced(conn, &id, &Utc::now()))
            .await?;
        if !found {
            log::debug!("mark_synced: response {response_id} no longer exists, ignoring");
        }
        Ok(())
    }

    // ── Drafts ───────────────────────────────────────────────────

    /// Autosave. Overwrites whatever was saved for the session before.
    pub async fn save_draft(
        &self,
        session_id: &str,
        survey_id: Option<&str>,
        answers: Payload,
    ) -> Result<String> {
        if session_id.trim().is_empty() {
            return Err(Error::InvalidInput("session_id must not be empty".into()));
        }
        let draft = Draft {
            session_id: session_id.to_string(),
            survey_id: survey_id.map(str::to_string),
            answers,
            saved_at: Utc::now(),
        };
        self.db
            .writer()
            .call(move |conn| repository::upsert_draft(conn, &draft))
            .await?;
        Ok(session_id.to_string())
    }

    pub async fn get_draft(&self, session_id: &str) -> Result<Option<Draft>> {
        let session_id = session_id.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_draft(conn, &session_id))
            .await?)
    }

    pub async fn list_drafts(&self) -> Result<Vec<Draft>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_drafts(conn))
            .await?)
    }

    /// Returns whether a draft existed.
    pub async fn discard_draft(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::delete_draft(conn, &session_id))
            .await?)
    }

    // ── Sync Queue ───────────────────────────────────────────────

    /// Append a snapshot. Later edits to the responses do not reach it.
    pub async fn enqueue(&self, payload: SyncPayload) -> Result<i64> {
        Ok(self
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let id = repository::insert_queue_entry(&tx, &payload, &Utc::now())?;
                tx.commit()?;
                Ok::<i64, rusqlite::Error>(id)
            })
            .await?)
    }

    /// Returns whether the entry existed.
    pub async fn dequeue(&self, id: i64) -> Result<bool> {
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::delete_queue_entry(conn, id))
            .await?)
    }

    /// Abandon an entry together with the unsynced responses only it carried,
    /// so recovery does not put them back. Returns how many responses were
    /// removed, or `None` if there was no such entry.
    pub async fn discard_entry(&self, id: i64) -> Result<Option<usize>> {
        let removed = self
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(entry) = repository::get_queue_entry(&tx, id)? else {
                    return Ok::<Option<usize>, rusqlite::Error>(None);
                };
                repository::delete_queue_entry(&tx, id)?;
                let mut removed = 0;
                for response_id in entry.payload.response_ids() {
                    if repository::delete_orphaned_response(&tx, &response_id)? {
                        removed += 1;
                    }
                }
                tx.commit()?;
                Ok(Some(removed))
            })
            .await?;
        if let Some(n) = removed {
            log::warn!("Discarded queue entry {id} and {n} unsynced responses");
        }
        Ok(removed)
    }

    /// Every entry, pending and failed, by id ascending.
    pub async fn list_queue(&self) -> Result<Vec<SyncQueueEntry>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_queue_entries(conn, None))
            .await?)
    }

    /// Entries eligible for the next processor run, by id ascending.
    pub async fn list_pending(&self) -> Result<Vec<SyncQueueEntry>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::list_queue_entries(conn, Some(QueueStatus::Pending)))
            .await?)
    }

    pub async fn get_queue_entry(&self, id: i64) -> Result<Option<SyncQueueEntry>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_queue_entry(conn, id))
            .await?)
    }

    /// Count a failed attempt. The entry stays pending until `max_retries`
    /// attempts have failed, then it is parked as failed.
    pub async fn record_failure(
        &self,
        id: i64,
        error_message: &str,
        max_retries: u32,
    ) -> Result<Option<QueueStatus>> {
        let message = error_message.to_string();
        Ok(self
            .db
            .writer()
            .call(move |conn| {
                repository::record_queue_failure(conn, id, &message, max_retries, &Utc::now())
            })
            .await?)
    }

    /// Park an entry for manual review.
    pub async fn mark_failed(&self, id: i64, error_message: &str) -> Result<bool> {
        let message = error_message.to_string();
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::mark_queue_failed(conn, id, &message, &Utc::now()))
            .await?)
    }

    /// Give a failed entry (or all of them, with `None`) a fresh retry budget.
    pub async fn retry_failed(&self, id: Option<i64>) -> Result<usize> {
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::reset_failed_entries(conn, id))
            .await?)
    }

    /// Mark the entry's responses synced and dequeue it in one transaction.
    /// Returns how many responses flipped to synced.
    pub async fn complete_entry(&self, id: i64, response_ids: Vec<String>) -> Result<u64> {
        Ok(self
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now();
                let mut marked = 0u64;
                for response_id in &response_ids {
                    if repository::mark_synced(&tx, response_id, &now)? {
                        marked += 1;
                    }
                }
                repository::delete_queue_entry(&tx, id)?;
                tx.commit()?;
                Ok::<u64, rusqlite::Error>(marked)
            })
            .await?)
    }

    /// Settle a partially accepted batch: mark the accepted responses synced and
    /// narrow the entry to the ones still outstanding, in one transaction.
    pub async fn settle_batch(
        &self,
        id: i64,
        accepted: Vec<String>,
        remaining: Vec<Response>,
    ) -> Result<u64> {
        Ok(self
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now();
                let mut marked = 0u64;
                for response_id in &accepted {
                    if repository::mark_synced(&tx, response_id, &now)? {
                        marked += 1;
                    }
                }
                repository::replace_queue_payload(&tx, id, &SyncPayload::Batch(remaining))?;
                tx.commit()?;
                Ok::<u64, rusqlite::Error>(marked)
            })
            .await?)
    }

    pub async fn failed_entries(&self) -> Result<u64> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::count_failed_entries(conn))
            .await?)
    }

    // ── Recovery, Stats, Reset ───────────────────────────────────

    /// Re-enqueue every unsynced response that no queue entry covers, one
    /// create-response entry each. Running it twice adds nothing the second time.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let recovered = self
            .db
            .writer()
            .call(|conn| {
                let tx = conn.transaction()?;
                let orphans = repository::find_orphaned_responses(&tx)?;
                let now = Utc::now();
                for response in &orphans {
                    repository::insert_queue_entry(
                        &tx,
                        &SyncPayload::Single(response.clone()),
                        &now,
                    )?;
                }
                tx.commit()?;
                Ok::<usize, rusqlite::Error>(orphans.len())
            })
            .await?;
        if recovered > 0 {
            log::warn!("Re-enqueued {recovered} unsynced responses that had no queue entry");
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::count_stats(conn))
            .await?)
    }

    // ── Sync Run History ─────────────────────────────────────────

    pub async fn begin_run(&self, trigger: &str) -> Result<i64> {
        let trigger = trigger.to_string();
        Ok(self
            .db
            .writer()
            .call(move |conn| repository::insert_sync_run(conn, &trigger, &Utc::now()))
            .await?)
    }

    pub async fn finish_run(
        &self,
        run_id: i64,
        summary: &ProcessSummary,
        error_message: Option<String>,
    ) -> Result<()> {
        let summary = summary.clone();
        self.db
            .writer()
            .call(move |conn| {
                repository::update_sync_run(
                    conn,
                    run_id,
                    summary.status.as_str(),
                    summary.attempted,
                    summary.succeeded,
                    summary.failed,
                    summary.dead_lettered,
                    error_message.as_deref(),
                )
            })
            .await?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<SyncRun>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::list_sync_runs(conn, limit))
            .await?)
    }

    /// Explicit user reset. The sync flow never calls this.
    pub async fn clear_all(&self) -> Result<()> {
        self.db
            .writer()
            .call(|conn| {
                let tx = conn.transaction()?;
                repository::clear_all(&tx)?;
                tx.commit()
            })
            .await?;
        log::info!("Cleared all local responses, drafts, and queued sync work");
        Ok(())
    }
}

fn prepare_for_save(response: &mut Response) -> Result<()> {
    if response.response_id.trim().is_empty() {
        response.response_id = new_response_id();
    }
    if response.survey_id.trim().is_empty() {
        return Err(Error::InvalidInput("survey_id must not be empty".into()));
    }
    if response.session_id.trim().is_empty() {
        return Err(Error::InvalidInput("session_id must not be empty".into()));
    }
    response.synced = false;
    response.synced_at = None;
    Ok(())
}
