use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::model::{
    Draft, Payload, QueueStatus, Response, StoreStats, SyncOperation, SyncPayload,
    SyncQueueEntry,
};

const RESPONSE_COLUMNS: &str =
    "response_id, survey_id, session_id, payload, device, submitted_at, synced, synced_at";

const QUEUE_COLUMNS: &str =
    "id, operation, payload, retries, last_error, status, created_at, last_attempt_at";

// ── Responses ──────────────────────────────────────────────────────

pub fn response_exists(conn: &Connection, response_id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM responses WHERE response_id = ?1)",
        params![response_id],
        |row| row.get(0),
    )
}

pub fn insert_response(conn: &Connection, response: &Response) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO responses (
            response_id, survey_id, session_id, payload, device, submitted_at, synced, synced_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL)",
        params![
            response.response_id,
            response.survey_id,
            response.session_id,
            to_json(&response.payload)?,
            to_json(&response.device)?,
            format_ts(&response.submitted_at),
        ],
    )?;
    Ok(())
}

pub fn get_response(
    conn: &Connection,
    response_id: &str,
) -> Result<Option<Response>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE response_id = ?1"),
        params![response_id],
        parse_response,
    )
    .optional()
}

/// All responses still waiting for a confirmed upload. Order is not meaningful;
/// sync order comes from the queue.
pub fn list_unsynced_responses(conn: &Connection) -> Result<Vec<Response>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESPONSE_COLUMNS} FROM responses WHERE synced = 0"
    ))?;
    let rows = stmt.query_map([], parse_response)?;
    rows.collect()
}

/// Returns false when the record no longer exists (cache cleared mid-flight).
pub fn mark_synced(
    conn: &Connection,
    response_id: &str,
    synced_at: &DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE responses SET synced = 1, synced_at = ?2 WHERE response_id = ?1",
        params![response_id, format_ts(synced_at)],
    )?;
    Ok(count > 0)
}

/// Unsynced responses that no queue entry covers. These are the leftovers of a
/// crash between the record write and the queue append.
pub fn find_orphaned_responses(conn: &Connection) -> Result<Vec<Response>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESPONSE_COLUMNS} FROM responses r
         WHERE r.synced = 0
           AND NOT EXISTS (
               SELECT 1 FROM sync_queue_items i WHERE i.response_id = r.response_id
           )
         ORDER BY r.submitted_at, r.response_id"
    ))?;
    let rows = stmt.query_map([], parse_response)?;
    rows.collect()
}

fn parse_response(row: &Row<'_>) -> rusqlite::Result<Response> {
    let payload: String = row.get(3)?;
    let device: String = row.get(4)?;
    let submitted_at: String = row.get(5)?;
    let synced_at: Option<String> = row.get(7)?;
    Ok(Response {
        response_id: row.get(0)?,
        survey_id: row.get(1)?,
        session_id: row.get(2)?,
        payload: from_json(3, &payload)?,
        device: from_json(4, &device)?,
        submitted_at: parse_ts(5, &submitted_at)?,
        synced: row.get(6)?,
        synced_at: synced_at.map(|s| parse_ts(7, &s)).transpose()?,
    })
}

// ── Drafts ─────────────────────────────────────────────────────────

pub fn upsert_draft(conn: &Connection, draft: &Draft) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO drafts (session_id, survey_id, answers, saved_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(session_id) DO UPDATE SET
            survey_id = COALESCE(excluded.survey_id, drafts.survey_id),
            answers = excluded.answers,
            saved_at = excluded.saved_at",
        params![
            draft.session_id,
            draft.survey_id,
            to_json(&draft.answers)?,
            format_ts(&draft.saved_at),
        ],
    )?;
    Ok(())
}

pub fn get_draft(conn: &Connection, session_id: &str) -> Result<Option<Draft>, rusqlite::Error> {
    conn.query_row(
        "SELECT session_id, survey_id, answers, saved_at FROM drafts WHERE session_id = ?1",
        params![session_id],
        parse_draft,
    )
    .optional()
}

pub fn list_drafts(conn: &Connection) -> Result<Vec<Draft>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT session_id, survey_id, answers, saved_at FROM drafts ORDER BY saved_at DESC",
    )?;
    let rows = stmt.query_map([], parse_draft)?;
    rows.collect()
}

pub fn delete_draft(conn: &Connection, session_id: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM drafts WHERE session_id = ?1",
        params![session_id],
    )?;
    Ok(count > 0)
}

fn parse_draft(row: &Row<'_>) -> rusqlite::Result<Draft> {
    let answers: String = row.get(2)?;
    let saved_at: String = row.get(3)?;
    Ok(Draft {
        session_id: row.get(0)?,
        survey_id: row.get(1)?,
        answers: from_json::<Payload>(2, &answers)?,
        saved_at: parse_ts(3, &saved_at)?,
    })
}

// ── Sync Queue ─────────────────────────────────────────────────────

/// Append a snapshot entry and link it to the responses it covers.
pub fn insert_queue_entry(
    conn: &Connection,
    payload: &SyncPayload,
    created_at: &DateTime<Utc>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_queue (operation, payload, retries, status, created_at)
         VALUES (?1, ?2, 0, 'pending', ?3)",
        params![
            payload.operation().as_str(),
            to_json(payload)?,
            format_ts(created_at),
        ],
    )?;
    let id = conn.last_insert_rowid();
    insert_queue_items(conn, id, payload)?;
    Ok(id)
}

fn insert_queue_items(
    conn: &Connection,
    queue_id: i64,
    payload: &SyncPayload,
) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO sync_queue_items (queue_id, response_id) VALUES (?1, ?2)",
    )?;
    for response_id in payload.response_ids() {
        stmt.execute(params![queue_id, response_id])?;
    }
    Ok(())
}

pub fn delete_queue_entry(conn: &Connection, id: i64) -> Result<bool, rusqlite::Error> {
    let count = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
    Ok(count > 0)
}

/// Delete an unsynced response that no queue entry covers any more.
pub fn delete_orphaned_response(conn: &Connection, response_id: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM responses
         WHERE response_id = ?1 AND synced = 0
           AND NOT EXISTS (SELECT 1 FROM sync_queue_items WHERE response_id = ?1)",
        params![response_id],
    )?;
    Ok(count > 0)
}

pub fn get_queue_entry(
    conn: &Connection,
    id: i64,
) -> Result<Option<SyncQueueEntry>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE id = ?1"),
        params![id],
        parse_queue_entry,
    )
    .optional()
}

/// Queue entries ordered by id ascending, optionally restricted to one status.
pub fn list_queue_entries(
    conn: &Connection,
    status: Option<QueueStatus>,
) -> Result<Vec<SyncQueueEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUEUE_COLUMNS} FROM sync_queue
         WHERE ?1 IS NULL OR status = ?1
         ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map(params![status.map(|s| s.as_str())], parse_queue_entry)?;
    rows.collect()
}

/// Count one failed attempt. Once `retries` reaches `max_retries` the entry is
/// parked as failed and the processor stops picking it up.
///
/// Returns the resulting status, or None if the entry no longer exists.
pub fn record_queue_failure(
    conn: &Connection,
    id: i64,
    error_message: &str,
    max_retries: u32,
    attempted_at: &DateTime<Utc>,
) -> Result<Option<QueueStatus>, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE sync_queue SET
            retries = retries + 1,
            last_error = ?2,
            last_attempt_at = ?3,
            status = CASE WHEN retries + 1 >= ?4 THEN 'failed' ELSE 'pending' END
         WHERE id = ?1",
        params![id, error_message, format_ts(attempted_at), max_retries],
    )?;
    if count == 0 {
        return Ok(None);
    }
    let status: String = conn.query_row(
        "SELECT status FROM sync_queue WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    parse_status(0, &status).map(Some)
}

/// Count the attempt and park the entry for manual review regardless of budget.
pub fn mark_queue_failed(
    conn: &Connection,
    id: i64,
    error_message: &str,
    attempted_at: &DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE sync_queue SET
            status = 'failed', retries = retries + 1, last_error = ?2, last_attempt_at = ?3
         WHERE id = ?1",
        params![id, error_message, format_ts(attempted_at)],
    )?;
    Ok(count > 0)
}

/// Put failed entries back in line with a fresh retry budget. `None` resets all.
pub fn reset_failed_entries(conn: &Connection, id: Option<i64>) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', retries = 0
         WHERE status = 'failed' AND (?1 IS NULL OR id = ?1)",
        params![id],
    )
}

/// Narrow an entry to a new snapshot (e.g. the still-failing part of a batch).
pub fn replace_queue_payload(
    conn: &Connection,
    id: i64,
    payload: &SyncPayload,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE sync_queue SET operation = ?2, payload = ?3 WHERE id = ?1",
        params![id, payload.operation().as_str(), to_json(payload)?],
    )?;
    if count == 0 {
        return Ok(false);
    }
    conn.execute(
        "DELETE FROM sync_queue_items WHERE queue_id = ?1",
        params![id],
    )?;
    insert_queue_items(conn, id, payload)?;
    Ok(true)
}

pub fn count_failed_entries(conn: &Connection) -> Result<u64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status = 'failed'",
        [],
        |row| row.get(0),
    )
}

fn parse_queue_entry(row: &Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
    let operation: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let last_attempt_at: Option<String> = row.get(7)?;

    let operation: SyncOperation = operation
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let payload: SyncPayload = from_json(2, &payload)?;
    if payload.operation() != operation {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("payload shape does not match operation {operation}").into(),
        ));
    }

    Ok(SyncQueueEntry {
        id: row.get(0)?,
        operation,
        payload,
        retries: row.get(3)?,
        last_error: row.get(4)?,
        status: parse_status(5, &status)?,
        created_at: parse_ts(6, &created_at)?,
        last_attempt_at: last_attempt_at.map(|s| parse_ts(7, &s)).transpose()?,
    })
}

fn parse_status(idx: usize, raw: &str) -> rusqlite::Result<QueueStatus> {
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ── Stats & Reset ──────────────────────────────────────────────────

pub fn count_stats(conn: &Connection) -> Result<StoreStats, rusqlite::Error> {
    let (total, synced): (u64, u64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(synced), 0) FROM responses",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let drafts: u64 = conn.query_row("SELECT COUNT(*) FROM drafts", [], |row| row.get(0))?;
    let queue: u64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
    Ok(StoreStats {
        total_responses: total,
        synced_responses: synced,
        unsynced_responses: total - synced,
        drafts,
        sync_queue: queue,
    })
}

/// Wipe responses, drafts, and the queue. Config and run history survive.
pub fn clear_all(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "DELETE FROM sync_queue_items;
         DELETE FROM sync_queue;
         DELETE FROM drafts;
         DELETE FROM responses;",
    )
}

// ── Sync Runs ──────────────────────────────────────────────────────

pub fn insert_sync_run(
    conn: &Connection,
    trigger: &str,
    started_at: &DateTime<Utc>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (trigger, status, started_at) VALUES (?1, 'running', ?2)",
        params![trigger, format_ts(started_at)],
    )?;
    Ok(conn.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
pub fn update_sync_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    attempted: u64,
    succeeded: u64,
    failed: u64,
    dead_lettered: u64,
    error_message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET
            status = ?2, completed_at = ?3,
            attempted = ?4, succeeded = ?5, failed = ?6, dead_lettered = ?7,
            error_message = ?8
         WHERE id = ?1",
        params![
            run_id,
            status,
            format_ts(&Utc::now()),
            attempted as i64,
            succeeded as i64,
            failed as i64,
            dead_lettered as i64,
            error_message,
        ],
    )?;
    Ok(())
}

pub fn list_sync_runs(conn: &Connection, limit: u32) -> Result<Vec<SyncRun>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, trigger, status, started_at, completed_at,
                attempted, succeeded, failed, dead_lettered, error_message
         FROM sync_runs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(SyncRun {
            id: row.get(0)?,
            trigger: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            attempted: row.get(5)?,
            succeeded: row.get(6)?,
            failed: row.get(7)?,
            dead_lettered: row.get(8)?,
            error_message: row.get(9)?,
        })
    })?;
    rows.collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub id: i64,
    pub trigger: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub error_message: Option<String>,
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn unset_config(conn: &Connection, key: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])?;
    Ok(count > 0)
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Helpers ────────────────────────────────────────────────────────

/// RFC 3339 with millisecond precision, so text order matches time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use serde_json::json;

    fn response(id: &str, session: &str) -> Response {
        let payload = json!({"q1": "42"}).as_object().unwrap().clone();
        Response::new("s1", session, payload).with_id(id)
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "endpoint", "https://example.com/api/v1/responses")?;
                let val = get_config(conn, "endpoint")?;
                assert_eq!(val, Some("https://example.com/api/v1/responses".to_string()));

                assert!(unset_config(conn, "endpoint")?);
                assert_eq!(get_config(conn, "endpoint")?, None);
                assert!(!unset_config(conn, "endpoint")?);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let mut original = response("r1", "sess1");
                original.device = json!({"platform": "android"}).as_object().unwrap().clone();
                insert_response(conn, &original)?;

                assert!(response_exists(conn, "r1")?);
                let fetched = get_response(conn, "r1")?.unwrap();
                assert_eq!(fetched.payload, original.payload);
                assert_eq!(fetched.device, original.device);
                assert!(!fetched.synced);
                assert!(fetched.synced_at.is_none());

                assert!(get_response(conn, "missing")?.is_none());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mark_synced_missing_is_noop() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                insert_response(conn, &response("r1", "sess1"))?;
                assert!(mark_synced(conn, "r1", &Utc::now())?);
                assert!(!mark_synced(conn, "ghost", &Utc::now())?);

                assert!(list_unsynced_responses(conn)?.is_empty());
                assert!(get_response(conn, "r1")?.unwrap().synced_at.is_some());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_draft_upsert_keeps_one_row() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let mut draft = Draft {
                    session_id: "S1".into(),
                    survey_id: Some("s1".into()),
                    answers: json!({"q1": "a"}).as_object().unwrap().clone(),
                    saved_at: Utc::now(),
                };
                upsert_draft(conn, &draft)?;

                draft.survey_id = None;
                draft.answers = json!({"q1": "b", "q2": "c"}).as_object().unwrap().clone();
                upsert_draft(conn, &draft)?;

                let drafts = list_drafts(conn)?;
                assert_eq!(drafts.len(), 1);
                assert_eq!(drafts[0].answers["q1"], "b");
                // A save without a survey id does not erase a known one.
                assert_eq!(drafts[0].survey_id.as_deref(), Some("s1"));

                assert!(delete_draft(conn, "S1")?);
                assert!(get_draft(conn, "S1")?.is_none());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_ordering_and_items() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let now = Utc::now();
                let a = insert_queue_entry(conn, &SyncPayload::Single(response("a", "x")), &now)?;
                let b = insert_queue_entry(
                    conn,
                    &SyncPayload::Batch(vec![response("b", "y"), response("c", "z")]),
                    &now,
                )?;
                assert!(b > a);

                let entries = list_queue_entries(conn, None)?;
                assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b]);
                assert_eq!(entries[1].operation, SyncOperation::BatchSync);

                let items: i64 =
                    conn.query_row("SELECT COUNT(*) FROM sync_queue_items", [], |row| row.get(0))?;
                assert_eq!(items, 3);

                // Deleting the entry cascades to its items.
                assert!(delete_queue_entry(conn, b)?);
                let items: i64 =
                    conn.query_row("SELECT COUNT(*) FROM sync_queue_items", [], |row| row.get(0))?;
                assert_eq!(items, 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ids_stay_monotonic_after_delete() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let now = Utc::now();
                let first = insert_queue_entry(conn, &SyncPayload::Single(response("a", "x")), &now)?;
                delete_queue_entry(conn, first)?;
                let second = insert_queue_entry(conn, &SyncPayload::Single(response("b", "y")), &now)?;
                assert!(second > first);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_record_failure_reaches_cap() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let now = Utc::now();
                let id = insert_queue_entry(conn, &SyncPayload::Single(response("a", "x")), &now)?;

                assert_eq!(record_queue_failure(conn, id, "timeout", 3, &now)?, Some(QueueStatus::Pending));
                assert_eq!(record_queue_failure(conn, id, "timeout", 3, &now)?, Some(QueueStatus::Pending));
                assert_eq!(record_queue_failure(conn, id, "HTTP 503", 3, &now)?, Some(QueueStatus::Failed));

                let entry = get_queue_entry(conn, id)?.unwrap();
                assert_eq!(entry.retries, 3);
                assert_eq!(entry.last_error.as_deref(), Some("HTTP 503"));
                assert!(entry.last_attempt_at.is_some());
                assert!(list_queue_entries(conn, Some(QueueStatus::Pending))?.is_empty());
                assert_eq!(count_failed_entries(conn)?, 1);

                assert_eq!(record_queue_failure(conn, 999, "x", 3, &now)?, None);

                assert_eq!(reset_failed_entries(conn, Some(id))?, 1);
                let entry = get_queue_entry(conn, id)?.unwrap();
                assert_eq!(entry.status, QueueStatus::Pending);
                assert_eq!(entry.retries, 0);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_orphan_detection() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let now = Utc::now();
                insert_response(conn, &response("queued", "a"))?;
                insert_queue_entry(conn, &SyncPayload::Single(response("queued", "a")), &now)?;
                insert_response(conn, &response("orphan", "b"))?;
                insert_response(conn, &response("done", "c"))?;
                mark_synced(conn, "done", &now)?;

                let orphans = find_orphaned_responses(conn)?;
                assert_eq!(orphans.len(), 1);
                assert_eq!(orphans[0].response_id, "orphan");
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_replace_payload_relinks_items() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let now = Utc::now();
                let id = insert_queue_entry(
                    conn,
                    &SyncPayload::Batch(vec![response("a", "x"), response("b", "y")]),
                    &now,
                )?;
                assert!(replace_queue_payload(conn, id, &SyncPayload::Batch(vec![response("b", "y")]))?);

                let linked: Vec<String> = conn
                    .prepare("SELECT response_id FROM sync_queue_items WHERE queue_id = ?1")?
                    .query_map(params![id], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                assert_eq!(linked, vec!["b".to_string()]);
                assert!(!replace_queue_payload(conn, 404, &SyncPayload::Batch(vec![]))?);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let now = Utc::now();
                insert_response(conn, &response("a", "x"))?;
                insert_response(conn, &response("b", "y"))?;
                mark_synced(conn, "a", &now)?;
                insert_queue_entry(conn, &SyncPayload::Single(response("b", "y")), &now)?;
                upsert_draft(
                    conn,
                    &Draft {
                        session_id: "z".into(),
                        survey_id: None,
                        answers: Payload::new(),
                        saved_at: now,
                    },
                )?;

                let stats = count_stats(conn)?;
                assert_eq!(
                    stats,
                    StoreStats {
                        total_responses: 2,
                        synced_responses: 1,
                        unsynced_responses: 1,
                        drafts: 1,
                        sync_queue: 1,
                    }
                );

                clear_all(conn)?;
                assert_eq!(count_stats(conn)?, StoreStats::default());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_run_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let run_id = insert_sync_run(conn, "manual", &Utc::now())?;
                assert!(run_id > 0);

                update_sync_run(conn, run_id, "partial_failure", 3, 2, 1, 0, None)?;

                let runs = list_sync_runs(conn, 10)?;
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].status, "partial_failure");
                assert_eq!(runs[0].succeeded, 2);
                assert!(runs[0].completed_at.is_some());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
