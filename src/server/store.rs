use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::Result;
use crate::model::{Payload, Response};
use crate::storage::repository::{format_ts, from_json, parse_ts, to_json};
use crate::storage::Database;

/// A response as the server holds it, with its delivery history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedResponse {
    pub response_id: String,
    pub survey_id: String,
    pub session_id: String,
    pub payload: Payload,
    pub device: Payload,
    pub submitted_at: DateTime<Utc>,
    /// 1 on first receipt, incremented by every resend.
    pub revision: u32,
    pub first_received_at: DateTime<Utc>,
    pub last_received_at: DateTime<Utc>,
}

/// Insert or overwrite by `response_id`. Returns the stored revision.
pub fn upsert_received(
    conn: &Connection,
    response: &Response,
    received_at: &DateTime<Utc>,
) -> rusqlite::Result<u32> {
    conn.query_row(
        "INSERT INTO received_responses (
            response_id, survey_id, session_id, payload, device, submitted_at,
            revision, first_received_at, last_received_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
        ON CONFLICT(response_id) DO UPDATE SET
            survey_id = excluded.survey_id,
            session_id = excluded.session_id,
            payload = excluded.payload,
            device = excluded.device,
            submitted_at = excluded.submitted_at,
            revision = received_responses.revision + 1,
            last_received_at = excluded.last_received_at
        RETURNING revision",
        params![
            response.response_id,
            response.survey_id,
            response.session_id,
            to_json(&response.payload)?,
            to_json(&response.device)?,
            format_ts(&response.submitted_at),
            format_ts(received_at),
        ],
        |row| row.get(0),
    )
}

pub fn get_received(
    conn: &Connection,
    response_id: &str,
) -> rusqlite::Result<Option<ReceivedResponse>> {
    conn.query_row(
        "SELECT response_id, survey_id, session_id, payload, device, submitted_at,
                revision, first_received_at, last_received_at
         FROM received_responses WHERE response_id = ?1",
        params![response_id],
        |row| {
            let payload: String = row.get(3)?;
            let device: String = row.get(4)?;
            let submitted_at: String = row.get(5)?;
            let first: String = row.get(7)?;
            let last: String = row.get(8)?;
            Ok(ReceivedResponse {
                response_id: row.get(0)?,
                survey_id: row.get(1)?,
                session_id: row.get(2)?,
                payload: from_json(3, &payload)?,
                device: from_json(4, &device)?,
                submitted_at: parse_ts(5, &submitted_at)?,
                revision: row.get(6)?,
                first_received_at: parse_ts(7, &first)?,
                last_received_at: parse_ts(8, &last)?,
            })
        },
    )
    .optional()
}

pub fn count_received(conn: &Connection) -> rusqlite::Result<u64> {
    conn.query_row("SELECT COUNT(*) FROM received_responses", [], |row| row.get(0))
}

/// Server-side persistence over a `Schema::Server` database.
#[derive(Clone)]
pub struct ServerStore {
    db: Database,
}

impl ServerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, response: Response) -> Result<u32> {
        Ok(self
            .db
            .writer()
            .call(move |conn| upsert_received(conn, &response, &Utc::now()))
            .await?)
    }

    pub async fn get(&self, response_id: &str) -> Result<Option<ReceivedResponse>> {
        let response_id = response_id.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| get_received(conn, &response_id))
            .await?)
    }

    pub async fn count(&self) -> Result<u64> {
        Ok(self
            .db
            .reader()
            .call(|conn| count_received(conn))
            .await?)
    }
}
