//! Pipeline run log.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::storage::database::{Database, Result};

/// One recorded pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub settings_json: String,
    pub summary_json: Option<String>,
}

/// Records the start of a run.
pub async fn insert(
    db: &Database,
    id: Uuid,
    started_at: DateTime<Utc>,
    settings_json: String,
) -> Result<()> {
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO runs (id, started_at, settings_json) VALUES (?1, ?2, ?3)",
            params![id.to_string(), started_at.to_rfc3339(), settings_json],
        )?;
        Ok(())
    })
    .await
}

/// Stores the summary of a finished run.
pub async fn finish(db: &Database, id: Uuid, summary_json: String) -> Result<bool> {
    db.with_conn(move |conn| {
        let updated = conn.execute(
            "UPDATE runs SET finished_at = ?2, summary_json = ?3 WHERE id = ?1",
            params![id.to_string(), Utc::now().to_rfc3339(), summary_json],
        )?;
        Ok(updated == 1)
    })
    .await
}

/// Retrieves a run by id.
pub async fn get(db: &Database, id: Uuid) -> Result<Option<RunRecord>> {
    db.with_conn(move |conn| {
        let record = conn
            .query_row(
                "SELECT id, started_at, finished_at, settings_json, summary_json
                 FROM runs WHERE id = ?1",
                params![id.to_string()],
                row_to_run,
            )
            .optional()?;
        Ok(record)
    })
    .await
}

/// Most recent runs first.
pub async fn list_recent(db: &Database, limit: usize) -> Result<Vec<RunRecord>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, settings_json, summary_json
             FROM runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    })
    .await
}

fn row_to_run(row: &Row<'_>) -> std::result::Result<RunRecord, rusqlite::Error> {
    let id: String = row.get(0)?;
    let started_at: String = row.get(1)?;
    let finished_at: Option<String> = row.get(2)?;

    Ok(RunRecord {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        started_at: parse_timestamp(&started_at).unwrap_or_default(),
        finished_at: finished_at.as_deref().and_then(parse_timestamp),
        settings_json: row.get(3)?,
        summary_json: row.get(4)?,
    })
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
