use rusqlite::{params, Connection};
use tracing::instrument;

use keel_core::ids::{CheckpointId, SessionId};
use keel_core::session::Checkpoint;

use crate::error::StoreError;
use crate::row_helpers::{self, to_i64, ts};

const COLUMNS: &str =
    "id, session_id, number, tokens_used, completed_components, metrics, message, continuation, created_at";

/// Append-only checkpoint log.
pub struct CheckpointRepo;

impl CheckpointRepo {
    #[instrument(skip(conn, checkpoint), fields(session_id = %checkpoint.session_id, number = checkpoint.number))]
    pub fn insert(conn: &Connection, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let continuation = checkpoint
            .continuation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            &format!("INSERT INTO checkpoints ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                checkpoint.id.as_str(),
                checkpoint.session_id.as_str(),
                checkpoint.number,
                to_i64(checkpoint.tokens_used),
                serde_json::to_string(&checkpoint.completed_components)?,
                serde_json::to_string(&checkpoint.metrics)?,
                checkpoint.message,
                continuation,
                ts(&checkpoint.created_at),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(format!(
                    "checkpoint {} already exists for session {}",
                    checkpoint.number, checkpoint.session_id
                ))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    /// All checkpoints of a session in number order.
    #[instrument(skip(conn), fields(session_id = %session_id))]
    pub fn list(conn: &Connection, session_id: &SessionId) -> Result<Vec<Checkpoint>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM checkpoints WHERE session_id = ?1 ORDER BY number ASC"
        ))?;
        let mut rows = stmt.query([session_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_checkpoint(row)?);
        }
        Ok(out)
    }

    pub fn latest(conn: &Connection, session_id: &SessionId) -> Result<Option<Checkpoint>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM checkpoints WHERE session_id = ?1 ORDER BY number DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query([session_id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_checkpoint(row)?)),
            None => Ok(None),
        }
    }

    pub fn count(conn: &Connection, session_id: &SessionId) -> Result<u64, StoreError> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM checkpoints WHERE session_id = ?1",
            [session_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<Checkpoint, StoreError> {
    const T: &str = "checkpoints";
    let components: String = row_helpers::get(row, 4, T, "completed_components")?;
    let metrics: String = row_helpers::get(row, 5, T, "metrics")?;
    let continuation: Option<String> = row_helpers::get_opt(row, 7, T, "continuation")?;
    let created_at: String = row_helpers::get(row, 8, T, "created_at")?;

    Ok(Checkpoint {
        id: CheckpointId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        number: row_helpers::get(row, 2, T, "number")?,
        tokens_used: row_helpers::get_u64(row, 3, T, "tokens_used")?,
        completed_components: row_helpers::parse_json(&components, T, "completed_components")?,
        metrics: row_helpers::parse_json(&metrics, T, "metrics")?,
        message: row_helpers::get_opt(row, 6, T, "message")?,
        continuation: continuation
            .map(|raw| row_helpers::parse_json(&raw, T, "continuation"))
            .transpose()?,
        created_at: row_helpers::parse_time(&created_at, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::sessions::fixtures;
    use chrono::Utc;
    use keel_core::session::{ContinuationPlan, RemainingWork, SessionMetrics};

    fn checkpoint(session_id: &SessionId, number: u32) -> Checkpoint {
        Checkpoint {
            id: CheckpointId::new(),
            session_id: session_id.clone(),
            number,
            created_at: Utc::now(),
            tokens_used: 1_000 * u64::from(number),
            completed_components: vec![format!("src/part{number}.rs")],
            metrics: SessionMetrics {
                lines_written: 100 * u64::from(number),
                ..Default::default()
            },
            message: Some(format!("checkpoint {number}")),
            continuation: Some(ContinuationPlan {
                remaining: RemainingWork {
                    lines: 10,
                    tests: 1,
                    docs: 0,
                },
                next_checkpoint_at_lines: Some(600),
                notes: vec![],
            }),
        }
    }

    #[test]
    fn list_in_number_order() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let s = fixtures::session(conn, "alpha", 10_000);
            CheckpointRepo::insert(conn, &checkpoint(&s.id, 1))?;
            CheckpointRepo::insert(conn, &checkpoint(&s.id, 2))?;

            let all = CheckpointRepo::list(conn, &s.id)?;
            assert_eq!(all.iter().map(|c| c.number).collect::<Vec<_>>(), vec![1, 2]);
            assert_eq!(all[1].metrics.lines_written, 200);
            assert_eq!(
                all[0].continuation.as_ref().unwrap().next_checkpoint_at_lines,
                Some(600)
            );
            assert_eq!(CheckpointRepo::latest(conn, &s.id)?.unwrap().number, 2);
            assert_eq!(CheckpointRepo::count(conn, &s.id)?, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn duplicate_number_conflicts() {
        let db = Database::in_memory().unwrap();
        let err = db
            .with_conn(|conn| {
                let s = fixtures::session(conn, "alpha", 10_000);
                CheckpointRepo::insert(conn, &checkpoint(&s.id, 1))?;
                CheckpointRepo::insert(conn, &checkpoint(&s.id, 1))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
