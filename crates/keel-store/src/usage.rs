use rusqlite::{params, Connection};
use tracing::instrument;

use keel_core::context::{ContextUsageRecord, PhaseUsage};
use keel_core::ids::{SessionId, UsageId};

use crate::error::StoreError;
use crate::row_helpers::{self, ts};

/// The context-usage ledger. Rows are never updated or deleted.
pub struct UsageRepo;

impl UsageRepo {
    #[instrument(skip(conn, record), fields(session_id = %record.session_id, tokens = record.tokens))]
    pub fn append(conn: &Connection, record: &ContextUsageRecord) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO context_usage (id, session_id, phase, tokens, operation, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.as_str(),
                record.session_id.as_str(),
                record.phase,
                record.tokens,
                record.operation,
                ts(&record.recorded_at),
            ],
        )?;
        Ok(())
    }

    /// All records for a session in the order they were written.
    pub fn list(conn: &Connection, session_id: &SessionId) -> Result<Vec<ContextUsageRecord>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, session_id, phase, tokens, operation, recorded_at
             FROM context_usage WHERE session_id = ?1
             ORDER BY recorded_at ASC, rowid ASC",
        )?;
        let mut rows = stmt.query([session_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            const T: &str = "context_usage";
            let recorded_at: String = row_helpers::get(row, 5, T, "recorded_at")?;
            out.push(ContextUsageRecord {
                id: UsageId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
                session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
                phase: row_helpers::get(row, 2, T, "phase")?,
                tokens: row_helpers::get(row, 3, T, "tokens")?,
                operation: row_helpers::get(row, 4, T, "operation")?,
                recorded_at: row_helpers::parse_time(&recorded_at, T, "recorded_at")?,
            });
        }
        Ok(out)
    }

    pub fn sum(conn: &Connection, session_id: &SessionId) -> Result<i64, StoreError> {
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(tokens), 0) FROM context_usage WHERE session_id = ?1",
            [session_id.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Net tokens per phase, largest first.
    pub fn by_phase(conn: &Connection, session_id: &SessionId) -> Result<Vec<PhaseUsage>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT phase, SUM(tokens) AS total FROM context_usage
             WHERE session_id = ?1 GROUP BY phase ORDER BY total DESC, phase ASC",
        )?;
        let rows = stmt.query_map([session_id.as_str()], |row| {
            Ok(PhaseUsage {
                phase: row.get(0)?,
                tokens: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
