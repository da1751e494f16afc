use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use keel_core::ids::{ProjectId, SessionId};
use keel_core::session::{EstimatedScope, Session, SessionMetrics, SessionStatus};

use crate::error::StoreError;
use crate::row_helpers::{self, to_i64, ts};

const COLUMNS: &str = "id, project, project_id, kind, phase, status, is_active,
    scope_lines, scope_tests, scope_docs, context_budget, context_used, continuing_from,
    lines_written, tests_written, docs_written, velocity_score, started_at, updated_at";

/// Session rows. Every function takes a `&Connection` so callers can compose
/// them inside one transaction.
pub struct SessionRepo;

impl SessionRepo {
    #[instrument(skip(conn, session), fields(session_id = %session.id, project = %session.project))]
    pub fn insert(conn: &Connection, session: &Session) -> Result<(), StoreError> {
        conn.execute(
            &format!(
                "INSERT INTO sessions ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
            ),
            params![
                session.id.as_str(),
                session.project,
                session.project_id.as_str(),
                session.kind.to_string(),
                session.phase,
                session.status.to_string(),
                session.is_active,
                to_i64(session.scope.lines),
                to_i64(session.scope.tests),
                to_i64(session.scope.docs),
                to_i64(session.context_budget),
                to_i64(session.context_used),
                session.continuing_from.as_ref().map(|id| id.as_str()),
                to_i64(session.metrics.lines_written),
                to_i64(session.metrics.tests_written),
                to_i64(session.metrics.docs_written),
                session.metrics.velocity_score,
                ts(&session.started_at),
                ts(&session.updated_at),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(conn), fields(session_id = %id))]
    pub fn find(conn: &Connection, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"))?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    pub fn get(conn: &Connection, id: &SessionId) -> Result<Session, StoreError> {
        Self::find(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    /// The most recently started session still flagged active.
    pub fn active(conn: &Connection) -> Result<Option<Session>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sessions WHERE is_active = 1
             ORDER BY started_at DESC, rowid DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    /// Sessions newest first, optionally restricted to one project name.
    #[instrument(skip(conn))]
    pub fn list(
        conn: &Connection,
        project: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Session>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sessions
             WHERE (?1 IS NULL OR project = ?1)
             ORDER BY started_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let mut rows = stmt.query(params![project, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_session(row)?);
        }
        Ok(out)
    }

    pub fn list_for_project(
        conn: &Connection,
        project_id: &ProjectId,
    ) -> Result<Vec<Session>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sessions WHERE project_id = ?1 ORDER BY started_at ASC, rowid ASC"
        ))?;
        let mut rows = stmt.query([project_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_session(row)?);
        }
        Ok(out)
    }

    #[instrument(skip(conn), fields(session_id = %id, status = %status))]
    pub fn update_status(
        conn: &Connection,
        id: &SessionId,
        status: SessionStatus,
        is_active: bool,
    ) -> Result<(), StoreError> {
        let changed = conn.execute(
            "UPDATE sessions SET status = ?1, is_active = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.to_string(), is_active, ts(&Utc::now()), id.as_str()],
        )?;
        expect_one(changed, id)
    }

    /// Write new metrics (velocity included) and status together.
    #[instrument(skip(conn, metrics), fields(session_id = %id, status = %status))]
    pub fn update_progress(
        conn: &Connection,
        id: &SessionId,
        metrics: &SessionMetrics,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let changed = conn.execute(
            "UPDATE sessions SET lines_written = ?1, tests_written = ?2, docs_written = ?3,
                velocity_score = ?4, status = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                to_i64(metrics.lines_written),
                to_i64(metrics.tests_written),
                to_i64(metrics.docs_written),
                metrics.velocity_score,
                status.to_string(),
                ts(&Utc::now()),
                id.as_str(),
            ],
        )?;
        expect_one(changed, id)
    }

    /// Apply a signed delta to `context_used`. Optionally moves the phase label
    /// and status in the same statement.
    #[instrument(skip(conn), fields(session_id = %id))]
    pub fn apply_usage(
        conn: &Connection,
        id: &SessionId,
        delta: i64,
        phase: Option<&str>,
        status: Option<SessionStatus>,
    ) -> Result<(), StoreError> {
        let changed = conn.execute(
            "UPDATE sessions SET context_used = MAX(context_used + ?1, 0),
                phase = COALESCE(?2, phase),
                status = COALESCE(?3, status),
                updated_at = ?4
             WHERE id = ?5",
            params![
                delta,
                phase,
                status.map(|s| s.to_string()),
                ts(&Utc::now()),
                id.as_str(),
            ],
        )?;
        expect_one(changed, id)
    }
}

fn expect_one(changed: usize, id: &SessionId) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound(format!("session {id}")));
    }
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    const T: &str = "sessions";
    let kind: String = row_helpers::get(row, 3, T, "kind")?;
    let status: String = row_helpers::get(row, 5, T, "status")?;
    let started_at: String = row_helpers::get(row, 17, T, "started_at")?;
    let updated_at: String = row_helpers::get(row, 18, T, "updated_at")?;

    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        project: row_helpers::get(row, 1, T, "project")?,
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 2, T, "project_id")?),
        kind: row_helpers::parse_enum(&kind, T, "kind")?,
        phase: row_helpers::get(row, 4, T, "phase")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        is_active: row_helpers::get(row, 6, T, "is_active")?,
        scope: EstimatedScope {
            lines: row_helpers::get_u64(row, 7, T, "scope_lines")?,
            tests: row_helpers::get_u64(row, 8, T, "scope_tests")?,
            docs: row_helpers::get_u64(row, 9, T, "scope_docs")?,
        },
        context_budget: row_helpers::get_u64(row, 10, T, "context_budget")?,
        context_used: row_helpers::get_u64(row, 11, T, "context_used")?,
        continuing_from: row_helpers::get_opt::<String>(row, 12, T, "continuing_from")?
            .map(SessionId::from_raw),
        metrics: SessionMetrics {
            lines_written: row_helpers::get_u64(row, 13, T, "lines_written")?,
            tests_written: row_helpers::get_u64(row, 14, T, "tests_written")?,
            docs_written: row_helpers::get_u64(row, 15, T, "docs_written")?,
            velocity_score: row_helpers::get(row, 16, T, "velocity_score")?,
        },
        started_at: row_helpers::parse_time(&started_at, T, "started_at")?,
        updated_at: row_helpers::parse_time(&updated_at, T, "updated_at")?,
    })
}

/// Whether a row exists, without decoding it.
pub fn exists(conn: &Connection, id: &SessionId) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?1", [id.as_str()], |_| Ok(()))
        .optional()?
        .is_some())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn insert_and_get() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let s = fixtures::session(conn, "alpha", 100_000);
            let fetched = SessionRepo::get(conn, &s.id)?;
            assert_eq!(fetched.id, s.id);
            assert_eq!(fetched.scope.lines, 1000);
            assert_eq!(fetched.status, SessionStatus::Active);
            assert!(fetched.is_active);
            assert!(exists(conn, &s.id)?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn get_missing_is_not_found() {
        let db = Database::in_memory().unwrap();
        let err = db
            .with_conn(|conn| SessionRepo::get(conn, &SessionId::from_raw("sess_nope")))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn usage_delta_never_goes_negative() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let s = fixtures::session(conn, "alpha", 100_000);
            SessionRepo::apply_usage(conn, &s.id, 500, Some("test"), None)?;
            SessionRepo::apply_usage(conn, &s.id, -200, None, Some(SessionStatus::Checkpoint))?;
            let fetched = SessionRepo::get(conn, &s.id)?;
            assert_eq!(fetched.context_used, 300);
            assert_eq!(fetched.phase, "test");
            assert_eq!(fetched.status, SessionStatus::Checkpoint);

            SessionRepo::apply_usage(conn, &s.id, -1_000, None, None)?;
            assert_eq!(SessionRepo::get(conn, &s.id)?.context_used, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn active_is_most_recent_flagged() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let first = fixtures::session(conn, "alpha", 1_000);
            let second = fixtures::session(conn, "alpha", 1_000);
            assert_eq!(SessionRepo::active(conn)?.unwrap().id, second.id);

            SessionRepo::update_status(conn, &second.id, SessionStatus::Handoff, false)?;
            assert_eq!(SessionRepo::active(conn)?.unwrap().id, first.id);
            Ok(())
        })
        .unwrap();
    }
}
