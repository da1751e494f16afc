use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::instrument;

use keel_core::ids::{BlockerId, ProjectId, SessionId};
use keel_core::project::Blocker;

use crate::error::StoreError;
use crate::row_helpers::{self, ts};

const COLUMNS: &str =
    "id, session_id, project_id, kind, description, impact, resolution, resolved_at, created_at";

/// Blockers are opened by report and closed by resolve; rows are never deleted.
pub struct BlockerRepo;

impl BlockerRepo {
    #[instrument(skip(conn, blocker), fields(session_id = %blocker.session_id, kind = %blocker.kind))]
    pub fn insert(conn: &Connection, blocker: &Blocker) -> Result<(), StoreError> {
        conn.execute(
            &format!("INSERT INTO blockers ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                blocker.id.as_str(),
                blocker.session_id.as_str(),
                blocker.project_id.as_str(),
                blocker.kind.to_string(),
                blocker.description,
                blocker.impact,
                blocker.resolution,
                blocker.resolved_at.as_ref().map(ts),
                ts(&blocker.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &BlockerId) -> Result<Blocker, StoreError> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM blockers WHERE id = ?1"))?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => row_to_blocker(row),
            None => Err(StoreError::NotFound(format!("blocker {id}"))),
        }
    }

    /// Close an open blocker. Resolving twice is a conflict.
    #[instrument(skip(conn, resolution), fields(blocker_id = %id))]
    pub fn resolve(
        conn: &Connection,
        id: &BlockerId,
        resolution: &str,
        at: DateTime<Utc>,
    ) -> Result<Blocker, StoreError> {
        let changed = conn.execute(
            "UPDATE blockers SET resolution = ?1, resolved_at = ?2
             WHERE id = ?3 AND resolved_at IS NULL",
            params![resolution, ts(&at), id.as_str()],
        )?;
        if changed == 0 {
            let existing = Self::get(conn, id)?;
            return Err(StoreError::Conflict(format!(
                "blocker {} already resolved at {}",
                existing.id,
                existing.resolved_at.map(|t| ts(&t)).unwrap_or_default()
            )));
        }
        Self::get(conn, id)
    }

    pub fn list_for_project(
        conn: &Connection,
        project_id: &ProjectId,
        open_only: bool,
    ) -> Result<Vec<Blocker>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM blockers
             WHERE project_id = ?1 AND (?2 = 0 OR resolved_at IS NULL)
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let mut rows = stmt.query(params![project_id.as_str(), open_only])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_blocker(row)?);
        }
        Ok(out)
    }
}

fn row_to_blocker(row: &rusqlite::Row<'_>) -> Result<Blocker, StoreError> {
    const T: &str = "blockers";
    let kind: String = row_helpers::get(row, 3, T, "kind")?;
    let created_at: String = row_helpers::get(row, 8, T, "created_at")?;
    Ok(Blocker {
        id: BlockerId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 2, T, "project_id")?),
        kind: row_helpers::parse_enum(&kind, T, "kind")?,
        description: row_helpers::get(row, 4, T, "description")?,
        impact: row_helpers::get(row, 5, T, "impact")?,
        resolution: row_helpers::get_opt(row, 6, T, "resolution")?,
        resolved_at: row_helpers::parse_time_opt(row_helpers::get_opt(row, 7, T, "resolved_at")?, T, "resolved_at")?,
        created_at: row_helpers::parse_time(&created_at, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::sessions::fixtures;
    use keel_core::project::BlockerKind;

    #[test]
    fn resolve_once() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let s = fixtures::session(conn, "alpha", 1_000);
            let b = Blocker {
                id: BlockerId::new(),
                session_id: s.id.clone(),
                project_id: s.project_id.clone(),
                kind: BlockerKind::UnclearRequirement,
                description: "which API?".into(),
                impact: 0.8,
                resolution: None,
                resolved_at: None,
                created_at: Utc::now(),
            };
            BlockerRepo::insert(conn, &b)?;
            assert_eq!(BlockerRepo::list_for_project(conn, &s.project_id, true)?.len(), 1);

            let resolved = BlockerRepo::resolve(conn, &b.id, "use v2", Utc::now())?;
            assert!(!resolved.is_open());
            assert_eq!(resolved.resolution.as_deref(), Some("use v2"));
            assert!(BlockerRepo::list_for_project(conn, &s.project_id, true)?.is_empty());

            let again = BlockerRepo::resolve(conn, &b.id, "again", Utc::now());
            assert!(matches!(again, Err(StoreError::Conflict(_))));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn resolve_unknown_is_not_found() {
        let db = Database::in_memory().unwrap();
        let err = db
            .with_conn(|conn| BlockerRepo::resolve(conn, &BlockerId::from_raw("blk_x"), "r", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
