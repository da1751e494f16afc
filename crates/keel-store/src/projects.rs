use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::instrument;

use keel_core::ids::{ProjectId, SessionId};
use keel_core::project::{BlockerCount, BlockerKind, Project, VelocityPoint};

use crate::error::StoreError;
use crate::row_helpers::{self, ts};

const COLUMNS: &str = "id, name, session_count, total_lines, average_velocity, completion_rate,
    common_blockers, created_at, updated_at";

/// How many blocker kinds a project summary keeps.
const TOP_BLOCKERS: u32 = 3;

pub struct ProjectRepo;

impl ProjectRepo {
    /// Find a project by its unique name, creating an empty one if absent.
    #[instrument(skip(conn))]
    pub fn get_or_create(conn: &Connection, name: &str) -> Result<Project, StoreError> {
        if let Some(existing) = Self::find_by_name(conn, name)? {
            return Ok(existing);
        }

        let now = Utc::now();
        let project = Project {
            id: ProjectId::new(),
            name: name.to_string(),
            session_count: 0,
            total_lines: 0,
            average_velocity: 0.0,
            completion_rate: 0.0,
            common_blockers: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO projects (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![project.id.as_str(), name, ts(&now), ts(&now)],
        )?;
        Ok(project)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Project>, StoreError> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM projects WHERE name = ?1"))?;
        let mut rows = stmt.query([name])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_project(row)?)),
            None => Ok(None),
        }
    }

    pub fn get(conn: &Connection, id: &ProjectId) -> Result<Project, StoreError> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM projects WHERE id = ?1"))?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => row_to_project(row),
            None => Err(StoreError::NotFound(format!("project {id}"))),
        }
    }

    /// Recompute the aggregate columns from sessions and blockers.
    #[instrument(skip(conn), fields(project_id = %id))]
    pub fn refresh(conn: &Connection, id: &ProjectId) -> Result<Project, StoreError> {
        let (count, lines, velocity, completed): (i64, i64, Option<f64>, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(lines_written), 0),
                    AVG(CASE WHEN context_used > 0 THEN velocity_score END),
                    COALESCE(SUM(CASE WHEN status = 'complete' THEN 1 ELSE 0 END), 0)
             FROM sessions WHERE project_id = ?1",
            [id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let common = Self::blocker_counts(conn, id)?;
        let completion_rate = if count > 0 {
            completed as f64 / count as f64
        } else {
            0.0
        };
        let average_velocity = (velocity.unwrap_or(0.0) * 100.0).round() / 100.0;

        let changed = conn.execute(
            "UPDATE projects SET session_count = ?1, total_lines = ?2, average_velocity = ?3,
                completion_rate = ?4, common_blockers = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                count,
                lines,
                average_velocity,
                completion_rate,
                serde_json::to_string(&common)?,
                ts(&Utc::now()),
                id.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("project {id}")));
        }
        Self::get(conn, id)
    }

    fn blocker_counts(conn: &Connection, id: &ProjectId) -> Result<Vec<BlockerCount>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) AS n FROM blockers WHERE project_id = ?1
             GROUP BY kind ORDER BY n DESC, kind ASC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![id.as_str(), TOP_BLOCKERS])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row_helpers::get(row, 0, "blockers", "kind")?;
            out.push(BlockerCount {
                kind: row_helpers::parse_enum::<BlockerKind>(&kind, "blockers", "kind")?,
                count: row_helpers::get_u64(row, 1, "blockers", "kind")?,
            });
        }
        Ok(out)
    }

    /// Per-session velocity, oldest first, for the velocity feed.
    pub fn velocity(conn: &Connection, id: &ProjectId, limit: u32) -> Result<Vec<VelocityPoint>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, velocity_score, lines_written, context_used, started_at FROM (
                SELECT id, velocity_score, lines_written, context_used, started_at, rowid AS r
                FROM sessions WHERE project_id = ?1
                ORDER BY started_at DESC, r DESC LIMIT ?2
             ) ORDER BY started_at ASC, r ASC",
        )?;
        let mut rows = stmt.query(params![id.as_str(), limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            const T: &str = "sessions";
            let started: String = row_helpers::get(row, 4, T, "started_at")?;
            out.push(VelocityPoint {
                session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
                velocity_score: row_helpers::get(row, 1, T, "velocity_score")?,
                lines_written: row_helpers::get_u64(row, 2, T, "lines_written")?,
                context_used: row_helpers::get_u64(row, 3, T, "context_used")?,
                started_at: row_helpers::parse_time(&started, T, "started_at")?,
            });
        }
        Ok(out)
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> Result<Project, StoreError> {
    const T: &str = "projects";
    let blockers: String = row_helpers::get(row, 6, T, "common_blockers")?;
    let created_at: String = row_helpers::get(row, 7, T, "created_at")?;
    let updated_at: String = row_helpers::get(row, 8, T, "updated_at")?;
    Ok(Project {
        id: ProjectId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        name: row_helpers::get(row, 1, T, "name")?,
        session_count: row_helpers::get_u64(row, 2, T, "session_count")?,
        total_lines: row_helpers::get_u64(row, 3, T, "total_lines")?,
        average_velocity: row_helpers::get(row, 4, T, "average_velocity")?,
        completion_rate: row_helpers::get(row, 5, T, "completion_rate")?,
        common_blockers: row_helpers::parse_json(&blockers, T, "common_blockers")?,
        created_at: row_helpers::parse_time(&created_at, T, "created_at")?,
        updated_at: row_helpers::parse_time(&updated_at, T, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockers::BlockerRepo;
    use crate::database::Database;
    use crate::sessions::{fixtures, SessionRepo};
    use keel_core::ids::BlockerId;
    use keel_core::project::Blocker;
    use keel_core::session::{SessionMetrics, SessionStatus};

    #[test]
    fn get_or_create_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let a = ProjectRepo::get_or_create(conn, "alpha")?;
            let b = ProjectRepo::get_or_create(conn, "alpha")?;
            assert_eq!(a.id, b.id);
            assert!(ProjectRepo::find_by_name(conn, "beta")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn refresh_aggregates_sessions_and_blockers() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let s1 = fixtures::session(conn, "alpha", 100_000);
            let s2 = fixtures::session(conn, "alpha", 100_000);
            SessionRepo::apply_usage(conn, &s1.id, 10_000, None, None)?;
            SessionRepo::update_progress(
                conn,
                &s1.id,
                &SessionMetrics {
                    lines_written: 200,
                    ..Default::default()
                }
                .with_velocity(10_000),
                SessionStatus::Checkpoint,
            )?;
            SessionRepo::update_status(conn, &s2.id, SessionStatus::Complete, false)?;

            for kind in [BlockerKind::Technical, BlockerKind::Technical, BlockerKind::External] {
                BlockerRepo::insert(
                    conn,
                    &Blocker {
                        id: BlockerId::new(),
                        session_id: s1.id.clone(),
                        project_id: s1.project_id.clone(),
                        kind,
                        description: "stuck".into(),
                        impact: 0.5,
                        resolution: None,
                        resolved_at: None,
                        created_at: Utc::now(),
                    },
                )?;
            }

            let p = ProjectRepo::refresh(conn, &s1.project_id)?;
            assert_eq!(p.session_count, 2);
            assert_eq!(p.total_lines, 200);
            assert_eq!(p.average_velocity, 20.0);
            assert_eq!(p.completion_rate, 0.5);
            assert_eq!(p.common_blockers[0].kind, BlockerKind::Technical);
            assert_eq!(p.common_blockers[0].count, 2);

            let points = ProjectRepo::velocity(conn, &s1.project_id, 10)?;
            assert_eq!(points.len(), 2);
            assert_eq!(points[0].session_id, s1.id);
            Ok(())
        })
        .unwrap();
    }
}
