use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::instrument;

use keel_core::ids::{SessionId, SnapshotId};
use keel_core::reality::RealitySnapshot;

use crate::error::StoreError;
use crate::row_helpers::{self, ts};

const COLUMNS: &str =
    "id, session_id, kind, focus_areas, confidence, discrepancies, recommendations, checked_at";

/// Reality snapshots are immutable; fixes applied against them are tracked
/// separately in `applied_fixes`.
pub struct RealityRepo;

impl RealityRepo {
    #[instrument(skip(conn, snapshot), fields(snapshot_id = %snapshot.id, session_id = %snapshot.session_id))]
    pub fn insert(conn: &Connection, snapshot: &RealitySnapshot) -> Result<(), StoreError> {
        conn.execute(
            &format!("INSERT INTO reality_snapshots ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                snapshot.id.as_str(),
                snapshot.session_id.as_str(),
                snapshot.kind.to_string(),
                serde_json::to_string(&snapshot.focus_areas)?,
                snapshot.confidence,
                serde_json::to_string(&snapshot.discrepancies)?,
                serde_json::to_string(&snapshot.recommendations)?,
                ts(&snapshot.checked_at),
            ],
        )?;
        Ok(())
    }

    pub fn find(conn: &Connection, id: &SnapshotId) -> Result<Option<RealitySnapshot>, StoreError> {
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM reality_snapshots WHERE id = ?1"))?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_snapshot(row)?)),
            None => Ok(None),
        }
    }

    /// Most recent snapshots first.
    pub fn list(conn: &Connection, session_id: &SessionId, limit: u32) -> Result<Vec<RealitySnapshot>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM reality_snapshots WHERE session_id = ?1
             ORDER BY checked_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let mut rows = stmt.query(params![session_id.as_str(), limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_snapshot(row)?);
        }
        Ok(out)
    }

    /// Most recent snapshot across all sessions.
    pub fn latest(conn: &Connection) -> Result<Option<RealitySnapshot>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM reality_snapshots ORDER BY checked_at DESC, rowid DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_snapshot(row)?)),
            None => Ok(None),
        }
    }

    /// Record the outcome of one fix. A fix can only be recorded once per snapshot.
    #[instrument(skip(conn), fields(snapshot_id = %snapshot_id))]
    pub fn record_fix(
        conn: &Connection,
        snapshot_id: &SnapshotId,
        discrepancy_id: &str,
        outcome: &str,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO applied_fixes (snapshot_id, discrepancy_id, outcome, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![snapshot_id.as_str(), discrepancy_id, outcome, ts(&Utc::now())],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(format!("fix {discrepancy_id} already applied"))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    pub fn applied_fixes(conn: &Connection, snapshot_id: &SnapshotId) -> Result<HashSet<String>, StoreError> {
        let mut stmt =
            conn.prepare("SELECT discrepancy_id FROM applied_fixes WHERE snapshot_id = ?1")?;
        let rows = stmt.query_map([snapshot_id.as_str()], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> Result<RealitySnapshot, StoreError> {
    const T: &str = "reality_snapshots";
    let kind: String = row_helpers::get(row, 2, T, "kind")?;
    let focus: String = row_helpers::get(row, 3, T, "focus_areas")?;
    let discrepancies: String = row_helpers::get(row, 5, T, "discrepancies")?;
    let recommendations: String = row_helpers::get(row, 6, T, "recommendations")?;
    let checked_at: String = row_helpers::get(row, 7, T, "checked_at")?;
    Ok(RealitySnapshot {
        id: SnapshotId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        kind: row_helpers::parse_enum(&kind, T, "kind")?,
        focus_areas: row_helpers::parse_json(&focus, T, "focus_areas")?,
        confidence: row_helpers::get(row, 4, T, "confidence")?,
        discrepancies: row_helpers::parse_json(&discrepancies, T, "discrepancies")?,
        recommendations: row_helpers::parse_json(&recommendations, T, "recommendations")?,
        checked_at: row_helpers::parse_time(&checked_at, T, "checked_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::sessions::fixtures;
    use keel_core::reality::{CheckKind, Discrepancy, DiscrepancyType, FixAction, FocusArea, Severity};

    fn snapshot(session_id: &SessionId) -> RealitySnapshot {
        RealitySnapshot {
            id: SnapshotId::new(),
            session_id: session_id.clone(),
            checked_at: Utc::now(),
            kind: CheckKind::Quick,
            focus_areas: vec![FocusArea::Files, FocusArea::Tests],
            confidence: 0.8,
            discrepancies: vec![Discrepancy {
                id: "d1".into(),
                kind: DiscrepancyType::FileMismatch,
                severity: Severity::Critical,
                description: "src/lib.rs is missing".into(),
                fix: Some(FixAction::RestoreFile {
                    path: "src/lib.rs".into(),
                }),
                auto_fixable: false,
            }],
            recommendations: vec!["restore src/lib.rs".into()],
        }
    }

    #[test]
    fn snapshot_round_trips_with_fix_descriptor() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let s = fixtures::session(conn, "alpha", 1_000);
            let snap = snapshot(&s.id);
            RealityRepo::insert(conn, &snap)?;
            let loaded = RealityRepo::find(conn, &snap.id)?.unwrap();
            assert_eq!(loaded.kind, CheckKind::Quick);
            assert_eq!(loaded.focus_areas, vec![FocusArea::Files, FocusArea::Tests]);
            assert_eq!(
                loaded.discrepancy("d1").unwrap().fix,
                Some(FixAction::RestoreFile {
                    path: "src/lib.rs".into()
                })
            );
            assert_eq!(RealityRepo::latest(conn)?.unwrap().id, snap.id);
            assert_eq!(RealityRepo::list(conn, &s.id, 5)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn fix_recorded_once() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let s = fixtures::session(conn, "alpha", 1_000);
            let snap = snapshot(&s.id);
            RealityRepo::insert(conn, &snap)?;
            RealityRepo::record_fix(conn, &snap.id, "d1", "applied")?;
            let again = RealityRepo::record_fix(conn, &snap.id, "d1", "applied");
            assert!(matches!(again, Err(StoreError::Conflict(_))));
            assert!(RealityRepo::applied_fixes(conn, &snap.id)?.contains("d1"));
            Ok(())
        })
        .unwrap();
    }
}
