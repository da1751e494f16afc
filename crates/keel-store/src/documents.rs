use rusqlite::{params, Connection};
use tracing::instrument;

use keel_core::ids::{DocumentationId, ProjectId, SessionId};
use keel_core::project::Documentation;

use crate::error::StoreError;
use crate::row_helpers::{self, ts};

/// Tracked documentation files, unique per `(project, path)`.
pub struct DocumentRepo;

impl DocumentRepo {
    /// Insert or refresh a tracked document. Re-tracking an existing path
    /// bumps its timestamp and keeps the original id.
    #[instrument(skip(conn, doc), fields(path = %doc.path))]
    pub fn upsert(conn: &Connection, doc: &Documentation) -> Result<Documentation, StoreError> {
        conn.execute(
            "INSERT INTO documentations (id, session_id, project_id, path, doc_type, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (project_id, path) DO UPDATE SET
                session_id = COALESCE(excluded.session_id, session_id),
                doc_type = excluded.doc_type,
                updated_at = excluded.updated_at",
            params![
                doc.id.as_str(),
                doc.session_id.as_ref().map(|s| s.as_str()),
                doc.project_id.as_str(),
                doc.path,
                doc.doc_type,
                ts(&doc.updated_at),
            ],
        )?;
        Self::find(conn, &doc.project_id, &doc.path)?
            .ok_or_else(|| StoreError::NotFound(format!("documentation {}", doc.path)))
    }

    pub fn find(
        conn: &Connection,
        project_id: &ProjectId,
        path: &str,
    ) -> Result<Option<Documentation>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, session_id, project_id, path, doc_type, updated_at
             FROM documentations WHERE project_id = ?1 AND path = ?2",
        )?;
        let mut rows = stmt.query(params![project_id.as_str(), path])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_doc(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_for_project(conn: &Connection, project_id: &ProjectId) -> Result<Vec<Documentation>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, session_id, project_id, path, doc_type, updated_at
             FROM documentations WHERE project_id = ?1 ORDER BY path ASC",
        )?;
        let mut rows = stmt.query([project_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_doc(row)?);
        }
        Ok(out)
    }

    pub fn count_for_session(conn: &Connection, session_id: &SessionId) -> Result<u64, StoreError> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documentations WHERE session_id = ?1",
            [session_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

fn row_to_doc(row: &rusqlite::Row<'_>) -> Result<Documentation, StoreError> {
    const T: &str = "documentations";
    let updated_at: String = row_helpers::get(row, 5, T, "updated_at")?;
    Ok(Documentation {
        id: DocumentationId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        session_id: row_helpers::get_opt::<String>(row, 1, T, "session_id")?.map(SessionId::from_raw),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 2, T, "project_id")?),
        path: row_helpers::get(row, 3, T, "path")?,
        doc_type: row_helpers::get(row, 4, T, "doc_type")?,
        updated_at: row_helpers::parse_time(&updated_at, T, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::sessions::fixtures;
    use chrono::Utc;

    #[test]
    fn upsert_keeps_id_per_path() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            let s = fixtures::session(conn, "alpha", 1_000);
            let first = DocumentRepo::upsert(
                conn,
                &Documentation {
                    id: DocumentationId::new(),
                    session_id: Some(s.id.clone()),
                    project_id: s.project_id.clone(),
                    path: "docs/api.md".into(),
                    doc_type: "reference".into(),
                    updated_at: Utc::now(),
                },
            )?;
            let second = DocumentRepo::upsert(
                conn,
                &Documentation {
                    id: DocumentationId::new(),
                    session_id: None,
                    project_id: s.project_id.clone(),
                    path: "docs/api.md".into(),
                    doc_type: "guide".into(),
                    updated_at: Utc::now(),
                },
            )?;
            assert_eq!(first.id, second.id);
            assert_eq!(second.doc_type, "guide");
            assert_eq!(second.session_id, Some(s.id.clone()));
            assert_eq!(DocumentRepo::list_for_project(conn, &s.project_id)?.len(), 1);
            assert_eq!(DocumentRepo::count_for_session(conn, &s.id)?, 1);
            Ok(())
        })
        .unwrap();
    }
}
