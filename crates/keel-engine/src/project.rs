//! Project aggregates, blockers and tracked documentation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, instrument};

use keel_core::ids::{BlockerId, DocumentationId, ProjectId, SessionId};
use keel_core::project::{Blocker, BlockerKind, Documentation, Project, VelocityPoint};
use keel_core::{KeelError, StateEvent};
use keel_store::{BlockerRepo, Database, DocumentRepo, ProjectRepo, StoreError};

use crate::reality::doc_type_for;
use crate::session::VELOCITY_WINDOW;
use crate::{load_session, publish, EVENT_CHANNEL_CAPACITY};

const DEFAULT_IMPACT: f64 = 0.5;

#[derive(Clone, Debug, Deserialize)]
pub struct ReportBlocker {
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub kind: BlockerKind,
    pub description: String,
    #[serde(default)]
    pub impact: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResolveBlocker {
    pub blocker_id: BlockerId,
    pub resolution: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TrackDocumentation {
    pub session_id: SessionId,
    pub path: String,
    #[serde(default)]
    pub doc_type: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProjectStatusReport {
    pub project: Project,
    pub open_blockers: Vec<Blocker>,
    pub velocity: Vec<VelocityPoint>,
    pub documents: Vec<Documentation>,
}

pub struct ProjectManager {
    db: Database,
    events: broadcast::Sender<StateEvent>,
}

impl ProjectManager {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { db, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn get_project_status(&self, name: &str) -> Result<ProjectStatusReport, KeelError> {
        self.db
            .with_conn(|conn| {
                let Some(project) = ProjectRepo::find_by_name(conn, name)? else {
                    return Ok(None);
                };
                Ok(Some(ProjectStatusReport {
                    open_blockers: BlockerRepo::list_for_project(conn, &project.id, true)?,
                    velocity: ProjectRepo::velocity(conn, &project.id, VELOCITY_WINDOW)?,
                    documents: DocumentRepo::list_for_project(conn, &project.id)?,
                    project,
                }))
            })?
            .ok_or_else(|| KeelError::ProjectNotFound(name.to_string()))
    }

    #[instrument(skip(self, req), fields(session_id = %req.session_id, kind = %req.kind))]
    pub fn report_blocker(&self, req: ReportBlocker) -> Result<Blocker, KeelError> {
        let description = req.description.trim();
        if description.is_empty() {
            return Err(KeelError::invalid("description must not be empty"));
        }
        let impact = req.impact.unwrap_or(DEFAULT_IMPACT);
        if !(0.0..=1.0).contains(&impact) {
            return Err(KeelError::invalid("impact must be between 0 and 1"));
        }
        let session = load_session(&self.db, &req.session_id)?;

        let blocker = Blocker {
            id: BlockerId::new(),
            session_id: session.id.clone(),
            project_id: session.project_id.clone(),
            kind: req.kind,
            description: description.to_string(),
            impact,
            resolution: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        let project = self.db.with_tx(|conn| {
            BlockerRepo::insert(conn, &blocker)?;
            ProjectRepo::refresh(conn, &session.project_id)
        })?;

        info!(blocker_id = %blocker.id, impact, "blocker reported");
        publish(&self.events, StateEvent::ProjectUpdated(Box::new(project)));
        Ok(blocker)
    }

    #[instrument(skip(self, req), fields(blocker_id = %req.blocker_id))]
    pub fn resolve_blocker(&self, req: ResolveBlocker) -> Result<Blocker, KeelError> {
        let resolution = req.resolution.trim();
        if resolution.is_empty() {
            return Err(KeelError::invalid("resolution must not be empty"));
        }

        let (blocker, project) = self
            .db
            .with_tx(|conn| {
                let blocker = BlockerRepo::resolve(conn, &req.blocker_id, resolution, Utc::now())?;
                let project = ProjectRepo::refresh(conn, &blocker.project_id)?;
                Ok((blocker, project))
            })
            .map_err(|e| match e {
                StoreError::NotFound(what) => KeelError::invalid(format!("unknown {what}")),
                StoreError::Conflict(msg) => KeelError::invalid(msg),
                other => other.into(),
            })?;

        info!("blocker resolved");
        publish(&self.events, StateEvent::ProjectUpdated(Box::new(project)));
        Ok(blocker)
    }

    #[instrument(skip(self, req), fields(session_id = %req.session_id, path = %req.path))]
    pub fn track_documentation(&self, req: TrackDocumentation) -> Result<Documentation, KeelError> {
        let path = req.path.trim().trim_start_matches("./");
        if path.is_empty() {
            return Err(KeelError::invalid("path must not be empty"));
        }
        let session = load_session(&self.db, &req.session_id)?;
        let doc_type = req
            .doc_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| doc_type_for(path));

        let (doc, documents) = self.db.with_tx(|conn| {
            let doc = DocumentRepo::upsert(
                conn,
                &Documentation {
                    id: DocumentationId::new(),
                    session_id: Some(session.id.clone()),
                    project_id: session.project_id.clone(),
                    path: path.to_string(),
                    doc_type,
                    updated_at: Utc::now(),
                },
            )?;
            Ok((doc, DocumentRepo::list_for_project(conn, &session.project_id)?))
        })?;

        publish(
            &self.events,
            StateEvent::DocumentationChanged {
                project_id: session.project_id,
                documents,
            },
        );
        Ok(doc)
    }

    pub fn documents(&self, project_id: &ProjectId) -> Result<Vec<Documentation>, KeelError> {
        Ok(self
            .db
            .with_conn(|conn| DocumentRepo::list_for_project(conn, project_id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ScopeInput, SessionManager, StartSession};
    use keel_core::session::{Session, SessionKind};
    use keel_settings::SessionSettings;

    fn setup() -> (ProjectManager, SessionManager, Session) {
        let db = Database::in_memory().unwrap();
        let sessions = SessionManager::new(db.clone(), SessionSettings::default());
        let session = sessions
            .start_session(StartSession {
                project: "alpha".into(),
                kind: SessionKind::Feature,
                scope: ScopeInput { lines: 800, tests: 5, docs: 1 },
                budget: Some(50_000),
                phase: None,
                continuing_from: None,
            })
            .unwrap()
            .session;
        (ProjectManager::new(db), sessions, session)
    }

    fn blocker(session: &Session, kind: BlockerKind) -> ReportBlocker {
        ReportBlocker {
            session_id: session.id.clone(),
            kind,
            description: "flaky CI runner".into(),
            impact: None,
        }
    }

    #[test]
    fn unknown_project_is_not_found() {
        let (projects, _, _) = setup();
        let err = projects.get_project_status("nope").unwrap_err();
        assert_eq!(err.error_code(), "PROJECT_NOT_FOUND");
    }

    #[test]
    fn blockers_feed_project_status() {
        let (projects, _, session) = setup();
        let mut rx = projects.subscribe();

        let first = projects.report_blocker(blocker(&session, BlockerKind::External)).unwrap();
        assert_eq!(first.impact, DEFAULT_IMPACT);
        projects.report_blocker(blocker(&session, BlockerKind::External)).unwrap();
        projects.report_blocker(blocker(&session, BlockerKind::Technical)).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), StateEvent::ProjectUpdated(_)));

        let status = projects.get_project_status("alpha").unwrap();
        assert_eq!(status.open_blockers.len(), 3);
        assert_eq!(status.project.common_blockers[0].kind, BlockerKind::External);
        assert_eq!(status.project.common_blockers[0].count, 2);

        let resolved = projects
            .resolve_blocker(ResolveBlocker {
                blocker_id: first.id.clone(),
                resolution: "pinned runner image".into(),
            })
            .unwrap();
        assert!(!resolved.is_open());
        assert_eq!(projects.get_project_status("alpha").unwrap().open_blockers.len(), 2);
    }

    #[test]
    fn resolving_twice_or_unknown_is_invalid() {
        let (projects, _, session) = setup();
        let b = projects.report_blocker(blocker(&session, BlockerKind::Context)).unwrap();
        let resolve = |id: &BlockerId| {
            projects.resolve_blocker(ResolveBlocker {
                blocker_id: id.clone(),
                resolution: "done".into(),
            })
        };
        resolve(&b.id).unwrap();
        assert_eq!(resolve(&b.id).unwrap_err().error_code(), "INVALID_PARAMETERS");
        assert_eq!(
            resolve(&BlockerId::from_raw("blk_missing")).unwrap_err().error_code(),
            "INVALID_PARAMETERS"
        );
    }

    #[test]
    fn blocker_validation() {
        let (projects, _, session) = setup();
        let mut req = blocker(&session, BlockerKind::Technical);
        req.impact = Some(1.5);
        assert!(projects.report_blocker(req).is_err());

        let mut req = blocker(&session, BlockerKind::Technical);
        req.description = "   ".into();
        assert!(projects.report_blocker(req).is_err());

        let mut req = blocker(&session, BlockerKind::Technical);
        req.session_id = SessionId::from_raw("sess_missing");
        assert_eq!(projects.report_blocker(req).unwrap_err().error_code(), "SESSION_NOT_FOUND");
    }

    #[test]
    fn blocker_params_use_type_field() {
        let req: ReportBlocker = serde_json::from_value(serde_json::json!({
            "session_id": "sess_x",
            "type": "unclear_requirement",
            "description": "which API version?"
        }))
        .unwrap();
        assert_eq!(req.kind, BlockerKind::UnclearRequirement);
        assert!(req.impact.is_none());
    }

    #[test]
    fn documentation_is_upserted_by_path() {
        let (projects, _, session) = setup();
        let mut rx = projects.subscribe();
        let track = |path: &str, doc_type: Option<&str>| {
            projects
                .track_documentation(TrackDocumentation {
                    session_id: session.id.clone(),
                    path: path.into(),
                    doc_type: doc_type.map(String::from),
                })
                .unwrap()
        };

        let readme = track("./README.md", None);
        assert_eq!(readme.path, "README.md");
        assert_eq!(readme.doc_type, "readme");
        track("README.md", Some("overview"));
        track("docs/api/routes.md", None);

        let docs = projects.documents(&session.project_id).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs.iter().find(|d| d.path == "README.md").unwrap().doc_type, "overview");
        match rx.try_recv().unwrap() {
            StateEvent::DocumentationChanged { documents, .. } => assert_eq!(documents.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
