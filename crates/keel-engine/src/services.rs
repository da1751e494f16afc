//! Explicitly constructed set of managers sharing one database.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use keel_core::StateEvent;
use keel_settings::KeelSettings;
use keel_store::Database;

use crate::advisory::AdvisoryOrchestrator;
use crate::context::ContextMonitor;
use crate::project::ProjectManager;
use crate::reality::{FsProbe, RealityChecker, WorkspaceProbe};
use crate::registry::ToolRegistry;
use crate::session::SessionManager;
use crate::tools::create_default_registry;

pub struct Services {
    pub db: Database,
    pub settings: Arc<KeelSettings>,
    pub sessions: Arc<SessionManager>,
    pub context: Arc<ContextMonitor>,
    pub reality: Arc<RealityChecker>,
    pub projects: Arc<ProjectManager>,
    pub advisory: Arc<AdvisoryOrchestrator>,
    pub registry: ToolRegistry,
}

impl Services {
    /// Managers observing the configured workspace on the local filesystem.
    pub fn new(db: Database, settings: KeelSettings) -> Self {
        let probe = FsProbe::new(
            settings.reality.workspace_root(),
            settings.reality.test_command.clone(),
        );
        info!(workspace = %probe.root().display(), "observing workspace");
        Self::with_probe(db, settings, Arc::new(probe))
    }

    pub fn with_probe(db: Database, settings: KeelSettings, probe: Arc<dyn WorkspaceProbe>) -> Self {
        let sessions = Arc::new(SessionManager::new(db.clone(), settings.session.clone()));
        let context = Arc::new(ContextMonitor::new(db.clone()));
        let reality = Arc::new(RealityChecker::new(db.clone(), probe));
        let projects = Arc::new(ProjectManager::new(db.clone()));
        let advisory = Arc::new(AdvisoryOrchestrator::new(
            db.clone(),
            &settings.advisory,
            settings.session.default_budget,
        ));
        let registry = create_default_registry(
            sessions.clone(),
            context.clone(),
            reality.clone(),
            projects.clone(),
            advisory.clone(),
        );

        Self {
            db,
            settings: Arc::new(settings),
            sessions,
            context,
            reality,
            projects,
            advisory,
            registry,
        }
    }

    /// One receiver per manager channel.
    pub fn subscribe_all(&self) -> Vec<(&'static str, broadcast::Receiver<StateEvent>)> {
        vec![
            ("sessions", self.sessions.subscribe()),
            ("context", self.context.subscribe()),
            ("reality", self.reality.subscribe()),
            ("projects", self.projects.subscribe()),
            ("advisory", self.advisory.subscribe()),
        ]
    }
}
