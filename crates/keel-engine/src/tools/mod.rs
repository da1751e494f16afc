pub mod advisory;
pub mod context;
pub mod project;
pub mod reality;
pub mod session;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use keel_core::ids::SessionId;

use crate::advisory::AdvisoryOrchestrator;
use crate::context::ContextMonitor;
use crate::project::ProjectManager;
use crate::reality::RealityChecker;
use crate::registry::ToolRegistry;
use crate::session::SessionManager;

/// Params of tools that only name a session.
#[derive(Debug, Deserialize)]
pub(crate) struct SessionRef {
    pub session_id: SessionId,
}

pub(crate) fn session_ref_schema() -> Value {
    json!({
        "type": "object",
        "required": ["session_id"],
        "properties": { "session_id": { "type": "string" } }
    })
}

/// Create a ToolRegistry with every built-in tool bound to its manager.
pub fn create_default_registry(
    sessions: Arc<SessionManager>,
    context: Arc<ContextMonitor>,
    reality: Arc<RealityChecker>,
    projects: Arc<ProjectManager>,
    advisory: Arc<AdvisoryOrchestrator>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // Session lifecycle
    registry.register(Arc::new(session::StartSessionTool::new(sessions.clone())));
    registry.register(Arc::new(session::CreateCheckpointTool::new(sessions.clone())));
    registry.register(Arc::new(session::CreateHandoffTool::new(
        sessions.clone(),
        advisory.clone(),
    )));
    registry.register(Arc::new(session::CompleteSessionTool::new(
        sessions.clone(),
        advisory.clone(),
    )));
    registry.register(Arc::new(session::ResumeSessionTool::new(sessions.clone())));
    registry.register(Arc::new(session::GetSessionStatusTool::new(sessions.clone())));
    registry.register(Arc::new(session::ListSessionsTool::new(sessions)));

    // Context budget
    registry.register(Arc::new(context::TrackContextUsageTool::new(context.clone())));
    registry.register(Arc::new(context::GetContextStatusTool::new(context.clone())));
    registry.register(Arc::new(context::PredictContextTool::new(context.clone())));
    registry.register(Arc::new(context::OptimizeContextTool::new(context)));

    // Reality checks
    registry.register(Arc::new(reality::RealityCheckTool::new(reality.clone())));
    registry.register(Arc::new(reality::ValidateMetricsTool::new(reality.clone())));
    registry.register(Arc::new(reality::ApplyFixesTool::new(reality)));

    // Project tracking
    registry.register(Arc::new(project::ReportBlockerTool::new(projects.clone())));
    registry.register(Arc::new(project::ResolveBlockerTool::new(projects.clone())));
    registry.register(Arc::new(project::GetProjectStatusTool::new(projects.clone())));
    registry.register(Arc::new(project::TrackDocumentationTool::new(projects)));

    // Advisory
    registry.register(Arc::new(advisory::RegisterSymbolTool::new(advisory.clone())));
    registry.register(Arc::new(advisory::RunAdvisoryTool::new(advisory)));

    registry
}
