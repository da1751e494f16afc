use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use keel_core::tools::{parse_params, Tool};
use keel_core::{KeelError, Topic};

use crate::project::{ProjectManager, ReportBlocker, ResolveBlocker, TrackDocumentation};

pub struct ReportBlockerTool {
    projects: Arc<ProjectManager>,
}

impl ReportBlockerTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl Tool for ReportBlockerTool {
    fn name(&self) -> &str {
        "report_blocker"
    }

    fn description(&self) -> &str {
        "Record something that is holding the session up"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "type", "description"],
            "properties": {
                "session_id": { "type": "string" },
                "type": { "type": "string", "enum": ["technical", "context", "external", "unclear_requirement"] },
                "description": { "type": "string" },
                "impact": { "type": "number", "minimum": 0, "maximum": 1 }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::ProjectStatus]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: ReportBlocker = parse_params(params)?;
        Ok(json!(self.projects.report_blocker(req)?))
    }
}

pub struct ResolveBlockerTool {
    projects: Arc<ProjectManager>,
}

impl ResolveBlockerTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl Tool for ResolveBlockerTool {
    fn name(&self) -> &str {
        "resolve_blocker"
    }

    fn description(&self) -> &str {
        "Close an open blocker with its resolution"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["blocker_id", "resolution"],
            "properties": {
                "blocker_id": { "type": "string" },
                "resolution": { "type": "string" }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::ProjectStatus]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: ResolveBlocker = parse_params(params)?;
        Ok(json!(self.projects.resolve_blocker(req)?))
    }
}

#[derive(Debug, Deserialize)]
struct ProjectParams {
    project: String,
}

pub struct GetProjectStatusTool {
    projects: Arc<ProjectManager>,
}

impl GetProjectStatusTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl Tool for GetProjectStatusTool {
    fn name(&self) -> &str {
        "get_project_status"
    }

    fn description(&self) -> &str {
        "Project aggregates, open blockers, velocity and tracked documents"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["project"],
            "properties": { "project": { "type": "string" } }
        })
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: ProjectParams = parse_params(params)?;
        Ok(json!(self.projects.get_project_status(&p.project)?))
    }
}

pub struct TrackDocumentationTool {
    projects: Arc<ProjectManager>,
}

impl TrackDocumentationTool {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl Tool for TrackDocumentationTool {
    fn name(&self) -> &str {
        "track_documentation"
    }

    fn description(&self) -> &str {
        "Track a documentation file written during the session"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "path"],
            "properties": {
                "session_id": { "type": "string" },
                "path": { "type": "string", "description": "Path relative to the workspace root" },
                "doc_type": { "type": "string" }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::DocumentationStatus]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: TrackDocumentation = parse_params(params)?;
        Ok(json!(self.projects.track_documentation(req)?))
    }
}
