use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use keel_core::ids::SessionId;
use keel_core::tools::{parse_params, Tool};
use keel_core::{KeelError, Topic};

use super::SessionRef;
use crate::advisory::AdvisoryOrchestrator;
use crate::session::{CreateCheckpoint, SessionManager, StartSession};

const DEFAULT_LIST_LIMIT: u32 = 20;
const MAX_LIST_LIMIT: u32 = 200;

pub struct StartSessionTool {
    sessions: Arc<SessionManager>,
}

impl StartSessionTool {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for StartSessionTool {
    fn name(&self) -> &str {
        "start_session"
    }

    fn description(&self) -> &str {
        "Start a bounded work session with an estimated scope and a context budget"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["project", "kind", "scope"],
            "properties": {
                "project": { "type": "string", "description": "Project name; created on first use" },
                "kind": { "type": "string", "enum": ["feature", "bugfix", "refactor", "documentation"] },
                "scope": {
                    "type": "object",
                    "required": ["lines"],
                    "properties": {
                        "lines": { "type": "integer", "minimum": 1 },
                        "tests": { "type": "integer", "minimum": 0 },
                        "docs": { "type": "integer", "minimum": 0 }
                    }
                },
                "budget": { "type": "integer", "minimum": 1, "description": "Context budget in tokens" },
                "phase": { "type": "string" },
                "continuing_from": { "type": "string", "description": "Session this one continues" }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::SessionStatus, Topic::ContextStatus, Topic::ProjectStatus]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: StartSession = parse_params(params)?;
        Ok(json!(self.sessions.start_session(req)?))
    }
}

pub struct CreateCheckpointTool {
    sessions: Arc<SessionManager>,
}

impl CreateCheckpointTool {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for CreateCheckpointTool {
    fn name(&self) -> &str {
        "create_checkpoint"
    }

    fn description(&self) -> &str {
        "Record a numbered progress checkpoint with cumulative metrics"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id"],
            "properties": {
                "session_id": { "type": "string" },
                "completed_components": { "type": "array", "items": { "type": "string" } },
                "metrics": {
                    "type": "object",
                    "properties": {
                        "lines_written": { "type": "integer", "minimum": 0 },
                        "tests_written": { "type": "integer", "minimum": 0 },
                        "docs_written": { "type": "integer", "minimum": 0 }
                    }
                },
                "message": { "type": "string" },
                "force": { "type": "boolean", "description": "Checkpoint even without new progress" }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::SessionStatus, Topic::ProjectStatus, Topic::ProjectVelocity]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: CreateCheckpoint = parse_params(params)?;
        Ok(json!(self.sessions.create_checkpoint(req)?))
    }
}

#[derive(Debug, Deserialize)]
struct HandoffParams {
    session_id: SessionId,
    #[serde(default)]
    next_goals: Option<Vec<String>>,
}

pub struct CreateHandoffTool {
    sessions: Arc<SessionManager>,
    advisory: Arc<AdvisoryOrchestrator>,
}

impl CreateHandoffTool {
    pub fn new(sessions: Arc<SessionManager>, advisory: Arc<AdvisoryOrchestrator>) -> Self {
        Self { sessions, advisory }
    }
}

#[async_trait]
impl Tool for CreateHandoffTool {
    fn name(&self) -> &str {
        "create_handoff"
    }

    fn description(&self) -> &str {
        "End the session and produce a continuation document for a successor"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id"],
            "properties": {
                "session_id": { "type": "string" },
                "next_goals": { "type": "array", "items": { "type": "string" } }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::SessionStatus, Topic::ProjectStatus]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: HandoffParams = parse_params(params)?;
        let handoff = self.sessions.create_handoff(&p.session_id, p.next_goals)?;
        self.advisory.session_closed(&p.session_id);
        Ok(json!(handoff))
    }
}

pub struct CompleteSessionTool {
    sessions: Arc<SessionManager>,
    advisory: Arc<AdvisoryOrchestrator>,
}

impl CompleteSessionTool {
    pub fn new(sessions: Arc<SessionManager>, advisory: Arc<AdvisoryOrchestrator>) -> Self {
        Self { sessions, advisory }
    }
}

#[async_trait]
impl Tool for CompleteSessionTool {
    fn name(&self) -> &str {
        "complete_session"
    }

    fn description(&self) -> &str {
        "Mark a session complete"
    }

    fn parameters_schema(&self) -> Value {
        super::session_ref_schema()
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::SessionStatus, Topic::ProjectStatus, Topic::ProjectVelocity]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: SessionRef = parse_params(params)?;
        let completed = self.sessions.complete_session(&p.session_id)?;
        self.advisory.session_closed(&p.session_id);
        Ok(json!(completed))
    }
}

pub struct ResumeSessionTool {
    sessions: Arc<SessionManager>,
}

impl ResumeSessionTool {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for ResumeSessionTool {
    fn name(&self) -> &str {
        "resume_session"
    }

    fn description(&self) -> &str {
        "Return a checkpointed session to active work"
    }

    fn parameters_schema(&self) -> Value {
        super::session_ref_schema()
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::SessionStatus]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: SessionRef = parse_params(params)?;
        Ok(json!(self.sessions.resume_session(&p.session_id)?))
    }
}

pub struct GetSessionStatusTool {
    sessions: Arc<SessionManager>,
}

impl GetSessionStatusTool {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for GetSessionStatusTool {
    fn name(&self) -> &str {
        "get_session_status"
    }

    fn description(&self) -> &str {
        "Session state, checkpoints and the next planned checkpoint"
    }

    fn parameters_schema(&self) -> Value {
        super::session_ref_schema()
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: SessionRef = parse_params(params)?;
        Ok(json!(self.sessions.get_session_status(&p.session_id)?))
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

pub struct ListSessionsTool {
    sessions: Arc<SessionManager>,
}

impl ListSessionsTool {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for ListSessionsTool {
    fn name(&self) -> &str {
        "list_sessions"
    }

    fn description(&self) -> &str {
        "Most recent sessions, optionally for one project"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "project": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "maximum": MAX_LIST_LIMIT }
            }
        })
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: ListParams = parse_params(params)?;
        let limit = p.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let sessions = self.sessions.list_sessions(p.project.as_deref(), limit)?;
        Ok(json!({ "sessions": sessions }))
    }
}
