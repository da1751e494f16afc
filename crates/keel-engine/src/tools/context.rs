use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use keel_core::context::PlannedTask;
use keel_core::ids::SessionId;
use keel_core::tools::{parse_params, Tool};
use keel_core::{KeelError, Topic};

use super::SessionRef;
use crate::context::{ContextMonitor, OptimizeContext, TrackUsage};

pub struct TrackContextUsageTool {
    context: Arc<ContextMonitor>,
}

impl TrackContextUsageTool {
    pub fn new(context: Arc<ContextMonitor>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Tool for TrackContextUsageTool {
    fn name(&self) -> &str {
        "track_context_usage"
    }

    fn description(&self) -> &str {
        "Record tokens consumed by an operation against the session budget"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "phase", "tokens", "operation"],
            "properties": {
                "session_id": { "type": "string" },
                "phase": { "type": "string" },
                "tokens": { "type": "integer", "minimum": 1 },
                "operation": { "type": "string" }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::ContextStatus, Topic::SessionStatus]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: TrackUsage = parse_params(params)?;
        Ok(json!(self.context.track_usage(req)?))
    }
}

pub struct GetContextStatusTool {
    context: Arc<ContextMonitor>,
}

impl GetContextStatusTool {
    pub fn new(context: Arc<ContextMonitor>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Tool for GetContextStatusTool {
    fn name(&self) -> &str {
        "get_context_status"
    }

    fn description(&self) -> &str {
        "Budget usage, phase breakdown, trend and projected exhaustion"
    }

    fn parameters_schema(&self) -> Value {
        super::session_ref_schema()
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: SessionRef = parse_params(params)?;
        Ok(json!(self.context.get_status(&p.session_id)?))
    }
}

#[derive(Debug, Deserialize)]
struct PredictParams {
    session_id: SessionId,
    #[serde(default)]
    planned_tasks: Vec<PlannedTask>,
}

pub struct PredictContextTool {
    context: Arc<ContextMonitor>,
}

impl PredictContextTool {
    pub fn new(context: Arc<ContextMonitor>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Tool for PredictContextTool {
    fn name(&self) -> &str {
        "predict_context"
    }

    fn description(&self) -> &str {
        "Which planned tasks fit in the remaining budget"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "planned_tasks"],
            "properties": {
                "session_id": { "type": "string" },
                "planned_tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name", "estimated_tokens"],
                        "properties": {
                            "name": { "type": "string" },
                            "estimated_tokens": { "type": "integer", "minimum": 0 }
                        }
                    }
                }
            }
        })
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: PredictParams = parse_params(params)?;
        Ok(json!(self.context.predict(&p.session_id, p.planned_tasks)?))
    }
}

pub struct OptimizeContextTool {
    context: Arc<ContextMonitor>,
}

impl OptimizeContextTool {
    pub fn new(context: Arc<ContextMonitor>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Tool for OptimizeContextTool {
    fn name(&self) -> &str {
        "optimize_context"
    }

    fn description(&self) -> &str {
        "Reclaim context with reduction strategies, lowest risk first"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "target_reduction"],
            "properties": {
                "session_id": { "type": "string" },
                "target_reduction": { "type": "integer", "minimum": 1, "description": "Tokens to reclaim" },
                "preserve_functionality": {
                    "type": "boolean",
                    "description": "Block high-risk strategies (default true)"
                }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::ContextStatus]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: OptimizeContext = parse_params(params)?;
        Ok(json!(self.context.optimize(req)?))
    }
}
