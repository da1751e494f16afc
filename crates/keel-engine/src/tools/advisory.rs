use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use keel_core::ids::SessionId;
use keel_core::tools::{parse_params, Tool};
use keel_core::{KeelError, Topic};

use crate::advisory::{AdvisoryOrchestrator, RegisterSymbol};

pub struct RegisterSymbolTool {
    advisory: Arc<AdvisoryOrchestrator>,
}

impl RegisterSymbolTool {
    pub fn new(advisory: Arc<AdvisoryOrchestrator>) -> Self {
        Self { advisory }
    }
}

#[async_trait]
impl Tool for RegisterSymbolTool {
    fn name(&self) -> &str {
        "register_symbol"
    }

    fn description(&self) -> &str {
        "Record the name used for a concept so naming drift can be flagged"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["project", "concept", "name"],
            "properties": {
                "project": { "type": "string" },
                "concept": { "type": "string" },
                "name": { "type": "string" },
                "context_type": { "type": "string", "description": "variable, function, type, ..." },
                "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
            }
        })
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: RegisterSymbol = parse_params(params)?;
        Ok(json!(self.advisory.register_symbol(req)?))
    }
}

#[derive(Debug, Deserialize)]
struct RunParams {
    #[serde(default)]
    session_id: Option<SessionId>,
}

pub struct RunAdvisoryTool {
    advisory: Arc<AdvisoryOrchestrator>,
}

impl RunAdvisoryTool {
    pub fn new(advisory: Arc<AdvisoryOrchestrator>) -> Self {
        Self { advisory }
    }
}

#[async_trait]
impl Tool for RunAdvisoryTool {
    fn name(&self) -> &str {
        "run_advisory"
    }

    fn description(&self) -> &str {
        "Run the advisory agents for a session (defaults to the active one)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "session_id": { "type": "string" } }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::AdvisorySuggestions]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: RunParams = parse_params(params)?;
        Ok(json!(self.advisory.run(p.session_id.as_ref()).await?))
    }
}
