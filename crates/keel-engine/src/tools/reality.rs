use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use keel_core::ids::SessionId;
use keel_core::tools::{parse_params, Tool};
use keel_core::{KeelError, Topic};

use crate::reality::{ApplyFixes, RealityCheck, RealityChecker};

pub struct RealityCheckTool {
    reality: Arc<RealityChecker>,
}

impl RealityCheckTool {
    pub fn new(reality: Arc<RealityChecker>) -> Self {
        Self { reality }
    }
}

#[async_trait]
impl Tool for RealityCheckTool {
    fn name(&self) -> &str {
        "reality_check"
    }

    fn description(&self) -> &str {
        "Compare the session's claims with the workspace and score the gaps"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id"],
            "properties": {
                "session_id": { "type": "string" },
                "kind": { "type": "string", "enum": ["comprehensive", "quick", "specific"] },
                "focus_areas": {
                    "type": "array",
                    "items": { "type": "string", "enum": ["files", "tests", "documentation", "metrics"] }
                }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::RealityChecks]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: RealityCheck = parse_params(params)?;
        Ok(json!(self.reality.perform_check(req).await?))
    }
}

#[derive(Debug, Deserialize)]
struct ValidateParams {
    session_id: SessionId,
    reported: BTreeMap<String, f64>,
}

pub struct ValidateMetricsTool {
    reality: Arc<RealityChecker>,
}

impl ValidateMetricsTool {
    pub fn new(reality: Arc<RealityChecker>) -> Self {
        Self { reality }
    }
}

#[async_trait]
impl Tool for ValidateMetricsTool {
    fn name(&self) -> &str {
        "validate_metrics"
    }

    fn description(&self) -> &str {
        "Check reported numbers against what the workspace shows"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "reported"],
            "properties": {
                "session_id": { "type": "string" },
                "reported": {
                    "type": "object",
                    "additionalProperties": { "type": "number" },
                    "description": "lines_written, tests_written, files_created, checkpoints, tokens_used"
                }
            }
        })
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let p: ValidateParams = parse_params(params)?;
        let metrics = self.reality.validate_metrics(&p.session_id, p.reported).await?;
        Ok(json!({ "metrics": metrics }))
    }
}

pub struct ApplyFixesTool {
    reality: Arc<RealityChecker>,
}

impl ApplyFixesTool {
    pub fn new(reality: Arc<RealityChecker>) -> Self {
        Self { reality }
    }
}

#[async_trait]
impl Tool for ApplyFixesTool {
    fn name(&self) -> &str {
        "apply_fixes"
    }

    fn description(&self) -> &str {
        "Apply auto-fixable fixes from a reality check snapshot"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["snapshot_id", "fix_ids"],
            "properties": {
                "snapshot_id": { "type": "string" },
                "fix_ids": { "type": "array", "items": { "type": "string" } },
                "auto_commit": { "type": "boolean", "description": "Allow commit_changes fixes" }
            }
        })
    }

    fn affected_topics(&self) -> &[Topic] {
        &[Topic::RealityChecks, Topic::SessionStatus, Topic::DocumentationStatus]
    }

    async fn execute(&self, params: Value) -> Result<Value, KeelError> {
        let req: ApplyFixes = parse_params(params)?;
        Ok(json!(self.reality.apply_fixes(req).await?))
    }
}
