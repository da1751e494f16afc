use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::KeelError;
use crate::events::Topic;

/// Tool definition advertised to hub clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub affected_topics: Vec<Topic>,
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Topics whose current value must be re-broadcast after a successful run.
    fn affected_topics(&self) -> &[Topic] {
        &[]
    }

    async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value, KeelError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
            affected_topics: self.affected_topics().to_vec(),
        }
    }
}

/// Deserialize tool params into their typed struct.
///
/// A missing params object is treated as `{}` so tools with all-optional
/// params accept a bare call.
pub fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, KeelError> {
    let params = if params.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| KeelError::invalid(e.to_string()))
}
