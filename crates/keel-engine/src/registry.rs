use std::collections::HashMap;
use std::sync::Arc;

use keel_core::tools::{Tool, ToolDefinition};
use keel_core::Topic;

/// Registry of the tools hub clients may execute.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Topics the named tool re-broadcasts after a successful run.
    pub fn affected_topics(&self, name: &str) -> Vec<Topic> {
        self.tools
            .get(name)
            .map(|t| t.affected_topics().to_vec())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_core::KeelError;

    struct DummyTool {
        name: String,
        topics: Vec<Topic>,
    }

    impl DummyTool {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                topics: vec![Topic::SessionStatus],
            }
        }
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A dummy tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        fn affected_topics(&self) -> &[Topic] {
            &self.topics
        }
        async fn execute(&self, _params: serde_json::Value) -> Result<serde_json::Value, KeelError> {
            Ok(serde_json::json!("ok"))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("start_session")));

        assert!(registry.contains("start_session"));
        assert!(!registry.contains("complete_session"));
        assert_eq!(registry.count(), 1);
        assert!(registry.get("start_session").is_some());
        assert_eq!(registry.affected_topics("start_session"), vec![Topic::SessionStatus]);
        assert!(registry.affected_topics("missing").is_empty());
    }

    #[test]
    fn names_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("reality_check")));
        registry.register(Arc::new(DummyTool::new("apply_fixes")));
        registry.register(Arc::new(DummyTool::new("list_sessions")));

        assert_eq!(registry.names(), vec!["apply_fixes", "list_sessions", "reality_check"]);
    }

    #[test]
    fn definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool::new("b")));
        registry.register(Arc::new(DummyTool::new("a")));
        registry.register(Arc::new(DummyTool::new("a")));

        let defs = registry.definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "a");
        assert_eq!(defs[1].affected_topics, vec![Topic::SessionStatus]);
    }
}
