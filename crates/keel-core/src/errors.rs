/// Typed error hierarchy shared by the managers and the tool boundary.
/// Every variant carries a human-readable remediation via [`KeelError::suggestion`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum KeelError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("context budget exhausted: {used} of {total} tokens used")]
    ContextExhausted { used: u64, total: u64 },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("database error: {message}")]
    Database { message: String },

    #[error("tool '{tool}' failed: {source}")]
    ToolExecution {
        tool: String,
        #[source]
        source: Box<KeelError>,
    },
}

impl KeelError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database {
            message: msg.into(),
        }
    }

    /// Wrap a handler failure with the name of the tool that produced it.
    /// Already-wrapped errors are not wrapped twice.
    pub fn in_tool(self, tool: &str) -> Self {
        match self {
            Self::ToolExecution { .. } => self,
            other => Self::ToolExecution {
                tool: tool.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, unwrapping tool execution layers.
    pub fn root(&self) -> &KeelError {
        match self {
            Self::ToolExecution { source, .. } => source.root(),
            other => other,
        }
    }

    /// Wire-level error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            Self::ContextExhausted { .. } => "CONTEXT_EXHAUSTED",
            Self::InvalidParameters(_) => "INVALID_PARAMETERS",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::ToolExecution { .. } => "TOOL_EXECUTION_ERROR",
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            Self::SessionNotFound(_) => {
                "Check the session id, or start a new session with start_session".into()
            }
            Self::ProjectNotFound(_) => {
                "Projects are created by start_session; check the project name".into()
            }
            Self::ContextExhausted { .. } => {
                "Create a handoff and continue in a new session, or run optimize_context".into()
            }
            Self::InvalidParameters(_) => {
                "Check the tool's input schema for required fields and types".into()
            }
            Self::Database { message } => database_hint(message).into(),
            Self::ToolExecution { source, .. } => source.suggestion(),
        }
    }
}

/// Remediation hint keyed off the underlying storage message.
fn database_hint(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("locked") || lower.contains("busy") {
        "The database is locked by another writer; retry shortly"
    } else if lower.contains("no such table") || lower.contains("no such column") {
        "The schema is missing or outdated; restart keel so migrations run"
    } else if lower.contains("constraint") {
        "A uniqueness or reference constraint failed; check ids and names"
    } else if lower.contains("unable to open") || lower.contains("permission") {
        "Check that the database path exists and is writable"
    } else {
        "Check the database file and its permissions"
    }
}
