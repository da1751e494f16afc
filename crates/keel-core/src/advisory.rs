use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DecisionId, SessionId, SymbolId};

/// Audit-trail entry written by an advisory agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentDecision {
    pub id: DecisionId,
    pub agent: String,
    pub action: String,
    pub session_id: Option<SessionId>,
    pub input: serde_json::Value,
    pub decision: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A decision an agent wants recorded, before it is persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewDecision {
    pub action: String,
    pub session_id: Option<SessionId>,
    pub input: serde_json::Value,
    pub decision: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub id: SymbolId,
    pub project: String,
    pub concept: String,
    pub name: String,
    pub context_type: String,
    pub confidence: f64,
    pub usage_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSeverity {
    Critical,
    Warning,
    Info,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Suggestion {
    pub agent: String,
    pub kind: String,
    pub severity: SuggestionSeverity,
    pub message: String,
    pub action_required: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Ran,
    Skipped,
    Failed,
    TimedOut,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRun {
    pub agent: String,
    pub status: AgentRunStatus,
    pub duration_ms: u64,
    pub suggestions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdvisoryReport {
    pub session_id: Option<SessionId>,
    pub suggestions: Vec<Suggestion>,
    pub agents: Vec<AgentRun>,
    pub tokens_used: u64,
    pub token_ceiling: u64,
    pub truncated: bool,
    pub generated_at: DateTime<Utc>,
}
