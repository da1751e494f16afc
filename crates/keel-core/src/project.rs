use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BlockerId, DocumentationId, ProjectId, SessionId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub session_count: u64,
    pub total_lines: u64,
    pub average_velocity: f64,
    pub completion_rate: f64,
    pub common_blockers: Vec<BlockerCount>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockerCount {
    pub kind: BlockerKind,
    pub count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerKind {
    Technical,
    Context,
    External,
    UnclearRequirement,
}

impl std::fmt::Display for BlockerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Technical => write!(f, "technical"),
            Self::Context => write!(f, "context"),
            Self::External => write!(f, "external"),
            Self::UnclearRequirement => write!(f, "unclear_requirement"),
        }
    }
}

impl std::str::FromStr for BlockerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "technical" => Ok(Self::Technical),
            "context" => Ok(Self::Context),
            "external" => Ok(Self::External),
            "unclear_requirement" => Ok(Self::UnclearRequirement),
            other => Err(format!("unknown blocker type: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Blocker {
    pub id: BlockerId,
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub kind: BlockerKind,
    pub description: String,
    pub impact: f64,
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Blocker {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Velocity of one session, for the `project.velocity` feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VelocityPoint {
    pub session_id: SessionId,
    pub velocity_score: f64,
    pub lines_written: u64,
    pub context_used: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Documentation {
    pub id: DocumentationId,
    pub session_id: Option<SessionId>,
    pub project_id: ProjectId,
    pub path: String,
    pub doc_type: String,
    pub updated_at: DateTime<Utc>,
}
