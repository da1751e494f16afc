use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::advisory::AdvisoryReport;
use crate::context::ContextStatus;
use crate::ids::{ProjectId, SnapshotId};
use crate::project::{Documentation, Project, VelocityPoint};
use crate::reality::{FixReport, RealitySnapshot};
use crate::session::{Session, SessionStatus};

/// Named channels observers subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "session.status")]
    SessionStatus,
    #[serde(rename = "context.status")]
    ContextStatus,
    #[serde(rename = "reality.checks")]
    RealityChecks,
    #[serde(rename = "project.status")]
    ProjectStatus,
    #[serde(rename = "project.velocity")]
    ProjectVelocity,
    #[serde(rename = "documentation.status")]
    DocumentationStatus,
    #[serde(rename = "tool:execution")]
    ToolExecution,
    #[serde(rename = "advisory.suggestions")]
    AdvisorySuggestions,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::SessionStatus,
        Topic::ContextStatus,
        Topic::RealityChecks,
        Topic::ProjectStatus,
        Topic::ProjectVelocity,
        Topic::DocumentationStatus,
        Topic::ToolExecution,
        Topic::AdvisorySuggestions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStatus => "session.status",
            Self::ContextStatus => "context.status",
            Self::RealityChecks => "reality.checks",
            Self::ProjectStatus => "project.status",
            Self::ProjectVelocity => "project.velocity",
            Self::DocumentationStatus => "documentation.status",
            Self::ToolExecution => "tool:execution",
            Self::AdvisorySuggestions => "advisory.suggestions",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown topic: {s}"))
    }
}

/// State changes published by the managers.
///
/// Each variant maps onto exactly one [`Topic`]; the hub forwards
/// [`StateEvent::payload`] as the event's `data`.
#[derive(Clone, Debug)]
pub enum StateEvent {
    SessionStatusChanged {
        session: Option<Box<Session>>,
        previous: Option<SessionStatus>,
        warning: Option<String>,
    },
    ContextStatusChanged(Box<ContextStatus>),
    RealityCheckCompleted(Box<RealitySnapshot>),
    FixesApplied {
        snapshot_id: SnapshotId,
        report: FixReport,
    },
    ProjectUpdated(Box<Project>),
    VelocityRecorded {
        project: String,
        points: Vec<VelocityPoint>,
    },
    DocumentationChanged {
        project_id: ProjectId,
        documents: Vec<Documentation>,
    },
    ToolExecuted {
        tool: String,
        request_id: Option<String>,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
    },
    AdvisorySuggestions(Box<AdvisoryReport>),
}

impl StateEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::SessionStatusChanged { .. } => Topic::SessionStatus,
            Self::ContextStatusChanged(_) => Topic::ContextStatus,
            Self::RealityCheckCompleted(_) | Self::FixesApplied { .. } => Topic::RealityChecks,
            Self::ProjectUpdated(_) => Topic::ProjectStatus,
            Self::VelocityRecorded { .. } => Topic::ProjectVelocity,
            Self::DocumentationChanged { .. } => Topic::DocumentationStatus,
            Self::ToolExecuted { .. } => Topic::ToolExecution,
            Self::AdvisorySuggestions(_) => Topic::AdvisorySuggestions,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::SessionStatusChanged {
                session,
                previous,
                warning,
            } => {
                let mut data = json!({ "session": session });
                if let Some(prev) = previous {
                    data["previousStatus"] = json!(prev);
                }
                if let Some(w) = warning {
                    data["warning"] = json!(w);
                }
                data
            }
            Self::ContextStatusChanged(status) => json!(status),
            Self::RealityCheckCompleted(snapshot) => json!({ "snapshot": snapshot }),
            Self::FixesApplied {
                snapshot_id,
                report,
            } => json!({ "snapshotId": snapshot_id, "fixes": report }),
            Self::ProjectUpdated(project) => json!({ "project": project }),
            Self::VelocityRecorded { project, points } => {
                json!({ "project": project, "sessions": points })
            }
            Self::DocumentationChanged {
                project_id,
                documents,
            } => json!({ "projectId": project_id, "documents": documents }),
            Self::ToolExecuted {
                tool,
                request_id,
                success,
                duration_ms,
                error,
            } => {
                let mut data = json!({
                    "tool": tool,
                    "requestId": request_id,
                    "success": success,
                    "durationMs": duration_ms,
                });
                if let Some(e) = error {
                    data["error"] = json!(e);
                }
                data
            }
            Self::AdvisorySuggestions(report) => json!(report),
        }
    }
}
