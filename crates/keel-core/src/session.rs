use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CheckpointId, ProjectId, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Feature,
    Bugfix,
    Refactor,
    Documentation,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Feature => write!(f, "feature"),
            Self::Bugfix => write!(f, "bugfix"),
            Self::Refactor => write!(f, "refactor"),
            Self::Documentation => write!(f, "documentation"),
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature" => Ok(Self::Feature),
            "bugfix" => Ok(Self::Bugfix),
            "refactor" => Ok(Self::Refactor),
            "documentation" => Ok(Self::Documentation),
            other => Err(format!("unknown session kind: {other}")),
        }
    }
}

/// Lifecycle status.
///
/// `active -> checkpoint -> active` while work continues,
/// `active|checkpoint -> handoff`, and anything but `complete` may complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Checkpoint,
    Handoff,
    Complete,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Active, Checkpoint)
                | (Checkpoint, Checkpoint)
                | (Checkpoint, Active)
                | (Active, Handoff)
                | (Checkpoint, Handoff)
                | (Active, Complete)
                | (Checkpoint, Complete)
                | (Handoff, Complete)
        )
    }

    /// Whether work can still be recorded against the session.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::Checkpoint)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Handoff => write!(f, "handoff"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "checkpoint" => Ok(Self::Checkpoint),
            "handoff" => Ok(Self::Handoff),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Estimated size of the work a session sets out to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatedScope {
    pub lines: u64,
    pub tests: u64,
    pub docs: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub lines_written: u64,
    pub tests_written: u64,
    pub docs_written: u64,
    /// Lines written per thousand tokens consumed.
    pub velocity_score: f64,
}

impl SessionMetrics {
    pub fn with_velocity(mut self, tokens_used: u64) -> Self {
        let kilo_tokens = (tokens_used as f64 / 1000.0).max(1.0);
        self.velocity_score = (self.lines_written as f64 / kilo_tokens * 100.0).round() / 100.0;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub project: String,
    pub project_id: ProjectId,
    pub kind: SessionKind,
    pub started_at: DateTime<Utc>,
    pub scope: EstimatedScope,
    pub phase: String,
    pub status: SessionStatus,
    pub is_active: bool,
    pub context_budget: u64,
    pub context_used: u64,
    pub continuing_from: Option<SessionId>,
    pub metrics: SessionMetrics,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh active session with an empty metric set.
    pub fn begin(
        project: impl Into<String>,
        project_id: ProjectId,
        kind: SessionKind,
        scope: EstimatedScope,
        phase: impl Into<String>,
        budget: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            project: project.into(),
            project_id,
            kind,
            started_at: now,
            scope,
            phase: phase.into(),
            status: SessionStatus::Active,
            is_active: true,
            context_budget: budget,
            context_used: 0,
            continuing_from: None,
            metrics: SessionMetrics::default(),
            updated_at: now,
        }
    }

    pub fn usage_percent(&self) -> f64 {
        usage_percent(self.context_used, self.context_budget)
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.context_budget.saturating_sub(self.context_used)
    }

    pub fn remaining_work(&self) -> RemainingWork {
        RemainingWork {
            lines: self.scope.lines.saturating_sub(self.metrics.lines_written),
            tests: self.scope.tests.saturating_sub(self.metrics.tests_written),
            docs: self.scope.docs.saturating_sub(self.metrics.docs_written),
        }
    }
}

/// Fraction of `total` consumed, clamped to `[0, 1]`.
pub fn usage_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (used as f64 / total as f64).clamp(0.0, 1.0)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingWork {
    pub lines: u64,
    pub tests: u64,
    pub docs: u64,
}

impl RemainingWork {
    pub fn is_empty(&self) -> bool {
        self.lines == 0 && self.tests == 0 && self.docs == 0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub session_id: SessionId,
    pub number: u32,
    pub created_at: DateTime<Utc>,
    pub tokens_used: u64,
    pub completed_components: Vec<String>,
    pub metrics: SessionMetrics,
    pub message: Option<String>,
    pub continuation: Option<ContinuationPlan>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContinuationPlan {
    pub remaining: RemainingWork,
    pub next_checkpoint_at_lines: Option<u64>,
    pub notes: Vec<String>,
}

/// A natural stopping point proposed from the session scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedCheckpoint {
    pub number: u32,
    pub fraction: f64,
    pub target_lines: u64,
    pub target_tokens: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedPhase {
    pub name: String,
    pub token_allocation: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandoffDoc {
    pub session_id: SessionId,
    pub project: String,
    pub kind: SessionKind,
    pub summary: String,
    pub completed_components: Vec<String>,
    pub remaining_work: RemainingWork,
    pub metrics: SessionMetrics,
    pub context_used: u64,
    pub context_budget: u64,
    pub last_checkpoint: Option<u32>,
    pub next_goals: Vec<String>,
    pub recommended_budget: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use SessionStatus::*;
        assert!(Active.can_transition_to(Checkpoint));
        assert!(Checkpoint.can_transition_to(Active));
        assert!(Active.can_transition_to(Handoff));
        assert!(Handoff.can_transition_to(Complete));
        assert!(!Handoff.can_transition_to(Active));
        assert!(!Complete.can_transition_to(Active));
        assert!(!Handoff.can_transition_to(Checkpoint));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in ["active", "checkpoint", "handoff", "complete"] {
            let parsed: SessionStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn velocity_is_lines_per_kilotoken() {
        let m = SessionMetrics {
            lines_written: 300,
            ..Default::default()
        }
        .with_velocity(20_000);
        assert_eq!(m.velocity_score, 15.0);

        // Fewer than 1k tokens counts as 1k.
        let m = SessionMetrics {
            lines_written: 10,
            ..Default::default()
        }
        .with_velocity(10);
        assert_eq!(m.velocity_score, 10.0);
    }

    #[test]
    fn usage_percent_bounds() {
        assert_eq!(usage_percent(0, 100), 0.0);
        assert_eq!(usage_percent(50, 100), 0.5);
        assert_eq!(usage_percent(100, 100), 1.0);
        assert_eq!(usage_percent(5, 0), 1.0);
    }
}
