use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, SnapshotId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Comprehensive,
    Quick,
    Specific,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Comprehensive => write!(f, "comprehensive"),
            Self::Quick => write!(f, "quick"),
            Self::Specific => write!(f, "specific"),
        }
    }
}

impl std::str::FromStr for CheckKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "comprehensive" => Ok(Self::Comprehensive),
            "quick" => Ok(Self::Quick),
            "specific" => Ok(Self::Specific),
            other => Err(format!("unknown check kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusArea {
    Files,
    Tests,
    Documentation,
    Metrics,
}

impl FocusArea {
    pub const ALL: [FocusArea; 4] = [
        FocusArea::Files,
        FocusArea::Tests,
        FocusArea::Documentation,
        FocusArea::Metrics,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyType {
    FileMismatch,
    TestFailure,
    DocumentationGap,
    StateDrift,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

/// Concrete remediation attached to a discrepancy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FixAction {
    SyncMetrics { lines_written: u64, tests_written: u64 },
    RegisterDocumentation { paths: Vec<String> },
    CommitChanges { paths: Vec<String> },
    RestoreFile { path: String },
    FixTests { failed: u64 },
}

impl FixAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncMetrics { .. } => "sync_metrics",
            Self::RegisterDocumentation { .. } => "register_documentation",
            Self::CommitChanges { .. } => "commit_changes",
            Self::RestoreFile { .. } => "restore_file",
            Self::FixTests { .. } => "fix_tests",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DiscrepancyType,
    pub severity: Severity,
    pub description: String,
    pub fix: Option<FixAction>,
    pub auto_fixable: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealitySnapshot {
    pub id: SnapshotId,
    pub session_id: SessionId,
    pub checked_at: DateTime<Utc>,
    pub kind: CheckKind,
    pub focus_areas: Vec<FocusArea>,
    pub confidence: f64,
    pub discrepancies: Vec<Discrepancy>,
    pub recommendations: Vec<String>,
}

impl RealitySnapshot {
    pub fn discrepancy(&self, id: &str) -> Option<&Discrepancy> {
        self.discrepancies.iter().find(|d| d.id == id)
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.discrepancies
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Accurate,
    MinorVariance,
    MajorVariance,
    Unverifiable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatedMetric {
    pub name: String,
    pub reported: f64,
    pub actual: Option<f64>,
    pub variance: Option<f64>,
    pub status: MetricStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailedFix {
    pub id: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FixReport {
    pub applied: Vec<String>,
    pub failed: Vec<FailedFix>,
    pub side_effects: Vec<String>,
}
