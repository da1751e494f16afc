use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UsageId};

/// One ledger entry. Negative `tokens` are reclamations written by optimization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextUsageRecord {
    pub id: UsageId,
    pub session_id: SessionId,
    pub phase: String,
    pub tokens: i64,
    pub operation: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageTrend {
    Stable,
    Increasing,
    Critical,
}

impl std::fmt::Display for UsageTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Increasing => write!(f, "increasing"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseUsage {
    pub phase: String,
    pub tokens: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextStatus {
    pub session_id: SessionId,
    pub used_tokens: u64,
    pub total_tokens: u64,
    pub remaining_tokens: u64,
    pub usage_percent: f64,
    pub phase_breakdown: Vec<PhaseUsage>,
    pub trend: UsageTrend,
    pub burn_rate_per_minute: f64,
    pub minutes_to_exhaustion: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannedTask {
    pub name: String,
    pub estimated_tokens: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prediction {
    pub session_id: SessionId,
    pub remaining_capacity: u64,
    pub safety_reserve: u64,
    pub feasible_tasks: Vec<PlannedTask>,
    pub deferred_tasks: Vec<PlannedTask>,
    pub projected_usage_percent: f64,
    pub recommend_checkpoint: bool,
    pub optimization_suggestions: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppliedStrategy {
    pub name: String,
    pub risk: RiskLevel,
    pub tokens_saved: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub session_id: SessionId,
    pub strategies_applied: Vec<AppliedStrategy>,
    pub blocked_strategies: Vec<String>,
    pub tokens_saved: u64,
    pub target_met: bool,
    pub new_capacity: u64,
    pub side_effects: Vec<String>,
}
