//! Context budget ledger: usage tracking, status, prediction and optimization.

pub mod strategies;
pub mod trend;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use keel_core::context::{
    AppliedStrategy, ContextStatus, ContextUsageRecord, OptimizationResult, PhaseUsage, PlannedTask,
    Prediction, UsageTrend,
};
use keel_core::ids::{SessionId, UsageId};
use keel_core::session::{usage_percent, Session, SessionStatus};
use keel_core::{KeelError, StateEvent};
use keel_store::{Database, SessionRepo, UsageRepo};

use crate::{load_session, publish, EVENT_CHANNEL_CAPACITY};

/// Share of the budget held back when planning tasks.
pub const SAFETY_RESERVE: f64 = 0.10;
/// Projected usage at which a checkpoint is recommended.
pub const CHECKPOINT_USAGE: f64 = 0.70;

#[derive(Clone, Debug, Deserialize)]
pub struct TrackUsage {
    pub session_id: SessionId,
    pub phase: String,
    pub tokens: i64,
    pub operation: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OptimizeContext {
    pub session_id: SessionId,
    pub target_reduction: u64,
    #[serde(default = "default_preserve")]
    pub preserve_functionality: bool,
}

fn default_preserve() -> bool {
    true
}

/// Build the status view from a session and its ledger.
pub fn status_from(
    session: &Session,
    records: &[ContextUsageRecord],
    phase_breakdown: Vec<PhaseUsage>,
    now: DateTime<Utc>,
) -> ContextStatus {
    let consumption = trend::consumption(records);
    let remaining = session.remaining_tokens();
    let rate = trend::burn_rate(&consumption, now);
    ContextStatus {
        session_id: session.id.clone(),
        used_tokens: session.context_used,
        total_tokens: session.context_budget,
        remaining_tokens: remaining,
        usage_percent: session.usage_percent(),
        phase_breakdown,
        trend: trend::classify(&consumption),
        burn_rate_per_minute: (rate * 10.0).round() / 10.0,
        minutes_to_exhaustion: trend::minutes_to_exhaustion(remaining, rate),
    }
}

/// Current status of a session, read straight from the store.
pub fn load_status(db: &Database, session_id: &SessionId) -> Result<ContextStatus, KeelError> {
    let (session, records, phases) = db.with_conn(|conn| {
        let session = SessionRepo::find(conn, session_id)?;
        let records = UsageRepo::list(conn, session_id)?;
        let phases = UsageRepo::by_phase(conn, session_id)?;
        Ok((session, records, phases))
    })?;
    let session = session.ok_or_else(|| KeelError::SessionNotFound(session_id.to_string()))?;
    Ok(status_from(&session, &records, phases, Utc::now()))
}

pub struct ContextMonitor {
    db: Database,
    events: broadcast::Sender<StateEvent>,
}

impl ContextMonitor {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { db, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Record consumption. Exhaustion rejects the usage without writing it.
    #[instrument(skip(self, req), fields(session_id = %req.session_id, tokens = req.tokens))]
    pub fn track_usage(&self, req: TrackUsage) -> Result<ContextStatus, KeelError> {
        if req.tokens <= 0 {
            return Err(KeelError::invalid("tokens must be greater than 0"));
        }
        if req.phase.trim().is_empty() {
            return Err(KeelError::invalid("phase must not be empty"));
        }
        let session = load_session(&self.db, &req.session_id)?;
        if !session.status.is_open() {
            return Err(KeelError::invalid(format!(
                "session {} is {}; usage can no longer be recorded",
                session.id, session.status
            )));
        }

        let used = session.context_used;
        let total = session.context_budget;
        let tokens = req.tokens as u64;
        if used >= total || used.saturating_add(tokens) > total {
            warn!(used, total, requested = tokens, "context budget exhausted");
            return Err(KeelError::ContextExhausted { used, total });
        }

        let resumes = session.status == SessionStatus::Checkpoint;
        let record = ContextUsageRecord {
            id: UsageId::new(),
            session_id: session.id.clone(),
            phase: req.phase.clone(),
            tokens: req.tokens,
            operation: req.operation,
            recorded_at: Utc::now(),
        };
        self.db.with_tx(|conn| {
            UsageRepo::append(conn, &record)?;
            SessionRepo::apply_usage(
                conn,
                &session.id,
                record.tokens,
                Some(record.phase.as_str()),
                resumes.then_some(SessionStatus::Active),
            )
        })?;

        let status = load_status(&self.db, &session.id)?;
        if resumes {
            let updated = load_session(&self.db, &session.id)?;
            publish(
                &self.events,
                StateEvent::SessionStatusChanged {
                    session: Some(Box::new(updated)),
                    previous: Some(SessionStatus::Checkpoint),
                    warning: None,
                },
            );
        }
        publish(&self.events, StateEvent::ContextStatusChanged(Box::new(status.clone())));
        Ok(status)
    }

    pub fn get_status(&self, session_id: &SessionId) -> Result<ContextStatus, KeelError> {
        load_status(&self.db, session_id)
    }

    /// Which of the planned tasks fit before the safety reserve is reached.
    /// Tasks are taken in order; the first one that does not fit and
    /// everything after it are deferred.
    pub fn predict(&self, session_id: &SessionId, planned: Vec<PlannedTask>) -> Result<Prediction, KeelError> {
        let status = load_status(&self.db, session_id)?;
        let reserve = (status.total_tokens as f64 * SAFETY_RESERVE).round() as u64;
        let usable = status.remaining_tokens.saturating_sub(reserve);

        let mut feasible = Vec::new();
        let mut deferred: Vec<PlannedTask> = Vec::new();
        let mut planned_tokens: u64 = 0;
        for task in planned {
            let next = planned_tokens.saturating_add(task.estimated_tokens);
            if deferred.is_empty() && next <= usable {
                planned_tokens = next;
                feasible.push(task);
            } else {
                deferred.push(task);
            }
        }

        let projected = usage_percent(status.used_tokens + planned_tokens, status.total_tokens);
        let recommend_checkpoint =
            projected >= CHECKPOINT_USAGE || !deferred.is_empty() || status.trend == UsageTrend::Critical;

        Ok(Prediction {
            session_id: status.session_id.clone(),
            remaining_capacity: status.remaining_tokens,
            safety_reserve: reserve,
            optimization_suggestions: suggestions(&status, &deferred, projected),
            feasible_tasks: feasible,
            deferred_tasks: deferred,
            projected_usage_percent: (projected * 1000.0).round() / 1000.0,
            recommend_checkpoint,
        })
    }

    /// Reclaim context by applying strategies from the catalog. Each applied
    /// strategy is written to the ledger as a negative record so the ledger
    /// sum keeps matching the session total.
    #[instrument(skip(self, req), fields(session_id = %req.session_id, target = req.target_reduction))]
    pub fn optimize(&self, req: OptimizeContext) -> Result<OptimizationResult, KeelError> {
        if req.target_reduction == 0 {
            return Err(KeelError::invalid("target_reduction must be greater than 0"));
        }
        let session = load_session(&self.db, &req.session_id)?;
        if !session.status.is_open() {
            return Err(KeelError::invalid(format!(
                "session {} is {}; nothing to optimize",
                session.id, session.status
            )));
        }

        let selection =
            strategies::select(session.context_used, req.target_reduction, req.preserve_functionality);
        let now = Utc::now();
        let records: Vec<ContextUsageRecord> = selection
            .applied
            .iter()
            .map(|(strategy, saved)| ContextUsageRecord {
                id: UsageId::new(),
                session_id: session.id.clone(),
                phase: session.phase.clone(),
                tokens: -(*saved as i64),
                operation: format!("optimize:{}", strategy.name),
                recorded_at: now,
            })
            .collect();

        if !records.is_empty() {
            self.db.with_tx(|conn| {
                for record in &records {
                    UsageRepo::append(conn, record)?;
                }
                SessionRepo::apply_usage(conn, &session.id, -(selection.saved as i64), None, None)
            })?;
        }

        let status = load_status(&self.db, &session.id)?;
        info!(
            saved = selection.saved,
            strategies = selection.applied.len(),
            "context optimized"
        );
        if !records.is_empty() {
            publish(&self.events, StateEvent::ContextStatusChanged(Box::new(status.clone())));
        }

        let mut side_effects: Vec<String> = selection
            .applied
            .iter()
            .map(|(s, _)| s.side_effect.to_string())
            .collect();
        if !selection.target_met(req.target_reduction) {
            side_effects.push(format!(
                "target of {} tokens not reached; {} reclaimed",
                req.target_reduction, selection.saved
            ));
        }

        Ok(OptimizationResult {
            session_id: session.id,
            strategies_applied: selection
                .applied
                .iter()
                .map(|(s, saved)| AppliedStrategy {
                    name: s.name.to_string(),
                    risk: s.risk,
                    tokens_saved: *saved,
                })
                .collect(),
            blocked_strategies: selection.blocked.iter().map(|s| s.to_string()).collect(),
            tokens_saved: selection.saved,
            target_met: selection.target_met(req.target_reduction),
            new_capacity: status.remaining_tokens,
            side_effects,
        })
    }
}

fn suggestions(status: &ContextStatus, deferred: &[PlannedTask], projected: f64) -> Vec<String> {
    let mut out = Vec::new();
    if !deferred.is_empty() {
        let tokens: u64 = deferred.iter().map(|t| t.estimated_tokens).sum();
        out.push(format!(
            "Defer {} task(s) (~{} tokens) to a follow-up session, or reclaim space with optimize_context",
            deferred.len(),
            tokens
        ));
    }
    if projected >= CHECKPOINT_USAGE {
        out.push("Create a checkpoint before starting the next task".to_string());
    }
    if status.trend == UsageTrend::Critical {
        out.push("Recent operations consume context quickly; prefer targeted reads and summarized tool output".to_string());
    }
    if let Some(top) = status.phase_breakdown.first() {
        let share = usage_percent(top.tokens.max(0) as u64, status.used_tokens.max(1));
        if share > 0.5 && status.phase_breakdown.len() > 1 {
            out.push(format!(
                "Phase '{}' holds {:.0}% of used context; summarize it once it is finished",
                top.phase,
                share * 100.0
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::ProjectRepo;
    use keel_core::session::{EstimatedScope, SessionKind};

    fn setup(budget: u64) -> (ContextMonitor, Session) {
        let db = Database::in_memory().unwrap();
        let session = db
            .with_conn(|conn| {
                let project = ProjectRepo::get_or_create(conn, "alpha")?;
                let scope = EstimatedScope {
                    lines: 1000,
                    tests: 10,
                    docs: 1,
                };
                let session = Session::begin("alpha", project.id, SessionKind::Feature, scope, "design", budget);
                SessionRepo::insert(conn, &session)?;
                Ok(session)
            })
            .unwrap();
        (ContextMonitor::new(db), session)
    }

    fn track(monitor: &ContextMonitor, id: &SessionId, phase: &str, tokens: i64) -> Result<ContextStatus, KeelError> {
        monitor.track_usage(TrackUsage {
            session_id: id.clone(),
            phase: phase.into(),
            tokens,
            operation: "read".into(),
        })
    }

    fn ledger_matches(monitor: &ContextMonitor, id: &SessionId) {
        let (sum, used) = monitor
            .db
            .with_conn(|conn| Ok((UsageRepo::sum(conn, id)?, SessionRepo::get(conn, id)?.context_used)))
            .unwrap();
        assert_eq!(sum, used as i64);
    }

    #[test]
    fn two_operations_on_fresh_session() {
        let (monitor, s) = setup(100_000);
        track(&monitor, &s.id, "implement", 1_000).unwrap();
        let status = track(&monitor, &s.id, "implement", 5_000).unwrap();
        assert_eq!(status.used_tokens, 6_000);
        assert_eq!(status.usage_percent, 0.06);
        assert_eq!(status.trend, UsageTrend::Stable);
        assert_eq!(status.remaining_tokens, 94_000);
        assert!(status.minutes_to_exhaustion.is_some());
        ledger_matches(&monitor, &s.id);
    }

    #[test]
    fn tracking_moves_phase_and_breaks_down() {
        let (monitor, s) = setup(100_000);
        track(&monitor, &s.id, "design", 1_000).unwrap();
        let status = track(&monitor, &s.id, "implement", 3_000).unwrap();
        assert_eq!(status.phase_breakdown[0].phase, "implement");
        assert_eq!(status.phase_breakdown[0].tokens, 3_000);
        let session = load_session(&monitor.db, &s.id).unwrap();
        assert_eq!(session.phase, "implement");
    }

    #[test]
    fn non_positive_tokens_rejected() {
        let (monitor, s) = setup(100_000);
        for tokens in [0, -10] {
            let err = track(&monitor, &s.id, "x", tokens).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_PARAMETERS");
        }
    }

    #[test]
    fn exhaustion_records_nothing() {
        let (monitor, s) = setup(10_000);
        track(&monitor, &s.id, "implement", 9_000).unwrap();
        let err = track(&monitor, &s.id, "implement", 2_000).unwrap_err();
        assert!(matches!(err, KeelError::ContextExhausted { used: 9_000, total: 10_000 }));

        // Exactly filling the budget is allowed, anything after is not.
        track(&monitor, &s.id, "implement", 1_000).unwrap();
        let err = track(&monitor, &s.id, "implement", 1).unwrap_err();
        assert_eq!(err.error_code(), "CONTEXT_EXHAUSTED");

        let status = monitor.get_status(&s.id).unwrap();
        assert_eq!(status.used_tokens, 10_000);
        assert_eq!(status.usage_percent, 1.0);
        let records = monitor.db.with_conn(|c| UsageRepo::list(c, &s.id)).unwrap();
        assert_eq!(records.len(), 2);
        ledger_matches(&monitor, &s.id);
    }

    #[test]
    fn tracking_resumes_checkpointed_session() {
        let (monitor, s) = setup(100_000);
        monitor
            .db
            .with_conn(|c| SessionRepo::update_status(c, &s.id, SessionStatus::Checkpoint, true))
            .unwrap();
        let mut rx = monitor.subscribe();
        track(&monitor, &s.id, "implement", 100).unwrap();

        assert_eq!(load_session(&monitor.db, &s.id).unwrap().status, SessionStatus::Active);
        assert!(matches!(
            rx.try_recv().unwrap(),
            StateEvent::SessionStatusChanged { previous: Some(SessionStatus::Checkpoint), .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), StateEvent::ContextStatusChanged(_)));
    }

    #[test]
    fn unknown_session() {
        let (monitor, _) = setup(100);
        let err = monitor.get_status(&SessionId::from_raw("sess_nope")).unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
    }

    #[test]
    fn prediction_defers_tasks_past_reserve() {
        let (monitor, s) = setup(100_000);
        track(&monitor, &s.id, "implement", 50_000).unwrap();
        // remaining 50k, reserve 10k, usable 40k
        let tasks = vec![
            PlannedTask {
                name: "api".into(),
                estimated_tokens: 25_000,
            },
            PlannedTask {
                name: "tests".into(),
                estimated_tokens: 20_000,
            },
            PlannedTask {
                name: "docs".into(),
                estimated_tokens: 1_000,
            },
        ];
        let p = monitor.predict(&s.id, tasks).unwrap();
        assert_eq!(p.remaining_capacity, 50_000);
        assert_eq!(p.safety_reserve, 10_000);
        assert_eq!(p.feasible_tasks.len(), 1);
        assert_eq!(p.deferred_tasks.len(), 2);
        assert!(p.recommend_checkpoint);
        assert!(p.optimization_suggestions[0].contains("Defer 2 task(s)"));
    }

    #[test]
    fn prediction_with_room_needs_no_checkpoint() {
        let (monitor, s) = setup(100_000);
        track(&monitor, &s.id, "implement", 1_000).unwrap();
        let p = monitor
            .predict(
                &s.id,
                vec![PlannedTask {
                    name: "small".into(),
                    estimated_tokens: 5_000,
                }],
            )
            .unwrap();
        assert!(!p.recommend_checkpoint);
        assert_eq!(p.projected_usage_percent, 0.06);
        assert!(p.deferred_tasks.is_empty());
    }

    #[test]
    fn optimize_writes_negative_records() {
        let (monitor, s) = setup(100_000);
        track(&monitor, &s.id, "implement", 50_000).unwrap();
        let result = monitor
            .optimize(OptimizeContext {
                session_id: s.id.clone(),
                target_reduction: 5_000,
                preserve_functionality: true,
            })
            .unwrap();
        // 5% + 8% of 50k
        assert_eq!(result.tokens_saved, 6_500);
        assert!(result.target_met);
        assert_eq!(result.new_capacity, 56_500);
        assert_eq!(result.strategies_applied.len(), 2);

        let records = monitor.db.with_conn(|c| UsageRepo::list(c, &s.id)).unwrap();
        assert_eq!(records.last().unwrap().operation, "optimize:prune_tool_output");
        assert!(records.last().unwrap().tokens < 0);
        ledger_matches(&monitor, &s.id);

        // The single 50k consumption record dominates; reclamations are not averaged in.
        assert_eq!(monitor.get_status(&s.id).unwrap().trend, UsageTrend::Critical);
    }

    #[test]
    fn optimize_reports_blocked_high_risk() {
        let (monitor, s) = setup(100_000);
        track(&monitor, &s.id, "implement", 10_000).unwrap();
        let result = monitor
            .optimize(OptimizeContext {
                session_id: s.id.clone(),
                target_reduction: 9_000,
                preserve_functionality: true,
            })
            .unwrap();
        assert!(!result.target_met);
        assert_eq!(result.blocked_strategies.len(), 2);
        assert!(result.side_effects.last().unwrap().contains("not reached"));
        ledger_matches(&monitor, &s.id);
    }

    #[test]
    fn status_from_empty_ledger() {
        let (monitor, s) = setup(1_000);
        let status = monitor.get_status(&s.id).unwrap();
        assert_eq!(status.used_tokens, 0);
        assert_eq!(status.burn_rate_per_minute, 0.0);
        assert_eq!(status.minutes_to_exhaustion, None);
        assert!(status.phase_breakdown.is_empty());
    }
}
