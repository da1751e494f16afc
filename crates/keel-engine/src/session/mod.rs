//! Session lifecycle: start, checkpoint, handoff, resume and complete.
//!
//! Every mutation writes through the store in one transaction and then
//! publishes on the manager's broadcast channel. Project aggregates are
//! refreshed in the same transaction as the session change.

pub mod plan;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use keel_core::ids::{CheckpointId, SessionId};
use keel_core::project::{Project, VelocityPoint};
use keel_core::session::{
    Checkpoint, ContinuationPlan, EstimatedScope, HandoffDoc, PlannedCheckpoint, PlannedPhase,
    RemainingWork, Session, SessionKind, SessionMetrics, SessionStatus,
};
use keel_core::{KeelError, StateEvent};
use keel_settings::SessionSettings;
use keel_store::{CheckpointRepo, Database, ProjectRepo, SessionRepo};

use crate::{load_session, publish, EVENT_CHANNEL_CAPACITY};

/// Sessions included in the velocity feed.
pub const VELOCITY_WINDOW: u32 = 20;

/// Scope as supplied by callers. Signed so negative values are rejected
/// with a readable error instead of a deserialization failure.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ScopeInput {
    pub lines: i64,
    #[serde(default)]
    pub tests: i64,
    #[serde(default)]
    pub docs: i64,
}

impl ScopeInput {
    fn validate(self) -> Result<EstimatedScope, KeelError> {
        if self.lines <= 0 {
            return Err(KeelError::invalid("scope.lines must be greater than 0"));
        }
        if self.tests < 0 || self.docs < 0 {
            return Err(KeelError::invalid("scope.tests and scope.docs must not be negative"));
        }
        Ok(EstimatedScope {
            lines: self.lines as u64,
            tests: self.tests as u64,
            docs: self.docs as u64,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct StartSession {
    pub project: String,
    pub kind: SessionKind,
    pub scope: ScopeInput,
    #[serde(default)]
    pub budget: Option<u64>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub continuing_from: Option<SessionId>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StartedSession {
    pub session: Session,
    pub checkpoint_plan: Vec<PlannedCheckpoint>,
    pub phase_plan: Vec<PlannedPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Cumulative metrics reported at a checkpoint. Absent fields keep the
/// session's current value.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct MetricsInput {
    #[serde(default)]
    pub lines_written: Option<u64>,
    #[serde(default)]
    pub tests_written: Option<u64>,
    #[serde(default)]
    pub docs_written: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateCheckpoint {
    pub session_id: SessionId,
    #[serde(default)]
    pub completed_components: Vec<String>,
    #[serde(default)]
    pub metrics: MetricsInput,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStatusReport {
    pub session: Session,
    pub checkpoints: Vec<Checkpoint>,
    pub usage_percent: f64,
    pub next_checkpoint: Option<PlannedCheckpoint>,
    pub elapsed_minutes: f64,
}

pub struct SessionManager {
    db: Database,
    settings: SessionSettings,
    events: broadcast::Sender<StateEvent>,
}

impl SessionManager {
    pub fn new(db: Database, settings: SessionSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            settings,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn plan_for(&self, session: &Session) -> Vec<PlannedCheckpoint> {
        plan::checkpoint_plan(
            &session.scope,
            session.context_budget,
            &self.settings.checkpoint_fractions,
            self.settings.large_scope_lines,
        )
    }

    #[instrument(skip(self, req), fields(project = %req.project, kind = %req.kind))]
    pub fn start_session(&self, req: StartSession) -> Result<StartedSession, KeelError> {
        let project_name = req.project.trim();
        if project_name.is_empty() {
            return Err(KeelError::invalid("project must not be empty"));
        }
        let scope = req.scope.validate()?;
        let budget = req.budget.unwrap_or(self.settings.default_budget);
        if budget == 0 {
            return Err(KeelError::invalid("budget must be greater than 0"));
        }
        if let Some(previous) = &req.continuing_from {
            load_session(&self.db, previous)?;
        }

        let phase_plan = plan::phase_plan(req.kind, budget);
        let phase = req
            .phase
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| plan::first_phase(req.kind).to_string());

        let already_active = self.db.with_conn(SessionRepo::active)?;
        let warning = already_active.map(|other| {
            warn!(
                active_session = %other.id,
                "starting a session while another is still active"
            );
            format!(
                "session {} ({}) is still active; the new session runs alongside it",
                other.id, other.project
            )
        });

        let (session, project) = self.db.with_tx(|conn| {
            let project = ProjectRepo::get_or_create(conn, project_name)?;
            let mut session = Session::begin(
                project.name.clone(),
                project.id.clone(),
                req.kind,
                scope,
                phase,
                budget,
            );
            session.continuing_from = req.continuing_from.clone();
            SessionRepo::insert(conn, &session)?;
            let project = ProjectRepo::refresh(conn, &project.id)?;
            Ok((session, project))
        })?;

        info!(session_id = %session.id, budget, "session started");

        let checkpoint_plan = self.plan_for(&session);
        publish(
            &self.events,
            StateEvent::SessionStatusChanged {
                session: Some(Box::new(session.clone())),
                previous: None,
                warning: warning.clone(),
            },
        );
        publish(&self.events, StateEvent::ProjectUpdated(Box::new(project)));

        Ok(StartedSession {
            session,
            checkpoint_plan,
            phase_plan,
            warning,
        })
    }

    #[instrument(skip(self, req), fields(session_id = %req.session_id))]
    pub fn create_checkpoint(&self, req: CreateCheckpoint) -> Result<Checkpoint, KeelError> {
        let session = load_session(&self.db, &req.session_id)?;
        if !session.status.can_transition_to(SessionStatus::Checkpoint) {
            return Err(KeelError::invalid(format!(
                "session {} is {}; checkpoints need an active session",
                session.id, session.status
            )));
        }

        let previous = self
            .db
            .with_conn(|conn| CheckpointRepo::latest(conn, &session.id))?;

        let metrics = SessionMetrics {
            lines_written: req.metrics.lines_written.unwrap_or(session.metrics.lines_written),
            tests_written: req.metrics.tests_written.unwrap_or(session.metrics.tests_written),
            docs_written: req.metrics.docs_written.unwrap_or(session.metrics.docs_written),
            velocity_score: 0.0,
        }
        .with_velocity(session.context_used);

        if !req.force && !makes_progress(previous.as_ref(), &req.completed_components, &metrics) {
            return Err(KeelError::invalid(
                "checkpoint adds no new components and no metric progress; pass force to record it anyway",
            ));
        }

        let number = previous.as_ref().map(|p| p.number + 1).unwrap_or(1);
        let remaining = RemainingWork {
            lines: session.scope.lines.saturating_sub(metrics.lines_written),
            tests: session.scope.tests.saturating_sub(metrics.tests_written),
            docs: session.scope.docs.saturating_sub(metrics.docs_written),
        };
        let plan = self.plan_for(&session);
        let continuation = ContinuationPlan {
            remaining,
            next_checkpoint_at_lines: plan::next_checkpoint(&plan, metrics.lines_written)
                .map(|p| p.target_lines),
            notes: continuation_notes(&remaining, &session),
        };

        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            session_id: session.id.clone(),
            number,
            created_at: Utc::now(),
            tokens_used: session.context_used,
            completed_components: req.completed_components,
            metrics,
            message: req.message,
            continuation: Some(continuation),
        };

        let (updated, project, velocity) = self.db.with_tx(|conn| {
            CheckpointRepo::insert(conn, &checkpoint)?;
            SessionRepo::update_progress(conn, &session.id, &metrics, SessionStatus::Checkpoint)?;
            let updated = SessionRepo::get(conn, &session.id)?;
            let project = ProjectRepo::refresh(conn, &session.project_id)?;
            let velocity = ProjectRepo::velocity(conn, &session.project_id, VELOCITY_WINDOW)?;
            Ok((updated, project, velocity))
        })?;

        info!(number, lines = metrics.lines_written, "checkpoint created");
        self.publish_change(updated, Some(session.status), project, Some(velocity));
        Ok(checkpoint)
    }

    #[instrument(skip(self, next_goals))]
    pub fn create_handoff(
        &self,
        session_id: &SessionId,
        next_goals: Option<Vec<String>>,
    ) -> Result<HandoffDoc, KeelError> {
        let session = load_session(&self.db, session_id)?;
        if !session.status.can_transition_to(SessionStatus::Handoff) {
            return Err(KeelError::invalid(format!(
                "session {} is {} and cannot hand off",
                session.id, session.status
            )));
        }

        let checkpoints = self
            .db
            .with_conn(|conn| CheckpointRepo::list(conn, &session.id))?;
        let completed_components = union_components(&checkpoints);
        let remaining_work = session.remaining_work();
        let next_goals = next_goals
            .filter(|goals| !goals.is_empty())
            .unwrap_or_else(|| derive_goals(&remaining_work));

        let doc = HandoffDoc {
            session_id: session.id.clone(),
            project: session.project.clone(),
            kind: session.kind,
            summary: summarize(&session, checkpoints.len()),
            completed_components,
            remaining_work,
            metrics: session.metrics,
            context_used: session.context_used,
            context_budget: session.context_budget,
            last_checkpoint: checkpoints.last().map(|c| c.number),
            next_goals,
            recommended_budget: recommended_budget(&session, &remaining_work),
            created_at: Utc::now(),
        };

        let (updated, project) = self.db.with_tx(|conn| {
            SessionRepo::update_status(conn, &session.id, SessionStatus::Handoff, false)?;
            let updated = SessionRepo::get(conn, &session.id)?;
            let project = ProjectRepo::refresh(conn, &session.project_id)?;
            Ok((updated, project))
        })?;

        info!(recommended_budget = doc.recommended_budget, "session handed off");
        self.publish_change(updated, Some(session.status), project, None);
        Ok(doc)
    }

    #[instrument(skip(self))]
    pub fn complete_session(&self, session_id: &SessionId) -> Result<Session, KeelError> {
        let session = load_session(&self.db, session_id)?;
        if !session.status.can_transition_to(SessionStatus::Complete) {
            return Err(KeelError::invalid(format!(
                "session {} is already {}",
                session.id, session.status
            )));
        }

        let (updated, project, velocity) = self.db.with_tx(|conn| {
            SessionRepo::update_status(conn, &session.id, SessionStatus::Complete, false)?;
            let updated = SessionRepo::get(conn, &session.id)?;
            let project = ProjectRepo::refresh(conn, &session.project_id)?;
            let velocity = ProjectRepo::velocity(conn, &session.project_id, VELOCITY_WINDOW)?;
            Ok((updated, project, velocity))
        })?;

        info!("session complete");
        self.publish_change(updated.clone(), Some(session.status), project, Some(velocity));
        Ok(updated)
    }

    /// Return a checkpointed session to active.
    #[instrument(skip(self))]
    pub fn resume_session(&self, session_id: &SessionId) -> Result<Session, KeelError> {
        let session = load_session(&self.db, session_id)?;
        if !session.status.can_transition_to(SessionStatus::Active) {
            return Err(KeelError::invalid(format!(
                "session {} is {}; only checkpointed sessions can resume",
                session.id, session.status
            )));
        }

        let updated = self.db.with_tx(|conn| {
            SessionRepo::update_status(conn, &session.id, SessionStatus::Active, true)?;
            SessionRepo::get(conn, &session.id)
        })?;

        publish(
            &self.events,
            StateEvent::SessionStatusChanged {
                session: Some(Box::new(updated.clone())),
                previous: Some(session.status),
                warning: None,
            },
        );
        Ok(updated)
    }

    pub fn get_session_status(&self, session_id: &SessionId) -> Result<SessionStatusReport, KeelError> {
        let session = load_session(&self.db, session_id)?;
        let checkpoints = self
            .db
            .with_conn(|conn| CheckpointRepo::list(conn, &session.id))?;
        let plan = self.plan_for(&session);
        let next_checkpoint = plan::next_checkpoint(&plan, session.metrics.lines_written).cloned();
        let elapsed = Utc::now().signed_duration_since(session.started_at);

        Ok(SessionStatusReport {
            usage_percent: session.usage_percent(),
            elapsed_minutes: (elapsed.num_milliseconds().max(0) as f64 / 60_000.0 * 10.0).round() / 10.0,
            next_checkpoint,
            checkpoints,
            session,
        })
    }

    pub fn active_session(&self) -> Result<Option<Session>, KeelError> {
        Ok(self.db.with_conn(SessionRepo::active)?)
    }

    pub fn list_sessions(&self, project: Option<&str>, limit: u32) -> Result<Vec<Session>, KeelError> {
        Ok(self
            .db
            .with_conn(|conn| SessionRepo::list(conn, project, limit))?)
    }

    fn publish_change(
        &self,
        session: Session,
        previous: Option<SessionStatus>,
        project: Project,
        velocity: Option<Vec<VelocityPoint>>,
    ) {
        let project_name = project.name.clone();
        publish(
            &self.events,
            StateEvent::SessionStatusChanged {
                session: Some(Box::new(session)),
                previous,
                warning: None,
            },
        );
        publish(&self.events, StateEvent::ProjectUpdated(Box::new(project)));
        if let Some(points) = velocity {
            publish(
                &self.events,
                StateEvent::VelocityRecorded {
                    project: project_name,
                    points,
                },
            );
        }
    }
}

/// A checkpoint counts as progress when it names a component the previous
/// one did not, or any metric moved forward.
fn makes_progress(previous: Option<&Checkpoint>, components: &[String], metrics: &SessionMetrics) -> bool {
    let Some(prev) = previous else {
        return !components.is_empty()
            || metrics.lines_written > 0
            || metrics.tests_written > 0
            || metrics.docs_written > 0;
    };
    components.iter().any(|c| !prev.completed_components.contains(c))
        || metrics.lines_written > prev.metrics.lines_written
        || metrics.tests_written > prev.metrics.tests_written
        || metrics.docs_written > prev.metrics.docs_written
}

/// Every component named across the checkpoints, in first-seen order.
fn union_components(checkpoints: &[Checkpoint]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for component in checkpoints.iter().flat_map(|c| &c.completed_components) {
        if !out.contains(component) {
            out.push(component.clone());
        }
    }
    out
}

fn derive_goals(remaining: &RemainingWork) -> Vec<String> {
    let mut goals = Vec::new();
    if remaining.lines > 0 {
        goals.push(format!("Write the remaining ~{} lines", remaining.lines));
    }
    if remaining.tests > 0 {
        goals.push(format!("Add {} more tests", remaining.tests));
    }
    if remaining.docs > 0 {
        goals.push(format!("Write {} more documents", remaining.docs));
    }
    if goals.is_empty() {
        goals.push("Review the delivered work and complete the session".to_string());
    }
    goals
}

fn continuation_notes(remaining: &RemainingWork, session: &Session) -> Vec<String> {
    if remaining.is_empty() {
        return vec!["Estimated scope reached".to_string()];
    }
    let mut notes = derive_goals(remaining);
    if session.usage_percent() >= 0.7 {
        notes.push("Context usage is above 70%; consider a handoff".to_string());
    }
    notes
}

/// Tokens the successor session should get: remaining lines at the observed
/// tokens-per-line rate, or the original budget without an observation.
fn recommended_budget(session: &Session, remaining: &RemainingWork) -> u64 {
    let lines = session.metrics.lines_written;
    if lines == 0 || session.context_used == 0 || remaining.lines == 0 {
        return session.context_budget;
    }
    let tokens_per_line = session.context_used as f64 / lines as f64;
    (remaining.lines as f64 * tokens_per_line).ceil() as u64
}

fn summarize(session: &Session, checkpoints: usize) -> String {
    format!(
        "{} session on {}: {} lines, {} tests and {} docs written over {} checkpoint(s); {:.0}% of the context budget used",
        session.kind,
        session.project,
        session.metrics.lines_written,
        session.metrics.tests_written,
        session.metrics.docs_written,
        checkpoints,
        session.usage_percent() * 100.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::context::ContextUsageRecord;
    use keel_core::ids::UsageId;
    use keel_store::UsageRepo;

    fn manager() -> SessionManager {
        SessionManager::new(Database::in_memory().unwrap(), SessionSettings::default())
    }

    fn request(project: &str, kind: SessionKind, lines: i64, tests: i64) -> StartSession {
        StartSession {
            project: project.into(),
            kind,
            scope: ScopeInput { lines, tests, docs: 0 },
            budget: None,
            phase: None,
            continuing_from: None,
        }
    }

    fn start(mgr: &SessionManager, project: &str, lines: i64) -> Session {
        let mut req = request(project, SessionKind::Feature, lines, 10);
        req.scope.docs = 2;
        req.budget = Some(100_000);
        mgr.start_session(req).unwrap().session
    }

    fn checkpoint(session_id: &SessionId, components: &[&str], lines: u64) -> CreateCheckpoint {
        CreateCheckpoint {
            session_id: session_id.clone(),
            completed_components: components.iter().map(|c| c.to_string()).collect(),
            metrics: MetricsInput {
                lines_written: Some(lines),
                ..Default::default()
            },
            message: None,
            force: false,
        }
    }

    fn use_tokens(mgr: &SessionManager, session_id: &SessionId, tokens: i64) {
        mgr.db
            .with_tx(|conn| {
                UsageRepo::append(
                    conn,
                    &ContextUsageRecord {
                        id: UsageId::new(),
                        session_id: session_id.clone(),
                        phase: "implement".into(),
                        tokens,
                        operation: "edit".into(),
                        recorded_at: Utc::now(),
                    },
                )?;
                SessionRepo::apply_usage(conn, session_id, tokens, None, None)
            })
            .unwrap();
    }

    #[test]
    fn start_defaults_phase_and_plans() {
        let mgr = manager();
        let started = mgr
            .start_session(request("alpha", SessionKind::Bugfix, 1000, 3))
            .unwrap();
        assert_eq!(started.session.phase, "reproduce");
        assert_eq!(started.session.context_budget, 200_000);
        assert_eq!(started.checkpoint_plan.len(), 3);
        assert_eq!(started.phase_plan[0].name, "reproduce");
        assert!(started.warning.is_none());
        assert_eq!(mgr.active_session().unwrap().unwrap().id, started.session.id);
    }

    #[test]
    fn start_rejects_bad_scope() {
        let mgr = manager();
        for (lines, tests) in [(0, 0), (-5, 0), (10, -1)] {
            let err = mgr
                .start_session(request("alpha", SessionKind::Feature, lines, tests))
                .unwrap_err();
            assert_eq!(err.error_code(), "INVALID_PARAMETERS");
        }
    }

    #[test]
    fn start_with_unknown_predecessor_fails() {
        let mgr = manager();
        let mut req = request("alpha", SessionKind::Feature, 10, 0);
        req.continuing_from = Some(SessionId::from_raw("sess_missing"));
        let err = mgr.start_session(req).unwrap_err();
        assert!(matches!(err, KeelError::SessionNotFound(_)));
    }

    #[test]
    fn second_active_session_starts_with_warning() {
        let mgr = manager();
        let first = start(&mgr, "alpha", 100);
        let second = mgr
            .start_session(request("beta", SessionKind::Refactor, 50, 0))
            .unwrap();
        let warning = second.warning.unwrap();
        assert!(warning.contains(first.id.as_str()));
    }

    #[test]
    fn start_publishes_session_and_project() {
        let mgr = manager();
        let mut rx = mgr.subscribe();
        let session = start(&mgr, "alpha", 100);

        match rx.try_recv().unwrap() {
            StateEvent::SessionStatusChanged { session: Some(s), previous, .. } => {
                assert_eq!(s.id, session.id);
                assert!(previous.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.try_recv().unwrap() {
            StateEvent::ProjectUpdated(p) => assert_eq!(p.session_count, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn checkpoints_number_sequentially() {
        let mgr = manager();
        let s = start(&mgr, "alpha", 1000);
        use_tokens(&mgr, &s.id, 20_000);

        let c1 = mgr.create_checkpoint(checkpoint(&s.id, &["src/model.rs"], 300)).unwrap();
        let c2 = mgr.create_checkpoint(checkpoint(&s.id, &["src/api.rs"], 450)).unwrap();
        let c3 = mgr.create_checkpoint(checkpoint(&s.id, &["src/api.rs"], 700)).unwrap();
        assert_eq!((c1.number, c2.number, c3.number), (1, 2, 3));

        assert_eq!(c1.metrics.velocity_score, 15.0);
        assert_eq!(c1.tokens_used, 20_000);
        let plan = c1.continuation.unwrap();
        assert_eq!(plan.remaining.lines, 700);
        assert_eq!(plan.next_checkpoint_at_lines, Some(600));

        let report = mgr.get_session_status(&s.id).unwrap();
        assert_eq!(report.session.status, SessionStatus::Checkpoint);
        assert_eq!(report.session.metrics.lines_written, 700);
        assert_eq!(report.checkpoints.len(), 3);
        assert_eq!(report.next_checkpoint.unwrap().target_lines, 850);
    }

    #[test]
    fn checkpoint_without_progress_needs_force() {
        let mgr = manager();
        let s = start(&mgr, "alpha", 1000);
        mgr.create_checkpoint(checkpoint(&s.id, &["parser"], 100)).unwrap();

        let err = mgr.create_checkpoint(checkpoint(&s.id, &["parser"], 100)).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PARAMETERS");

        let mut forced = checkpoint(&s.id, &["parser"], 100);
        forced.force = true;
        assert_eq!(mgr.create_checkpoint(forced).unwrap().number, 2);
    }

    #[test]
    fn checkpoint_unknown_session() {
        let mgr = manager();
        let err = mgr
            .create_checkpoint(checkpoint(&SessionId::from_raw("sess_nope"), &["x"], 1))
            .unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
    }

    #[test]
    fn checkpoint_publishes_velocity() {
        let mgr = manager();
        let s = start(&mgr, "alpha", 1000);
        let mut rx = mgr.subscribe();
        mgr.create_checkpoint(checkpoint(&s.id, &["a"], 10)).unwrap();

        let topics: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.topic().as_str())
            .collect();
        assert_eq!(topics, vec!["session.status", "project.status", "project.velocity"]);
    }

    #[test]
    fn handoff_builds_continuation_document() {
        let mgr = manager();
        let s = start(&mgr, "alpha", 1000);
        use_tokens(&mgr, &s.id, 40_000);
        mgr.create_checkpoint(checkpoint(&s.id, &["src/a.rs", "src/b.rs"], 200)).unwrap();
        mgr.create_checkpoint(checkpoint(&s.id, &["src/b.rs", "src/c.rs"], 400)).unwrap();

        let doc = mgr.create_handoff(&s.id, None).unwrap();
        assert_eq!(doc.completed_components, vec!["src/a.rs", "src/b.rs", "src/c.rs"]);
        assert_eq!(doc.remaining_work.lines, 600);
        assert_eq!(doc.remaining_work.tests, 10);
        assert_eq!(doc.last_checkpoint, Some(2));
        // 40k tokens for 400 lines is 100 tokens per line.
        assert_eq!(doc.recommended_budget, 60_000);
        assert!(doc.next_goals[0].contains("600"));

        let after = mgr.get_session_status(&s.id).unwrap().session;
        assert_eq!(after.status, SessionStatus::Handoff);
        assert!(!after.is_active);
        assert!(mgr.active_session().unwrap().is_none());
    }

    #[test]
    fn handoff_without_observation_falls_back_to_budget() {
        let mgr = manager();
        let s = start(&mgr, "alpha", 100);
        let doc = mgr
            .create_handoff(&s.id, Some(vec!["ship it".into()]))
            .unwrap();
        assert_eq!(doc.recommended_budget, 100_000);
        assert_eq!(doc.next_goals, vec!["ship it"]);
        assert_eq!(doc.last_checkpoint, None);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mgr = manager();
        let s = start(&mgr, "alpha", 100);

        // Active cannot resume.
        assert_eq!(mgr.resume_session(&s.id).unwrap_err().error_code(), "INVALID_PARAMETERS");

        mgr.create_handoff(&s.id, None).unwrap();
        assert!(mgr.create_handoff(&s.id, None).is_err());
        assert!(mgr.create_checkpoint(checkpoint(&s.id, &["x"], 5)).is_err());

        let done = mgr.complete_session(&s.id).unwrap();
        assert_eq!(done.status, SessionStatus::Complete);
        assert_eq!(mgr.complete_session(&s.id).unwrap_err().error_code(), "INVALID_PARAMETERS");
    }

    #[test]
    fn resume_returns_checkpoint_to_active() {
        let mgr = manager();
        let s = start(&mgr, "alpha", 100);
        mgr.create_checkpoint(checkpoint(&s.id, &["x"], 5)).unwrap();
        let resumed = mgr.resume_session(&s.id).unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);
    }

    #[test]
    fn complete_updates_project_rate() {
        let mgr = manager();
        let a = start(&mgr, "alpha", 100);
        start(&mgr, "alpha", 100);
        let mut rx = mgr.subscribe();
        mgr.complete_session(&a.id).unwrap();

        let project = std::iter::from_fn(|| rx.try_recv().ok())
            .find_map(|e| match e {
                StateEvent::ProjectUpdated(p) => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(project.session_count, 2);
        assert_eq!(project.completion_rate, 0.5);
    }

    #[test]
    fn list_filters_by_project() {
        let mgr = manager();
        start(&mgr, "alpha", 100);
        start(&mgr, "beta", 100);
        start(&mgr, "alpha", 100);
        assert_eq!(mgr.list_sessions(Some("alpha"), 10).unwrap().len(), 2);
        assert_eq!(mgr.list_sessions(None, 10).unwrap().len(), 3);
        assert_eq!(mgr.list_sessions(None, 1).unwrap().len(), 1);
    }
}
