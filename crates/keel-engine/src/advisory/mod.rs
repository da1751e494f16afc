//! Advisory agents: heuristic evaluators that propose but never apply.
//!
//! Agents see an immutable [`AdvisoryContext`] snapshot and return
//! suggestions plus decisions for the audit trail. The orchestrator runs
//! them one at a time under a per-agent timeout.

pub mod budget_guardian;
pub mod checkpoint_timing;
pub mod naming;
pub mod orchestrator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use keel_core::advisory::{AgentDecision, NewDecision, Suggestion, SymbolEntry};
use keel_core::context::ContextStatus;
use keel_core::ids::SessionId;
use keel_core::session::Session;
use keel_core::KeelError;

pub use budget_guardian::BudgetGuardianAgent;
pub use checkpoint_timing::CheckpointTimingAgent;
pub use naming::NamingAgent;
pub use orchestrator::{AdvisoryOrchestrator, RegisterSymbol};

/// Everything an agent may look at during one advisory run.
#[derive(Clone, Debug)]
pub struct AdvisoryContext {
    pub session: Option<Session>,
    pub context: Option<ContextStatus>,
    pub project: Option<String>,
    pub symbols: Vec<SymbolEntry>,
    /// Prior decisions recorded for the session, oldest first.
    pub decisions: Vec<AgentDecision>,
    pub now: DateTime<Utc>,
}

impl AdvisoryContext {
    /// Usage in `[0, 1]`, preferring the live context status.
    pub fn usage(&self) -> Option<f64> {
        self.context
            .as_ref()
            .map(|c| c.usage_percent)
            .or_else(|| self.session.as_ref().map(Session::usage_percent))
    }

    pub fn prior<'a>(&'a self, action: &'a str) -> impl Iterator<Item = &'a AgentDecision> + 'a {
        self.decisions.iter().filter(move |d| d.action == action)
    }
}

#[derive(Clone, Debug, Default)]
pub struct AgentOutput {
    pub suggestions: Vec<Suggestion>,
    pub decisions: Vec<NewDecision>,
}

#[async_trait]
pub trait AdvisoryAgent: Send + Sync {
    fn name(&self) -> &str;
    /// Lower runs first when suggestions are merged.
    fn priority(&self) -> u8;
    fn should_run(&self, ctx: &AdvisoryContext) -> bool;
    async fn evaluate(&self, ctx: &AdvisoryContext) -> Result<AgentOutput, KeelError>;
    /// Drop per-session state once the session is handed off or complete.
    fn forget_session(&self, _session_id: &SessionId) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use keel_core::ids::ProjectId;
    use keel_core::session::{EstimatedScope, SessionKind};

    pub fn session(used: u64, budget: u64, phase: &str) -> Session {
        let scope = EstimatedScope {
            lines: 1000,
            tests: 10,
            docs: 1,
        };
        let mut session = Session::begin(
            "alpha",
            ProjectId::from_raw("proj_alpha"),
            SessionKind::Feature,
            scope,
            phase,
            budget,
        );
        session.id = SessionId::from_raw("sess_advisory");
        session.context_used = used;
        session
    }

    pub fn context(session: Option<Session>) -> AdvisoryContext {
        AdvisoryContext {
            project: session.as_ref().map(|s| s.project.clone()),
            session,
            context: None,
            symbols: Vec::new(),
            decisions: Vec::new(),
            now: Utc::now(),
        }
    }
}
