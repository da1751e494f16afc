//! Sequential advisory pipeline.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

use keel_core::advisory::{
    AdvisoryReport, AgentDecision, AgentRun, AgentRunStatus, Suggestion, SymbolEntry,
};
use keel_core::ids::{DecisionId, SessionId};
use keel_core::session::Session;
use keel_core::tokens::estimate_json_tokens;
use keel_core::{KeelError, StateEvent};
use keel_settings::AdvisorySettings;
use keel_store::{Database, DecisionRepo, SessionRepo, SymbolRepo};

use super::{
    AdvisoryAgent, AdvisoryContext, AgentOutput, BudgetGuardianAgent, CheckpointTimingAgent,
    NamingAgent,
};
use crate::{context, load_session, publish, EVENT_CHANNEL_CAPACITY};

#[derive(Clone, Debug, Deserialize)]
pub struct RegisterSymbol {
    pub project: String,
    pub concept: String,
    pub name: String,
    #[serde(default = "default_context_type")]
    pub context_type: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_context_type() -> String {
    "variable".into()
}

fn default_confidence() -> f64 {
    1.0
}

pub struct AdvisoryOrchestrator {
    db: Database,
    agents: Vec<Arc<dyn AdvisoryAgent>>,
    agent_timeout: Duration,
    budget_ratio: f64,
    default_budget: u64,
    events: broadcast::Sender<StateEvent>,
    /// Held for a whole run so threshold decisions are read and written once.
    running: Mutex<()>,
}

impl AdvisoryOrchestrator {
    pub fn new(db: Database, settings: &AdvisorySettings, default_budget: u64) -> Self {
        let agents: Vec<Arc<dyn AdvisoryAgent>> = vec![
            Arc::new(NamingAgent),
            Arc::new(CheckpointTimingAgent),
            Arc::new(BudgetGuardianAgent::new()),
        ];
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            agents,
            agent_timeout: Duration::from_millis(settings.agent_timeout_ms),
            budget_ratio: settings.budget_ratio,
            default_budget,
            events,
            running: Mutex::new(()),
        }
    }

    /// Replace the agent list. Agents run in the given order.
    pub fn with_agents(mut self, agents: Vec<Arc<dyn AdvisoryAgent>>) -> Self {
        self.agents = agents;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn build_context(&self, session: Option<Session>) -> Result<AdvisoryContext, KeelError> {
        let context = session
            .as_ref()
            .map(|s| context::load_status(&self.db, &s.id))
            .transpose()?;
        let (symbols, decisions) = self.db.with_conn(|conn| {
            let symbols = match &session {
                Some(s) => SymbolRepo::for_project(conn, &s.project)?,
                None => Vec::new(),
            };
            let decisions = match &session {
                Some(s) => DecisionRepo::for_session(conn, &s.id, None)?,
                None => Vec::new(),
            };
            Ok((symbols, decisions))
        })?;
        Ok(AdvisoryContext {
            project: session.as_ref().map(|s| s.project.clone()),
            session,
            context,
            symbols,
            decisions,
            now: Utc::now(),
        })
    }

    /// Run every agent once. Without a session id the active session is
    /// used; with none active only session-independent agents produce output.
    #[instrument(skip(self))]
    pub async fn run(&self, session_id: Option<&SessionId>) -> Result<AdvisoryReport, KeelError> {
        let _running = self.running.lock().await;
        let session = match session_id {
            Some(id) => Some(load_session(&self.db, id)?),
            None => self.db.with_conn(SessionRepo::active)?,
        };
        let ctx = self.build_context(session)?;

        let mut runs = Vec::with_capacity(self.agents.len());
        let mut ranked: Vec<(u8, Suggestion)> = Vec::new();
        for agent in &self.agents {
            let name = agent.name().to_string();
            if !agent.should_run(&ctx) {
                debug!(agent = %name, "agent skipped");
                runs.push(AgentRun {
                    agent: name,
                    status: AgentRunStatus::Skipped,
                    duration_ms: 0,
                    suggestions: 0,
                    error: None,
                });
                continue;
            }

            let started = Instant::now();
            let outcome = tokio::time::timeout(
                self.agent_timeout,
                AssertUnwindSafe(agent.evaluate(&ctx)).catch_unwind(),
            )
            .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (status, error, output) = match outcome {
                Ok(Ok(Ok(output))) => (AgentRunStatus::Ran, None, output),
                Ok(Ok(Err(e))) => {
                    warn!(agent = %name, error = %e, "advisory agent failed");
                    (AgentRunStatus::Failed, Some(e.to_string()), AgentOutput::default())
                }
                Ok(Err(_panic)) => {
                    warn!(agent = %name, "advisory agent panicked");
                    (
                        AgentRunStatus::Failed,
                        Some("agent panicked".to_string()),
                        AgentOutput::default(),
                    )
                }
                Err(_timeout) => {
                    warn!(
                        agent = %name,
                        timeout_ms = self.agent_timeout.as_millis() as u64,
                        "advisory agent timed out, discarding its output"
                    );
                    (
                        AgentRunStatus::TimedOut,
                        Some(format!("timed out after {} ms", self.agent_timeout.as_millis())),
                        AgentOutput::default(),
                    )
                }
            };

            if !output.decisions.is_empty() {
                self.remember(&name, &output)?;
            }
            runs.push(AgentRun {
                agent: name,
                status,
                duration_ms,
                suggestions: output.suggestions.len(),
                error,
            });
            let priority = agent.priority();
            ranked.extend(output.suggestions.into_iter().map(|s| (priority, s)));
        }

        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.severity.cmp(&b.1.severity)));
        let budget = ctx
            .session
            .as_ref()
            .map(|s| s.context_budget)
            .unwrap_or(self.default_budget);
        let token_ceiling = (budget as f64 * self.budget_ratio).floor() as u64;

        let mut suggestions = Vec::new();
        let mut tokens_used = 0;
        let mut truncated = false;
        for (_, suggestion) in ranked {
            let cost = estimate_json_tokens(&json!(suggestion));
            if tokens_used + cost > token_ceiling {
                truncated = true;
                break;
            }
            tokens_used += cost;
            suggestions.push(suggestion);
        }

        let report = AdvisoryReport {
            session_id: ctx.session.as_ref().map(|s| s.id.clone()),
            suggestions,
            agents: runs,
            tokens_used,
            token_ceiling,
            truncated,
            generated_at: Utc::now(),
        };
        info!(
            suggestions = report.suggestions.len(),
            truncated,
            "advisory run complete"
        );
        publish(&self.events, StateEvent::AdvisorySuggestions(Box::new(report.clone())));
        Ok(report)
    }

    /// Release agent state held for a session that can no longer run.
    pub fn session_closed(&self, session_id: &SessionId) {
        for agent in &self.agents {
            agent.forget_session(session_id);
        }
    }

    fn remember(&self, agent: &str, output: &AgentOutput) -> Result<(), KeelError> {
        let now = Utc::now();
        self.db.with_tx(|conn| {
            for d in &output.decisions {
                DecisionRepo::append(
                    conn,
                    &AgentDecision {
                        id: DecisionId::new(),
                        agent: agent.to_string(),
                        action: d.action.clone(),
                        session_id: d.session_id.clone(),
                        input: d.input.clone(),
                        decision: d.decision.clone(),
                        success: true,
                        created_at: now,
                        completed_at: Some(now),
                    },
                )?;
            }
            Ok(())
        })?;
        Ok(())
    }

    #[instrument(skip(self, req), fields(project = %req.project, concept = %req.concept))]
    pub fn register_symbol(&self, req: RegisterSymbol) -> Result<SymbolEntry, KeelError> {
        for (field, value) in [
            ("project", &req.project),
            ("concept", &req.concept),
            ("name", &req.name),
        ] {
            if value.trim().is_empty() {
                return Err(KeelError::invalid(format!("{field} must not be empty")));
            }
        }
        if !(0.0..=1.0).contains(&req.confidence) {
            return Err(KeelError::invalid("confidence must be between 0 and 1"));
        }
        Ok(self.db.with_conn(|conn| {
            SymbolRepo::register(
                conn,
                req.project.trim(),
                req.concept.trim(),
                req.name.trim(),
                &req.context_type,
                req.confidence,
                Utc::now(),
            )
        })?)
    }
}
