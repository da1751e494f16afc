//! Suggests checkpoints as context usage crosses fixed thresholds.

use async_trait::async_trait;
use serde_json::json;

use keel_core::advisory::{NewDecision, Suggestion, SuggestionSeverity};
use keel_core::KeelError;

use super::{AdvisoryAgent, AdvisoryContext, AgentOutput};

pub const NAME: &str = "checkpoint_timing";
pub const ACTION: &str = "checkpoint_suggestion";
/// Usage thresholds in percent. The last one is critical.
pub const THRESHOLDS: [u32; 4] = [30, 50, 70, 85];
const CRITICAL: u32 = 85;
const WARNING: u32 = 70;

pub struct CheckpointTimingAgent;

impl CheckpointTimingAgent {
    /// Thresholds already suggested for the session.
    fn suggested(ctx: &AdvisoryContext) -> Vec<u32> {
        ctx.prior(ACTION)
            .filter_map(|d| d.input.get("threshold")?.as_u64())
            .map(|t| t as u32)
            .collect()
    }
}

#[async_trait]
impl AdvisoryAgent for CheckpointTimingAgent {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> u8 {
        2
    }

    fn should_run(&self, ctx: &AdvisoryContext) -> bool {
        ctx.session.as_ref().is_some_and(|s| s.status.is_open())
    }

    async fn evaluate(&self, ctx: &AdvisoryContext) -> Result<AgentOutput, KeelError> {
        let (Some(session), Some(usage)) = (ctx.session.as_ref(), ctx.usage()) else {
            return Ok(AgentOutput::default());
        };
        let percent = usage * 100.0;
        let already = Self::suggested(ctx);
        let crossed: Vec<u32> = THRESHOLDS
            .into_iter()
            .filter(|t| percent >= f64::from(*t) && !already.contains(t))
            .collect();
        let Some(&highest) = crossed.last() else {
            return Ok(AgentOutput::default());
        };

        let (severity, message) = match highest {
            t if t >= CRITICAL => (
                SuggestionSeverity::Critical,
                format!("Context is {percent:.0}% used; checkpoint and hand off now"),
            ),
            t if t >= WARNING => (
                SuggestionSeverity::Warning,
                format!("Context is {percent:.0}% used; create a checkpoint before the next large step"),
            ),
            _ => (
                SuggestionSeverity::Info,
                format!("Context is {percent:.0}% used; a checkpoint here keeps recovery cheap"),
            ),
        };

        let suggestion = Suggestion {
            agent: NAME.into(),
            kind: ACTION.into(),
            severity,
            message,
            action_required: highest >= CRITICAL,
            details: json!({
                "threshold": highest,
                "usage_percent": (percent * 10.0).round() / 10.0,
                "phase": session.phase,
            }),
        };
        let decisions = crossed
            .iter()
            .map(|t| NewDecision {
                action: ACTION.into(),
                session_id: Some(session.id.clone()),
                input: json!({ "threshold": t, "usage_percent": (percent * 10.0).round() / 10.0 }),
                decision: format!("suggested checkpoint at {t}%"),
            })
            .collect();

        Ok(AgentOutput {
            suggestions: vec![suggestion],
            decisions,
        })
    }
}
