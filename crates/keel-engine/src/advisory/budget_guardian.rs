//! Watches how fast usage climbs between advisory runs.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use keel_core::advisory::{NewDecision, Suggestion, SuggestionSeverity};
use keel_core::ids::SessionId;
use keel_core::KeelError;

use super::{AdvisoryAgent, AdvisoryContext, AgentOutput};

pub const NAME: &str = "budget_guardian";
/// Samples kept per session.
pub const WINDOW: usize = 6;
/// Usage (percent) below which the guardian stays quiet.
const MIN_USAGE: f64 = 25.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsagePattern {
    Plateau,
    Steady,
    Spike,
    Exponential,
}

impl UsagePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plateau => "plateau",
            Self::Steady => "steady",
            Self::Spike => "spike",
            Self::Exponential => "exponential",
        }
    }
}

/// Classify consecutive percentage-point deltas.
pub fn classify(deltas: &[f64]) -> UsagePattern {
    if deltas.is_empty() {
        return UsagePattern::Steady;
    }
    let accelerating = deltas.len() >= 2
        && deltas.windows(2).all(|w| w[1] > w[0])
        && deltas.last().is_some_and(|d| *d >= 5.0);
    if accelerating {
        return UsagePattern::Exponential;
    }
    let avg = deltas.iter().sum::<f64>() / deltas.len() as f64;
    if avg < 1.0 {
        UsagePattern::Plateau
    } else if avg < 5.0 {
        UsagePattern::Steady
    } else if avg < 10.0 {
        UsagePattern::Spike
    } else {
        UsagePattern::Exponential
    }
}

fn phase_tip(phase: &str) -> &'static str {
    match phase {
        "design" | "analyze" | "outline" => "keep exploration notes short and record decisions instead of transcripts",
        "implement" | "fix" | "restructure" | "draft" => "checkpoint after each finished component",
        "test" | "verify" | "reproduce" => "run focused tests instead of whole suites",
        "document" | "review" => "summarize sources rather than quoting them",
        _ => "trim tool output before it lands in context",
    }
}

/// Keeps a rolling window of `(time, usage %)` samples per session.
#[derive(Default)]
pub struct BudgetGuardianAgent {
    samples: Mutex<HashMap<SessionId, VecDeque<(DateTime<Utc>, f64)>>>,
}

impl BudgetGuardianAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample and return the window after it.
    fn record(&self, session_id: &SessionId, at: DateTime<Utc>, percent: f64) -> Vec<(DateTime<Utc>, f64)> {
        let mut samples = self.samples.lock();
        let window = samples.entry(session_id.clone()).or_default();
        window.push_back((at, percent));
        while window.len() > WINDOW {
            window.pop_front();
        }
        window.iter().copied().collect()
    }

    pub fn tracked_sessions(&self) -> usize {
        self.samples.lock().len()
    }
}

/// Minutes until 100 % at the average pace of the window.
fn projected_minutes(window: &[(DateTime<Utc>, f64)], avg_delta: f64, percent: f64) -> Option<f64> {
    let (first, last) = (window.first()?, window.last()?);
    if window.len() < 2 || avg_delta <= 0.0 {
        return None;
    }
    let span = last.0.signed_duration_since(first.0).num_milliseconds() as f64 / 60_000.0;
    let spacing = (span / (window.len() - 1) as f64).max(1.0);
    let rate = avg_delta / spacing;
    Some((((100.0 - percent).max(0.0) / rate) * 10.0).round() / 10.0)
}

#[async_trait]
impl AdvisoryAgent for BudgetGuardianAgent {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> u8 {
        3
    }

    fn should_run(&self, ctx: &AdvisoryContext) -> bool {
        ctx.session.as_ref().is_some_and(|s| s.status.is_open())
            && ctx.usage().is_some_and(|u| u * 100.0 >= MIN_USAGE)
    }

    async fn evaluate(&self, ctx: &AdvisoryContext) -> Result<AgentOutput, KeelError> {
        let (Some(session), Some(usage)) = (ctx.session.as_ref(), ctx.usage()) else {
            return Ok(AgentOutput::default());
        };
        let percent = usage * 100.0;
        let window = self.record(&session.id, ctx.now, percent);
        let deltas: Vec<f64> = window.windows(2).map(|w| w[1].1 - w[0].1).collect();
        let pattern = classify(&deltas);
        let avg_delta = if deltas.is_empty() {
            0.0
        } else {
            deltas.iter().sum::<f64>() / deltas.len() as f64
        };
        let minutes = projected_minutes(&window, avg_delta, percent);
        let soon = minutes.is_some_and(|m| m < 30.0);

        let severity = match pattern {
            UsagePattern::Exponential => SuggestionSeverity::Critical,
            UsagePattern::Spike => SuggestionSeverity::Warning,
            UsagePattern::Steady if soon || percent >= 60.0 => SuggestionSeverity::Info,
            UsagePattern::Steady | UsagePattern::Plateau => return Ok(AgentOutput::default()),
        };

        let mut message = match pattern {
            UsagePattern::Exponential => format!("Usage is accelerating at {percent:.0}%"),
            UsagePattern::Spike => format!("Usage jumped {avg_delta:.1} points per run, now {percent:.0}%"),
            _ => format!("Usage is climbing steadily, now {percent:.0}%"),
        };
        if let Some(m) = minutes {
            message.push_str(&format!("; about {m:.0} minutes left at this pace"));
        }
        message.push_str(&format!("; {}", phase_tip(&session.phase)));

        let suggestion = Suggestion {
            agent: NAME.into(),
            kind: "budget_pattern".into(),
            severity,
            message,
            action_required: pattern == UsagePattern::Exponential,
            details: json!({
                "pattern": pattern,
                "usage_percent": (percent * 10.0).round() / 10.0,
                "average_delta": (avg_delta * 100.0).round() / 100.0,
                "minutes_to_exhaustion": minutes,
                "samples": window.len(),
            }),
        };
        let decision = NewDecision {
            action: "budget_pattern".into(),
            session_id: Some(session.id.clone()),
            input: json!({ "deltas": deltas, "usage_percent": percent }),
            decision: format!("{} at {percent:.0}%", pattern.as_str()),
        };
        Ok(AgentOutput {
            suggestions: vec![suggestion],
            decisions: vec![decision],
        })
    }

    fn forget_session(&self, session_id: &SessionId) {
        if self.samples.lock().remove(session_id).is_some() {
            debug!(session_id = %session_id, "dropped usage samples");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::testing;
    use chrono::Duration;

    #[test]
    fn pattern_bands() {
        assert_eq!(classify(&[0.5, 0.2]), UsagePattern::Plateau);
        assert_eq!(classify(&[3.0, 2.0, 4.0, 3.0]), UsagePattern::Steady);
        assert_eq!(classify(&[8.0, 7.0]), UsagePattern::Spike);
        assert_eq!(classify(&[12.0, 11.0]), UsagePattern::Exponential);
        // strictly accelerating, last step >= 5
        assert_eq!(classify(&[1.0, 2.0, 6.0]), UsagePattern::Exponential);
        // accelerating but small
        assert_eq!(classify(&[1.0, 2.0, 3.0]), UsagePattern::Steady);
    }

    #[test]
    fn projection_uses_sample_spacing() {
        let t0 = Utc::now();
        let window = vec![(t0, 40.0), (t0 + Duration::minutes(10), 50.0)];
        // 10 points per 10 minutes, 50 points left
        assert_eq!(projected_minutes(&window, 10.0, 50.0), Some(50.0));
        assert_eq!(projected_minutes(&window[..1], 10.0, 50.0), None);
    }

    #[test]
    fn window_is_bounded_and_per_session() {
        let agent = BudgetGuardianAgent::new();
        let a = SessionId::from_raw("sess_a");
        for i in 0..10 {
            agent.record(&a, Utc::now(), 30.0 + i as f64);
        }
        let window = agent.record(&a, Utc::now(), 41.0);
        assert_eq!(window.len(), WINDOW);
        assert_eq!(window[0].1, 35.0);
        assert_eq!(agent.record(&SessionId::from_raw("sess_b"), Utc::now(), 30.0).len(), 1);
        agent.forget_session(&a);
        assert_eq!(agent.tracked_sessions(), 1);
        assert_eq!(agent.record(&a, Utc::now(), 42.0).len(), 1);
    }

    #[tokio::test]
    async fn accelerating_usage_is_critical() {
        let agent = BudgetGuardianAgent::new();
        let mut ctx = testing::context(Some(testing::session(10_000, 100_000, "test")));
        assert!(!agent.should_run(&ctx));

        let start = Utc::now();
        let mut last = AgentOutput::default();
        for (i, used) in [30_000u64, 32_000, 36_000, 44_000].into_iter().enumerate() {
            ctx.session.as_mut().unwrap().context_used = used;
            ctx.now = start + Duration::minutes(5 * i as i64);
            assert!(agent.should_run(&ctx));
            last = agent.evaluate(&ctx).await.unwrap();
        }
        let s = &last.suggestions[0];
        assert_eq!(s.severity, SuggestionSeverity::Critical);
        assert!(s.action_required);
        assert_eq!(s.details["pattern"], "exponential");
        assert!(s.message.contains("focused tests"));
        assert_eq!(last.decisions.len(), 1);
    }

    #[tokio::test]
    async fn plateau_is_silent() {
        let agent = BudgetGuardianAgent::new();
        let mut ctx = testing::context(Some(testing::session(40_000, 100_000, "implement")));
        agent.evaluate(&ctx).await.unwrap();
        ctx.session.as_mut().unwrap().context_used = 40_300;
        let out = agent.evaluate(&ctx).await.unwrap();
        assert!(out.suggestions.is_empty());
    }
}
