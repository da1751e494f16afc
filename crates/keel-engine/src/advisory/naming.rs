//! Naming consistency across a project's symbol registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;

use keel_core::advisory::{NewDecision, Suggestion, SuggestionSeverity, SymbolEntry};
use keel_core::KeelError;

use super::{AdvisoryAgent, AdvisoryContext, AgentOutput};

pub const NAME: &str = "naming";
pub const ACTION: &str = "naming_conflict";
/// Share of a concept's usage above which a competing name is a warning.
const WARNING_SHARE: f64 = 0.35;

/// Flags concepts that are referred to by more than one name.
pub struct NamingAgent;

/// Highest usage wins; ties go to the name seen first.
fn canonical<'a>(names: &[&'a SymbolEntry]) -> Option<&'a SymbolEntry> {
    names.iter().copied().min_by(|a, b| {
        b.usage_count
            .cmp(&a.usage_count)
            .then(a.first_seen.cmp(&b.first_seen))
    })
}

#[async_trait]
impl AdvisoryAgent for NamingAgent {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> u8 {
        1
    }

    fn should_run(&self, ctx: &AdvisoryContext) -> bool {
        ctx.project.is_some() && ctx.symbols.len() > 1
    }

    async fn evaluate(&self, ctx: &AdvisoryContext) -> Result<AgentOutput, KeelError> {
        let mut by_concept: BTreeMap<&str, Vec<&SymbolEntry>> = BTreeMap::new();
        for entry in &ctx.symbols {
            by_concept.entry(entry.concept.as_str()).or_default().push(entry);
        }

        let mut output = AgentOutput::default();
        for (concept, names) in by_concept {
            if names.len() < 2 {
                continue;
            }
            let Some(chosen) = canonical(&names) else {
                continue;
            };
            let total: u64 = names.iter().map(|n| n.usage_count).sum();

            let mut conflicts = Vec::new();
            for other in names.iter().filter(|n| n.name != chosen.name) {
                let share = other.usage_count as f64 / total.max(1) as f64;
                let severity = if share >= WARNING_SHARE {
                    SuggestionSeverity::Warning
                } else {
                    SuggestionSeverity::Info
                };
                output.suggestions.push(Suggestion {
                    agent: NAME.into(),
                    kind: ACTION.into(),
                    severity,
                    message: format!(
                        "'{}' and '{}' both name {concept}; prefer '{}'",
                        other.name, chosen.name, chosen.name
                    ),
                    action_required: false,
                    details: json!({
                        "concept": concept,
                        "canonical": chosen.name,
                        "conflicting": other.name,
                        "usage_share": (share * 100.0).round() / 100.0,
                    }),
                });
                conflicts.push(other.name.clone());
            }

            let decision = format!("canonical '{}' over {}", chosen.name, conflicts.join(", "));
            let known = ctx
                .prior(ACTION)
                .any(|d| d.input["concept"] == concept && d.decision == decision);
            if known {
                continue;
            }
            output.decisions.push(NewDecision {
                action: ACTION.into(),
                session_id: ctx.session.as_ref().map(|s| s.id.clone()),
                input: json!({ "concept": concept, "names": names.iter().map(|n| &n.name).collect::<Vec<_>>() }),
                decision,
            });
        }
        Ok(output)
    }
}
