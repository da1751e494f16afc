//! Checkpoint and phase planning from an estimated scope.

use keel_core::session::{EstimatedScope, PlannedCheckpoint, PlannedPhase, SessionKind};

/// Phase names and their relative token weights per session kind.
fn phase_weights(kind: SessionKind) -> &'static [(&'static str, f64)] {
    match kind {
        SessionKind::Feature => &[
            ("design", 0.15),
            ("implement", 0.50),
            ("test", 0.25),
            ("document", 0.10),
        ],
        SessionKind::Bugfix => &[("reproduce", 0.25), ("fix", 0.45), ("verify", 0.30)],
        SessionKind::Refactor => &[("analyze", 0.20), ("restructure", 0.55), ("verify", 0.25)],
        SessionKind::Documentation => &[("outline", 0.20), ("draft", 0.60), ("review", 0.20)],
    }
}

/// Token allocation per phase, proportional to the fixed weights.
pub fn phase_plan(kind: SessionKind, budget: u64) -> Vec<PlannedPhase> {
    let weights = phase_weights(kind);
    let total: f64 = weights.iter().map(|(_, w)| w).sum();
    weights
        .iter()
        .map(|(name, weight)| PlannedPhase {
            name: (*name).to_string(),
            token_allocation: (budget as f64 * weight / total).round() as u64,
        })
        .collect()
}

/// The opening phase of a kind's plan.
pub fn first_phase(kind: SessionKind) -> &'static str {
    phase_weights(kind).first().map(|(name, _)| *name).unwrap_or("work")
}

/// Natural stopping points. Large scopes get one checkpoint per fraction;
/// small scopes get a single final checkpoint.
pub fn checkpoint_plan(
    scope: &EstimatedScope,
    budget: u64,
    fractions: &[f64],
    large_scope_lines: u64,
) -> Vec<PlannedCheckpoint> {
    if scope.lines < large_scope_lines || fractions.is_empty() {
        return vec![PlannedCheckpoint {
            number: 1,
            fraction: 1.0,
            target_lines: scope.lines,
            target_tokens: budget,
        }];
    }

    fractions
        .iter()
        .enumerate()
        .map(|(i, fraction)| PlannedCheckpoint {
            number: i as u32 + 1,
            fraction: *fraction,
            target_lines: (scope.lines as f64 * fraction).round() as u64,
            target_tokens: (budget as f64 * fraction).round() as u64,
        })
        .collect()
}

/// The first planned checkpoint whose line target has not been reached.
pub fn next_checkpoint(plan: &[PlannedCheckpoint], lines_written: u64) -> Option<&PlannedCheckpoint> {
    plan.iter().find(|p| p.target_lines > lines_written)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRACTIONS: [f64; 3] = [0.3, 0.6, 0.85];

    fn scope(lines: u64) -> EstimatedScope {
        EstimatedScope {
            lines,
            tests: 5,
            docs: 1,
        }
    }

    #[test]
    fn large_scope_gets_three_checkpoints() {
        let plan = checkpoint_plan(&scope(1000), 200_000, &FRACTIONS, 500);
        let lines: Vec<u64> = plan.iter().map(|p| p.target_lines).collect();
        assert_eq!(lines, vec![300, 600, 850]);
        assert_eq!(plan[0].target_tokens, 60_000);
        assert_eq!(plan[2].number, 3);
    }

    #[test]
    fn small_scope_gets_single_final_checkpoint() {
        let plan = checkpoint_plan(&scope(499), 100_000, &FRACTIONS, 500);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].target_lines, 499);
        assert_eq!(plan[0].fraction, 1.0);
    }

    #[test]
    fn boundary_scope_is_large() {
        assert_eq!(checkpoint_plan(&scope(500), 100_000, &FRACTIONS, 500).len(), 3);
    }

    #[test]
    fn phase_allocations_follow_weights() {
        let plan = phase_plan(SessionKind::Feature, 100_000);
        let names: Vec<&str> = plan.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["design", "implement", "test", "document"]);
        assert_eq!(plan[1].token_allocation, 50_000);
        let total: u64 = plan.iter().map(|p| p.token_allocation).sum();
        assert_eq!(total, 100_000);

        assert_eq!(first_phase(SessionKind::Bugfix), "reproduce");
        assert_eq!(phase_plan(SessionKind::Documentation, 10).len(), 3);
    }

    #[test]
    fn next_checkpoint_skips_reached_targets() {
        let plan = checkpoint_plan(&scope(1000), 200_000, &FRACTIONS, 500);
        assert_eq!(next_checkpoint(&plan, 0).unwrap().number, 1);
        assert_eq!(next_checkpoint(&plan, 300).unwrap().number, 2);
        assert!(next_checkpoint(&plan, 900).is_none());
    }
}
