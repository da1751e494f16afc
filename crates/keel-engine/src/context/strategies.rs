//! Context reclamation strategies, applied greedily from lowest risk up.

use keel_core::context::RiskLevel;

#[derive(Clone, Copy, Debug)]
pub struct Strategy {
    pub name: &'static str,
    pub risk: RiskLevel,
    /// Share of current usage the strategy reclaims.
    pub savings: f64,
    pub side_effect: &'static str,
}

pub const CATALOG: [Strategy; 6] = [
    Strategy {
        name: "deduplicate_context",
        risk: RiskLevel::Low,
        savings: 0.05,
        side_effect: "repeated file reads collapse to one copy",
    },
    Strategy {
        name: "prune_tool_output",
        risk: RiskLevel::Low,
        savings: 0.08,
        side_effect: "verbose tool output is trimmed to its summary",
    },
    Strategy {
        name: "summarize_completed_phases",
        risk: RiskLevel::Medium,
        savings: 0.15,
        side_effect: "finished phases are kept only as summaries",
    },
    Strategy {
        name: "compress_history",
        risk: RiskLevel::Medium,
        savings: 0.12,
        side_effect: "older conversation turns are compressed",
    },
    Strategy {
        name: "truncate_early_context",
        risk: RiskLevel::High,
        savings: 0.30,
        side_effect: "early context is dropped and cannot be referenced",
    },
    Strategy {
        name: "drop_reference_material",
        risk: RiskLevel::High,
        savings: 0.20,
        side_effect: "reference documents must be re-read when needed",
    },
];

#[derive(Debug, Default)]
pub struct Selection {
    pub applied: Vec<(Strategy, u64)>,
    pub blocked: Vec<&'static str>,
    pub saved: u64,
}

impl Selection {
    pub fn target_met(&self, target: u64) -> bool {
        self.saved >= target
    }
}

/// Pick strategies until `target` tokens are reclaimed or the catalog runs
/// out. High-risk strategies are blocked when functionality must be kept.
pub fn select(used: u64, target: u64, preserve_functionality: bool) -> Selection {
    let mut selection = Selection::default();
    for strategy in CATALOG {
        if selection.saved >= target {
            break;
        }
        if preserve_functionality && strategy.risk == RiskLevel::High {
            selection.blocked.push(strategy.name);
            continue;
        }
        let available = used.saturating_sub(selection.saved);
        let saving = ((used as f64 * strategy.savings).round() as u64).min(available);
        if saving == 0 {
            continue;
        }
        selection.saved += saving;
        selection.applied.push((strategy, saving));
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(selection: &Selection) -> Vec<&'static str> {
        selection.applied.iter().map(|(s, _)| s.name).collect()
    }

    #[test]
    fn stops_once_target_met() {
        let s = select(100_000, 4_000, true);
        assert_eq!(names(&s), vec!["deduplicate_context"]);
        assert_eq!(s.saved, 5_000);
        assert!(s.target_met(4_000));
        assert!(s.blocked.is_empty());
    }

    #[test]
    fn escalates_through_medium() {
        let s = select(100_000, 20_000, true);
        assert_eq!(
            names(&s),
            vec!["deduplicate_context", "prune_tool_output", "summarize_completed_phases"]
        );
        assert_eq!(s.saved, 28_000);
    }

    #[test]
    fn preserve_blocks_high_risk() {
        let s = select(100_000, 90_000, true);
        assert_eq!(s.saved, 40_000);
        assert!(!s.target_met(90_000));
        assert_eq!(s.blocked, vec!["truncate_early_context", "drop_reference_material"]);
    }

    #[test]
    fn high_risk_allowed_without_preserve() {
        let s = select(100_000, 60_000, false);
        assert!(names(&s).contains(&"truncate_early_context"));
        assert_eq!(s.saved, 70_000);
    }

    #[test]
    fn never_reclaims_more_than_used() {
        let s = select(10, 1_000_000, false);
        assert!(s.saved <= 10);
        assert_eq!(select(0, 100, false).applied.len(), 0);
    }
}
