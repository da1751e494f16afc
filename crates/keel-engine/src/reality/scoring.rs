use keel_core::reality::{Discrepancy, MetricStatus, Severity};

const ACCURATE: f64 = 0.10;
const MINOR: f64 = 0.30;

/// 1.0 minus a penalty per discrepancy, floored at 0.
pub fn confidence(discrepancies: &[Discrepancy]) -> f64 {
    let penalty: f64 = discrepancies
        .iter()
        .map(|d| match d.severity {
            Severity::Critical => 0.2,
            Severity::Warning => 0.05,
            Severity::Info => 0.01,
        })
        .sum();
    ((1.0 - penalty).max(0.0) * 100.0).round() / 100.0
}

/// Relative variance `|reported - actual| / max(actual, 1)` and its band.
pub fn classify(reported: f64, actual: f64) -> (f64, MetricStatus) {
    let variance = (reported - actual).abs() / actual.max(1.0);
    let status = if variance <= ACCURATE {
        MetricStatus::Accurate
    } else if variance <= MINOR {
        MetricStatus::MinorVariance
    } else {
        MetricStatus::MajorVariance
    };
    ((variance * 1000.0).round() / 1000.0, status)
}
