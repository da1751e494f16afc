//! Trend classification and burn-rate projection over the usage ledger.

use chrono::{DateTime, Utc};

use keel_core::context::{ContextUsageRecord, UsageTrend};

/// Records that make up the "recent" window.
pub const RECENT_WINDOW: usize = 5;
/// A recent mean above this is critical regardless of history.
pub const CRITICAL_MEAN: f64 = 20_000.0;
/// A recent mean below this is stable regardless of history.
pub const STABLE_MEAN: f64 = 500.0;
const INCREASING_RATIO: f64 = 1.2;
const CRITICAL_RATIO: f64 = 1.5;

/// Consumption records only. Negative entries are reclamations.
pub fn consumption(records: &[ContextUsageRecord]) -> Vec<&ContextUsageRecord> {
    records.iter().filter(|r| r.tokens > 0).collect()
}

/// Index where the recent window starts.
fn recent_start(records: &[&ContextUsageRecord]) -> usize {
    records.len().saturating_sub(RECENT_WINDOW)
}

fn mean(records: &[&ContextUsageRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().map(|r| r.tokens as f64).sum::<f64>() / records.len() as f64
}

/// Classify consumption records given in time order.
pub fn classify(records: &[&ContextUsageRecord]) -> UsageTrend {
    let (older, recent) = records.split_at(recent_start(records));
    let recent_mean = mean(recent);

    if recent_mean > CRITICAL_MEAN {
        return UsageTrend::Critical;
    }
    if recent_mean < STABLE_MEAN || older.is_empty() {
        return UsageTrend::Stable;
    }

    let older_mean = mean(older);
    if older_mean <= 0.0 {
        return UsageTrend::Stable;
    }
    let ratio = recent_mean / older_mean;
    if ratio <= INCREASING_RATIO {
        UsageTrend::Stable
    } else if ratio <= CRITICAL_RATIO {
        UsageTrend::Increasing
    } else {
        UsageTrend::Critical
    }
}

/// Tokens per minute over the recent window. The window counts as at
/// least one minute long.
pub fn burn_rate(records: &[&ContextUsageRecord], now: DateTime<Utc>) -> f64 {
    let recent = &records[recent_start(records)..];
    let Some(first) = recent.first() else {
        return 0.0;
    };
    let minutes = now.signed_duration_since(first.recorded_at).num_milliseconds() as f64 / 60_000.0;
    let total: i64 = recent.iter().map(|r| r.tokens).sum();
    total as f64 / minutes.max(1.0)
}

pub fn minutes_to_exhaustion(remaining: u64, rate: f64) -> Option<f64> {
    if rate <= 0.0 {
        return None;
    }
    Some((remaining as f64 / rate * 10.0).round() / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keel_core::ids::{SessionId, UsageId};

    fn records(tokens: &[i64]) -> Vec<ContextUsageRecord> {
        let start = Utc::now() - Duration::minutes(tokens.len() as i64);
        tokens
            .iter()
            .enumerate()
            .map(|(i, t)| ContextUsageRecord {
                id: UsageId::new(),
                session_id: SessionId::from_raw("sess_t"),
                phase: "implement".into(),
                tokens: *t,
                operation: "op".into(),
                recorded_at: start + Duration::minutes(i as i64),
            })
            .collect()
    }

    fn trend(tokens: &[i64]) -> UsageTrend {
        let recs = records(tokens);
        classify(&consumption(&recs))
    }

    #[test]
    fn no_history_is_stable() {
        assert_eq!(trend(&[]), UsageTrend::Stable);
        assert_eq!(trend(&[1_000, 5_000]), UsageTrend::Stable);
    }

    #[test]
    fn huge_recent_mean_is_critical() {
        assert_eq!(trend(&[25_000]), UsageTrend::Critical);
    }

    #[test]
    fn small_recent_mean_is_stable() {
        assert_eq!(trend(&[10_000, 100, 100, 100, 100, 100]), UsageTrend::Stable);
    }

    #[test]
    fn ratio_bands() {
        // older mean 1000
        assert_eq!(trend(&[1_000, 1_100, 1_100, 1_100, 1_100, 1_100]), UsageTrend::Stable);
        assert_eq!(trend(&[1_000, 1_400, 1_400, 1_400, 1_400, 1_400]), UsageTrend::Increasing);
        assert_eq!(trend(&[1_000, 2_000, 2_000, 2_000, 2_000, 2_000]), UsageTrend::Critical);
    }

    #[test]
    fn reclamations_are_ignored() {
        assert_eq!(trend(&[1_000, -500, 1_100, 1_100, 1_100, 1_100, 1_100]), UsageTrend::Stable);
    }

    #[test]
    fn burn_rate_uses_recent_window() {
        let recs = records(&[600, 600]);
        let rate = burn_rate(&consumption(&recs), Utc::now());
        // two minutes of history, 1200 tokens
        assert!((rate - 600.0).abs() < 5.0, "rate {rate}");
        assert_eq!(minutes_to_exhaustion(6_000, 600.0), Some(10.0));
        assert_eq!(minutes_to_exhaustion(6_000, 0.0), None);
    }

    #[test]
    fn burn_rate_floors_window_at_one_minute() {
        let mut recs = records(&[300]);
        recs[0].recorded_at = Utc::now();
        assert_eq!(burn_rate(&consumption(&recs), Utc::now()), 300.0);
        assert_eq!(burn_rate(&[], Utc::now()), 0.0);
    }
}
