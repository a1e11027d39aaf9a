//! Budget evaluation: per-dimension threshold checks with highest-reached
//! selection, severity mapping, and 24h alert de-duplication.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::billing_db::BillingDb;
use crate::models::billing::{AlertDimension, AlertSeverity, AlertStatus, UsageAlert, UsageBudget};

const DEDUPE_WINDOW_HOURS: i64 = 24;

pub fn severity_for_threshold(threshold: u32) -> AlertSeverity {
    if threshold >= 100 {
        AlertSeverity::Critical
    } else if threshold >= 80 {
        AlertSeverity::Warning
    } else {
        AlertSeverity::Info
    }
}

/// Highest threshold met by the current usage. `thresholds` is sorted
/// ascending; the walk is descending so the first hit wins.
pub fn highest_met_threshold(thresholds: &[u32], percent_used: f64) -> Option<u32> {
    thresholds
        .iter()
        .rev()
        .find(|&&t| percent_used >= f64::from(t))
        .copied()
}

/// Cost values are stored in alerts as integer cents.
pub fn to_cents(amount: Decimal) -> i64 {
    (amount * Decimal::from(100)).round().to_i64().unwrap_or(i64::MAX)
}

/// The dimensions a budget actually constrains: (dimension, actual, limit),
/// cost in cents, everything else in raw units. A zero limit disables the
/// dimension.
fn constrained_dimensions(budget: &UsageBudget) -> Vec<(AlertDimension, i64, i64)> {
    let mut dims = Vec::new();
    if budget.span_limit > 0 {
        dims.push((
            AlertDimension::Spans,
            budget.current_spans as i64,
            budget.span_limit as i64,
        ));
    }
    if budget.bytes_limit > 0 {
        dims.push((
            AlertDimension::Bytes,
            budget.current_bytes as i64,
            budget.bytes_limit as i64,
        ));
    }
    if budget.score_limit > 0 {
        dims.push((
            AlertDimension::Scores,
            budget.current_scores as i64,
            budget.score_limit as i64,
        ));
    }
    if budget.cost_limit > Decimal::ZERO {
        dims.push((
            AlertDimension::Cost,
            to_cents(budget.current_cost),
            to_cents(budget.cost_limit),
        ));
    }
    dims
}

/// Evaluate one budget and persist at most one new alert per dimension.
/// Returns the alerts created this tick (deduped ones are skipped).
pub fn evaluate_budget(
    db: &BillingDb,
    budget: &UsageBudget,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<UsageAlert>> {
    if budget.thresholds.is_empty() {
        return Ok(Vec::new());
    }
    let mut thresholds = budget.thresholds.clone();
    thresholds.sort_unstable();

    let since = now - Duration::hours(DEDUPE_WINDOW_HOURS);
    let mut created = Vec::new();
    for (dimension, actual, limit) in constrained_dimensions(budget) {
        let percent_used = actual as f64 / limit as f64 * 100.0;
        let Some(threshold) = highest_met_threshold(&thresholds, percent_used) else {
            continue;
        };
        if db.has_recent_unresolved_alert(&budget.id, dimension, threshold, since)? {
            tracing::debug!(
                "budget {}: {}@{threshold}% already alerted within {DEDUPE_WINDOW_HOURS}h",
                budget.id,
                dimension.as_str()
            );
            continue;
        }
        let alert = UsageAlert {
            id: uuid::Uuid::new_v4().to_string(),
            budget_id: budget.id.clone(),
            organization_id: budget.organization_id.clone(),
            project_id: budget.project_id.clone(),
            threshold,
            dimension,
            severity: severity_for_threshold(threshold),
            threshold_value: limit * i64::from(threshold) / 100,
            actual_value: actual,
            percent_used,
            status: AlertStatus::Triggered,
            triggered_at: now,
            notified_at: None,
        };
        db.create_alert(&alert)?;
        tracing::info!(
            "budget {}: {} at {:.1}% of limit, alerting at {threshold}% ({})",
            budget.id,
            dimension.as_str(),
            percent_used,
            alert.severity.as_str()
        );
        created.push(alert);
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::billing::BudgetPeriod;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn budget(org: &str) -> UsageBudget {
        UsageBudget {
            id: "b1".to_string(),
            organization_id: org.to_string(),
            project_id: None,
            budget_type: BudgetPeriod::Monthly,
            thresholds: vec![50, 80, 100],
            span_limit: 1_000_000,
            bytes_limit: 0,
            score_limit: 0,
            cost_limit: Decimal::ZERO,
            current_spans: 0,
            current_bytes: 0,
            current_scores: 0,
            current_cost: Decimal::ZERO,
            enabled: true,
        }
    }

    #[test]
    fn severity_bands() {
        assert_eq!(severity_for_threshold(50), AlertSeverity::Info);
        assert_eq!(severity_for_threshold(79), AlertSeverity::Info);
        assert_eq!(severity_for_threshold(80), AlertSeverity::Warning);
        assert_eq!(severity_for_threshold(100), AlertSeverity::Critical);
        assert_eq!(severity_for_threshold(150), AlertSeverity::Critical);
    }

    #[test]
    fn highest_reached_threshold_wins() {
        let thresholds = vec![50, 80, 100];
        assert_eq!(highest_met_threshold(&thresholds, 49.9), None);
        assert_eq!(highest_met_threshold(&thresholds, 50.0), Some(50));
        assert_eq!(highest_met_threshold(&thresholds, 82.0), Some(80));
        assert_eq!(highest_met_threshold(&thresholds, 140.0), Some(100));
    }

    #[test]
    fn cents_conversion_rounds() {
        assert_eq!(to_cents(dec!(275.00)), 27_500);
        assert_eq!(to_cents(dec!(0.005)), 1);
        assert_eq!(to_cents(Decimal::ZERO), 0);
    }

    #[test]
    fn spans_at_82_percent_triggers_warning_at_80() {
        let db = BillingDb::open_in_memory().unwrap();
        let mut b = budget("org-1");
        b.current_spans = 820_000;
        db.put_usage_budget(&b).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let alerts = evaluate_budget(&db, &b, now).unwrap();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.threshold, 80);
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert_eq!(alert.threshold_value, 800_000);
        assert_eq!(alert.actual_value, 820_000);
        assert!((alert.percent_used - 82.0).abs() < 1e-9);
    }

    #[test]
    fn one_alert_per_dimension_at_highest_threshold() {
        let db = BillingDb::open_in_memory().unwrap();
        let mut b = budget("org-1");
        b.current_spans = 1_500_000; // blows through 50, 80 and 100
        b.cost_limit = dec!(100);
        b.current_cost = dec!(85); // between 80 and 100
        db.put_usage_budget(&b).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let alerts = evaluate_budget(&db, &b, now).unwrap();
        assert_eq!(alerts.len(), 2);
        let spans = alerts
            .iter()
            .find(|a| a.dimension == AlertDimension::Spans)
            .unwrap();
        assert_eq!(spans.threshold, 100);
        assert_eq!(spans.severity, AlertSeverity::Critical);
        let cost = alerts
            .iter()
            .find(|a| a.dimension == AlertDimension::Cost)
            .unwrap();
        assert_eq!(cost.threshold, 80);
        assert_eq!(cost.actual_value, 8_500);
        assert_eq!(cost.threshold_value, 8_000);
    }

    #[test]
    fn unresolved_alert_within_window_suppresses() {
        let db = BillingDb::open_in_memory().unwrap();
        let mut b = budget("org-1");
        b.current_spans = 820_000;
        db.put_usage_budget(&b).unwrap();

        let first_tick = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(evaluate_budget(&db, &b, first_tick).unwrap().len(), 1);

        // Next tick five minutes later: suppressed.
        let next_tick = first_tick + Duration::minutes(5);
        assert!(evaluate_budget(&db, &b, next_tick).unwrap().is_empty());

        // A tick past the 24h window fires again.
        let much_later = first_tick + Duration::hours(25);
        assert_eq!(evaluate_budget(&db, &b, much_later).unwrap().len(), 1);
    }

    #[test]
    fn zero_limits_disable_dimensions() {
        let db = BillingDb::open_in_memory().unwrap();
        let mut b = budget("org-1");
        b.span_limit = 0;
        b.current_spans = 999_999_999;
        db.put_usage_budget(&b).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(evaluate_budget(&db, &b, now).unwrap().is_empty());
    }
}
