//! Tiered pricing and billing-period arithmetic. All money math stays in
//! `Decimal`; floats only ever appear at the external boundary.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;

use crate::models::billing::{AlertDimension, BudgetPeriod, VolumeDiscountTier};

/// Units the per-unit prices are quoted against: spans per 100k, bytes per
/// GiB, scores per 1k.
pub fn dimension_unit(dimension: AlertDimension) -> Decimal {
    match dimension {
        AlertDimension::Spans => Decimal::from(100_000u64),
        AlertDimension::Bytes => Decimal::from(1_073_741_824u64),
        AlertDimension::Scores => Decimal::from(1_000u64),
        AlertDimension::Cost => Decimal::ONE,
    }
}

/// Plan base rates and free-tier allowances; contracts may override single
/// fields via their `pricing_override` JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanPricing {
    pub free_spans: u64,
    pub free_bytes: u64,
    pub free_scores: u64,
    pub span_price: Decimal,
    pub byte_price: Decimal,
    pub score_price: Decimal,
}

impl PlanPricing {
    pub fn for_plan(plan: &str) -> Self {
        match plan {
            "enterprise" => Self {
                free_spans: 100_000_000,
                free_bytes: 100 * 1_073_741_824,
                free_scores: 1_000_000,
                span_price: Decimal::new(25, 2),
                byte_price: Decimal::new(18, 2),
                score_price: Decimal::new(8, 2),
            },
            "pro" => Self {
                free_spans: 10_000_000,
                free_bytes: 10 * 1_073_741_824,
                free_scores: 100_000,
                span_price: Decimal::new(30, 2),
                byte_price: Decimal::new(22, 2),
                score_price: Decimal::new(10, 2),
            },
            // free plan: allowances only, overage billed at list price
            _ => Self {
                free_spans: 1_000_000,
                free_bytes: 1_073_741_824,
                free_scores: 10_000,
                span_price: Decimal::new(35, 2),
                byte_price: Decimal::new(25, 2),
                score_price: Decimal::new(12, 2),
            },
        }
    }

    pub fn with_override(mut self, pricing_override: &serde_json::Value) -> Self {
        let as_u64 = |key: &str| pricing_override.get(key).and_then(|v| v.as_u64());
        let as_price = |key: &str| {
            pricing_override
                .get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Decimal>().ok())
        };
        if let Some(v) = as_u64("free_spans") {
            self.free_spans = v;
        }
        if let Some(v) = as_u64("free_bytes") {
            self.free_bytes = v;
        }
        if let Some(v) = as_u64("free_scores") {
            self.free_scores = v;
        }
        if let Some(v) = as_price("span_price") {
            self.span_price = v;
        }
        if let Some(v) = as_price("byte_price") {
            self.byte_price = v;
        }
        if let Some(v) = as_price("score_price") {
            self.score_price = v;
        }
        self
    }

    pub fn free_allowance(&self, dimension: AlertDimension) -> u64 {
        match dimension {
            AlertDimension::Spans => self.free_spans,
            AlertDimension::Bytes => self.free_bytes,
            AlertDimension::Scores => self.free_scores,
            AlertDimension::Cost => 0,
        }
    }

    pub fn flat_price(&self, dimension: AlertDimension) -> Decimal {
        match dimension {
            AlertDimension::Spans => self.span_price,
            AlertDimension::Bytes => self.byte_price,
            AlertDimension::Scores => self.score_price,
            AlertDimension::Cost => Decimal::ZERO,
        }
    }
}

/// Progressive-tier cost for one dimension.
///
/// Tiers are half-open absolute ranges `[tier_min, tier_max)`; the billable
/// range is `[free, used)`. Each tier contributes
/// `max(0, min(used, tier_max) - max(free, tier_min)) / unit * price`.
/// Without tiers, falls back to flat `max(0, used - free) / unit * price`.
pub fn calculate_dimension_with_tiers(
    used: u64,
    free: u64,
    dimension: AlertDimension,
    tiers: &[VolumeDiscountTier],
    flat_price: Decimal,
) -> Decimal {
    let unit = dimension_unit(dimension);
    let applicable: Vec<&VolumeDiscountTier> =
        tiers.iter().filter(|t| t.dimension == dimension).collect();
    if applicable.is_empty() {
        let billable = used.saturating_sub(free);
        return Decimal::from(billable) / unit * flat_price;
    }

    let mut cost = Decimal::ZERO;
    for tier in applicable {
        let lo = tier.tier_min.max(free);
        let hi = tier.tier_max.map_or(used, |max| max.min(used));
        if hi > lo {
            cost += Decimal::from(hi - lo) / unit * tier.price_per_unit;
        }
    }
    cost
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// End of the billing cycle that started at `cycle_start` with the given
/// anchor day: one month later, clamped to that month's length, so a Jan 31
/// anchor rolls over on Feb 28/29 and recovers to the 31st when it can.
pub fn period_end(cycle_start: DateTime<Utc>, anchor_day: u32) -> DateTime<Utc> {
    let date = cycle_start.date_naive();
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let day = anchor_day.clamp(1, days_in_month(year, month));
    let end = NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or(date)
        .and_time(NaiveTime::MIN);
    DateTime::from_naive_utc_and_offset(end, Utc)
}

/// Start of the budget's current window: weekly budgets anchor to Monday
/// 00:00, monthly budgets to day 1 00:00.
pub fn budget_period_start(period: BudgetPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive();
    let start = match period {
        BudgetPeriod::Weekly => date
            .checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
            .unwrap_or(date),
        BudgetPeriod::Monthly => date.with_day(1).unwrap_or(date),
    };
    DateTime::from_naive_utc_and_offset(start.and_time(NaiveTime::MIN), Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn tier(
        dimension: AlertDimension,
        min: u64,
        max: Option<u64>,
        price: Decimal,
        priority: i32,
    ) -> VolumeDiscountTier {
        VolumeDiscountTier {
            dimension,
            tier_min: min,
            tier_max: max,
            price_per_unit: price,
            priority,
        }
    }

    #[test]
    fn volume_discount_across_tiers() {
        // 150M spans used, 50M free, $0.30/100k to 100M then $0.25/100k:
        // (100M-50M)/100k * 0.30 + (150M-100M)/100k * 0.25 = 150 + 125
        let tiers = vec![
            tier(AlertDimension::Spans, 0, Some(100_000_000), dec!(0.30), 0),
            tier(AlertDimension::Spans, 100_000_000, None, dec!(0.25), 1),
        ];
        let cost = calculate_dimension_with_tiers(
            150_000_000,
            50_000_000,
            AlertDimension::Spans,
            &tiers,
            dec!(0.30),
        );
        assert_eq!(cost, dec!(275.00));
    }

    #[test]
    fn tiers_covering_everything_bill_exactly_the_overage() {
        let tiers = vec![
            tier(AlertDimension::Scores, 0, Some(5_000), dec!(1), 0),
            tier(AlertDimension::Scores, 5_000, Some(20_000), dec!(1), 1),
            tier(AlertDimension::Scores, 20_000, None, dec!(1), 2),
        ];
        for (used, free) in [(0u64, 0u64), (4_000, 1_000), (25_000, 6_000), (25_000, 0)] {
            let cost =
                calculate_dimension_with_tiers(used, free, AlertDimension::Scores, &tiers, dec!(1));
            let expected = Decimal::from(used.saturating_sub(free)) / dec!(1000);
            assert_eq!(cost, expected, "used={used} free={free}");
        }
    }

    #[test]
    fn usage_within_free_tier_costs_nothing() {
        let tiers = vec![tier(AlertDimension::Spans, 0, None, dec!(0.30), 0)];
        let cost = calculate_dimension_with_tiers(
            40_000,
            100_000,
            AlertDimension::Spans,
            &tiers,
            dec!(0.30),
        );
        assert_eq!(cost, Decimal::ZERO);
    }

    #[test]
    fn flat_fallback_when_no_tiers_configured() {
        let cost = calculate_dimension_with_tiers(
            2_147_483_648, // 2 GiB
            0,
            AlertDimension::Bytes,
            &[],
            dec!(0.25),
        );
        assert_eq!(cost, dec!(0.50));
    }

    #[test]
    fn tiers_for_other_dimensions_are_ignored() {
        let tiers = vec![tier(AlertDimension::Bytes, 0, None, dec!(9.99), 0)];
        let cost =
            calculate_dimension_with_tiers(200_000, 0, AlertDimension::Spans, &tiers, dec!(0.30));
        assert_eq!(cost, dec!(0.60));
    }

    #[test]
    fn period_end_clamps_to_month_length() {
        let jan31_leap = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(
            period_end(jan31_leap, 31),
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap()
        );

        let jan31 = Utc.with_ymd_and_hms(2023, 1, 31, 0, 0, 0).unwrap();
        assert_eq!(
            period_end(jan31, 31),
            Utc.with_ymd_and_hms(2023, 2, 28, 0, 0, 0).unwrap()
        );

        let mid_march = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(
            period_end(mid_march, 15),
            Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn period_end_recovers_anchor_after_short_month() {
        // A Jan 31 anchor that rolled to Feb 29 comes back to Mar 31.
        let feb29 = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        assert_eq!(
            period_end(feb29, 31),
            Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn period_end_crosses_year_boundary() {
        let dec15 = Utc.with_ymd_and_hms(2024, 12, 15, 0, 0, 0).unwrap();
        assert_eq!(
            period_end(dec15, 15),
            Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn weekly_budgets_anchor_to_monday() {
        // 2024-05-01 is a Wednesday
        let wednesday = Utc.with_ymd_and_hms(2024, 5, 1, 15, 30, 0).unwrap();
        assert_eq!(
            budget_period_start(BudgetPeriod::Weekly, wednesday),
            Utc.with_ymd_and_hms(2024, 4, 29, 0, 0, 0).unwrap()
        );
        // Mondays anchor to themselves
        let monday = Utc.with_ymd_and_hms(2024, 4, 29, 8, 0, 0).unwrap();
        assert_eq!(
            budget_period_start(BudgetPeriod::Weekly, monday),
            Utc.with_ymd_and_hms(2024, 4, 29, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn monthly_budgets_anchor_to_day_one() {
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 9, 0, 0).unwrap();
        assert_eq!(
            budget_period_start(BudgetPeriod::Monthly, now),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn contract_override_replaces_single_fields() {
        let base = PlanPricing::for_plan("pro");
        let merged = base.clone().with_override(&serde_json::json!({
            "span_price": "0.21",
            "free_spans": 50_000_000u64,
        }));
        assert_eq!(merged.span_price, dec!(0.21));
        assert_eq!(merged.free_spans, 50_000_000);
        assert_eq!(merged.byte_price, base.byte_price);
    }
}
