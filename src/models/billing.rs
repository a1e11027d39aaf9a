use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-organization billing state, mirrored from OLAP totals every sync tick.
/// `current_period_*` always reflect `[billing_cycle_start, now)`.
#[derive(Debug, Clone)]
pub struct OrganizationBilling {
    pub organization_id: String,
    pub plan: String,
    pub billing_cycle_start: DateTime<Utc>,
    /// Day-of-month the cycle anchors to, 1..=31, clamped to month length.
    pub billing_cycle_anchor_day: u32,
    pub current_period_spans: u64,
    pub current_period_bytes: u64,
    pub current_period_scores: u64,
    pub current_period_cost: Decimal,
    pub free_spans_remaining: u64,
    pub free_bytes_remaining: u64,
    pub free_scores_remaining: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetPeriod {
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetPeriod::Weekly => "weekly",
            BudgetPeriod::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weekly" => Some(BudgetPeriod::Weekly),
            "monthly" => Some(BudgetPeriod::Monthly),
            _ => None,
        }
    }
}

/// A tenant-defined set of per-period limits with alert thresholds.
/// A zero limit disables that dimension.
#[derive(Debug, Clone)]
pub struct UsageBudget {
    pub id: String,
    pub organization_id: String,
    pub project_id: Option<String>,
    pub budget_type: BudgetPeriod,
    /// Kept sorted ascending; evaluation walks them descending.
    pub thresholds: Vec<u32>,
    pub span_limit: u64,
    pub bytes_limit: u64,
    pub score_limit: u64,
    pub cost_limit: Decimal,
    pub current_spans: u64,
    pub current_bytes: u64,
    pub current_scores: u64,
    pub current_cost: Decimal,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertDimension {
    Spans,
    Bytes,
    Scores,
    Cost,
}

impl AlertDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertDimension::Spans => "spans",
            AlertDimension::Bytes => "bytes",
            AlertDimension::Scores => "scores",
            AlertDimension::Cost => "cost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spans" => Some(AlertDimension::Spans),
            "bytes" => Some(AlertDimension::Bytes),
            "scores" => Some(AlertDimension::Scores),
            "cost" => Some(AlertDimension::Cost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(AlertSeverity::Info),
            "warning" => Some(AlertSeverity::Warning),
            "critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Triggered,
    Acked,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Triggered => "triggered",
            AlertStatus::Acked => "acked",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "triggered" => Some(AlertStatus::Triggered),
            "acked" => Some(AlertStatus::Acked),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

/// A budget threshold breach. At most one active alert exists per
/// (budget_id, dimension, threshold) within any 24h window.
#[derive(Debug, Clone)]
pub struct UsageAlert {
    pub id: String,
    pub budget_id: String,
    pub organization_id: String,
    pub project_id: Option<String>,
    pub threshold: u32,
    pub dimension: AlertDimension,
    pub severity: AlertSeverity,
    /// Integer cents for cost, raw units for the other dimensions.
    pub threshold_value: i64,
    pub actual_value: i64,
    pub percent_used: f64,
    pub status: AlertStatus,
    pub triggered_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
}

/// Half-open absolute pricing range `[tier_min, tier_max)`; `tier_max = None`
/// means unbounded. Coordinates are pre-free-tier.
#[derive(Debug, Clone)]
pub struct VolumeDiscountTier {
    pub dimension: AlertDimension,
    pub tier_min: u64,
    pub tier_max: Option<u64>,
    pub price_per_unit: Decimal,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractStatus {
    Active,
    Expired,
}

impl ContractStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractStatus::Active => "active",
            ContractStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ContractStatus::Active),
            "expired" => Some(ContractStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Contract {
    pub id: String,
    pub organization_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// JSON object overriding individual plan pricing fields.
    pub pricing_override: serde_json::Value,
    pub status: ContractStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::Critical);
    }

    #[test]
    fn enum_string_round_trips() {
        for d in [
            AlertDimension::Spans,
            AlertDimension::Bytes,
            AlertDimension::Scores,
            AlertDimension::Cost,
        ] {
            assert_eq!(AlertDimension::parse(d.as_str()), Some(d));
        }
        for s in [AlertStatus::Triggered, AlertStatus::Acked, AlertStatus::Resolved] {
            assert_eq!(AlertStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(BudgetPeriod::parse("weekly"), Some(BudgetPeriod::Weekly));
        assert_eq!(BudgetPeriod::parse("quarterly"), None);
    }
}
