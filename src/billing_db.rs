use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, params};
use rust_decimal::Decimal;
use std::sync::Mutex;

use crate::models::billing::{
    AlertDimension, AlertStatus, BudgetPeriod, Contract, ContractStatus, OrganizationBilling,
    UsageAlert, UsageBudget, VolumeDiscountTier,
};

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or(NaiveDate::MIN)
}

fn parse_decimal(s: &str) -> Decimal {
    s.parse().unwrap_or(Decimal::ZERO)
}

pub struct BillingDb {
    conn: Mutex<Connection>,
}

impl BillingDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS organization_billing (
                organization_id          TEXT PRIMARY KEY,
                plan                     TEXT NOT NULL DEFAULT 'free',
                billing_cycle_start      TEXT NOT NULL,
                billing_cycle_anchor_day INTEGER NOT NULL CHECK(billing_cycle_anchor_day BETWEEN 1 AND 31),
                current_period_spans     INTEGER NOT NULL DEFAULT 0,
                current_period_bytes     INTEGER NOT NULL DEFAULT 0,
                current_period_scores    INTEGER NOT NULL DEFAULT 0,
                current_period_cost      TEXT NOT NULL DEFAULT '0',
                free_spans_remaining     INTEGER NOT NULL DEFAULT 0,
                free_bytes_remaining     INTEGER NOT NULL DEFAULT 0,
                free_scores_remaining    INTEGER NOT NULL DEFAULT 0,
                last_synced_at           TEXT
            );

            CREATE TABLE IF NOT EXISTS usage_budget (
                id              TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                project_id      TEXT,
                budget_type     TEXT NOT NULL CHECK(budget_type IN ('weekly','monthly')),
                thresholds      TEXT NOT NULL DEFAULT '[]',
                span_limit      INTEGER NOT NULL DEFAULT 0,
                bytes_limit     INTEGER NOT NULL DEFAULT 0,
                score_limit     INTEGER NOT NULL DEFAULT 0,
                cost_limit      TEXT NOT NULL DEFAULT '0',
                current_spans   INTEGER NOT NULL DEFAULT 0,
                current_bytes   INTEGER NOT NULL DEFAULT 0,
                current_scores  INTEGER NOT NULL DEFAULT 0,
                current_cost    TEXT NOT NULL DEFAULT '0',
                enabled         INTEGER NOT NULL DEFAULT 1,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_budget_org ON usage_budget(organization_id);

            CREATE TABLE IF NOT EXISTS usage_alert (
                id              TEXT PRIMARY KEY,
                budget_id       TEXT NOT NULL REFERENCES usage_budget(id) ON DELETE CASCADE,
                organization_id TEXT NOT NULL,
                project_id      TEXT,
                threshold       INTEGER NOT NULL,
                dimension       TEXT NOT NULL CHECK(dimension IN ('spans','bytes','scores','cost')),
                severity        TEXT NOT NULL CHECK(severity IN ('info','warning','critical')),
                threshold_value INTEGER NOT NULL,
                actual_value    INTEGER NOT NULL,
                percent_used    REAL NOT NULL,
                status          TEXT NOT NULL DEFAULT 'triggered' CHECK(status IN ('triggered','acked','resolved')),
                triggered_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                notified_at     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alert_dedupe
                ON usage_alert(budget_id, dimension, threshold, triggered_at DESC);

            CREATE TABLE IF NOT EXISTS volume_discount_tier (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                dimension      TEXT NOT NULL CHECK(dimension IN ('spans','bytes','scores','cost')),
                tier_min       INTEGER NOT NULL,
                tier_max       INTEGER,
                price_per_unit TEXT NOT NULL,
                priority       INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS contract (
                id               TEXT PRIMARY KEY,
                organization_id  TEXT NOT NULL,
                start_date       TEXT NOT NULL,
                end_date         TEXT NOT NULL,
                pricing_override TEXT NOT NULL DEFAULT '{}',
                status           TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','expired'))
            );
            CREATE INDEX IF NOT EXISTS idx_contract_org ON contract(organization_id, status);
            ",
        )?;
        Ok(())
    }

    // ── Organization billing ──

    pub fn put_organization_billing(&self, billing: &OrganizationBilling) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO organization_billing \
             (organization_id, plan, billing_cycle_start, billing_cycle_anchor_day, \
              current_period_spans, current_period_bytes, current_period_scores, current_period_cost, \
              free_spans_remaining, free_bytes_remaining, free_scores_remaining, last_synced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                billing.organization_id,
                billing.plan,
                fmt_ts(billing.billing_cycle_start),
                billing.billing_cycle_anchor_day,
                billing.current_period_spans as i64,
                billing.current_period_bytes as i64,
                billing.current_period_scores as i64,
                billing.current_period_cost.to_string(),
                billing.free_spans_remaining as i64,
                billing.free_bytes_remaining as i64,
                billing.free_scores_remaining as i64,
                billing.last_synced_at.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_organization_billing(
        &self,
        organization_id: &str,
    ) -> anyhow::Result<Option<OrganizationBilling>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT organization_id, plan, billing_cycle_start, billing_cycle_anchor_day, \
             current_period_spans, current_period_bytes, current_period_scores, current_period_cost, \
             free_spans_remaining, free_bytes_remaining, free_scores_remaining, last_synced_at \
             FROM organization_billing WHERE organization_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![organization_id], |row| {
            Ok(OrganizationBilling {
                organization_id: row.get(0)?,
                plan: row.get(1)?,
                billing_cycle_start: parse_ts(&row.get::<_, String>(2)?),
                billing_cycle_anchor_day: row.get(3)?,
                current_period_spans: row.get::<_, i64>(4)? as u64,
                current_period_bytes: row.get::<_, i64>(5)? as u64,
                current_period_scores: row.get::<_, i64>(6)? as u64,
                current_period_cost: parse_decimal(&row.get::<_, String>(7)?),
                free_spans_remaining: row.get::<_, i64>(8)? as u64,
                free_bytes_remaining: row.get::<_, i64>(9)? as u64,
                free_scores_remaining: row.get::<_, i64>(10)? as u64,
                last_synced_at: row.get::<_, Option<String>>(11)?.map(|s| parse_ts(&s)),
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_billing_organizations(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT organization_id FROM organization_billing ORDER BY organization_id")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_billing_usage(
        &self,
        organization_id: &str,
        spans: u64,
        bytes: u64,
        scores: u64,
        cost: Decimal,
        free_spans_remaining: u64,
        free_bytes_remaining: u64,
        free_scores_remaining: u64,
        synced_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE organization_billing SET \
             current_period_spans = ?2, current_period_bytes = ?3, current_period_scores = ?4, \
             current_period_cost = ?5, free_spans_remaining = ?6, free_bytes_remaining = ?7, \
             free_scores_remaining = ?8, last_synced_at = ?9 \
             WHERE organization_id = ?1",
            params![
                organization_id,
                spans as i64,
                bytes as i64,
                scores as i64,
                cost.to_string(),
                free_spans_remaining as i64,
                free_bytes_remaining as i64,
                free_scores_remaining as i64,
                fmt_ts(synced_at),
            ],
        )?;
        Ok(())
    }

    /// Cycle rollover: zero the period counters, restore the plan's free
    /// allowances, and advance the cycle start.
    pub fn reset_period(
        &self,
        organization_id: &str,
        new_cycle_start: DateTime<Utc>,
        free_spans: u64,
        free_bytes: u64,
        free_scores: u64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE organization_billing SET \
             billing_cycle_start = ?2, current_period_spans = 0, current_period_bytes = 0, \
             current_period_scores = 0, current_period_cost = '0', \
             free_spans_remaining = ?3, free_bytes_remaining = ?4, free_scores_remaining = ?5 \
             WHERE organization_id = ?1",
            params![
                organization_id,
                fmt_ts(new_cycle_start),
                free_spans as i64,
                free_bytes as i64,
                free_scores as i64,
            ],
        )?;
        Ok(())
    }

    // ── Budgets ──

    pub fn put_usage_budget(&self, budget: &UsageBudget) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO usage_budget \
             (id, organization_id, project_id, budget_type, thresholds, span_limit, bytes_limit, \
              score_limit, cost_limit, current_spans, current_bytes, current_scores, current_cost, enabled) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                budget.id,
                budget.organization_id,
                budget.project_id,
                budget.budget_type.as_str(),
                serde_json::to_string(&budget.thresholds)?,
                budget.span_limit as i64,
                budget.bytes_limit as i64,
                budget.score_limit as i64,
                budget.cost_limit.to_string(),
                budget.current_spans as i64,
                budget.current_bytes as i64,
                budget.current_scores as i64,
                budget.current_cost.to_string(),
                budget.enabled,
            ],
        )?;
        Ok(())
    }

    /// Enabled budgets owned by an organization; thresholds come back sorted
    /// ascending, the shape evaluation expects.
    pub fn list_active_budgets(&self, organization_id: &str) -> anyhow::Result<Vec<UsageBudget>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, project_id, budget_type, thresholds, span_limit, \
             bytes_limit, score_limit, cost_limit, current_spans, current_bytes, current_scores, \
             current_cost, enabled \
             FROM usage_budget WHERE organization_id = ?1 AND enabled = 1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![organization_id], |row| {
                let mut thresholds: Vec<u32> =
                    serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default();
                thresholds.sort_unstable();
                Ok(UsageBudget {
                    id: row.get(0)?,
                    organization_id: row.get(1)?,
                    project_id: row.get(2)?,
                    budget_type: BudgetPeriod::parse(&row.get::<_, String>(3)?)
                        .unwrap_or(BudgetPeriod::Monthly),
                    thresholds,
                    span_limit: row.get::<_, i64>(5)? as u64,
                    bytes_limit: row.get::<_, i64>(6)? as u64,
                    score_limit: row.get::<_, i64>(7)? as u64,
                    cost_limit: parse_decimal(&row.get::<_, String>(8)?),
                    current_spans: row.get::<_, i64>(9)? as u64,
                    current_bytes: row.get::<_, i64>(10)? as u64,
                    current_scores: row.get::<_, i64>(11)? as u64,
                    current_cost: parse_decimal(&row.get::<_, String>(12)?),
                    enabled: row.get(13)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_budget_usage(
        &self,
        budget_id: &str,
        spans: u64,
        bytes: u64,
        scores: u64,
        cost: Decimal,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE usage_budget SET current_spans = ?2, current_bytes = ?3, current_scores = ?4, \
             current_cost = ?5, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1",
            params![
                budget_id,
                spans as i64,
                bytes as i64,
                scores as i64,
                cost.to_string(),
            ],
        )?;
        Ok(())
    }

    // ── Alerts ──

    pub fn create_alert(&self, alert: &UsageAlert) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO usage_alert \
             (id, budget_id, organization_id, project_id, threshold, dimension, severity, \
              threshold_value, actual_value, percent_used, status, triggered_at, notified_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                alert.id,
                alert.budget_id,
                alert.organization_id,
                alert.project_id,
                alert.threshold,
                alert.dimension.as_str(),
                alert.severity.as_str(),
                alert.threshold_value,
                alert.actual_value,
                alert.percent_used,
                alert.status.as_str(),
                fmt_ts(alert.triggered_at),
                alert.notified_at.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    /// Dedupe gate: an unresolved alert for the same (budget, dimension,
    /// threshold) triggered at or after `since` suppresses a new one.
    pub fn has_recent_unresolved_alert(
        &self,
        budget_id: &str,
        dimension: AlertDimension,
        threshold: u32,
        since: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM usage_alert \
             WHERE budget_id = ?1 AND dimension = ?2 AND threshold = ?3 \
             AND status != 'resolved' AND triggered_at >= ?4",
            params![budget_id, dimension.as_str(), threshold, fmt_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn update_alert_status(&self, alert_id: &str, status: AlertStatus) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE usage_alert SET status = ?2 WHERE id = ?1",
            params![alert_id, status.as_str()],
        )?;
        Ok(count > 0)
    }

    pub fn mark_alert_notified(&self, alert_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE usage_alert SET notified_at = ?2 WHERE id = ?1",
            params![alert_id, fmt_ts(at)],
        )?;
        Ok(())
    }

    // ── Volume discount tiers ──

    pub fn add_tier(&self, tier: &VolumeDiscountTier) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO volume_discount_tier (dimension, tier_min, tier_max, price_per_unit, priority) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tier.dimension.as_str(),
                tier.tier_min as i64,
                tier.tier_max.map(|m| m as i64),
                tier.price_per_unit.to_string(),
                tier.priority,
            ],
        )?;
        Ok(())
    }

    pub fn list_tiers(&self, dimension: AlertDimension) -> anyhow::Result<Vec<VolumeDiscountTier>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT dimension, tier_min, tier_max, price_per_unit, priority \
             FROM volume_discount_tier WHERE dimension = ?1 ORDER BY priority, tier_min",
        )?;
        let rows = stmt
            .query_map(params![dimension.as_str()], |row| {
                Ok(VolumeDiscountTier {
                    dimension: AlertDimension::parse(&row.get::<_, String>(0)?)
                        .unwrap_or(AlertDimension::Spans),
                    tier_min: row.get::<_, i64>(1)? as u64,
                    tier_max: row.get::<_, Option<i64>>(2)?.map(|m| m as u64),
                    price_per_unit: parse_decimal(&row.get::<_, String>(3)?),
                    priority: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Contracts ──

    pub fn put_contract(&self, contract: &Contract) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO contract \
             (id, organization_id, start_date, end_date, pricing_override, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                contract.id,
                contract.organization_id,
                fmt_date(contract.start_date),
                fmt_date(contract.end_date),
                contract.pricing_override.to_string(),
                contract.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn contract_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contract> {
        Ok(Contract {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            start_date: parse_date(&row.get::<_, String>(2)?),
            end_date: parse_date(&row.get::<_, String>(3)?),
            pricing_override: serde_json::from_str(&row.get::<_, String>(4)?)
                .unwrap_or(serde_json::json!({})),
            status: ContractStatus::parse(&row.get::<_, String>(5)?)
                .unwrap_or(ContractStatus::Expired),
        })
    }

    /// The active contract covering `today`, if any.
    pub fn active_contract(
        &self,
        organization_id: &str,
        today: NaiveDate,
    ) -> anyhow::Result<Option<Contract>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, start_date, end_date, pricing_override, status \
             FROM contract WHERE organization_id = ?1 AND status = 'active' \
             AND start_date <= ?2 AND end_date >= ?2 ORDER BY end_date DESC",
        )?;
        let mut rows = stmt.query_map(params![organization_id, fmt_date(today)], |row| {
            Self::contract_from_row(row)
        })?;
        Ok(rows.next().transpose()?)
    }

    /// Active contracts whose end date lies strictly before `today`.
    pub fn expiring_contracts(&self, today: NaiveDate) -> anyhow::Result<Vec<Contract>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, start_date, end_date, pricing_override, status \
             FROM contract WHERE status = 'active' AND end_date < ?1",
        )?;
        let rows = stmt
            .query_map(params![fmt_date(today)], |row| Self::contract_from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn expire_contract(&self, contract_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE contract SET status = 'expired' WHERE id = ?1 AND status = 'active'",
            params![contract_id],
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn billing(org: &str) -> OrganizationBilling {
        OrganizationBilling {
            organization_id: org.to_string(),
            plan: "pro".to_string(),
            billing_cycle_start: Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
            billing_cycle_anchor_day: 31,
            current_period_spans: 1_000,
            current_period_bytes: 2_000,
            current_period_scores: 30,
            current_period_cost: dec!(12.34),
            free_spans_remaining: 500,
            free_bytes_remaining: 600,
            free_scores_remaining: 70,
            last_synced_at: None,
        }
    }

    fn budget(id: &str, org: &str) -> UsageBudget {
        UsageBudget {
            id: id.to_string(),
            organization_id: org.to_string(),
            project_id: None,
            budget_type: BudgetPeriod::Monthly,
            thresholds: vec![100, 50, 80],
            span_limit: 1_000_000,
            bytes_limit: 0,
            score_limit: 0,
            cost_limit: dec!(500),
            current_spans: 0,
            current_bytes: 0,
            current_scores: 0,
            current_cost: Decimal::ZERO,
            enabled: true,
        }
    }

    #[test]
    fn billing_state_round_trips() {
        let db = BillingDb::open_in_memory().unwrap();
        db.put_organization_billing(&billing("org-1")).unwrap();

        let loaded = db.get_organization_billing("org-1").unwrap().unwrap();
        assert_eq!(loaded.plan, "pro");
        assert_eq!(loaded.billing_cycle_anchor_day, 31);
        assert_eq!(loaded.current_period_cost, dec!(12.34));
        assert!(loaded.last_synced_at.is_none());
        assert!(db.get_organization_billing("nope").unwrap().is_none());
        assert_eq!(db.list_billing_organizations().unwrap(), vec!["org-1"]);
    }

    #[test]
    fn on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("billing.db");
        let path = path.to_str().unwrap();
        {
            let db = BillingDb::open(path).unwrap();
            db.put_organization_billing(&billing("org-1")).unwrap();
        }
        let db = BillingDb::open(path).unwrap();
        let loaded = db.get_organization_billing("org-1").unwrap().unwrap();
        assert_eq!(loaded.plan, "pro");
        assert_eq!(loaded.current_period_cost, dec!(12.34));
    }

    #[test]
    fn reset_period_zeroes_counters_and_advances_cycle() {
        let db = BillingDb::open_in_memory().unwrap();
        db.put_organization_billing(&billing("org-1")).unwrap();

        let new_start = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        db.reset_period("org-1", new_start, 10_000_000, 999, 111).unwrap();

        let loaded = db.get_organization_billing("org-1").unwrap().unwrap();
        assert_eq!(loaded.billing_cycle_start, new_start);
        assert_eq!(loaded.current_period_spans, 0);
        assert_eq!(loaded.current_period_cost, Decimal::ZERO);
        assert_eq!(loaded.free_spans_remaining, 10_000_000);
        assert_eq!(loaded.free_bytes_remaining, 999);
    }

    #[test]
    fn budgets_load_with_sorted_thresholds() {
        let db = BillingDb::open_in_memory().unwrap();
        db.put_usage_budget(&budget("b1", "org-1")).unwrap();
        let mut disabled = budget("b2", "org-1");
        disabled.enabled = false;
        db.put_usage_budget(&disabled).unwrap();

        let budgets = db.list_active_budgets("org-1").unwrap();
        assert_eq!(budgets.len(), 1);
        assert_eq!(budgets[0].thresholds, vec![50, 80, 100]);

        db.update_budget_usage("b1", 42, 0, 0, dec!(1.50)).unwrap();
        let budgets = db.list_active_budgets("org-1").unwrap();
        assert_eq!(budgets[0].current_spans, 42);
        assert_eq!(budgets[0].current_cost, dec!(1.50));
    }

    #[test]
    fn alert_dedupe_window() {
        let db = BillingDb::open_in_memory().unwrap();
        db.put_usage_budget(&budget("b1", "org-1")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let alert = UsageAlert {
            id: "a1".to_string(),
            budget_id: "b1".to_string(),
            organization_id: "org-1".to_string(),
            project_id: None,
            threshold: 80,
            dimension: AlertDimension::Spans,
            severity: crate::models::billing::AlertSeverity::Warning,
            threshold_value: 800_000,
            actual_value: 820_000,
            percent_used: 82.0,
            status: AlertStatus::Triggered,
            triggered_at: now,
            notified_at: None,
        };
        db.create_alert(&alert).unwrap();

        let since = now - chrono::Duration::hours(24);
        assert!(db
            .has_recent_unresolved_alert("b1", AlertDimension::Spans, 80, since)
            .unwrap());
        // Different threshold or dimension does not suppress.
        assert!(!db
            .has_recent_unresolved_alert("b1", AlertDimension::Spans, 100, since)
            .unwrap());
        assert!(!db
            .has_recent_unresolved_alert("b1", AlertDimension::Cost, 80, since)
            .unwrap());

        // Resolving clears the gate.
        assert!(db.update_alert_status("a1", AlertStatus::Resolved).unwrap());
        assert!(!db
            .has_recent_unresolved_alert("b1", AlertDimension::Spans, 80, since)
            .unwrap());
    }

    #[test]
    fn tiers_come_back_ordered() {
        let db = BillingDb::open_in_memory().unwrap();
        for (min, max, price, priority) in [
            (100_000_000u64, None, dec!(0.25), 1),
            (0, Some(100_000_000u64), dec!(0.30), 0),
        ] {
            db.add_tier(&VolumeDiscountTier {
                dimension: AlertDimension::Spans,
                tier_min: min,
                tier_max: max,
                price_per_unit: price,
                priority,
            })
            .unwrap();
        }
        let tiers = db.list_tiers(AlertDimension::Spans).unwrap();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0].tier_min, 0);
        assert_eq!(tiers[1].tier_max, None);
        assert!(db.list_tiers(AlertDimension::Bytes).unwrap().is_empty());
    }

    #[test]
    fn contract_lifecycle() {
        let db = BillingDb::open_in_memory().unwrap();
        let contract = Contract {
            id: "c1".to_string(),
            organization_id: "org-1".to_string(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            pricing_override: serde_json::json!({"span_price": "0.20"}),
            status: ContractStatus::Active,
        };
        db.put_contract(&contract).unwrap();

        let mid = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let active = db.active_contract("org-1", mid).unwrap().unwrap();
        assert_eq!(active.id, "c1");
        assert_eq!(active.pricing_override["span_price"], "0.20");

        // Not yet expiring mid-term
        assert!(db.expiring_contracts(mid).unwrap().is_empty());

        let after = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let expiring = db.expiring_contracts(after).unwrap();
        assert_eq!(expiring.len(), 1);

        assert!(db.expire_contract("c1").unwrap());
        assert!(!db.expire_contract("c1").unwrap());
        assert!(db.active_contract("org-1", mid).unwrap().is_none());
        assert!(db.expiring_contracts(after).unwrap().is_empty());
    }
}
