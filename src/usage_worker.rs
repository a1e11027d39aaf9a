//! Usage aggregation worker: the periodic per-organization sync from OLAP
//! totals into billing state, tiered cost computation, budget evaluation and
//! alert emission.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::billing_db::BillingDb;
use crate::budget::evaluate_budget;
use crate::models::billing::{AlertDimension, UsageAlert, UsageBudget, VolumeDiscountTier};
use crate::notify::{NotificationJob, NotificationSender};
use crate::olap::OlapRepository;
use crate::pricing::{
    PlanPricing, budget_period_start, calculate_dimension_with_tiers, period_end,
};

/// Where budget alerts go; resolved from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct AlertChannels {
    pub email_to: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub webhook_url: Option<String>,
}

struct DimensionTiers {
    spans: Vec<VolumeDiscountTier>,
    bytes: Vec<VolumeDiscountTier>,
    scores: Vec<VolumeDiscountTier>,
}

/// Cost of a usage window. `with_free_tier` is false for raw-cost modes
/// (project budgets), where the free tier stays attributed to the cycle.
fn window_cost(
    pricing: &PlanPricing,
    tiers: &DimensionTiers,
    spans: u64,
    bytes: u64,
    scores: u64,
    with_free_tier: bool,
) -> Decimal {
    let free = |dimension: AlertDimension| {
        if with_free_tier {
            pricing.free_allowance(dimension)
        } else {
            0
        }
    };
    calculate_dimension_with_tiers(
        spans,
        free(AlertDimension::Spans),
        AlertDimension::Spans,
        &tiers.spans,
        pricing.span_price,
    ) + calculate_dimension_with_tiers(
        bytes,
        free(AlertDimension::Bytes),
        AlertDimension::Bytes,
        &tiers.bytes,
        pricing.byte_price,
    ) + calculate_dimension_with_tiers(
        scores,
        free(AlertDimension::Scores),
        AlertDimension::Scores,
        &tiers.scores,
        pricing.score_price,
    )
}

/// If the cycle is over, the new cycle start (== the old period end).
fn rollover_target(
    cycle_start: DateTime<Utc>,
    anchor_day: u32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let end = period_end(cycle_start, anchor_day);
    (now >= end).then_some(end)
}

/// A mid-cycle budget window pays only for what the window added on top of
/// the cycle-to-date spend before it; the free tier stays with the cycle.
fn marginal_cost(cycle_cost: Decimal, cost_up_to_budget_start: Decimal) -> Decimal {
    (cycle_cost - cost_up_to_budget_start).max(Decimal::ZERO)
}

pub struct UsageWorker {
    billing: Arc<BillingDb>,
    olap: Arc<OlapRepository>,
    notifier: NotificationSender,
    channels: AlertChannels,
    sync_interval: Duration,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl UsageWorker {
    pub fn new(
        billing: Arc<BillingDb>,
        olap: Arc<OlapRepository>,
        notifier: NotificationSender,
        channels: AlertChannels,
        sync_interval: Duration,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            billing,
            olap,
            notifier,
            channels,
            sync_interval,
            running: AtomicBool::new(false),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::info!(
            "usage worker: starting (sync every {:?})",
            self.sync_interval
        );
        let worker = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.handles.lock().unwrap().push(tokio::spawn(async move {
            // interval fires immediately, then on cadence
            let mut ticker = tokio::time::interval(worker.sync_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => worker.sync_all(Utc::now()).await,
                    _ = shutdown.changed() => return,
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("usage worker: stopped");
    }

    async fn sync_all(&self, now: DateTime<Utc>) {
        let organizations = match self.billing.list_billing_organizations() {
            Ok(orgs) => orgs,
            Err(e) => {
                tracing::error!("usage sync: listing organizations failed: {e}");
                return;
            }
        };
        for organization_id in organizations {
            if let Err(e) = self.sync_organization(&organization_id, now).await {
                tracing::error!("usage sync for {organization_id} failed: {e}");
            }
        }
    }

    async fn sync_organization(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        // No billing row means billing is not configured for this org.
        let Some(mut state) = self.billing.get_organization_billing(organization_id)? else {
            return Ok(());
        };

        let contract = self
            .billing
            .active_contract(organization_id, now.date_naive())?;
        let mut pricing = PlanPricing::for_plan(&state.plan);
        if let Some(contract) = &contract {
            pricing = pricing.with_override(&contract.pricing_override);
        }

        if let Some(new_cycle_start) =
            rollover_target(state.billing_cycle_start, state.billing_cycle_anchor_day, now)
        {
            self.billing.reset_period(
                organization_id,
                new_cycle_start,
                pricing.free_spans,
                pricing.free_bytes,
                pricing.free_scores,
            )?;
            state = self
                .billing
                .get_organization_billing(organization_id)?
                .ok_or_else(|| anyhow::anyhow!("billing state vanished during rollover"))?;
            tracing::info!(
                "billing cycle for {organization_id} rolled over, new cycle starts {new_cycle_start}"
            );
        }
        let cycle_start = state.billing_cycle_start;

        let tiers = DimensionTiers {
            spans: self.billing.list_tiers(AlertDimension::Spans)?,
            bytes: self.billing.list_tiers(AlertDimension::Bytes)?,
            scores: self.billing.list_tiers(AlertDimension::Scores)?,
        };

        let summary = self
            .olap
            .usage_summary(organization_id, None, cycle_start, now)
            .await?;
        let cycle_cost = window_cost(
            &pricing,
            &tiers,
            summary.total_spans,
            summary.total_bytes,
            summary.total_scores,
            true,
        );

        self.billing.update_billing_usage(
            organization_id,
            summary.total_spans,
            summary.total_bytes,
            summary.total_scores,
            cycle_cost,
            pricing.free_spans.saturating_sub(summary.total_spans),
            pricing.free_bytes.saturating_sub(summary.total_bytes),
            pricing.free_scores.saturating_sub(summary.total_scores),
            now,
        )?;

        for budget in self.billing.list_active_budgets(organization_id)? {
            if let Err(e) = self
                .sync_budget(&budget, organization_id, cycle_start, cycle_cost, &pricing, &tiers, &summary, now)
                .await
            {
                tracing::error!("budget {} evaluation failed: {e}", budget.id);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_budget(
        &self,
        budget: &UsageBudget,
        organization_id: &str,
        cycle_start: DateTime<Utc>,
        cycle_cost: Decimal,
        pricing: &PlanPricing,
        tiers: &DimensionTiers,
        cycle_summary: &crate::olap::UsageSummary,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let budget_start = budget_period_start(budget.budget_type, now);

        let (spans, bytes, scores, cost) = if let Some(project_id) = &budget.project_id {
            // Project budgets meter raw cost over the budget window; the free
            // tier belongs to the organization cycle, not the project.
            let s = self
                .olap
                .usage_summary(organization_id, Some(project_id), budget_start, now)
                .await?;
            let cost = window_cost(pricing, tiers, s.total_spans, s.total_bytes, s.total_scores, false);
            (s.total_spans, s.total_bytes, s.total_scores, cost)
        } else if budget_start <= cycle_start {
            // Window matches (or predates) the cycle: reuse the sync's totals.
            (
                cycle_summary.total_spans,
                cycle_summary.total_bytes,
                cycle_summary.total_scores,
                cycle_cost,
            )
        } else {
            // Window starts mid-cycle: usage over [budget_start, now), cost as
            // the marginal spend since the window opened.
            let s = self
                .olap
                .usage_summary(organization_id, None, budget_start, now)
                .await?;
            let before = self
                .olap
                .usage_summary(organization_id, None, cycle_start, budget_start)
                .await?;
            let cost_before = window_cost(
                pricing,
                tiers,
                before.total_spans,
                before.total_bytes,
                before.total_scores,
                true,
            );
            let cost = marginal_cost(cycle_cost, cost_before);
            (s.total_spans, s.total_bytes, s.total_scores, cost)
        };

        self.billing
            .update_budget_usage(&budget.id, spans, bytes, scores, cost)?;

        let mut current = budget.clone();
        current.current_spans = spans;
        current.current_bytes = bytes;
        current.current_scores = scores;
        current.current_cost = cost;

        for alert in evaluate_budget(&self.billing, &current, now)? {
            if self.notify_alert(&alert) {
                self.billing.mark_alert_notified(&alert.id, now)?;
            }
        }
        Ok(())
    }

    /// Fan the alert out to every configured channel; true when at least one
    /// delivery was enqueued.
    fn notify_alert(&self, alert: &UsageAlert) -> bool {
        let scope = alert
            .project_id
            .as_deref()
            .map(|p| format!("project {p}"))
            .unwrap_or_else(|| format!("organization {}", alert.organization_id));
        let message = format!(
            "Usage alert [{}]: {} for {scope} at {:.1}% of limit (threshold {}%, {} of {})",
            alert.severity.as_str().to_uppercase(),
            alert.dimension.as_str(),
            alert.percent_used,
            alert.threshold,
            alert.actual_value,
            alert.threshold_value * 100 / alert.threshold.max(1) as i64,
        );

        let mut enqueued = false;
        if let Some(to) = &self.channels.email_to {
            enqueued |= self.notifier.send(NotificationJob::Email {
                to: to.clone(),
                subject: format!(
                    "[Fathom] {} budget alert for {scope}",
                    alert.dimension.as_str()
                ),
                body: message.clone(),
            });
        }
        if let Some(url) = &self.channels.slack_webhook_url {
            enqueued |= self.notifier.send(NotificationJob::Slack {
                webhook_url: url.clone(),
                text: message.clone(),
            });
        }
        if let Some(url) = &self.channels.webhook_url {
            enqueued |= self.notifier.send(NotificationJob::Webhook {
                url: url.clone(),
                payload: serde_json::json!({
                    "alert_id": alert.id,
                    "budget_id": alert.budget_id,
                    "organization_id": alert.organization_id,
                    "project_id": alert.project_id,
                    "dimension": alert.dimension.as_str(),
                    "threshold": alert.threshold,
                    "severity": alert.severity.as_str(),
                    "percent_used": alert.percent_used,
                    "actual_value": alert.actual_value,
                    "threshold_value": alert.threshold_value,
                    "message": message,
                }),
            });
        }
        if !enqueued {
            tracing::warn!(
                "alert {} for budget {} has no configured notification channel",
                alert.id,
                alert.budget_id
            );
        }
        enqueued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn no_tiers() -> DimensionTiers {
        DimensionTiers {
            spans: vec![],
            bytes: vec![],
            scores: vec![],
        }
    }

    #[test]
    fn rollover_happens_exactly_once() {
        let cycle_start = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let just_after = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 1).unwrap();

        // Anchor 31 in a leap year rolls over on Feb 29.
        let new_start = rollover_target(cycle_start, 31, just_after).unwrap();
        assert_eq!(new_start, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());

        // After the reset the same tick no longer rolls over.
        assert!(rollover_target(new_start, 31, just_after).is_none());
    }

    #[test]
    fn no_rollover_before_period_end() {
        let cycle_start = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 4, 14, 23, 59, 59).unwrap();
        assert!(rollover_target(cycle_start, 15, before).is_none());
        let at = Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap();
        assert_eq!(
            rollover_target(cycle_start, 15, at).unwrap(),
            Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn marginal_cost_clamps_at_zero() {
        assert_eq!(marginal_cost(dec!(40), dec!(15)), dec!(25));
        assert_eq!(marginal_cost(dec!(10), dec!(15)), Decimal::ZERO);
        assert_eq!(marginal_cost(dec!(10), dec!(10)), Decimal::ZERO);
    }

    #[test]
    fn window_cost_respects_free_tier_flag() {
        let pricing = PlanPricing {
            free_spans: 100_000,
            free_bytes: 0,
            free_scores: 0,
            span_price: dec!(0.30),
            byte_price: Decimal::ZERO,
            score_price: Decimal::ZERO,
        };
        let tiers = no_tiers();
        // 200k spans: free tier halves the billable volume.
        let with_free = window_cost(&pricing, &tiers, 200_000, 0, 0, true);
        assert_eq!(with_free, dec!(0.30));
        let raw = window_cost(&pricing, &tiers, 200_000, 0, 0, false);
        assert_eq!(raw, dec!(0.60));
    }

    #[test]
    fn window_cost_sums_dimensions() {
        let pricing = PlanPricing {
            free_spans: 0,
            free_bytes: 0,
            free_scores: 0,
            span_price: dec!(0.30),
            byte_price: dec!(0.25),
            score_price: dec!(0.10),
        };
        let cost = window_cost(
            &pricing,
            &no_tiers(),
            100_000,       // one span unit
            1_073_741_824, // one GiB
            1_000,         // one score unit
            false,
        );
        assert_eq!(cost, dec!(0.65));
    }
}
