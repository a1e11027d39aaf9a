//! Contract expiration worker: one pass at startup, then a daily tick at
//! UTC midnight. Worst-case expiration latency is a day, which is fine for
//! multi-month enterprise contracts.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::billing_db::BillingDb;

fn next_midnight_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(now.date_naive());
    DateTime::from_naive_utc_and_offset(tomorrow.and_time(NaiveTime::MIN), Utc)
}

pub struct ContractWorker {
    billing: Arc<BillingDb>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ContractWorker {
    pub fn new(billing: Arc<BillingDb>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            billing,
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
        let worker = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        self.handles.lock().unwrap().push(tokio::spawn(async move {
            worker.expire_due(Utc::now());
            loop {
                let now = Utc::now();
                let wait = (next_midnight_utc(now) - now)
                    .to_std()
                    .unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => { worker.expire_due(Utc::now()); },
                    _ = shutdown.changed() => return,
                }
            }
        }));
        tracing::info!("contract worker: started (daily tick at UTC midnight)");
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
        tracing::info!("contract worker: stopped");
    }

    /// Expire every active contract whose end date has passed. Returns the
    /// number of contracts expired.
    pub fn expire_due(&self, now: DateTime<Utc>) -> usize {
        let today = now.date_naive();
        let due = match self.billing.expiring_contracts(today) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("contract worker: lookup failed: {e}");
                return 0;
            }
        };
        let mut expired = 0;
        for contract in due {
            match self.billing.expire_contract(&contract.id) {
                Ok(true) => {
                    expired += 1;
                    tracing::info!(
                        "contract {} for {} expired (ended {})",
                        contract.id,
                        contract.organization_id,
                        contract.end_date
                    );
                }
                Ok(false) => {}
                Err(e) => tracing::error!("expiring contract {} failed: {e}", contract.id),
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::billing::{Contract, ContractStatus};
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn midnight_math() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 17, 45, 12).unwrap();
        assert_eq!(
            next_midnight_utc(now),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()
        );
        // Exactly at midnight the next tick is tomorrow, not now.
        let midnight = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        assert_eq!(
            next_midnight_utc(midnight),
            Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn expires_only_past_contracts() {
        let billing = Arc::new(BillingDb::open_in_memory().unwrap());
        for (id, end) in [("c-past", "2024-04-30"), ("c-live", "2024-12-31")] {
            billing
                .put_contract(&Contract {
                    id: id.to_string(),
                    organization_id: "org-1".to_string(),
                    start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                    end_date: end.parse().unwrap(),
                    pricing_override: serde_json::json!({}),
                    status: ContractStatus::Active,
                })
                .unwrap();
        }
        let worker = ContractWorker::new(Arc::clone(&billing));
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 5).unwrap();
        assert_eq!(worker.expire_due(now), 1);
        // second pass is a no-op
        assert_eq!(worker.expire_due(now), 0);
        assert!(billing
            .active_contract("org-1", now.date_naive())
            .unwrap()
            .is_some());
    }
}
