//! Analytics worker fabric: priority-aware bounded queues feeding per-type
//! buffers that a bulk-flush timer drains into the columnar store.
//!
//! The router's audit rows travel the event/batch queues; pipeline
//! self-metrics travel the metrics queue. On a full queue a High-or-above
//! submission may evict a lower-priority head; anything else is dropped and
//! counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::FabricConfig;
use crate::models::rows::{MetricSumRow, TelemetryBatchRow, TelemetryEventRow};
use crate::olap::OlapRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

struct QueueItem<T> {
    payload: T,
    priority: Priority,
}

/// Bounded FIFO with priority eviction. Locks are never held across awaits.
struct BoundedQueue<T> {
    items: Mutex<VecDeque<QueueItem<T>>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns false when the submission was dropped. A `Priority >= High`
    /// submission displaces the first lower-priority item when full.
    fn push(&self, payload: T, priority: Priority) -> bool {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            if priority >= Priority::High {
                if let Some(pos) = items.iter().position(|it| it.priority < priority) {
                    items.remove(pos);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    items.push_back(QueueItem { payload, priority });
                    drop(items);
                    self.notify.notify_one();
                    return true;
                }
            }
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        items.push_back(QueueItem { payload, priority });
        drop(items);
        self.notify.notify_one();
        true
    }

    fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front().map(|it| it.payload)
    }

    async fn pop(&self, shutdown: &mut watch::Receiver<bool>) -> Option<T> {
        loop {
            if let Some(payload) = self.try_pop() {
                return Some(payload);
            }
            if *shutdown.borrow() {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }
}

/// `max(1, ...)` minimums keep the batch/metric pools alive at small scale.
pub fn worker_counts(max_workers: usize) -> (usize, usize, usize) {
    let event_workers = max_workers.max(1);
    (event_workers, (event_workers / 2).max(1), (event_workers / 4).max(1))
}

#[derive(Debug, Clone, Default)]
pub struct FabricStats {
    pub events_processed: u64,
    pub batches_processed: u64,
    pub metrics_processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FabricHealth {
    pub queue_depth: usize,
    pub buffer_utilization: f64,
    pub error_rate: f64,
    pub throughput_per_sec: f64,
    pub healthy: bool,
}

#[derive(Default)]
struct Counters {
    events_processed: AtomicU64,
    batches_processed: AtomicU64,
    metrics_processed: AtomicU64,
    failed: AtomicU64,
}

pub struct AnalyticsFabric {
    olap: Arc<OlapRepository>,
    config: FabricConfig,
    event_queue: Arc<BoundedQueue<TelemetryEventRow>>,
    batch_queue: Arc<BoundedQueue<TelemetryBatchRow>>,
    metric_queue: Arc<BoundedQueue<MetricSumRow>>,
    event_buffer: Arc<Mutex<Vec<TelemetryEventRow>>>,
    batch_buffer: Arc<Mutex<Vec<TelemetryBatchRow>>>,
    metric_buffer: Arc<Mutex<Vec<MetricSumRow>>>,
    counters: Arc<Counters>,
    health: Arc<RwLock<FabricHealth>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AnalyticsFabric {
    pub fn new(olap: Arc<OlapRepository>, config: FabricConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let buffer_size = config.buffer_size.max(10);
        Arc::new(Self {
            olap,
            event_queue: Arc::new(BoundedQueue::new(buffer_size)),
            batch_queue: Arc::new(BoundedQueue::new(buffer_size / 10)),
            metric_queue: Arc::new(BoundedQueue::new(buffer_size / 5)),
            event_buffer: Arc::new(Mutex::new(Vec::new())),
            batch_buffer: Arc::new(Mutex::new(Vec::new())),
            metric_buffer: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(Counters::default()),
            health: Arc::new(RwLock::new(FabricHealth::default())),
            running: AtomicBool::new(false),
            shutdown_tx,
            config,
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
        let (event_workers, batch_workers, metric_workers) =
            worker_counts(self.config.analytics_workers);
        tracing::info!(
            "analytics fabric: starting ({event_workers} event / {batch_workers} batch / {metric_workers} metric workers, buffer={})",
            self.config.buffer_size
        );

        let mut handles = self.handles.lock().unwrap();
        for _ in 0..event_workers {
            let queue = Arc::clone(&self.event_queue);
            let buffer = Arc::clone(&self.event_buffer);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                while let Some(row) = queue.pop(&mut shutdown).await {
                    buffer.lock().unwrap().push(row);
                }
            }));
        }
        for _ in 0..batch_workers {
            let queue = Arc::clone(&self.batch_queue);
            let buffer = Arc::clone(&self.batch_buffer);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                while let Some(row) = queue.pop(&mut shutdown).await {
                    buffer.lock().unwrap().push(row);
                }
            }));
        }
        for _ in 0..metric_workers {
            let queue = Arc::clone(&self.metric_queue);
            let buffer = Arc::clone(&self.metric_buffer);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                while let Some(row) = queue.pop(&mut shutdown).await {
                    buffer.lock().unwrap().push(row);
                }
            }));
        }

        // Bulk-flush timer
        {
            let fabric = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            let interval = Duration::from_millis(self.config.batch_interval_ms.max(10));
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => fabric.flush_buffers().await,
                        _ = shutdown.changed() => return,
                    }
                }
            }));
        }

        // Health monitor
        {
            let fabric = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                let mut last_processed = 0u64;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => last_processed = fabric.recompute_health(last_processed, 5.0),
                        _ = shutdown.changed() => return,
                    }
                }
            }));
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn submit_event(&self, row: TelemetryEventRow, priority: Priority) -> bool {
        self.is_running() && self.event_queue.push(row, priority)
    }

    pub fn submit_batch(&self, row: TelemetryBatchRow, priority: Priority) -> bool {
        self.is_running() && self.batch_queue.push(row, priority)
    }

    pub fn submit_metric(&self, row: MetricSumRow, priority: Priority) -> bool {
        self.is_running() && self.metric_queue.push(row, priority)
    }

    async fn flush_buffers(&self) {
        let events = std::mem::take(&mut *self.event_buffer.lock().unwrap());
        if !events.is_empty() {
            let count = events.len() as u64;
            match self.olap.insert_telemetry_events(&events).await {
                Ok(()) => {
                    self.counters.events_processed.fetch_add(count, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!("fabric: bulk event flush of {count} failed, retrying items: {e}");
                    self.retry_items(events, &self.counters.events_processed, |olap, row| async move {
                        olap.insert_telemetry_event(&row).await
                    })
                    .await;
                }
            }
        }

        let batches = std::mem::take(&mut *self.batch_buffer.lock().unwrap());
        if !batches.is_empty() {
            let count = batches.len() as u64;
            match self.olap.insert_telemetry_batches(&batches).await {
                Ok(()) => {
                    self.counters.batches_processed.fetch_add(count, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!("fabric: bulk batch flush of {count} failed, retrying items: {e}");
                    self.retry_items(batches, &self.counters.batches_processed, |olap, row| async move {
                        olap.insert_telemetry_batch(&row).await
                    })
                    .await;
                }
            }
        }

        let metrics = std::mem::take(&mut *self.metric_buffer.lock().unwrap());
        if !metrics.is_empty() {
            let count = metrics.len() as u64;
            match self.olap.insert_metric_sums(&metrics).await {
                Ok(()) => {
                    self.counters.metrics_processed.fetch_add(count, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!("fabric: bulk metric flush of {count} failed, retrying items: {e}");
                    self.retry_items(metrics, &self.counters.metrics_processed, |olap, row| async move {
                        olap.insert_metric_sum(&row).await
                    })
                    .await;
                }
            }
        }
    }

    /// Individual-item fallback after a bulk failure: exponential back-off
    /// `retry_backoff * 2^(retry-1)` capped at `max_retries` attempts.
    async fn retry_items<T, F, Fut>(&self, items: Vec<T>, processed: &AtomicU64, insert: F)
    where
        T: Clone,
        F: Fn(Arc<OlapRepository>, T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let max_retries = self.config.max_retries.max(1);
        for item in items {
            let mut ok = false;
            for retry in 1..=max_retries {
                match insert(Arc::clone(&self.olap), item.clone()).await {
                    Ok(()) => {
                        ok = true;
                        break;
                    }
                    Err(e) => {
                        if retry == max_retries {
                            tracing::warn!("fabric: item insert failed after {retry} attempt(s): {e}");
                        } else {
                            let backoff = Duration::from_millis(
                                self.config.retry_backoff_ms << (retry - 1),
                            );
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
            if ok {
                processed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn processed_total(&self) -> u64 {
        self.counters.events_processed.load(Ordering::Relaxed)
            + self.counters.batches_processed.load(Ordering::Relaxed)
            + self.counters.metrics_processed.load(Ordering::Relaxed)
    }

    fn recompute_health(&self, last_processed: u64, window_secs: f64) -> u64 {
        let processed = self.processed_total();
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let denominator = (processed + failed).max(1) as f64;
        let error_rate = failed as f64 / denominator;
        let utilization = self
            .event_queue
            .utilization()
            .max(self.batch_queue.utilization())
            .max(self.metric_queue.utilization());
        let depth = self.event_queue.len() + self.batch_queue.len() + self.metric_queue.len();
        let snapshot = FabricHealth {
            queue_depth: depth,
            buffer_utilization: utilization,
            error_rate,
            throughput_per_sec: (processed.saturating_sub(last_processed)) as f64 / window_secs,
            healthy: error_rate < 0.05 && utilization < 0.90,
        };
        *self.health.write().unwrap() = snapshot;
        processed
    }

    pub fn stats(&self) -> FabricStats {
        FabricStats {
            events_processed: self.counters.events_processed.load(Ordering::Relaxed),
            batches_processed: self.counters.batches_processed.load(Ordering::Relaxed),
            metrics_processed: self.counters.metrics_processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.event_queue.dropped.load(Ordering::Relaxed)
                + self.batch_queue.dropped.load(Ordering::Relaxed)
                + self.metric_queue.dropped.load(Ordering::Relaxed),
            queue_depth: self.event_queue.len()
                + self.batch_queue.len()
                + self.metric_queue.len(),
        }
    }

    pub fn health(&self) -> FabricHealth {
        self.health.read().unwrap().clone()
    }

    /// Idempotent graceful drain: stop accepting, join workers, move any
    /// queue remainder into the buffers, flush once.
    pub async fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::info!("analytics fabric: draining");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }

        while let Some(row) = self.event_queue.try_pop() {
            self.event_buffer.lock().unwrap().push(row);
        }
        while let Some(row) = self.batch_queue.try_pop() {
            self.batch_buffer.lock().unwrap().push(row);
        }
        while let Some(row) = self.metric_queue.try_pop() {
            self.metric_buffer.lock().unwrap().push(row);
        }
        self.flush_buffers().await;
        tracing::info!("analytics fabric: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_minimums_prevent_starvation() {
        assert_eq!(worker_counts(1), (1, 1, 1));
        assert_eq!(worker_counts(2), (2, 1, 1));
        assert_eq!(worker_counts(3), (3, 1, 1));
        assert_eq!(worker_counts(8), (8, 4, 2));
    }

    #[test]
    fn high_priority_evicts_low_on_full_queue() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2);
        assert!(queue.push(1, Priority::Low));
        assert!(queue.push(2, Priority::Normal));

        // Full: a High submission displaces the Low head.
        assert!(queue.push(3, Priority::High));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
    }

    #[test]
    fn low_priority_is_dropped_when_full() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(1);
        assert!(queue.push(1, Priority::Normal));
        assert!(!queue.push(2, Priority::Low));
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn high_cannot_evict_equal_priority() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(1);
        assert!(queue.push(1, Priority::High));
        assert!(!queue.push(2, Priority::High));
        assert_eq!(queue.try_pop(), Some(1));
    }

    #[tokio::test]
    async fn submissions_rejected_after_stop() {
        let olap = Arc::new(OlapRepository::new(clickhouse::Client::default()));
        let config = FabricConfig {
            analytics_workers: 1,
            buffer_size: 10,
            batch_interval_ms: 3_600_000,
            max_retries: 1,
            retry_backoff_ms: 1,
        };
        let fabric = AnalyticsFabric::new(olap, config);
        fabric.start();
        assert!(fabric.is_running());
        fabric.stop().await;
        assert!(!fabric.is_running());

        let row = MetricSumRow {
            project_id: "p".into(),
            organization_id: "o".into(),
            environment: "dev".into(),
            event_id: "e".into(),
            metric_name: "m".into(),
            timestamp: 0,
            value: 1.0,
            attributes: "{}".into(),
            is_monotonic: false,
            aggregation_temporality: 0,
        };
        assert!(!fabric.submit_metric(row, Priority::Critical));
        // Second stop is a no-op.
        fabric.stop().await;
    }
}
