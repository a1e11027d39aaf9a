//! Telemetry stream consumer: discovers per-tenant streams, reads them
//! fairly under one consumer group, and drives each message through the
//! retry → DLQ → ack/claim-release policy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use redis::streams::{StreamId, StreamKey};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::claims::ClaimStore;
use crate::config::ConsumerConfig;
use crate::dlq::DlqManager;
use crate::fabric::{AnalyticsFabric, Priority};
use crate::models::event::TelemetryStreamMessage;
use crate::models::rows::{MetricSumRow, to_nanos};
use crate::router::BatchRouter;
use crate::stream::StreamTransport;

const MAX_DISCOVERY_BACKOFF: Duration = Duration::from_secs(30);

/// What to do with a message after processing settles. The only path that
/// leaves a message pending is a failed DLQ write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    AckAndReleaseClaims,
    LeavePending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Persisted,
    DeadLettered,
    DlqWriteFailed,
}

pub fn ack_decision(outcome: MessageOutcome) -> AckAction {
    match outcome {
        MessageOutcome::Persisted => AckAction::Ack,
        MessageOutcome::DeadLettered => AckAction::AckAndReleaseClaims,
        MessageOutcome::DlqWriteFailed => AckAction::LeavePending,
    }
}

/// Rotated window over the active set: every stream is read at least every
/// ceil(N / max_per_read) iterations.
fn rotate_slice(streams: &[String], rotation: usize, max_per_read: usize) -> Vec<String> {
    if streams.is_empty() || max_per_read == 0 {
        return Vec::new();
    }
    let start = rotation % streams.len();
    streams[start..]
        .iter()
        .chain(streams[..start].iter())
        .take(max_per_read)
        .cloned()
        .collect()
}

#[derive(Default)]
struct ActiveStreams {
    streams: Vec<String>,
    rotation: usize,
}

#[derive(Default)]
struct Counters {
    batches_processed: AtomicU64,
    events_processed: AtomicU64,
    errors: AtomicU64,
    dlq_messages: AtomicU64,
    active_streams: AtomicUsize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStats {
    pub batches_processed: u64,
    pub events_processed: u64,
    pub errors: u64,
    pub dlq_messages: u64,
    pub archive_errors: u64,
    pub active_streams: usize,
}

pub struct StreamConsumer {
    transport: StreamTransport,
    router: Arc<BatchRouter>,
    dlq: Arc<DlqManager>,
    claims: ClaimStore,
    fabric: Arc<AnalyticsFabric>,
    config: ConsumerConfig,
    consumer_id: String,
    active: RwLock<ActiveStreams>,
    counters: Counters,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamConsumer {
    pub fn new(
        transport: StreamTransport,
        router: Arc<BatchRouter>,
        dlq: Arc<DlqManager>,
        claims: ClaimStore,
        fabric: Arc<AnalyticsFabric>,
        config: ConsumerConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let consumer_id = config.effective_consumer_id();
        Arc::new(Self {
            transport,
            router,
            dlq,
            claims,
            fabric,
            config,
            consumer_id,
            active: RwLock::new(ActiveStreams::default()),
            counters: Counters::default(),
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
            "stream consumer {} starting (group={}, batch_size={}, max_streams_per_read={})",
            self.consumer_id,
            self.config.group,
            self.config.batch_size,
            self.config.max_streams_per_read
        );
        let mut handles = self.handles.lock().unwrap();
        {
            let consumer = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                consumer.discovery_loop(shutdown).await;
            }));
        }
        {
            let consumer = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                consumer.consume_loop(shutdown).await;
            }));
        }
    }

    /// Idempotent: the first call wins, later calls return immediately.
    /// In-flight reads run to completion because XREADGROUP returns at the
    /// block timeout.
    pub async fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::info!("stream consumer {} stopping", self.consumer_id);
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("stream consumer {} stopped", self.consumer_id);
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            batches_processed: self.counters.batches_processed.load(Ordering::Relaxed),
            events_processed: self.counters.events_processed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            dlq_messages: self.counters.dlq_messages.load(Ordering::Relaxed),
            archive_errors: self.router.archive_errors(),
            active_streams: self.counters.active_streams.load(Ordering::Relaxed),
        }
    }

    // ── Discovery ──

    async fn discovery_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.discovery_interval_secs.max(1));
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return;
            }
            let wait = match self.discover_streams().await {
                Ok(count) => {
                    backoff = Duration::from_secs(1);
                    tracing::debug!("stream discovery: {count} active stream(s)");
                    interval
                }
                Err(e) => {
                    tracing::error!("stream discovery failed: {e}; backing off {backoff:?}");
                    let wait = backoff;
                    backoff = (backoff * 2).min(MAX_DISCOVERY_BACKOFF);
                    wait
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn discover_streams(&self) -> anyhow::Result<usize> {
        let found = self.transport.scan_batch_streams().await?;
        let known: HashSet<String> = {
            let active = self.active.read().unwrap();
            active.streams.iter().cloned().collect()
        };
        for stream in found.iter().filter(|s| !known.contains(*s)) {
            self.transport.ensure_group(stream, &self.config.group).await?;
            tracing::info!("discovered stream {stream}, consumer group ready");
        }
        let count = found.len();
        {
            let mut active = self.active.write().unwrap();
            active.streams = found;
        }
        self.counters.active_streams.store(count, Ordering::Relaxed);
        Ok(count)
    }

    // ── Consumption ──

    async fn consume_loop(&self, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let slice = {
                let mut active = self.active.write().unwrap();
                let slice = rotate_slice(
                    &active.streams,
                    active.rotation,
                    self.config.max_streams_per_read,
                );
                active.rotation = active.rotation.wrapping_add(self.config.max_streams_per_read);
                slice
            };
            if slice.is_empty() {
                tokio::time::sleep(self.config.block_duration()).await;
                continue;
            }
            let keys = match self
                .transport
                .read_group(
                    &self.config.group,
                    &self.consumer_id,
                    &slice,
                    self.config.batch_size,
                    self.config.block_duration(),
                )
                .await
            {
                Ok(keys) => keys,
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("XREADGROUP over {} stream(s) failed: {e}", slice.len());
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if keys.is_empty() {
                continue;
            }
            // Streams in parallel, messages within a stream in order.
            join_all(keys.into_iter().map(|key| self.process_stream(key))).await;
        }
    }

    async fn process_stream(&self, key: StreamKey) {
        for message in key.ids {
            self.process_message(&key.key, message).await;
        }
    }

    async fn process_message(&self, stream: &str, message: StreamId) {
        let raw: String = match message.get("data") {
            Some(data) => data,
            None => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.finish_failed(stream, &message.id, None, "", "message has no data field", 0)
                    .await;
                return;
            }
        };

        let batch: TelemetryStreamMessage = match serde_json::from_str(&raw) {
            Ok(batch) => batch,
            Err(e) => {
                // Unparseable data is a permanent failure, straight to DLQ.
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.finish_failed(
                    stream,
                    &message.id,
                    None,
                    &raw,
                    &format!("malformed batch: {e}"),
                    0,
                )
                .await;
                return;
            }
        };
        if !batch.claims_are_consistent() {
            tracing::warn!(
                "batch {}: claimed_event_ids reference unknown events",
                batch.batch_id
            );
        }

        let max_attempts = self.config.max_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.router.route_batch(&batch, attempt - 1).await {
                Ok(summary) => {
                    if let Err(e) = self
                        .transport
                        .ack(stream, &self.config.group, &message.id)
                        .await
                    {
                        // Still pending; redelivery will be absorbed by the
                        // idempotent event keys downstream.
                        tracing::error!("XACK of {}/{} failed: {e}", stream, message.id);
                    }
                    self.counters.batches_processed.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .events_processed
                        .fetch_add(summary.processed_count as u64, Ordering::Relaxed);
                    self.emit_throughput_metric(&batch, summary.processed_count);
                    return;
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    last_error = e.to_string();
                    tracing::warn!(
                        "batch {} attempt {attempt}/{max_attempts} failed: {last_error}",
                        batch.batch_id
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                    }
                }
            }
        }
        self.finish_failed(
            stream,
            &message.id,
            Some(&batch),
            &raw,
            &last_error,
            self.config.max_retries,
        )
        .await;
    }

    /// Retries are exhausted. DLQ write success means the data is safe: ack
    /// and release the batch's claims so a client retry is accepted. DLQ
    /// write failure leaves the message pending for another consumer.
    async fn finish_failed(
        &self,
        stream: &str,
        message_id: &str,
        batch: Option<&TelemetryStreamMessage>,
        raw: &str,
        error: &str,
        retry_count: u32,
    ) {
        match self
            .dlq
            .move_to_dlq(stream, message_id, batch, raw, error, retry_count)
            .await
        {
            Ok(_) => {
                self.counters.dlq_messages.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self
                    .transport
                    .ack(stream, &self.config.group, message_id)
                    .await
                {
                    tracing::error!("XACK after DLQ write of {stream}/{message_id} failed: {e}");
                }
                if let Some(batch) = batch {
                    if let Err(e) = self
                        .claims
                        .release_events(&batch.project_id, &batch.claimed_event_ids)
                        .await
                    {
                        tracing::error!(
                            "claim release for batch {} failed: {e}",
                            batch.batch_id
                        );
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    "DLQ write for {stream}/{message_id} failed: {e}; leaving message pending"
                );
            }
        }
    }

    fn emit_throughput_metric(&self, batch: &TelemetryStreamMessage, processed: usize) {
        let row = MetricSumRow {
            project_id: batch.project_id.clone(),
            organization_id: batch.organization_id.clone(),
            environment: batch.environment.clone(),
            event_id: uuid::Uuid::new_v4().to_string(),
            metric_name: "fathom.pipeline.events_persisted".to_string(),
            timestamp: to_nanos(chrono::Utc::now()),
            value: processed as f64,
            attributes: format!("{{\"consumer_id\":\"{}\"}}", self.consumer_id),
            is_monotonic: true,
            aggregation_temporality: 1,
        };
        self.fabric.submit_metric(row, Priority::Low);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_policy_matches_delivery_contract() {
        assert_eq!(ack_decision(MessageOutcome::Persisted), AckAction::Ack);
        assert_eq!(
            ack_decision(MessageOutcome::DeadLettered),
            AckAction::AckAndReleaseClaims
        );
        assert_eq!(
            ack_decision(MessageOutcome::DlqWriteFailed),
            AckAction::LeavePending
        );
    }

    #[test]
    fn rotation_covers_every_stream() {
        let streams: Vec<String> = (0..5).map(|i| format!("telemetry:batches:p{i}")).collect();
        let max_per_read = 2;
        let mut seen = HashSet::new();
        let mut rotation = 0;
        // ceil(5 / 2) = 3 iterations must include every stream at least once
        for _ in 0..streams.len().div_ceil(max_per_read) {
            for stream in rotate_slice(&streams, rotation, max_per_read) {
                seen.insert(stream);
            }
            rotation += max_per_read;
        }
        assert_eq!(seen.len(), streams.len());
    }

    #[test]
    fn rotation_wraps_around() {
        let streams: Vec<String> = (0..3).map(|i| format!("s{i}")).collect();
        assert_eq!(rotate_slice(&streams, 2, 2), vec!["s2", "s0"]);
        assert_eq!(rotate_slice(&streams, 4, 2), vec!["s1", "s2"]);
    }

    #[test]
    fn rotation_handles_empty_and_zero() {
        assert!(rotate_slice(&[], 7, 2).is_empty());
        let streams = vec!["s0".to_string()];
        assert!(rotate_slice(&streams, 0, 0).is_empty());
        assert_eq!(rotate_slice(&streams, 9, 10), vec!["s0"]);
    }
}
