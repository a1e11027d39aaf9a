//! Batch router: dependency-ordered typed bulk writes plus the best-effort
//! archive fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};

use crate::archive::{ArchiveStore, is_transient_error};
use crate::config::ArchiveConfig;
use crate::fabric::{AnalyticsFabric, Priority};
use crate::models::event::{
    EventType, RawTelemetryRecord, SignalType, TelemetryEvent, TelemetryStreamMessage,
};
use crate::models::rows::{
    GenAiEventRow, LogRow, MetricExponentialHistogramRow, MetricGaugeRow, MetricHistogramRow,
    MetricSumRow, ScoreRow, SpanRow, TelemetryBatchRow, TelemetryEventRow, to_nanos,
};
use crate::olap::OlapRepository;

/// The one error the consumer treats as retriable: every event group in the
/// batch failed to persist.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("batch {batch_id}: all {failed} event(s) failed to persist: {message}")]
    BatchFailed {
        batch_id: String,
        failed: usize,
        message: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RouteSummary {
    pub processed_count: usize,
    pub failed_count: usize,
    /// Validation drops: unknown event types and unparseable payloads.
    pub skipped_count: usize,
}

impl RouteSummary {
    pub fn status(&self) -> &'static str {
        if self.failed_count == 0 {
            "completed"
        } else if self.processed_count > 0 {
            "partial"
        } else {
            "failed"
        }
    }
}

/// Stable sort by dependency priority: spans first, scores last, unknown at
/// the very end.
fn sort_events(events: &[TelemetryEvent]) -> Vec<&TelemetryEvent> {
    let mut sorted: Vec<&TelemetryEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.event_type.routing_priority());
    sorted
}

/// Group the sorted slice by concrete type, preserving first-seen order.
fn group_events<'a>(sorted: &[&'a TelemetryEvent]) -> Vec<(EventType, Vec<&'a TelemetryEvent>)> {
    let mut groups: Vec<(EventType, Vec<&TelemetryEvent>)> = Vec::new();
    for event in sorted {
        match groups.iter_mut().find(|(ty, _)| *ty == event.event_type) {
            Some((_, members)) => members.push(event),
            None => groups.push((event.event_type, vec![event])),
        }
    }
    groups
}

fn raw_record(msg: &TelemetryStreamMessage, event: &TelemetryEvent) -> Option<RawTelemetryRecord> {
    let signal = event.event_type.signal()?;
    let timestamp = event.payload_timestamp().unwrap_or(msg.timestamp);
    let trace_id = event.trace_id.clone().unwrap_or_else(|| {
        event
            .event_payload
            .get("trace_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    });
    let span_id = event.span_id.clone().unwrap_or_else(|| {
        event
            .event_payload
            .get("span_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    });
    Some(RawTelemetryRecord {
        record_id: event.event_id.clone(),
        project_id: msg.project_id.clone(),
        signal_type: signal,
        timestamp,
        trace_id,
        span_id,
        span_json_raw: event.event_payload.to_string(),
        archived_at: Utc::now(),
    })
}

/// Upload attempt budget for one archive bucket: `max_retries` attempts in
/// total, with exponential `base_backoff * 2^i` sleeps between them.
fn archive_retry_schedule(config: &ArchiveConfig) -> (u32, Vec<Duration>) {
    let attempts = config.max_retries.max(1);
    let backoffs = (0..attempts - 1)
        .map(|i| Duration::from_millis(config.base_backoff_ms << i))
        .collect();
    (attempts, backoffs)
}

/// Bucket raw records by `(signal, UTC day)` — one Parquet file per bucket.
fn partition_records(
    records: Vec<RawTelemetryRecord>,
) -> HashMap<(SignalType, NaiveDate), Vec<RawTelemetryRecord>> {
    let mut buckets: HashMap<(SignalType, NaiveDate), Vec<RawTelemetryRecord>> = HashMap::new();
    for record in records {
        buckets
            .entry((record.signal_type, record.timestamp.date_naive()))
            .or_default()
            .push(record);
    }
    buckets
}

pub struct BatchRouter {
    olap: Arc<OlapRepository>,
    fabric: Arc<AnalyticsFabric>,
    archive: Option<Arc<ArchiveStore>>,
    archive_config: ArchiveConfig,
    archive_errors: Arc<AtomicU64>,
}

impl BatchRouter {
    pub fn new(
        olap: Arc<OlapRepository>,
        fabric: Arc<AnalyticsFabric>,
        archive: Option<Arc<ArchiveStore>>,
        archive_config: ArchiveConfig,
        archive_errors: Arc<AtomicU64>,
    ) -> Self {
        Self {
            olap,
            fabric,
            archive,
            archive_config,
            archive_errors,
        }
    }

    pub fn archive_errors(&self) -> u64 {
        self.archive_errors.load(Ordering::Relaxed)
    }

    /// Persist one heterogeneous batch: dependency-sorted typed bulk writes,
    /// audit rows through the fabric, then the detached archive fan-out.
    pub async fn route_batch(
        &self,
        msg: &TelemetryStreamMessage,
        retry_count: u32,
    ) -> Result<RouteSummary, RouteError> {
        let started = Instant::now();
        let sorted = sort_events(&msg.events);
        let groups = group_events(&sorted);

        let mut summary = RouteSummary::default();
        for (event_type, members) in &groups {
            if *event_type == EventType::Unknown {
                tracing::warn!(
                    "batch {}: skipping {} event(s) of unknown type",
                    msg.batch_id,
                    members.len()
                );
                summary.skipped_count += members.len();
                continue;
            }
            let (processed, skipped, error) = self.insert_group(msg, *event_type, members).await;
            summary.processed_count += processed;
            summary.skipped_count += skipped;
            if let Some(e) = error {
                let failed = members.len() - skipped;
                summary.failed_count += failed;
                tracing::warn!(
                    "batch {}: {} insert of {failed} event(s) failed: {e}",
                    msg.batch_id,
                    event_type.as_str()
                );
            }
        }

        self.submit_audit_rows(msg, &summary, retry_count, started.elapsed());

        if self.archive_config.enabled {
            self.spawn_archive_tasks(msg);
        }

        if summary.processed_count == 0 && summary.failed_count > 0 {
            return Err(RouteError::BatchFailed {
                batch_id: msg.batch_id.clone(),
                failed: summary.failed_count,
                message: "no event group persisted".to_string(),
            });
        }
        if summary.failed_count > 0 {
            // Partial failure is terminal here: the persisted part is safe and
            // the failed events will come back via SDK retry, deduped by the
            // claim TTL.
            tracing::warn!(
                "batch {}: partial failure ({} ok / {} failed / {} skipped)",
                msg.batch_id,
                summary.processed_count,
                summary.failed_count,
                summary.skipped_count
            );
        }
        Ok(summary)
    }

    /// One bulk insert for one typed group. Returns (processed, skipped,
    /// insert_error); payloads that fail to parse are validation drops and
    /// never retried.
    async fn insert_group(
        &self,
        msg: &TelemetryStreamMessage,
        event_type: EventType,
        members: &[&TelemetryEvent],
    ) -> (usize, usize, Option<anyhow::Error>) {
        macro_rules! convert_and_insert {
            ($payload:ty, $row:ty, $insert:ident) => {{
                let mut rows: Vec<$row> = Vec::with_capacity(members.len());
                let mut skipped = 0usize;
                for event in members {
                    match serde_json::from_value::<$payload>(event.event_payload.clone()) {
                        Ok(payload) => {
                            rows.push(<$row>::from_payload(msg, &event.event_id, payload))
                        }
                        Err(e) => {
                            tracing::warn!(
                                "batch {}: dropping malformed {} payload {}: {e}",
                                msg.batch_id,
                                event_type.as_str(),
                                event.event_id
                            );
                            skipped += 1;
                        }
                    }
                }
                if rows.is_empty() {
                    (0, skipped, None)
                } else {
                    match self.olap.$insert(&rows).await {
                        Ok(()) => (rows.len(), skipped, None),
                        Err(e) => (0, skipped, Some(e)),
                    }
                }
            }};
        }

        use crate::models::event::{
            GenAiEventPayload, LogPayload, MetricExponentialHistogramPayload, MetricGaugePayload,
            MetricHistogramPayload, MetricSumPayload, ScorePayload, SpanPayload,
        };

        match event_type {
            EventType::Span => convert_and_insert!(SpanPayload, SpanRow, insert_spans),
            EventType::QualityScore => convert_and_insert!(ScorePayload, ScoreRow, insert_scores),
            EventType::MetricSum => {
                convert_and_insert!(MetricSumPayload, MetricSumRow, insert_metric_sums)
            }
            EventType::MetricGauge => {
                convert_and_insert!(MetricGaugePayload, MetricGaugeRow, insert_metric_gauges)
            }
            EventType::MetricHistogram => convert_and_insert!(
                MetricHistogramPayload,
                MetricHistogramRow,
                insert_metric_histograms
            ),
            EventType::MetricExponentialHistogram => convert_and_insert!(
                MetricExponentialHistogramPayload,
                MetricExponentialHistogramRow,
                insert_metric_exponential_histograms
            ),
            EventType::Log => convert_and_insert!(LogPayload, LogRow, insert_logs),
            EventType::GenaiEvent => {
                convert_and_insert!(GenAiEventPayload, GenAiEventRow, insert_genai_events)
            }
            EventType::Unknown => (0, members.len(), None),
        }
    }

    fn submit_audit_rows(
        &self,
        msg: &TelemetryStreamMessage,
        summary: &RouteSummary,
        retry_count: u32,
        elapsed: Duration,
    ) {
        let now_nanos = to_nanos(Utc::now());
        for event in &msg.events {
            let row = TelemetryEventRow {
                id: event.event_id.clone(),
                batch_id: msg.batch_id.clone(),
                project_id: msg.project_id.clone(),
                organization_id: msg.organization_id.clone(),
                environment: msg.environment.clone(),
                event_type: event.event_type.as_str().to_string(),
                event_data: event.event_payload.to_string(),
                timestamp: to_nanos(msg.timestamp),
                retry_count,
                processed_at: now_nanos,
            };
            if !self.fabric.submit_event(row, Priority::Normal) {
                tracing::debug!("batch {}: audit event row dropped by fabric", msg.batch_id);
            }
        }

        let batch_row = TelemetryBatchRow {
            id: msg.batch_id.clone(),
            project_id: msg.project_id.clone(),
            organization_id: msg.organization_id.clone(),
            environment: msg.environment.clone(),
            status: summary.status().to_string(),
            total_events: msg.events.len() as u32,
            processed_events: summary.processed_count as u32,
            failed_events: summary.failed_count as u32,
            processing_time_ms: elapsed.as_millis() as u64,
            metadata: serde_json::Value::Object(msg.metadata.clone()).to_string(),
            timestamp: to_nanos(msg.timestamp),
            processed_at: now_nanos,
        };
        if !self.fabric.submit_batch(batch_row, Priority::High) {
            tracing::debug!("batch {}: audit batch row dropped by fabric", msg.batch_id);
        }
    }

    /// Fire-and-forget Parquet uploads, one detached task per
    /// (signal, UTC day) bucket. Each task owns a fresh batch id and a 30s
    /// timeout independent of the consumer's read context, so acking the
    /// parent batch never cancels an upload in flight.
    fn spawn_archive_tasks(&self, msg: &TelemetryStreamMessage) {
        let Some(archive) = self.archive.as_ref() else {
            return;
        };
        let records: Vec<RawTelemetryRecord> = msg
            .events
            .iter()
            .filter_map(|e| raw_record(msg, e))
            .collect();
        for ((signal, day), bucket) in partition_records(records) {
            let archive = Arc::clone(archive);
            let config = self.archive_config.clone();
            let errors = Arc::clone(&self.archive_errors);
            let project_id = msg.project_id.clone();
            let batch_id = uuid::Uuid::new_v4().to_string();
            tokio::spawn(async move {
                let timeout = Duration::from_secs(config.timeout_secs);
                let (max_attempts, backoffs) = archive_retry_schedule(&config);
                for attempt in 0..max_attempts {
                    let result = tokio::time::timeout(
                        timeout,
                        archive.archive_batch(&project_id, &batch_id, &bucket),
                    )
                    .await;
                    let error_message = match result {
                        Ok(Ok(result)) => {
                            tracing::debug!(
                                "archived {}/{} {day}: {} record(s) at {}",
                                project_id,
                                signal.as_str(),
                                result.record_count,
                                result.path
                            );
                            return;
                        }
                        Ok(Err(e)) => e.to_string(),
                        Err(_) => format!("upload timeout after {timeout:?}"),
                    };
                    if attempt + 1 == max_attempts || !is_transient_error(&error_message) {
                        errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            "archive of {}/{} {day} failed after {} attempt(s): {error_message}",
                            project_id,
                            signal.as_str(),
                            attempt + 1
                        );
                        return;
                    }
                    tokio::time::sleep(backoffs[attempt as usize]).await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(id: &str, ty: &str, payload: serde_json::Value) -> TelemetryEvent {
        serde_json::from_value(serde_json::json!({
            "event_id": id,
            "event_type": ty,
            "event_payload": payload,
        }))
        .unwrap()
    }

    fn message(events: Vec<TelemetryEvent>) -> TelemetryStreamMessage {
        TelemetryStreamMessage {
            batch_id: "b1".into(),
            project_id: "proj-1".into(),
            organization_id: "org-1".into(),
            environment: "production".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            metadata: serde_json::Map::new(),
            events,
            claimed_event_ids: vec![],
        }
    }

    #[test]
    fn sort_is_stable_and_dependency_ordered() {
        let events = vec![
            event("q1", "quality_score", serde_json::json!({})),
            event("s1", "span", serde_json::json!({})),
            event("l1", "log", serde_json::json!({})),
            event("s2", "span", serde_json::json!({})),
            event("x1", "mystery", serde_json::json!({})),
        ];
        let sorted = sort_events(&events);
        let ids: Vec<&str> = sorted.iter().map(|e| e.event_id.as_str()).collect();
        // spans first (original relative order kept), score after log, unknown last
        assert_eq!(ids, vec!["s1", "s2", "l1", "q1", "x1"]);
    }

    #[test]
    fn groups_preserve_insert_order() {
        let events = vec![
            event("q1", "quality_score", serde_json::json!({})),
            event("s1", "span", serde_json::json!({})),
            event("g1", "metric_gauge", serde_json::json!({})),
            event("s2", "span", serde_json::json!({})),
        ];
        let sorted = sort_events(&events);
        let groups = group_events(&sorted);
        let order: Vec<EventType> = groups.iter().map(|(ty, _)| *ty).collect();
        assert_eq!(
            order,
            vec![EventType::Span, EventType::MetricGauge, EventType::QualityScore]
        );
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn raw_records_partition_by_signal_and_day() {
        let msg = message(vec![
            event(
                "s1",
                "span",
                serde_json::json!({"start_time": "2024-05-01T10:00:00Z", "trace_id": "t1", "span_id": "a"}),
            ),
            event(
                "s2",
                "span",
                serde_json::json!({"start_time": "2024-05-02T01:00:00Z", "trace_id": "t1", "span_id": "b"}),
            ),
            event(
                "l1",
                "log",
                serde_json::json!({"timestamp": "2024-05-01T10:00:00Z", "body": "hi"}),
            ),
            event("x1", "mystery", serde_json::json!({})),
        ]);
        let records: Vec<RawTelemetryRecord> =
            msg.events.iter().filter_map(|e| raw_record(&msg, e)).collect();
        // unknown event never archived
        assert_eq!(records.len(), 3);
        let buckets = partition_records(records);
        assert_eq!(buckets.len(), 3);
        let day1 = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        assert_eq!(buckets[&(SignalType::Traces, day1)].len(), 1);
        assert_eq!(buckets[&(SignalType::Traces, day2)].len(), 1);
        assert_eq!(buckets[&(SignalType::Logs, day1)].len(), 1);
        assert_eq!(buckets[&(SignalType::Traces, day1)][0].trace_id, "t1");
    }

    #[test]
    fn raw_record_falls_back_to_batch_day() {
        let msg = message(vec![event("g1", "genai_event", serde_json::json!({"span_id": "s"}))]);
        let record = raw_record(&msg, &msg.events[0]).unwrap();
        assert_eq!(record.timestamp, msg.timestamp);
        assert_eq!(record.signal_type, SignalType::Genai);
    }

    #[test]
    fn archive_uploads_get_exactly_three_attempts_by_default() {
        let config = ArchiveConfig::default();
        let (attempts, backoffs) = archive_retry_schedule(&config);
        assert_eq!(attempts, 3);
        assert_eq!(
            backoffs,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn archive_retry_schedule_floors_at_one_attempt() {
        let config = ArchiveConfig {
            max_retries: 0,
            ..ArchiveConfig::default()
        };
        let (attempts, backoffs) = archive_retry_schedule(&config);
        assert_eq!(attempts, 1);
        assert!(backoffs.is_empty());
    }

    #[test]
    fn summary_status_edges() {
        let ok = RouteSummary { processed_count: 3, failed_count: 0, skipped_count: 0 };
        assert_eq!(ok.status(), "completed");
        let partial = RouteSummary { processed_count: 2, failed_count: 1, skipped_count: 0 };
        assert_eq!(partial.status(), "partial");
        let failed = RouteSummary { processed_count: 0, failed_count: 3, skipped_count: 1 };
        assert_eq!(failed.status(), "failed");
    }
}
