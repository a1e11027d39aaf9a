use clickhouse::Row;
use serde::{Deserialize, Serialize};

use crate::models::event::{
    GenAiEventPayload, LogPayload, MetricExponentialHistogramPayload, MetricGaugePayload,
    MetricHistogramPayload, MetricSumPayload, ScorePayload, SpanPayload, TelemetryStreamMessage,
};

/// Convert a timestamp to i64 nanoseconds since epoch (DateTime64(9) columns).
pub fn to_nanos(ts: chrono::DateTime<chrono::Utc>) -> i64 {
    ts.timestamp_nanos_opt()
        .unwrap_or(ts.timestamp() * 1_000_000_000)
}

fn attrs_json(value: &serde_json::Value) -> String {
    if value.is_null() {
        "{}".to_string()
    } else {
        value.to_string()
    }
}

/// A span as stored in the `spans` table.
/// Sort key: (project_id, start_time, trace_id, span_id); (project_id,
/// event_id) identifies the row, and re-insertion is absorbed by merges.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct SpanRow {
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub event_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub attributes: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl SpanRow {
    pub fn from_payload(msg: &TelemetryStreamMessage, event_id: &str, p: SpanPayload) -> Self {
        Self {
            project_id: msg.project_id.clone(),
            organization_id: msg.organization_id.clone(),
            environment: msg.environment.clone(),
            event_id: event_id.to_string(),
            trace_id: p.trace_id,
            span_id: p.span_id,
            parent_span_id: p.parent_span_id,
            name: p.name,
            start_time: to_nanos(p.start_time),
            end_time: to_nanos(p.end_time),
            attributes: attrs_json(&p.attributes),
            input_tokens: p.usage.input_tokens,
            output_tokens: p.usage.output_tokens,
            total_tokens: p.usage.total_tokens,
            cost: p.cost,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct ScoreRow {
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub event_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub name: String,
    pub value: f64,
    pub comment: String,
    pub timestamp: i64,
}

impl ScoreRow {
    pub fn from_payload(msg: &TelemetryStreamMessage, event_id: &str, p: ScorePayload) -> Self {
        Self {
            project_id: msg.project_id.clone(),
            organization_id: msg.organization_id.clone(),
            environment: msg.environment.clone(),
            event_id: event_id.to_string(),
            trace_id: p.trace_id.unwrap_or_default(),
            span_id: p.span_id.unwrap_or_default(),
            name: p.name,
            value: p.value,
            comment: p.comment,
            timestamp: to_nanos(p.timestamp.unwrap_or(msg.timestamp)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct MetricSumRow {
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub event_id: String,
    pub metric_name: String,
    pub timestamp: i64,
    pub value: f64,
    pub attributes: String,
    pub is_monotonic: bool,
    pub aggregation_temporality: u8,
}

impl MetricSumRow {
    pub fn from_payload(msg: &TelemetryStreamMessage, event_id: &str, p: MetricSumPayload) -> Self {
        Self {
            project_id: msg.project_id.clone(),
            organization_id: msg.organization_id.clone(),
            environment: msg.environment.clone(),
            event_id: event_id.to_string(),
            metric_name: p.name,
            timestamp: to_nanos(p.timestamp),
            value: p.value,
            attributes: attrs_json(&p.attributes),
            is_monotonic: p.is_monotonic,
            aggregation_temporality: p.aggregation_temporality,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct MetricGaugeRow {
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub event_id: String,
    pub metric_name: String,
    pub timestamp: i64,
    pub value: f64,
    pub attributes: String,
}

impl MetricGaugeRow {
    pub fn from_payload(
        msg: &TelemetryStreamMessage,
        event_id: &str,
        p: MetricGaugePayload,
    ) -> Self {
        Self {
            project_id: msg.project_id.clone(),
            organization_id: msg.organization_id.clone(),
            environment: msg.environment.clone(),
            event_id: event_id.to_string(),
            metric_name: p.name,
            timestamp: to_nanos(p.timestamp),
            value: p.value,
            attributes: attrs_json(&p.attributes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct MetricHistogramRow {
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub event_id: String,
    pub metric_name: String,
    pub timestamp: i64,
    pub count: u64,
    pub sum: f64,
    pub bucket_counts: Vec<u64>,
    pub explicit_bounds: Vec<f64>,
    pub attributes: String,
}

impl MetricHistogramRow {
    pub fn from_payload(
        msg: &TelemetryStreamMessage,
        event_id: &str,
        p: MetricHistogramPayload,
    ) -> Self {
        Self {
            project_id: msg.project_id.clone(),
            organization_id: msg.organization_id.clone(),
            environment: msg.environment.clone(),
            event_id: event_id.to_string(),
            metric_name: p.name,
            timestamp: to_nanos(p.timestamp),
            count: p.count,
            sum: p.sum,
            bucket_counts: p.bucket_counts,
            explicit_bounds: p.explicit_bounds,
            attributes: attrs_json(&p.attributes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct MetricExponentialHistogramRow {
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub event_id: String,
    pub metric_name: String,
    pub timestamp: i64,
    pub count: u64,
    pub sum: f64,
    pub scale: i32,
    pub zero_count: u64,
    pub positive_offset: i32,
    pub positive_bucket_counts: Vec<u64>,
    pub negative_offset: i32,
    pub negative_bucket_counts: Vec<u64>,
    pub attributes: String,
}

impl MetricExponentialHistogramRow {
    pub fn from_payload(
        msg: &TelemetryStreamMessage,
        event_id: &str,
        p: MetricExponentialHistogramPayload,
    ) -> Self {
        Self {
            project_id: msg.project_id.clone(),
            organization_id: msg.organization_id.clone(),
            environment: msg.environment.clone(),
            event_id: event_id.to_string(),
            metric_name: p.name,
            timestamp: to_nanos(p.timestamp),
            count: p.count,
            sum: p.sum,
            scale: p.scale,
            zero_count: p.zero_count,
            positive_offset: p.positive_offset,
            positive_bucket_counts: p.positive_bucket_counts,
            negative_offset: p.negative_offset,
            negative_bucket_counts: p.negative_bucket_counts,
            attributes: attrs_json(&p.attributes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct LogRow {
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub event_id: String,
    pub timestamp: i64,
    pub trace_id: String,
    pub span_id: String,
    pub body: String,
    pub severity_text: String,
    pub severity_number: u8,
    pub attributes: String,
}

impl LogRow {
    pub fn from_payload(msg: &TelemetryStreamMessage, event_id: &str, p: LogPayload) -> Self {
        Self {
            project_id: msg.project_id.clone(),
            organization_id: msg.organization_id.clone(),
            environment: msg.environment.clone(),
            event_id: event_id.to_string(),
            timestamp: to_nanos(p.timestamp),
            trace_id: p.trace_id.unwrap_or_default(),
            span_id: p.span_id.unwrap_or_default(),
            body: p.body,
            severity_text: p.severity_text,
            severity_number: p.severity_number,
            attributes: attrs_json(&p.attributes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct GenAiEventRow {
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub event_id: String,
    pub span_id: String,
    pub event_name: String,
    pub payload: String,
    pub timestamp: i64,
}

impl GenAiEventRow {
    pub fn from_payload(
        msg: &TelemetryStreamMessage,
        event_id: &str,
        p: GenAiEventPayload,
    ) -> Self {
        Self {
            project_id: msg.project_id.clone(),
            organization_id: msg.organization_id.clone(),
            environment: msg.environment.clone(),
            event_id: event_id.to_string(),
            span_id: p.span_id,
            event_name: p.event_name,
            payload: attrs_json(&p.payload),
            timestamp: to_nanos(p.timestamp.unwrap_or(msg.timestamp)),
        }
    }
}

/// Audit row: one per ingested event, also the source for usage metering
/// (`countIf` by event_type, `sum(length(event_data))` for bytes).
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct TelemetryEventRow {
    pub id: String,
    pub batch_id: String,
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub event_type: String,
    pub event_data: String,
    pub timestamp: i64,
    pub retry_count: u32,
    pub processed_at: i64,
}

/// Audit row: one per routed batch.
#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct TelemetryBatchRow {
    pub id: String,
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub status: String,
    pub total_events: u32,
    pub processed_events: u32,
    pub failed_events: u32,
    pub processing_time_ms: u64,
    pub metadata: String,
    pub timestamp: i64,
    pub processed_at: i64,
}
