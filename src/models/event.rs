use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stream message carrying N heterogeneous events from one tenant.
/// This is the JSON shape published by the ingest handlers under the `data`
/// field of `telemetry:batches:<project_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryStreamMessage {
    pub batch_id: String,
    pub project_id: String,
    pub organization_id: String,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub events: Vec<TelemetryEvent>,
    /// Event ids the ingest handler claimed before publishing. Always a
    /// subset of the batch's event ids.
    #[serde(default)]
    pub claimed_event_ids: Vec<String>,
}

impl TelemetryStreamMessage {
    pub fn claims_are_consistent(&self) -> bool {
        self.claimed_event_ids
            .iter()
            .all(|id| self.events.iter().any(|e| &e.event_id == id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub event_payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl TelemetryEvent {
    /// Best timestamp for day-partitioning: the payload's own clock if it has
    /// one, otherwise the caller falls back to the batch header.
    pub fn payload_timestamp(&self) -> Option<DateTime<Utc>> {
        for key in ["timestamp", "start_time"] {
            if let Some(ts) = self.event_payload.get(key).and_then(|v| v.as_str()) {
                if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
                    return Some(dt.with_timezone(&Utc));
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Span,
    QualityScore,
    MetricSum,
    MetricGauge,
    MetricHistogram,
    MetricExponentialHistogram,
    Log,
    GenaiEvent,
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Routing order within a batch. Scores reference spans, so spans must be
    /// persisted first; unknown types sort last and are skipped.
    pub fn routing_priority(self) -> u8 {
        match self {
            EventType::Span => 0,
            EventType::MetricSum
            | EventType::MetricGauge
            | EventType::MetricHistogram
            | EventType::MetricExponentialHistogram => 1,
            EventType::Log => 2,
            EventType::GenaiEvent => 3,
            EventType::QualityScore => 4,
            EventType::Unknown => 5,
        }
    }

    /// Archive partition key. Scores archive under `traces` (they carry
    /// trace/span ids); unknown types are never archived.
    pub fn signal(self) -> Option<SignalType> {
        match self {
            EventType::Span | EventType::QualityScore => Some(SignalType::Traces),
            EventType::Log => Some(SignalType::Logs),
            EventType::MetricSum
            | EventType::MetricGauge
            | EventType::MetricHistogram
            | EventType::MetricExponentialHistogram => Some(SignalType::Metrics),
            EventType::GenaiEvent => Some(SignalType::Genai),
            EventType::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Span => "span",
            EventType::QualityScore => "quality_score",
            EventType::MetricSum => "metric_sum",
            EventType::MetricGauge => "metric_gauge",
            EventType::MetricHistogram => "metric_histogram",
            EventType::MetricExponentialHistogram => "metric_exponential_histogram",
            EventType::Log => "log",
            EventType::GenaiEvent => "genai_event",
            EventType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Traces,
    Logs,
    Metrics,
    Genai,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Traces => "traces",
            SignalType::Logs => "logs",
            SignalType::Metrics => "metrics",
            SignalType::Genai => "genai",
        }
    }
}

/// Raw payload copy headed for the object-storage archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTelemetryRecord {
    pub record_id: String,
    pub project_id: String,
    pub signal_type: SignalType,
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
    pub span_id: String,
    pub span_json_raw: String,
    pub archived_at: DateTime<Utc>,
}

// ── Wire payload shapes (JSON round-tripped into typed rows) ──

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpanUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpanPayload {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub usage: SpanUsage,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScorePayload {
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricSumPayload {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub is_monotonic: bool,
    #[serde(default)]
    pub aggregation_temporality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricGaugePayload {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricHistogramPayload {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub count: u64,
    pub sum: f64,
    #[serde(default)]
    pub bucket_counts: Vec<u64>,
    #[serde(default)]
    pub explicit_bounds: Vec<f64>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricExponentialHistogramPayload {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub count: u64,
    pub sum: f64,
    #[serde(default)]
    pub scale: i32,
    #[serde(default)]
    pub zero_count: u64,
    #[serde(default)]
    pub positive_offset: i32,
    #[serde(default)]
    pub positive_bucket_counts: Vec<u64>,
    #[serde(default)]
    pub negative_offset: i32,
    #[serde(default)]
    pub negative_bucket_counts: Vec<u64>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogPayload {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    pub body: String,
    #[serde(default)]
    pub severity_text: String,
    #[serde(default)]
    pub severity_number: u8,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenAiEventPayload {
    pub span_id: String,
    pub event_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, event_type: EventType) -> TelemetryEvent {
        TelemetryEvent {
            event_id: id.to_string(),
            event_type,
            event_payload: serde_json::json!({}),
            trace_id: None,
            span_id: None,
        }
    }

    #[test]
    fn event_type_round_trips_snake_case() {
        let json = serde_json::to_string(&EventType::MetricExponentialHistogram).unwrap();
        assert_eq!(json, "\"metric_exponential_histogram\"");
        let parsed: EventType = serde_json::from_str("\"genai_event\"").unwrap();
        assert_eq!(parsed, EventType::GenaiEvent);
    }

    #[test]
    fn unrecognized_event_type_parses_as_unknown() {
        let parsed: EventType = serde_json::from_str("\"profile_sample\"").unwrap();
        assert_eq!(parsed, EventType::Unknown);
        assert_eq!(parsed.routing_priority(), 5);
        assert!(parsed.signal().is_none());
    }

    #[test]
    fn spans_route_before_scores() {
        assert!(EventType::Span.routing_priority() < EventType::MetricSum.routing_priority());
        assert!(EventType::MetricSum.routing_priority() < EventType::Log.routing_priority());
        assert!(EventType::Log.routing_priority() < EventType::QualityScore.routing_priority());
        assert!(
            EventType::QualityScore.routing_priority() < EventType::Unknown.routing_priority()
        );
    }

    #[test]
    fn claim_subset_invariant() {
        let msg = TelemetryStreamMessage {
            batch_id: "b1".into(),
            project_id: "p1".into(),
            organization_id: "o1".into(),
            environment: "prod".into(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
            events: vec![event("e1", EventType::Span), event("e2", EventType::Log)],
            claimed_event_ids: vec!["e1".into()],
        };
        assert!(msg.claims_are_consistent());

        let mut bad = msg.clone();
        bad.claimed_event_ids = vec!["e1".into(), "e9".into()];
        assert!(!bad.claims_are_consistent());
    }

    #[test]
    fn payload_timestamp_prefers_event_clock() {
        let mut e = event("e1", EventType::Span);
        e.event_payload = serde_json::json!({ "start_time": "2024-05-01T12:00:00Z" });
        let ts = e.payload_timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T12:00:00+00:00");

        let bare = event("e2", EventType::Log);
        assert!(bare.payload_timestamp().is_none());
    }

    #[test]
    fn score_payload_tolerates_missing_optionals() {
        let p: ScorePayload = serde_json::from_value(serde_json::json!({
            "name": "helpfulness",
            "value": 0.92,
        }))
        .unwrap();
        assert!(p.trace_id.is_none());
        assert_eq!(p.comment, "");
    }
}
