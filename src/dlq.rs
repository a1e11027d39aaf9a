//! Dead-letter queue: capped, TTL'd per-tenant streams for batches that
//! exhausted their retries, with a list/retry surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::streams::StreamId;
use serde::Serialize;

use crate::config::DlqConfig;
use crate::models::event::TelemetryStreamMessage;
use crate::router::{BatchRouter, RouteSummary};
use crate::stream::{StreamTransport, project_from_stream};

#[derive(Debug, Clone, Serialize)]
pub struct DlqEntry {
    /// Id of the entry in the DLQ stream itself.
    pub message_id: String,
    pub original_stream: String,
    pub original_msg_id: String,
    pub batch_id: String,
    pub project_id: String,
    pub event_count: usize,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub original_data: String,
}

fn entry_fields(
    stream: &str,
    original_msg_id: &str,
    batch: Option<&TelemetryStreamMessage>,
    project_id: &str,
    original_data: &str,
    error: &str,
    retry_count: u32,
) -> Vec<(&'static str, String)> {
    vec![
        ("original_stream", stream.to_string()),
        ("original_msg_id", original_msg_id.to_string()),
        (
            "batch_id",
            batch.map(|b| b.batch_id.clone()).unwrap_or_default(),
        ),
        ("project_id", project_id.to_string()),
        (
            "event_count",
            batch.map(|b| b.events.len()).unwrap_or(0).to_string(),
        ),
        ("error_message", error.to_string()),
        ("failed_at", Utc::now().to_rfc3339()),
        ("retry_count", retry_count.to_string()),
        ("original_data", original_data.to_string()),
    ]
}

fn parse_entry(id: &StreamId) -> DlqEntry {
    let get = |field: &str| id.get::<String>(field).unwrap_or_default();
    DlqEntry {
        message_id: id.id.clone(),
        original_stream: get("original_stream"),
        original_msg_id: get("original_msg_id"),
        batch_id: get("batch_id"),
        project_id: get("project_id"),
        event_count: get("event_count").parse().unwrap_or(0),
        error_message: get("error_message"),
        failed_at: get("failed_at")
            .parse()
            .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH),
        retry_count: get("retry_count").parse().unwrap_or(0),
        original_data: get("original_data"),
    }
}

pub struct DlqManager {
    transport: StreamTransport,
    router: Arc<BatchRouter>,
    config: DlqConfig,
}

impl DlqManager {
    pub fn new(transport: StreamTransport, router: Arc<BatchRouter>, config: DlqConfig) -> Self {
        Self {
            transport,
            router,
            config,
        }
    }

    /// Append one entry to `telemetry:dlq:batches:<project>`. `batch` is None
    /// when the original data never parsed.
    pub async fn move_to_dlq(
        &self,
        stream: &str,
        original_msg_id: &str,
        batch: Option<&TelemetryStreamMessage>,
        original_data: &str,
        error: &str,
        retry_count: u32,
    ) -> anyhow::Result<String> {
        let project_id = batch
            .map(|b| b.project_id.clone())
            .or_else(|| project_from_stream(stream).map(str::to_string))
            .ok_or_else(|| anyhow::anyhow!("cannot derive project id for DLQ from {stream}"))?;

        let fields = entry_fields(
            stream,
            original_msg_id,
            batch,
            &project_id,
            original_data,
            error,
            retry_count,
        );
        let id = self
            .transport
            .append_dlq(
                &project_id,
                &fields,
                self.config.max_length,
                Duration::from_secs(self.config.retention_days * 24 * 3600),
            )
            .await?;
        tracing::info!(
            "batch {} moved to DLQ for project {project_id} (entry {id}): {error}",
            batch.map(|b| b.batch_id.as_str()).unwrap_or("<unparsed>")
        );
        Ok(id)
    }

    /// Most-recent-first DLQ entries for a tenant.
    pub async fn dlq_messages(
        &self,
        project_id: &str,
        count: usize,
    ) -> anyhow::Result<Vec<DlqEntry>> {
        let reply = self.transport.dlq_recent(project_id, count).await?;
        Ok(reply.ids.iter().map(parse_entry).collect())
    }

    /// Re-run the router over a dead-lettered batch; delete the entry on
    /// success.
    pub async fn retry_message(
        &self,
        project_id: &str,
        message_id: &str,
    ) -> anyhow::Result<RouteSummary> {
        let reply = self.transport.dlq_entry(project_id, message_id).await?;
        let entry = reply
            .ids
            .first()
            .map(parse_entry)
            .ok_or_else(|| anyhow::anyhow!("DLQ entry {message_id} not found for {project_id}"))?;

        let batch: TelemetryStreamMessage = serde_json::from_str(&entry.original_data)?;
        let summary = self
            .router
            .route_batch(&batch, entry.retry_count + 1)
            .await?;
        self.transport.dlq_delete(project_id, message_id).await?;
        tracing::info!(
            "DLQ retry of batch {} succeeded ({} event(s) persisted), entry {message_id} deleted",
            batch.batch_id,
            summary.processed_count
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn entry_fields_cover_contract() {
        let fields = entry_fields(
            "telemetry:batches:proj-1",
            "1-0",
            None,
            "proj-1",
            "{}",
            "boom",
            3,
        );
        let names: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            names,
            vec![
                "original_stream",
                "original_msg_id",
                "batch_id",
                "project_id",
                "event_count",
                "error_message",
                "failed_at",
                "retry_count",
                "original_data",
            ]
        );
    }

    #[test]
    fn parse_entry_round_trips() {
        let mut map = HashMap::new();
        for (k, v) in [
            ("original_stream", "telemetry:batches:proj-1"),
            ("original_msg_id", "5-0"),
            ("batch_id", "b1"),
            ("project_id", "proj-1"),
            ("event_count", "4"),
            ("error_message", "insert failed"),
            ("failed_at", "2024-05-01T12:00:00+00:00"),
            ("retry_count", "3"),
            ("original_data", "{\"batch_id\":\"b1\"}"),
        ] {
            map.insert(
                k.to_string(),
                redis::Value::BulkString(v.as_bytes().to_vec()),
            );
        }
        let id = StreamId {
            id: "7-0".to_string(),
            map,
        };
        let entry = parse_entry(&id);
        assert_eq!(entry.message_id, "7-0");
        assert_eq!(entry.original_msg_id, "5-0");
        assert_eq!(entry.event_count, 4);
        assert_eq!(entry.retry_count, 3);
        assert_eq!(entry.failed_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }
}
