//! Raw-payload archival: partitioned Parquet files in object storage, laid
//! out `<project>/<signal>/<YYYY>/<MM>/<DD>/<batch_id>.parquet`.
//!
//! Archival is a best-effort side channel; the columnar store stays the
//! source of truth and the schema here must stay stable for replay.

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDate};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::models::event::RawTelemetryRecord;
use crate::models::rows::to_nanos;

#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub path: String,
    pub record_count: usize,
    pub file_size_bytes: usize,
}

pub fn archive_path(project_id: &str, signal: &str, day: NaiveDate, batch_id: &str) -> String {
    format!(
        "{project_id}/{signal}/{:04}/{:02}/{:02}/{batch_id}.parquet",
        day.year(),
        day.month(),
        day.day()
    )
}

fn encode_parquet(records: &[RawTelemetryRecord]) -> anyhow::Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("record_id", DataType::Utf8, false),
        Field::new("project_id", DataType::Utf8, false),
        Field::new("signal_type", DataType::Utf8, false),
        Field::new("timestamp", DataType::Int64, false),
        Field::new("trace_id", DataType::Utf8, false),
        Field::new("span_id", DataType::Utf8, false),
        Field::new("span_json_raw", DataType::Utf8, false),
        Field::new("archived_at", DataType::Int64, false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.record_id.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.project_id.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.signal_type.as_str()),
        )),
        Arc::new(Int64Array::from_iter_values(
            records.iter().map(|r| to_nanos(r.timestamp)),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.trace_id.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.span_id.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.span_json_raw.as_str()),
        )),
        Arc::new(Int64Array::from_iter_values(
            records.iter().map(|r| to_nanos(r.archived_at)),
        )),
    ];

    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}

#[derive(Clone)]
pub struct ArchiveStore {
    store: Arc<dyn ObjectStore>,
}

impl ArchiveStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Upload one partition's records as a single Parquet file. All records
    /// in a call must share (project, signal, UTC day) — the router groups
    /// before calling.
    pub async fn archive_batch(
        &self,
        project_id: &str,
        batch_id: &str,
        records: &[RawTelemetryRecord],
    ) -> anyhow::Result<ArchiveResult> {
        let first = records
            .first()
            .ok_or_else(|| anyhow::anyhow!("archive batch is empty"))?;
        let signal = first.signal_type;
        let day = first.timestamp.date_naive();
        for record in records {
            if record.project_id != project_id
                || record.signal_type != signal
                || record.timestamp.date_naive() != day
            {
                anyhow::bail!(
                    "archive batch mixes partitions: expected ({project_id}, {}, {day}), got ({}, {}, {})",
                    signal.as_str(),
                    record.project_id,
                    record.signal_type.as_str(),
                    record.timestamp.date_naive(),
                );
            }
        }

        let buf = encode_parquet(records)?;
        let file_size_bytes = buf.len();
        let path = archive_path(project_id, signal.as_str(), day, batch_id);
        self.store
            .put(&ObjectPath::from(path.as_str()), PutPayload::from(buf))
            .await?;

        tracing::debug!(
            "archived {} record(s) to {path} ({file_size_bytes} bytes)",
            records.len()
        );
        Ok(ArchiveResult {
            path,
            record_count: records.len(),
            file_size_bytes,
        })
    }
}

/// Transient-vs-permanent classification for upload retries.
pub fn is_transient_error(message: &str) -> bool {
    const TRANSIENT: &[&str] = &[
        "timeout",
        "429",
        "500",
        "503",
        "i/o timeout",
        "connection refused",
        "connection reset",
        "TLS handshake",
        "service unavailable",
    ];
    let lower = message.to_lowercase();
    TRANSIENT.iter().any(|t| lower.contains(&t.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::SignalType;
    use chrono::{TimeZone, Utc};
    use object_store::memory::InMemory;

    fn record(project: &str, signal: SignalType, ts: &str, id: &str) -> RawTelemetryRecord {
        RawTelemetryRecord {
            record_id: id.to_string(),
            project_id: project.to_string(),
            signal_type: signal,
            timestamp: ts.parse().unwrap(),
            trace_id: "t1".into(),
            span_id: "s1".into(),
            span_json_raw: "{\"name\":\"chat\"}".into(),
            archived_at: Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap(),
        }
    }

    #[test]
    fn path_layout_is_partitioned_by_day() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(
            archive_path("proj-1", "traces", day, "batch-9"),
            "proj-1/traces/2024/05/01/batch-9.parquet"
        );
    }

    #[tokio::test]
    async fn uploads_single_partition() {
        let store = Arc::new(InMemory::new());
        let archive = ArchiveStore::new(store.clone());
        let records = vec![
            record("proj-1", SignalType::Traces, "2024-05-01T10:00:00Z", "r1"),
            record("proj-1", SignalType::Traces, "2024-05-01T23:59:59Z", "r2"),
        ];
        let result = archive
            .archive_batch("proj-1", "batch-1", &records)
            .await
            .unwrap();
        assert_eq!(result.record_count, 2);
        assert_eq!(result.path, "proj-1/traces/2024/05/01/batch-1.parquet");

        let stored = store
            .get(&ObjectPath::from(result.path.as_str()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.len(), result.file_size_bytes);
        // Parquet magic at both ends
        assert_eq!(&stored[..4], b"PAR1");
        assert_eq!(&stored[stored.len() - 4..], b"PAR1");
    }

    #[tokio::test]
    async fn rejects_mixed_partitions() {
        let archive = ArchiveStore::new(Arc::new(InMemory::new()));
        let records = vec![
            record("proj-1", SignalType::Traces, "2024-05-01T10:00:00Z", "r1"),
            record("proj-1", SignalType::Logs, "2024-05-01T10:00:00Z", "r2"),
        ];
        assert!(archive.archive_batch("proj-1", "b", &records).await.is_err());

        let cross_day = vec![
            record("proj-1", SignalType::Traces, "2024-05-01T23:59:59Z", "r1"),
            record("proj-1", SignalType::Traces, "2024-05-02T00:00:01Z", "r2"),
        ];
        assert!(archive.archive_batch("proj-1", "b", &cross_day).await.is_err());
    }

    #[tokio::test]
    async fn rejects_empty_batch() {
        let archive = ArchiveStore::new(Arc::new(InMemory::new()));
        assert!(archive.archive_batch("proj-1", "b", &[]).await.is_err());
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient_error("upload failed: 503 Service Unavailable"));
        assert!(is_transient_error("connection reset by peer"));
        assert!(is_transient_error("TLS handshake eof"));
        assert!(!is_transient_error("access denied"));
        assert!(!is_transient_error("bucket does not exist"));
    }
}
