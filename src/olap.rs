//! Typed bulk inserts into the columnar store, plus the usage-summary
//! aggregation the billing sync reads.
//!
//! Every batch insert is a single INSERT statement (the commit boundary); a
//! failure is retryable at batch granularity because nothing partial commits.

use chrono::{DateTime, Utc};
use clickhouse::Client;
use serde::Serialize;
use std::time::Duration;

use crate::models::rows::{
    GenAiEventRow, LogRow, MetricExponentialHistogramRow, MetricGaugeRow, MetricHistogramRow,
    MetricSumRow, ScoreRow, SpanRow, TelemetryBatchRow, TelemetryEventRow, to_nanos,
};

const BULK_INSERT_TIMEOUT: Duration = Duration::from_secs(60);
const SINGLE_INSERT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct UsageSummary {
    pub total_spans: u64,
    pub total_bytes: u64,
    pub total_scores: u64,
    pub period_start: DateTime<Utc>,
}

#[derive(clickhouse::Row, serde::Deserialize)]
struct UsageTotalsRow {
    total_spans: u64,
    total_bytes: u64,
    total_scores: u64,
}

fn build_usage_sql(
    organization_id: &str,
    project_id: Option<&str>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> String {
    let org = organization_id.replace('\'', "\\'");
    let project_filter = match project_id {
        Some(p) => format!(" AND project_id = '{}'", p.replace('\'', "\\'")),
        None => String::new(),
    };
    format!(
        "SELECT countIf(event_type = 'span') as total_spans, \
         sum(length(event_data)) as total_bytes, \
         countIf(event_type = 'quality_score') as total_scores \
         FROM telemetry_events \
         WHERE organization_id = '{org}'{project_filter} \
         AND timestamp >= {from} AND timestamp < {to}",
        from = to_nanos(from),
        to = to_nanos(to),
    )
}

#[derive(Clone)]
pub struct OlapRepository {
    ch: Client,
}

impl OlapRepository {
    pub fn new(ch: Client) -> Self {
        Self { ch }
    }

    async fn insert_rows<T>(&self, table: &str, rows: &[T], timeout: Duration) -> anyhow::Result<()>
    where
        T: clickhouse::Row + Serialize,
    {
        if rows.is_empty() {
            return Ok(());
        }
        let write = async {
            let mut insert = self.ch.insert(table)?;
            for row in rows {
                insert.write(row).await?;
            }
            insert.end().await?;
            Ok::<(), anyhow::Error>(())
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| anyhow::anyhow!("insert into {table} timed out after {timeout:?}"))??;
        Ok(())
    }

    // ── Spans ──

    pub async fn insert_span(&self, row: &SpanRow) -> anyhow::Result<()> {
        self.insert_rows("spans", std::slice::from_ref(row), SINGLE_INSERT_TIMEOUT)
            .await
    }

    pub async fn insert_spans(&self, rows: &[SpanRow]) -> anyhow::Result<()> {
        self.insert_rows("spans", rows, BULK_INSERT_TIMEOUT).await
    }

    // ── Quality scores ──

    pub async fn insert_score(&self, row: &ScoreRow) -> anyhow::Result<()> {
        self.insert_rows("scores", std::slice::from_ref(row), SINGLE_INSERT_TIMEOUT)
            .await
    }

    pub async fn insert_scores(&self, rows: &[ScoreRow]) -> anyhow::Result<()> {
        self.insert_rows("scores", rows, BULK_INSERT_TIMEOUT).await
    }

    // ── Metric variants ──

    pub async fn insert_metric_sum(&self, row: &MetricSumRow) -> anyhow::Result<()> {
        self.insert_rows("metric_sum", std::slice::from_ref(row), SINGLE_INSERT_TIMEOUT)
            .await
    }

    pub async fn insert_metric_sums(&self, rows: &[MetricSumRow]) -> anyhow::Result<()> {
        self.insert_rows("metric_sum", rows, BULK_INSERT_TIMEOUT).await
    }

    pub async fn insert_metric_gauge(&self, row: &MetricGaugeRow) -> anyhow::Result<()> {
        self.insert_rows("metric_gauge", std::slice::from_ref(row), SINGLE_INSERT_TIMEOUT)
            .await
    }

    pub async fn insert_metric_gauges(&self, rows: &[MetricGaugeRow]) -> anyhow::Result<()> {
        self.insert_rows("metric_gauge", rows, BULK_INSERT_TIMEOUT).await
    }

    pub async fn insert_metric_histogram(&self, row: &MetricHistogramRow) -> anyhow::Result<()> {
        self.insert_rows(
            "metric_histogram",
            std::slice::from_ref(row),
            SINGLE_INSERT_TIMEOUT,
        )
        .await
    }

    pub async fn insert_metric_histograms(
        &self,
        rows: &[MetricHistogramRow],
    ) -> anyhow::Result<()> {
        self.insert_rows("metric_histogram", rows, BULK_INSERT_TIMEOUT)
            .await
    }

    pub async fn insert_metric_exponential_histogram(
        &self,
        row: &MetricExponentialHistogramRow,
    ) -> anyhow::Result<()> {
        self.insert_rows(
            "metric_exponential_histogram",
            std::slice::from_ref(row),
            SINGLE_INSERT_TIMEOUT,
        )
        .await
    }

    pub async fn insert_metric_exponential_histograms(
        &self,
        rows: &[MetricExponentialHistogramRow],
    ) -> anyhow::Result<()> {
        self.insert_rows("metric_exponential_histogram", rows, BULK_INSERT_TIMEOUT)
            .await
    }

    // ── Logs ──

    pub async fn insert_log(&self, row: &LogRow) -> anyhow::Result<()> {
        self.insert_rows("logs", std::slice::from_ref(row), SINGLE_INSERT_TIMEOUT)
            .await
    }

    pub async fn insert_logs(&self, rows: &[LogRow]) -> anyhow::Result<()> {
        self.insert_rows("logs", rows, BULK_INSERT_TIMEOUT).await
    }

    // ── GenAI events ──

    pub async fn insert_genai_event(&self, row: &GenAiEventRow) -> anyhow::Result<()> {
        self.insert_rows("genai_events", std::slice::from_ref(row), SINGLE_INSERT_TIMEOUT)
            .await
    }

    pub async fn insert_genai_events(&self, rows: &[GenAiEventRow]) -> anyhow::Result<()> {
        self.insert_rows("genai_events", rows, BULK_INSERT_TIMEOUT).await
    }

    // ── Audit trail ──

    pub async fn insert_telemetry_event(&self, row: &TelemetryEventRow) -> anyhow::Result<()> {
        self.insert_rows(
            "telemetry_events",
            std::slice::from_ref(row),
            SINGLE_INSERT_TIMEOUT,
        )
        .await
    }

    pub async fn insert_telemetry_events(&self, rows: &[TelemetryEventRow]) -> anyhow::Result<()> {
        self.insert_rows("telemetry_events", rows, BULK_INSERT_TIMEOUT)
            .await
    }

    pub async fn insert_telemetry_batch(&self, row: &TelemetryBatchRow) -> anyhow::Result<()> {
        self.insert_rows(
            "telemetry_batches",
            std::slice::from_ref(row),
            SINGLE_INSERT_TIMEOUT,
        )
        .await
    }

    pub async fn insert_telemetry_batches(
        &self,
        rows: &[TelemetryBatchRow],
    ) -> anyhow::Result<()> {
        self.insert_rows("telemetry_batches", rows, BULK_INSERT_TIMEOUT)
            .await
    }

    /// Metered totals for `[from, to)`, org-wide or filtered to one project.
    pub async fn usage_summary(
        &self,
        organization_id: &str,
        project_id: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<UsageSummary> {
        let sql = build_usage_sql(organization_id, project_id, from, to);
        let row = self.ch.query(&sql).fetch_one::<UsageTotalsRow>().await?;
        Ok(UsageSummary {
            total_spans: row.total_spans,
            total_bytes: row.total_bytes,
            total_scores: row.total_scores,
            period_start: from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn usage_sql_filters_org_and_window() {
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let sql = build_usage_sql("org-1", None, from, to);
        assert!(sql.contains("organization_id = 'org-1'"));
        assert!(sql.contains(&format!("timestamp >= {}", to_nanos(from))));
        assert!(sql.contains(&format!("timestamp < {}", to_nanos(to))));
        assert!(!sql.contains("project_id"));
    }

    #[test]
    fn usage_sql_escapes_and_scopes_project() {
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let sql = build_usage_sql("o'rg", Some("proj-1"), from, to);
        assert!(sql.contains("organization_id = 'o\\'rg'"));
        assert!(sql.contains("project_id = 'proj-1'"));
    }
}
