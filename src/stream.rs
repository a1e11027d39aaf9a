//! Redis Streams transport: per-tenant append-only batch logs with consumer
//! groups, plus the capped dead-letter streams.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamKey, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply,
};

pub const BATCH_STREAM_PREFIX: &str = "telemetry:batches:";
pub const DLQ_STREAM_PREFIX: &str = "telemetry:dlq:batches:";

pub fn batch_stream_key(project_id: &str) -> String {
    format!("{BATCH_STREAM_PREFIX}{project_id}")
}

pub fn dlq_stream_key(project_id: &str) -> String {
    format!("{DLQ_STREAM_PREFIX}{project_id}")
}

/// Project id from a `telemetry:batches:<project_id>` key.
pub fn project_from_stream(stream: &str) -> Option<&str> {
    stream.strip_prefix(BATCH_STREAM_PREFIX).filter(|p| !p.is_empty())
}

#[derive(Clone)]
pub struct StreamTransport {
    con: ConnectionManager,
}

impl StreamTransport {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let con = ConnectionManager::new(client).await?;
        Ok(Self { con })
    }

    /// Publish a JSON-encoded batch message to the tenant's stream.
    /// Ingest handlers must claim event ids before calling this.
    pub async fn publish_batch(&self, project_id: &str, data: &str) -> anyhow::Result<String> {
        let mut con = self.con.clone();
        let id: String = con
            .xadd(batch_stream_key(project_id), "*", &[("data", data)])
            .await?;
        Ok(id)
    }

    /// XGROUP CREATE MKSTREAM at offset "0" so batches published before the
    /// consumer started are not lost. BUSYGROUP means another worker won the
    /// race, which is fine.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> anyhow::Result<()> {
        let mut con = self.con.clone();
        match con
            .xgroup_create_mkstream::<_, _, _, String>(stream, group, "0")
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// SCAN-discover every per-tenant batch stream.
    pub async fn scan_batch_streams(&self) -> anyhow::Result<Vec<String>> {
        let mut con = self.con.clone();
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter: redis::AsyncIter<'_, String> =
                con.scan_match(format!("{BATCH_STREAM_PREFIX}*")).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// XREADGROUP over up to `max_streams_per_read` streams with the ">"
    /// last-delivered marker. Returns empty on block timeout.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> anyhow::Result<Vec<StreamKey>> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.con.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let reply: Option<StreamReadReply> = con.xread_options(streams, &ids, &opts).await?;
        Ok(reply.map(|r| r.keys).unwrap_or_default())
    }

    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> anyhow::Result<()> {
        let mut con = self.con.clone();
        let _: i64 = con.xack(stream, group, &[id]).await?;
        Ok(())
    }

    // ── DLQ primitives ──

    /// XADD MAXLEN ~N to the tenant DLQ stream and refresh its TTL.
    pub async fn append_dlq(
        &self,
        project_id: &str,
        fields: &[(&str, String)],
        max_length: usize,
        retention: Duration,
    ) -> anyhow::Result<String> {
        let key = dlq_stream_key(project_id);
        let mut con = self.con.clone();
        let id: String = con
            .xadd_maxlen(&key, StreamMaxlen::Approx(max_length), "*", fields)
            .await?;
        let _: bool = con.expire(&key, retention.as_secs() as i64).await?;
        Ok(id)
    }

    /// Most-recent-first DLQ entries.
    pub async fn dlq_recent(
        &self,
        project_id: &str,
        count: usize,
    ) -> anyhow::Result<StreamRangeReply> {
        let mut con = self.con.clone();
        let reply: StreamRangeReply = con
            .xrevrange_count(dlq_stream_key(project_id), "+", "-", count)
            .await?;
        Ok(reply)
    }

    pub async fn dlq_entry(
        &self,
        project_id: &str,
        message_id: &str,
    ) -> anyhow::Result<StreamRangeReply> {
        let mut con = self.con.clone();
        let reply: StreamRangeReply = con
            .xrange(dlq_stream_key(project_id), message_id, message_id)
            .await?;
        Ok(reply)
    }

    pub async fn dlq_delete(&self, project_id: &str, message_id: &str) -> anyhow::Result<()> {
        let mut con = self.con.clone();
        let _: i64 = con.xdel(dlq_stream_key(project_id), &[message_id]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keys_carry_tenant() {
        assert_eq!(batch_stream_key("proj-1"), "telemetry:batches:proj-1");
        assert_eq!(dlq_stream_key("proj-1"), "telemetry:dlq:batches:proj-1");
    }

    #[test]
    fn project_extraction() {
        assert_eq!(project_from_stream("telemetry:batches:proj-1"), Some("proj-1"));
        assert_eq!(project_from_stream("telemetry:batches:"), None);
        assert_eq!(project_from_stream("other:key"), None);
    }
}
