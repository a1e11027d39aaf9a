use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level config loaded from `fathom.toml`.
///
/// Connection endpoints (Redis, ClickHouse, SMTP, object storage) come from
/// the environment; this file holds tuning knobs only.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FathomConfig {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub claims: ClaimsConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_consumer_group")]
    pub group: String,
    /// Defaults to `worker-<uuid>` when empty so parallel replicas never collide.
    #[serde(default)]
    pub consumer_id: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_max_streams_per_read")]
    pub max_streams_per_read: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: default_consumer_group(),
            consumer_id: String::new(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            discovery_interval_secs: default_discovery_interval_secs(),
            max_streams_per_read: default_max_streams_per_read(),
        }
    }
}

impl ConsumerConfig {
    pub fn effective_consumer_id(&self) -> String {
        if self.consumer_id.is_empty() {
            format!("worker-{}", uuid::Uuid::new_v4())
        } else {
            self.consumer_id.clone()
        }
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_consumer_group() -> String {
    "telemetry-workers".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_block_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_discovery_interval_secs() -> u64 {
    30
}

fn default_max_streams_per_read() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_archive_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_archive_timeout_secs(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
        }
    }
}

fn default_archive_timeout_secs() -> u64 {
    30
}

fn default_base_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    #[serde(default = "default_analytics_workers")]
    pub analytics_workers: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_fabric_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            analytics_workers: default_analytics_workers(),
            buffer_size: default_buffer_size(),
            batch_interval_ms: default_batch_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_fabric_backoff_ms(),
        }
    }
}

fn default_analytics_workers() -> usize {
    8
}

fn default_buffer_size() -> usize {
    4500
}

fn default_batch_interval_ms() -> u64 {
    2000
}

fn default_fabric_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_sync_interval_minutes")]
    pub sync_interval_minutes: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            sync_interval_minutes: default_sync_interval_minutes(),
        }
    }
}

fn default_sync_interval_minutes() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_dlq_max_length")]
    pub max_length: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            retention_days: default_dlq_retention_days(),
            max_length: default_dlq_max_length(),
        }
    }
}

fn default_dlq_retention_days() -> u64 {
    7
}

fn default_dlq_max_length() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimsConfig {
    /// Must cover DLQ retention + processing window; the 24h default
    /// dominates any legitimate SDK retry.
    #[serde(default = "default_claim_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_claim_ttl_hours(),
        }
    }
}

fn default_claim_ttl_hours() -> u64 {
    24
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_notification_workers")]
    pub workers: usize,
    #[serde(default = "default_notification_queue_size")]
    pub queue_size: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            workers: default_notification_workers(),
            queue_size: default_notification_queue_size(),
        }
    }
}

fn default_notification_workers() -> usize {
    2
}

fn default_notification_queue_size() -> usize {
    256
}

impl FathomConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: FathomConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = FathomConfig::default();
        assert_eq!(cfg.consumer.group, "telemetry-workers");
        assert_eq!(cfg.consumer.batch_size, 50);
        assert_eq!(cfg.consumer.block_ms, 1000);
        assert_eq!(cfg.consumer.max_retries, 3);
        assert_eq!(cfg.consumer.max_streams_per_read, 10);
        assert_eq!(cfg.fabric.analytics_workers, 8);
        assert_eq!(cfg.fabric.buffer_size, 4500);
        assert_eq!(cfg.usage.sync_interval_minutes, 5);
        assert_eq!(cfg.dlq.retention_days, 7);
        assert_eq!(cfg.dlq.max_length, 1000);
        assert_eq!(cfg.claims.ttl_hours, 24);
        assert!(!cfg.archive.enabled);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: FathomConfig = toml::from_str(
            r#"
            [consumer]
            batch_size = 10

            [archive]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.consumer.batch_size, 10);
        assert_eq!(cfg.consumer.group, "telemetry-workers");
        assert!(cfg.archive.enabled);
        assert_eq!(cfg.archive.timeout_secs, 30);
    }

    #[test]
    fn generated_consumer_id_has_worker_prefix() {
        let cfg = ConsumerConfig::default();
        assert!(cfg.effective_consumer_id().starts_with("worker-"));
    }
}
