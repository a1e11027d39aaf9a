use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use axum::{Router, routing::get, routing::post};
use clickhouse::Client;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fathom_ingest::AppState;
use fathom_ingest::archive::ArchiveStore;
use fathom_ingest::billing_db::BillingDb;
use fathom_ingest::claims::ClaimStore;
use fathom_ingest::config::FathomConfig;
use fathom_ingest::consumer::StreamConsumer;
use fathom_ingest::contracts::ContractWorker;
use fathom_ingest::dlq::DlqManager;
use fathom_ingest::fabric::AnalyticsFabric;
use fathom_ingest::handlers;
use fathom_ingest::notify::{NotificationFabric, SmtpConfig};
use fathom_ingest::olap::OlapRepository;
use fathom_ingest::router::BatchRouter;
use fathom_ingest::stream::StreamTransport;
use fathom_ingest::usage_worker::{AlertChannels, UsageWorker};

fn build_archive_store() -> anyhow::Result<Arc<dyn ObjectStore>> {
    let bucket = std::env::var("FATHOM_ARCHIVE_BUCKET")
        .map_err(|_| anyhow::anyhow!("FATHOM_ARCHIVE_BUCKET is not set"))?;
    let store = AmazonS3Builder::from_env()
        .with_bucket_name(&bucket)
        .build()?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("fathom_ingest=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("FATHOM_CONFIG").unwrap_or_else(|_| "./fathom.toml".to_string());
    let config = FathomConfig::load(&config_path)?;

    let clickhouse_url =
        std::env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".to_string());
    let clickhouse_db =
        std::env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "observability".to_string());
    let clickhouse_user =
        std::env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_string());
    let clickhouse_password = std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default();

    let ch = Client::default()
        .with_url(&clickhouse_url)
        .with_database(&clickhouse_db)
        .with_user(&clickhouse_user)
        .with_password(&clickhouse_password);
    let olap = Arc::new(OlapRepository::new(ch));

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let transport = StreamTransport::connect(&redis_url).await?;
    let claims = ClaimStore::connect(
        &redis_url,
        Duration::from_secs(config.claims.ttl_hours * 3600),
    )
    .await?;
    tracing::info!("redis connected at {redis_url}");

    let billing_path =
        std::env::var("FATHOM_BILLING_DB").unwrap_or_else(|_| "./fathom_billing.db".to_string());
    let billing = Arc::new(BillingDb::open(&billing_path)?);
    tracing::info!("billing db opened at {billing_path}");

    // Raw archival is optional; the pipeline runs without it and ClickHouse
    // stays the source of truth.
    let archive = if config.archive.enabled {
        match build_archive_store() {
            Ok(store) => {
                tracing::info!("raw archive enabled");
                Some(Arc::new(ArchiveStore::new(store)))
            }
            Err(e) => {
                tracing::warn!("raw archive disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let fabric = AnalyticsFabric::new(Arc::clone(&olap), config.fabric.clone());
    fabric.start();

    let archive_errors = Arc::new(AtomicU64::new(0));
    let router = Arc::new(BatchRouter::new(
        Arc::clone(&olap),
        Arc::clone(&fabric),
        archive,
        config.archive.clone(),
        archive_errors,
    ));
    let dlq = Arc::new(DlqManager::new(
        transport.clone(),
        Arc::clone(&router),
        config.dlq.clone(),
    ));

    let consumer = StreamConsumer::new(
        transport.clone(),
        router,
        Arc::clone(&dlq),
        claims,
        Arc::clone(&fabric),
        config.consumer.clone(),
    );
    consumer.start();

    // SMTP config for email notifications (optional)
    let smtp_config = SmtpConfig {
        host: std::env::var("FATHOM_SMTP_HOST").ok(),
        user: std::env::var("FATHOM_SMTP_USER").ok(),
        pass: std::env::var("FATHOM_SMTP_PASS").ok(),
        port: std::env::var("FATHOM_SMTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(587),
        from: std::env::var("FATHOM_SMTP_FROM")
            .unwrap_or_else(|_| "fathom@localhost".to_string()),
    };
    let notifications = NotificationFabric::spawn(config.notifications.clone(), smtp_config);

    let alert_channels = AlertChannels {
        email_to: std::env::var("FATHOM_ALERT_EMAIL").ok(),
        slack_webhook_url: std::env::var("FATHOM_ALERT_SLACK_WEBHOOK").ok(),
        webhook_url: std::env::var("FATHOM_ALERT_WEBHOOK").ok(),
    };
    let usage_worker = UsageWorker::new(
        Arc::clone(&billing),
        Arc::clone(&olap),
        notifications.sender(),
        alert_channels,
        Duration::from_secs(config.usage.sync_interval_minutes * 60),
    );
    usage_worker.start();

    let contract_worker = ContractWorker::new(Arc::clone(&billing));
    contract_worker.start();

    let state = AppState {
        consumer: Arc::clone(&consumer),
        fabric: Arc::clone(&fabric),
        dlq: Arc::clone(&dlq),
    };

    let app = Router::new()
        .route("/healthz", get(handlers::health::healthz))
        .route("/api/v1/stats", get(handlers::stats::get_stats))
        .route("/api/v1/dlq/{project_id}", get(handlers::dlq::list_dlq))
        .route(
            "/api/v1/dlq/{project_id}/{message_id}/retry",
            post(handlers::dlq::retry_dlq),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("fathom-ingest listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Drain front-to-back: stop reading, then flush, then the slow loops.
    consumer.stop().await;
    fabric.stop().await;
    usage_worker.stop().await;
    contract_worker.stop().await;
    notifications.stop().await;
    tracing::info!("fathom-ingest stopped");

    Ok(())
}
