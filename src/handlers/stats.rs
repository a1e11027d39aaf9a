use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::AppState;

/// Pipeline stats: consumer counters plus fabric stats and the latest health
/// snapshot.
pub async fn get_stats(State(state): State<AppState>) -> Json<Value> {
    let consumer = state.consumer.stats();
    let fabric = state.fabric.stats();
    let health = state.fabric.health();
    Json(json!({
        "consumer": consumer,
        "fabric": {
            "events_processed": fabric.events_processed,
            "batches_processed": fabric.batches_processed,
            "metrics_processed": fabric.metrics_processed,
            "failed": fabric.failed,
            "dropped": fabric.dropped,
            "queue_depth": fabric.queue_depth,
            "health": {
                "healthy": health.healthy,
                "queue_depth": health.queue_depth,
                "buffer_utilization": health.buffer_utilization,
                "error_rate": health.error_rate,
                "throughput_per_sec": health.throughput_per_sec,
            },
        },
    }))
}
