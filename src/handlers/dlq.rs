use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    /// Number of entries to return, most recent first (default 50).
    pub count: Option<usize>,
}

/// List a tenant's dead-lettered batches.
pub async fn list_dlq(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(params): Query<DlqQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let count = params.count.unwrap_or(50).min(1000);
    let entries = state
        .dlq
        .dlq_messages(&project_id, count)
        .await
        .map_err(|e| {
            tracing::error!("DLQ list for {project_id} failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("dlq list failed: {e}"))
        })?;
    Ok(Json(entries))
}

/// Re-run the router over one dead-lettered batch; the entry is deleted on
/// success.
pub async fn retry_dlq(
    State(state): State<AppState>,
    Path((project_id, message_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let summary = state
        .dlq
        .retry_message(&project_id, &message_id)
        .await
        .map_err(|e| {
            tracing::warn!("DLQ retry of {project_id}/{message_id} failed: {e}");
            (StatusCode::BAD_GATEWAY, format!("retry failed: {e}"))
        })?;
    Ok(Json(serde_json::json!({
        "status": summary.status(),
        "processed_count": summary.processed_count,
        "failed_count": summary.failed_count,
        "skipped_count": summary.skipped_count,
    })))
}
