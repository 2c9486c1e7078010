//! Batch submission, cancellation and queue status

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use ihale_common::batch::{
    AnalyzeBatchRequest, AnalyzeBatchResponse, BatchDocument, BatchInfo, BatchStateResponse,
    CancelBatchResponse,
};
use ihale_common::QueueStatus;
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::error::ApiResult;
use crate::AppState;

/// POST /analyze-batch
///
/// Accepts the batch and returns at once; progress arrives on `/events`.
pub async fn analyze_batch(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeBatchRequest>,
) -> ApiResult<Json<AnalyzeBatchResponse>> {
    let names: HashMap<_, _> = db::load_filenames(&state.db, &request.document_ids)
        .await?
        .into_iter()
        .collect();

    let handle = state.hub.queue.enqueue(request.document_ids)?;
    let documents = handle
        .document_ids
        .iter()
        .map(|id| BatchDocument {
            id: *id,
            filename: names
                .get(id)
                .cloned()
                .unwrap_or_else(|| db::display_name(*id, None)),
        })
        .collect();

    Ok(Json(AnalyzeBatchResponse {
        batch: BatchInfo {
            batch_id: handle.batch_id,
            created_at: handle.created_at,
            position: handle.position,
            documents,
        },
        queue_status: state.hub.queue.status(),
    }))
}

/// POST /batches/:batch_id/cancel
///
/// Cooperative: a running batch stops before its next document. Cancelling
/// a finished or unknown batch is not an error.
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Json<CancelBatchResponse> {
    let outcome = state.hub.queue.cancel(batch_id);
    info!(batch_id = %batch_id, ?outcome, "Cancel request handled");
    Json(CancelBatchResponse { batch_id, outcome })
}

/// GET /batches/:batch_id
///
/// Lets a client that lost its stream learn how its batch ended. Batches
/// the server never saw, or finished too long ago, report `unknown`.
pub async fn batch_state(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Json<BatchStateResponse> {
    Json(state.hub.queue.batch_state(batch_id))
}

/// GET /queue/status
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.hub.queue.status())
}

pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/analyze-batch", post(analyze_batch))
        .route("/batches/:batch_id", get(batch_state))
        .route("/batches/:batch_id/cancel", post(cancel_batch))
        .route("/queue/status", get(queue_status))
}
