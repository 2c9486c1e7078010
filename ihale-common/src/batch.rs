//! Request and response bodies of the batch endpoints
//!
//! Shared by the analysis server and the monitor client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{BatchComplete, BatchError, DocumentId, ProgressEvent, QueueStatus};

/// `POST /analyze-batch` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeBatchRequest {
    pub document_ids: Vec<DocumentId>,
}

/// Document listed in an accepted batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDocument {
    pub id: DocumentId,
    pub filename: String,
}

/// Accepted batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInfo {
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// 0 when processing started immediately, otherwise place in line
    pub position: usize,
    pub documents: Vec<BatchDocument>,
}

/// `POST /analyze-batch` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeBatchResponse {
    pub batch: BatchInfo,
    pub queue_status: QueueStatus,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Batch had not started and was removed from the queue
    Removed,
    /// Batch is running; the worker stops before its next document
    Requested,
    /// Batch already finished or never existed
    NotActive,
}

/// `POST /batches/{batch_id}/cancel` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBatchResponse {
    pub batch_id: Uuid,
    pub outcome: CancelOutcome,
}

/// Where a batch stands, as far as the server remembers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    Processing,
    /// Terminal event is attached
    Finished,
    /// Never seen, or finished too long ago to be remembered
    Unknown,
}

/// `GET /batches/{batch_id}` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStateResponse {
    pub batch_id: Uuid,
    pub state: BatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<BatchComplete>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchError>,
}

impl BatchStateResponse {
    /// Lookup result carrying the batch's terminal event, if any
    pub fn new(batch_id: Uuid, state: BatchState, terminal: Option<&ProgressEvent>) -> Self {
        let (complete, error) = match terminal {
            Some(ProgressEvent::Complete(c)) => (Some(c.clone()), None),
            Some(ProgressEvent::Error(e)) => (None, Some(e.clone())),
            _ => (None, None),
        };
        Self {
            batch_id,
            state,
            complete,
            error,
        }
    }

    /// The terminal event as it was broadcast
    pub fn terminal(&self) -> Option<ProgressEvent> {
        self.complete
            .clone()
            .map(ProgressEvent::Complete)
            .or_else(|| self.error.clone().map(ProgressEvent::Error))
    }
}
