//! Progress event types
//!
//! `ProgressEvent` is the wire unit broadcast to observers of the analysis
//! queue. Each variant maps to one SSE event label; the payload is the JSON
//! object written on the `data:` line.
//!
//! Payload field names are camelCase on the wire (`documentId`,
//! `stageDetail`, `isProcessing`, ...).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Document identifier as stored by the tender backend
pub type DocumentId = i64;

/// SSE label for [`ProgressEvent::QueueStatus`]
pub const EVENT_QUEUE_STATUS: &str = "queue_status";
/// SSE label for [`ProgressEvent::DocumentProcessing`]
pub const EVENT_DOCUMENT_PROCESSING: &str = "document_processing";
/// SSE label for [`ProgressEvent::DocumentComplete`]
pub const EVENT_DOCUMENT_COMPLETE: &str = "document_complete";
/// SSE label for [`ProgressEvent::DocumentError`]
pub const EVENT_DOCUMENT_ERROR: &str = "document_error";
/// SSE label for [`ProgressEvent::Complete`]
pub const EVENT_COMPLETE: &str = "complete";
/// SSE label for [`ProgressEvent::Error`]
pub const EVENT_ERROR: &str = "error";

/// Aggregate queue counts, recomputed on demand
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Documents not yet started (running batch + waiting batches)
    pub pending: usize,
    /// Batches waiting behind the running one
    pub queued: usize,
    /// Batches in the processing slot
    pub processing: usize,
    /// True iff a batch occupies the processing slot
    pub is_processing: bool,
    /// `queued + processing`
    pub total_in_queue: usize,
}

/// Per-document lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    /// Ordering used to keep status monotonic
    pub fn rank(self) -> u8 {
        match self {
            DocumentStatus::Pending => 0,
            DocumentStatus::Processing => 1,
            DocumentStatus::Completed | DocumentStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }
}

/// How a successfully finished document was handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentOutcome {
    /// Sent through the extraction backend
    #[default]
    Analyzed,
    /// Not analysable (archive types)
    Skipped,
    /// Already analysed earlier, stored result reused
    Cached,
}

/// Why a document failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[default]
    Extraction,
    NotFound,
    Timeout,
    /// The extraction backend became unreachable while this document ran
    Backend,
}

/// `document_processing` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentProcessing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub document_id: DocumentId,
    pub filename: String,
    pub status: DocumentStatus,
    pub stage: String,
    #[serde(default)]
    pub stage_detail: String,
    /// Percent complete for this document (0-100)
    #[serde(default)]
    pub progress: u8,
    /// 1-based position of this document in its batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

/// `document_complete` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub document_id: DocumentId,
    pub filename: String,
    pub status: DocumentStatus,
    /// Milliseconds spent on this document
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub outcome: DocumentOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
}

/// `document_error` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub document_id: DocumentId,
    pub filename: String,
    pub status: DocumentStatus,
    pub error: String,
    #[serde(default)]
    pub kind: FailureKind,
    #[serde(default)]
    pub duration: u64,
}

/// Final record for one document of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResult {
    pub document_id: DocumentId,
    pub filename: String,
    pub status: DocumentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DocumentOutcome>,
    #[serde(default)]
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
}

impl From<&DocumentComplete> for DocumentResult {
    fn from(event: &DocumentComplete) -> Self {
        Self {
            document_id: event.document_id,
            filename: event.filename.clone(),
            status: DocumentStatus::Completed,
            outcome: Some(event.outcome),
            duration: event.duration,
            error: None,
            analysis: event.analysis.clone(),
        }
    }
}

impl From<&DocumentError> for DocumentResult {
    fn from(event: &DocumentError) -> Self {
        Self {
            document_id: event.document_id,
            filename: event.filename.clone(),
            status: DocumentStatus::Failed,
            outcome: None,
            duration: event.duration,
            error: Some(event.error.clone()),
            analysis: None,
        }
    }
}

/// Batch-level counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    /// Freshly analysed documents
    pub success: usize,
    pub failed: usize,
    /// Skipped or cached documents
    #[serde(default)]
    pub skipped: usize,
    /// Documents never started (cancellation or abort)
    #[serde(default)]
    pub cancelled: usize,
}

impl BatchSummary {
    /// Tally results against the batch size; unreported documents count as cancelled
    pub fn from_results(total: usize, results: &[DocumentResult]) -> Self {
        let mut summary = Self {
            total,
            ..Self::default()
        };
        for result in results {
            match (result.status, result.outcome) {
                (DocumentStatus::Failed, _) => summary.failed += 1,
                (DocumentStatus::Completed, Some(DocumentOutcome::Skipped))
                | (DocumentStatus::Completed, Some(DocumentOutcome::Cached)) => {
                    summary.skipped += 1
                }
                (DocumentStatus::Completed, _) => summary.success += 1,
                _ => {}
            }
        }
        summary.cancelled =
            total.saturating_sub(summary.success + summary.failed + summary.skipped);
        summary
    }

    /// Documents that reached a terminal state
    pub fn processed(&self) -> usize {
        self.success + self.failed + self.skipped
    }
}

/// Batch `complete` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub summary: BatchSummary,
    #[serde(default)]
    pub results: Vec<DocumentResult>,
    #[serde(default)]
    pub cancelled: bool,
}

/// Batch `error` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub error: String,
    #[serde(default)]
    pub summary: BatchSummary,
    /// Documents that finished before the abort
    #[serde(default)]
    pub results: Vec<DocumentResult>,
}

/// Event broadcast to progress observers
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    QueueStatus(QueueStatus),
    DocumentProcessing(DocumentProcessing),
    DocumentComplete(DocumentComplete),
    DocumentError(DocumentError),
    Complete(BatchComplete),
    Error(BatchError),
}

impl ProgressEvent {
    /// SSE event label
    pub fn event_type(&self) -> &'static str {
        match self {
            ProgressEvent::QueueStatus(_) => EVENT_QUEUE_STATUS,
            ProgressEvent::DocumentProcessing(_) => EVENT_DOCUMENT_PROCESSING,
            ProgressEvent::DocumentComplete(_) => EVENT_DOCUMENT_COMPLETE,
            ProgressEvent::DocumentError(_) => EVENT_DOCUMENT_ERROR,
            ProgressEvent::Complete(_) => EVENT_COMPLETE,
            ProgressEvent::Error(_) => EVENT_ERROR,
        }
    }

    /// JSON payload for the `data:` line
    pub fn payload_json(&self) -> Result<String> {
        let json = match self {
            ProgressEvent::QueueStatus(p) => serde_json::to_string(p),
            ProgressEvent::DocumentProcessing(p) => serde_json::to_string(p),
            ProgressEvent::DocumentComplete(p) => serde_json::to_string(p),
            ProgressEvent::DocumentError(p) => serde_json::to_string(p),
            ProgressEvent::Complete(p) => serde_json::to_string(p),
            ProgressEvent::Error(p) => serde_json::to_string(p),
        }?;
        Ok(json)
    }

    /// Rebuild an event from its label and payload.
    ///
    /// Returns `Ok(None)` for labels this version does not know, so newer
    /// servers can add event kinds without breaking older clients. A known
    /// label with an invalid payload is a [`Error::StreamDesync`].
    pub fn from_parts(event_type: &str, data: &str) -> Result<Option<Self>> {
        fn parse<T: serde::de::DeserializeOwned>(label: &str, data: &str) -> Result<T> {
            serde_json::from_str(data)
                .map_err(|e| Error::StreamDesync(format!("invalid {} payload: {}", label, e)))
        }

        let event = match event_type {
            EVENT_QUEUE_STATUS => ProgressEvent::QueueStatus(parse(event_type, data)?),
            EVENT_DOCUMENT_PROCESSING => {
                let p: DocumentProcessing = parse(event_type, data)?;
                expect_status(event_type, p.status, DocumentStatus::Processing)?;
                if p.progress > 100 {
                    return Err(Error::StreamDesync(format!(
                        "progress {} out of range for document {}",
                        p.progress, p.document_id
                    )));
                }
                ProgressEvent::DocumentProcessing(p)
            }
            EVENT_DOCUMENT_COMPLETE => {
                let p: DocumentComplete = parse(event_type, data)?;
                expect_status(event_type, p.status, DocumentStatus::Completed)?;
                ProgressEvent::DocumentComplete(p)
            }
            EVENT_DOCUMENT_ERROR => {
                let p: DocumentError = parse(event_type, data)?;
                expect_status(event_type, p.status, DocumentStatus::Failed)?;
                ProgressEvent::DocumentError(p)
            }
            EVENT_COMPLETE => ProgressEvent::Complete(parse(event_type, data)?),
            EVENT_ERROR => ProgressEvent::Error(parse(event_type, data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Batch this event belongs to (None for queue-level events)
    pub fn batch_id(&self) -> Option<Uuid> {
        match self {
            ProgressEvent::QueueStatus(_) => None,
            ProgressEvent::DocumentProcessing(p) => p.batch_id,
            ProgressEvent::DocumentComplete(p) => p.batch_id,
            ProgressEvent::DocumentError(p) => p.batch_id,
            ProgressEvent::Complete(p) => p.batch_id,
            ProgressEvent::Error(p) => p.batch_id,
        }
    }

    /// Document this event is about (None for queue- and batch-level events)
    pub fn document_id(&self) -> Option<DocumentId> {
        match self {
            ProgressEvent::DocumentProcessing(p) => Some(p.document_id),
            ProgressEvent::DocumentComplete(p) => Some(p.document_id),
            ProgressEvent::DocumentError(p) => Some(p.document_id),
            _ => None,
        }
    }

    /// True for `complete` and `error`
    pub fn is_batch_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete(_) | ProgressEvent::Error(_))
    }
}

fn expect_status(label: &str, got: DocumentStatus, want: DocumentStatus) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(Error::StreamDesync(format!(
            "{} carries status {:?}, expected {:?}",
            label, got, want
        )))
    }
}
