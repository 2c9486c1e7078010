//! Batch worker
//!
//! Pulls batches from the [`JobQueue`] one at a time and runs their
//! documents through the extraction backend, reporting every step through a
//! per-batch [`StageEmitter`].
//!
//! Per document, in order:
//! 1. stop if the batch was cancelled or aborted (document is never started)
//! 2. load the row; missing rows fail with `not_found`
//! 3. archives are skipped, already analysed documents reuse their result
//! 4. check the backend; an unreachable backend aborts the batch
//! 5. extract under the per-document deadline and persist the outcome

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::{stream, FutureExt, StreamExt};
use ihale_common::config::AnalysisConfig;
use ihale_common::events::{BatchSummary, DocumentId, DocumentOutcome, FailureKind};
use ihale_common::Error;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcaster::Broadcaster;
use crate::db;
use crate::emitter::{DocumentDone, DocumentRef, StageEmitter};
use crate::extraction::{ExtractionRequest, Extractor, StageReporter};
use crate::hub::AnalysisHub;
use crate::queue::{ActiveBatch, JobQueue};

/// First fatal error seen while a batch runs
#[derive(Default)]
struct AbortReason(Mutex<Option<Error>>);

impl AbortReason {
    /// Keep the first fatal error, as `BatchAborted`
    fn set(&self, cause: &Error) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(Error::BatchAborted(cause.to_string()));
        }
    }

    fn is_set(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn take(&self) -> Option<Error> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Terminal event payload for a document that failed with `err`
fn failure(err: Error) -> DocumentDone {
    let (kind, message) = match err {
        Error::Timeout(message) => (FailureKind::Timeout, message),
        Error::NotFound(message) => (FailureKind::NotFound, message),
        Error::DocumentFailed { message, .. } => (FailureKind::Extraction, message),
        other if other.is_fatal() => (FailureKind::Backend, other.to_string()),
        other => (FailureKind::Extraction, other.to_string()),
    };
    DocumentDone::Failed { kind, message }
}

pub struct Worker {
    queue: JobQueue,
    broadcaster: Broadcaster,
    extractor: Arc<dyn Extractor>,
    db: SqlitePool,
    config: AnalysisConfig,
}

impl Worker {
    pub fn new(
        hub: &AnalysisHub,
        extractor: Arc<dyn Extractor>,
        db: SqlitePool,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            queue: hub.queue.clone(),
            broadcaster: hub.broadcaster.clone(),
            extractor,
            db,
            config,
        }
    }

    /// Run the worker loop on its own task
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Process batches until shutdown or until the queue closes
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            extractor = self.extractor.name(),
            concurrency = self.config.document_concurrency,
            "Analysis worker started"
        );
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.queue.next_batch() => match next {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.process_batch(batch).await;
        }
        info!("Analysis worker stopped");
    }

    /// Run one batch to its terminal event and release the processing slot
    pub async fn process_batch(&self, batch: ActiveBatch) -> BatchSummary {
        let total = batch.document_ids.len();
        info!(batch_id = %batch.id, documents = total, "Batch processing started");

        let emitter = Arc::new(StageEmitter::new(
            self.broadcaster.clone(),
            batch.id,
            total,
        ));
        let abort = AbortReason::default();
        let concurrency = self.config.document_concurrency.max(1);

        let batch_ref = &batch;
        let emitter_ref = &emitter;
        let abort_ref = &abort;
        stream::iter(batch.document_ids.iter().copied().enumerate())
            .map(move |(index, id)| async move {
                let position = index + 1;
                let run = self.process_document(batch_ref, emitter_ref, abort_ref, id, position);
                if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                    error!(batch_id = %batch_ref.id, document_id = id, "Document task panicked");
                    let doc = DocumentRef {
                        id,
                        filename: db::display_name(id, None),
                        position,
                    };
                    let err = Error::DocumentFailed {
                        document_id: id,
                        message: "internal error during analysis".to_string(),
                    };
                    emitter_ref.on_document_done(&doc, failure(err));
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<()>>()
            .await;

        let results = emitter.results();
        let summary = BatchSummary::from_results(total, &results);
        match abort.take() {
            Some(reason) => {
                error!(
                    batch_id = %batch.id,
                    processed = summary.processed(),
                    "{}",
                    reason
                );
                let message = match reason {
                    Error::BatchAborted(message) => message,
                    other => other.to_string(),
                };
                emitter.on_batch_error(&message);
            }
            None => {
                let cancelled = batch.cancel.is_cancelled() && summary.cancelled > 0;
                info!(
                    batch_id = %batch.id,
                    success = summary.success,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    cancelled = summary.cancelled,
                    "Batch processing finished"
                );
                emitter.on_batch_done(cancelled);
            }
        }

        self.queue.finish_batch(batch.id);
        summary
    }

    fn start_document(&self, batch: &ActiveBatch, emitter: &StageEmitter, doc: &DocumentRef) {
        self.queue.document_started(batch.id);
        emitter.on_document_start(doc);
    }

    fn should_stop(&self, batch: &ActiveBatch, abort: &AbortReason, id: DocumentId) -> bool {
        if batch.cancel.is_cancelled() || abort.is_set() {
            debug!(batch_id = %batch.id, document_id = id, "Document not started");
            return true;
        }
        false
    }

    async fn process_document(
        &self,
        batch: &ActiveBatch,
        emitter: &Arc<StageEmitter>,
        abort: &AbortReason,
        id: DocumentId,
        position: usize,
    ) {
        if self.should_stop(batch, abort, id) {
            return;
        }

        let loaded = db::load_document(&self.db, id).await;
        let filename = match &loaded {
            Ok(Some(record)) => record.display_name(),
            _ => db::display_name(id, None),
        };
        let doc = DocumentRef {
            id,
            filename,
            position,
        };

        let record = match loaded {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.start_document(batch, emitter, &doc);
                let err = Error::NotFound(format!("Document {} not found", id));
                emitter.on_document_done(&doc, failure(err));
                return;
            }
            Err(e) => {
                warn!(document_id = id, error = %e, "Failed to load document");
                self.start_document(batch, emitter, &doc);
                emitter.on_document_done(&doc, failure(e));
                return;
            }
        };

        let skip = record
            .extension()
            .filter(|ext| {
                self.config
                    .skip_extensions
                    .iter()
                    .any(|s| s.trim_start_matches('.').eq_ignore_ascii_case(ext))
            });
        if let Some(ext) = skip {
            debug!(document_id = id, extension = %ext, "Archive skipped");
            self.start_document(batch, emitter, &doc);
            emitter.on_document_done(
                &doc,
                DocumentDone::Succeeded {
                    outcome: DocumentOutcome::Skipped,
                    analysis: None,
                },
            );
            return;
        }

        if let Some(analysis) = record.cached_analysis() {
            debug!(document_id = id, "Reusing stored analysis");
            self.start_document(batch, emitter, &doc);
            emitter.on_document_done(
                &doc,
                DocumentDone::Succeeded {
                    outcome: DocumentOutcome::Cached,
                    analysis: Some(analysis),
                },
            );
            return;
        }

        if let Err(e) = self.extractor.ensure_available().await {
            let err = e.into_common(id);
            if err.is_fatal() {
                abort.set(&err);
                return;
            }
            warn!(document_id = id, error = %err, "Backend health check failed, trying anyway");
        }
        // Another document may have aborted the batch during the check
        if self.should_stop(batch, abort, id) {
            return;
        }

        self.start_document(batch, emitter, &doc);
        if let Err(e) = db::mark_processing(&self.db, id).await {
            warn!(document_id = id, error = %e, "Failed to mark document processing");
        }

        let request = ExtractionRequest {
            document_id: id,
            filename: doc.filename.clone(),
            file_type: record.extension(),
            storage_path: record.storage_path.clone(),
        };
        let reporter = StageReporter::new(emitter.clone(), doc.clone());
        let deadline = self.config.document_timeout();

        let extracted = match tokio::time::timeout(
            deadline,
            self.extractor.extract(&request, &reporter),
        )
        .await
        {
            Ok(result) => result.map_err(|e| e.into_common(id)),
            Err(_) => Err(Error::Timeout(format!(
                "Analysis timed out after {}s",
                deadline.as_secs()
            ))),
        };

        let done = match extracted {
            Ok(analysis) => {
                if let Err(e) = db::mark_completed(&self.db, id, &analysis).await {
                    warn!(document_id = id, error = %e, "Failed to store analysis");
                }
                DocumentDone::Succeeded {
                    outcome: DocumentOutcome::Analyzed,
                    analysis: Some(analysis),
                }
            }
            Err(err) => {
                if err.is_fatal() {
                    abort.set(&err);
                }
                failure(err)
            }
        };

        if let DocumentDone::Failed { message, .. } = &done {
            warn!(batch_id = %batch.id, document_id = id, "Document failed: {}", message);
            if let Err(e) = db::mark_failed(&self.db, id, message).await {
                warn!(document_id = id, error = %e, "Failed to store document failure");
            }
        }
        emitter.on_document_done(&doc, done);
    }
}
