//! State reconciler
//!
//! Folds progress events into a [`ClientViewState`]. The reducer is pure
//! (time is passed in), so the same input always yields the same view no
//! matter how the bytes were chunked on the way in.
//!
//! Rules kept by the view:
//! - a file's status only moves pending -> processing -> completed/failed
//! - `current` never decreases within a batch
//! - the batch `complete`/`error` is final; later events are ignored

use std::time::{Duration, Instant};

use ihale_common::batch::BatchDocument;
use ihale_common::events::{
    BatchSummary, DocumentId, DocumentOutcome, DocumentResult, DocumentStatus, ProgressEvent,
    QueueStatus,
};
use ihale_common::sse::{decode_event, FrameDecoder, RawFrame};
use ihale_common::Error;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where the watched batch stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Running,
    Completed,
    /// Server reported a batch-level error
    Aborted,
    Cancelled,
    /// Connection was re-established after the batch had already left the queue
    Disconnected,
}

/// Whether the caller should keep reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// One row of the per-document progress table
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub id: DocumentId,
    pub filename: String,
    pub status: DocumentStatus,
    pub stage: Option<String>,
    pub stage_detail: Option<String>,
    pub progress: u8,
    pub duration: Option<u64>,
    pub error: Option<String>,
    pub outcome: Option<DocumentOutcome>,
}

impl FileProgress {
    fn pending(id: DocumentId, filename: String) -> Self {
        Self {
            id,
            filename,
            status: DocumentStatus::Pending,
            stage: None,
            stage_detail: None,
            progress: 0,
            duration: None,
            error: None,
            outcome: None,
        }
    }

    /// Move forward to `status`; returns false if that would go backwards
    fn advance(&mut self, status: DocumentStatus) -> bool {
        if status.rank() < self.status.rank() || self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}

/// Client-side reconstruction of one batch's progress
#[derive(Debug, Clone, PartialEq)]
pub struct ClientViewState {
    /// Batch being watched; events of other batches are ignored
    pub batch_id: Option<Uuid>,
    pub current: usize,
    pub total: usize,
    pub message: String,
    pub start_time: Instant,
    pub estimated_remaining: Option<Duration>,
    pub current_file: Option<DocumentId>,
    pub files: Vec<FileProgress>,
    /// Latest queue snapshot
    pub queue: Option<QueueStatus>,
    /// Terminal document results in arrival order
    pub results: Vec<DocumentResult>,
    pub summary: Option<BatchSummary>,
    pub phase: Phase,
    pub error: Option<String>,
}

impl ClientViewState {
    pub fn new(batch_id: Option<Uuid>, total: usize, start_time: Instant) -> Self {
        Self {
            batch_id,
            current: 0,
            total,
            message: "Analysis starting".to_string(),
            start_time,
            estimated_remaining: None,
            current_file: None,
            files: Vec::new(),
            queue: None,
            results: Vec::new(),
            summary: None,
            phase: Phase::Running,
            error: None,
        }
    }

    /// View seeded with the documents of an accepted batch, all pending
    pub fn for_batch(batch_id: Uuid, documents: &[BatchDocument], start_time: Instant) -> Self {
        let mut view = Self::new(Some(batch_id), documents.len(), start_time);
        view.files = documents
            .iter()
            .map(|d| FileProgress::pending(d.id, d.filename.clone()))
            .collect();
        view
    }

    pub fn is_done(&self) -> bool {
        self.phase != Phase::Running
    }

    /// Documents that reached a terminal status
    pub fn processed(&self) -> usize {
        self.files.iter().filter(|f| f.status.is_terminal()).count()
    }

    pub fn file(&self, id: DocumentId) -> Option<&FileProgress> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn current_file(&self) -> Option<&FileProgress> {
        self.current_file.and_then(|id| self.file(id))
    }

    fn file_mut(&mut self, id: DocumentId, filename: &str) -> &mut FileProgress {
        let index = match self.files.iter().position(|f| f.id == id) {
            Some(index) => index,
            None => {
                self.files.push(FileProgress::pending(id, filename.to_string()));
                self.files.len() - 1
            }
        };
        let file = &mut self.files[index];
        if !filename.is_empty() {
            file.filename = filename.to_string();
        }
        file
    }

    fn record_result(&mut self, result: DocumentResult) {
        if !self.results.iter().any(|r| r.document_id == result.document_id) {
            self.results.push(result);
        }
    }

    fn update_estimate(&mut self, now: Instant) {
        if self.current == 0 || self.total == 0 {
            self.estimated_remaining = None;
            return;
        }
        let elapsed = now.saturating_duration_since(self.start_time);
        let remaining = self.total.saturating_sub(self.current) as u32;
        self.estimated_remaining = Some(elapsed / self.current as u32 * remaining);
    }

    /// Fold one event into the view
    pub fn apply_at(&mut self, event: &ProgressEvent, now: Instant) -> Flow {
        if self.is_done() {
            return Flow::Done;
        }
        if let (Some(mine), Some(theirs)) = (self.batch_id, event.batch_id()) {
            if mine != theirs {
                return Flow::Continue;
            }
        }

        match event {
            ProgressEvent::QueueStatus(status) => {
                self.queue = Some(*status);
            }
            ProgressEvent::DocumentProcessing(p) => {
                let file = self.file_mut(p.document_id, &p.filename);
                if !file.advance(DocumentStatus::Processing) {
                    debug!(document_id = p.document_id, "Late processing event ignored");
                    return Flow::Continue;
                }
                file.stage = Some(p.stage.clone());
                file.stage_detail = Some(p.stage_detail.clone());
                file.progress = file.progress.max(p.progress.min(100));
                let filename = file.filename.clone();

                if let Some(total) = p.total.filter(|t| *t > 0) {
                    self.total = total;
                }
                let started = self
                    .files
                    .iter()
                    .filter(|f| f.status != DocumentStatus::Pending)
                    .count();
                self.current = self.current.max(p.current.unwrap_or(started));
                self.current_file = Some(p.document_id);
                self.message = format!(
                    "Analyzing {} ({}/{}): {}",
                    filename, self.current, self.total, p.stage
                );
                self.update_estimate(now);
            }
            ProgressEvent::DocumentComplete(c) => {
                let file = self.file_mut(c.document_id, &c.filename);
                if file.advance(DocumentStatus::Completed) {
                    file.progress = 100;
                    file.duration = Some(c.duration);
                    file.outcome = Some(c.outcome);
                    self.record_result(DocumentResult::from(c));
                }
            }
            ProgressEvent::DocumentError(e) => {
                let file = self.file_mut(e.document_id, &e.filename);
                if file.advance(DocumentStatus::Failed) {
                    file.duration = Some(e.duration);
                    file.error = Some(e.error.clone());
                    self.record_result(DocumentResult::from(e));
                }
            }
            ProgressEvent::Complete(c) => {
                self.merge_results(&c.results);
                self.total = c.summary.total;
                self.summary = Some(c.summary);
                if c.cancelled {
                    self.current = self.current.max(c.summary.processed());
                    self.phase = Phase::Cancelled;
                    self.message = format!(
                        "Cancelled ({}/{} processed)",
                        c.summary.processed(),
                        c.summary.total
                    );
                } else {
                    self.current = self.total;
                    self.phase = Phase::Completed;
                    self.message = format!(
                        "Completed ({}/{})",
                        c.summary.success + c.summary.skipped,
                        c.summary.total
                    );
                }
                self.estimated_remaining = None;
                return Flow::Done;
            }
            ProgressEvent::Error(e) => {
                self.merge_results(&e.results);
                if e.summary.total > 0 {
                    self.total = e.summary.total;
                    self.summary = Some(e.summary);
                }
                self.abort(&e.error);
                return Flow::Done;
            }
        }
        Flow::Continue
    }

    /// Fill in terminal results that never arrived as individual events
    fn merge_results(&mut self, results: &[DocumentResult]) {
        for result in results {
            let file = self.file_mut(result.document_id, &result.filename);
            if file.advance(result.status) {
                file.progress = if result.status == DocumentStatus::Completed {
                    100
                } else {
                    file.progress
                };
                file.duration = Some(result.duration);
                file.error = result.error.clone();
                file.outcome = result.outcome;
            }
            self.record_result(result.clone());
        }
    }

    /// End the view with a batch-level failure
    pub fn abort(&mut self, error: &str) {
        if self.is_done() {
            return;
        }
        self.phase = Phase::Aborted;
        self.error = Some(error.to_string());
        self.message = format!(
            "Analysis stopped early ({}/{} processed): {}",
            self.processed(),
            self.total,
            error
        );
        self.estimated_remaining = None;
    }

    fn disconnected(&mut self) {
        self.phase = Phase::Disconnected;
        self.message = "Batch finished while the stream was disconnected".to_string();
        self.estimated_remaining = None;
    }
}

/// Byte-level driver: decodes frames and feeds them to the view
#[derive(Debug)]
pub struct Reconciler {
    decoder: FrameDecoder,
    view: ClientViewState,
    /// Frames skipped because they could not be decoded
    desyncs: usize,
    /// Set once the stream has been re-established. From then on an idle
    /// queue means the batch ended while no one was listening.
    resumed: bool,
}

impl Reconciler {
    pub fn new(view: ClientViewState) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            view,
            desyncs: 0,
            resumed: false,
        }
    }

    pub fn view(&self) -> &ClientViewState {
        &self.view
    }

    pub fn into_view(self) -> ClientViewState {
        self.view
    }

    pub fn desyncs(&self) -> usize {
        self.desyncs
    }

    /// Feed one network chunk
    pub fn feed_at(&mut self, chunk: &[u8], now: Instant) -> Flow {
        let frames = match self.decoder.push(chunk) {
            Ok(frames) => frames,
            Err(e) => {
                self.desyncs += 1;
                warn!(error = %e, "Dropping unterminated frame");
                Vec::new()
            }
        };
        for frame in frames {
            if self.apply_frame(&frame, now) == Flow::Done {
                return Flow::Done;
            }
        }
        if self.view.is_done() {
            Flow::Done
        } else {
            Flow::Continue
        }
    }

    fn apply_frame(&mut self, frame: &RawFrame, now: Instant) -> Flow {
        let event = match decode_event(frame) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(event_type = frame.event_type(), "Unknown event ignored");
                return Flow::Continue;
            }
            Err(e) => return self.on_bad_frame(frame, e),
        };
        self.apply_at(&event, now)
    }

    /// Apply one decoded event, including events learned out of band
    pub fn apply_at(&mut self, event: &ProgressEvent, now: Instant) -> Flow {
        if let ProgressEvent::QueueStatus(status) = event {
            if self.resumed && status.total_in_queue == 0 && !self.view.is_done() {
                self.view.queue = Some(*status);
                self.view.disconnected();
                return Flow::Done;
            }
        }
        self.view.apply_at(event, now)
    }

    /// The server no longer knows the batch; its outcome is lost
    pub fn lost_track(&mut self) {
        if !self.view.is_done() {
            self.view.disconnected();
        }
    }

    fn on_bad_frame(&mut self, frame: &RawFrame, err: Error) -> Flow {
        if frame.event_type() == ihale_common::events::EVENT_ERROR {
            // A batch error aborts even when its payload is unreadable
            warn!(error = %err, "Malformed error frame");
            let message = if frame.data.trim().is_empty() {
                "server reported an error".to_string()
            } else {
                frame.data.clone()
            };
            self.view.abort(&message);
            return Flow::Done;
        }
        self.desyncs += 1;
        warn!(
            event_type = frame.event_type(),
            error = %err,
            "Skipping malformed frame"
        );
        Flow::Continue
    }

    /// Prepare for a fresh connection: drop any partial frame and watch for
    /// the queue going idle without our terminal event
    pub fn resubscribed(&mut self) {
        self.decoder.reset();
        self.resumed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ihale_common::events::{
        BatchComplete, BatchError, DocumentComplete, DocumentError, DocumentProcessing,
        FailureKind,
    };
    use ihale_common::sse::encode_frame;

    fn batch() -> Uuid {
        Uuid::from_u128(0xb47c)
    }

    fn docs(ids: &[DocumentId]) -> Vec<BatchDocument> {
        ids.iter()
            .map(|&id| BatchDocument {
                id,
                filename: format!("doc-{}.pdf", id),
            })
            .collect()
    }

    fn processing(id: DocumentId, stage: &str, progress: u8, current: usize) -> ProgressEvent {
        ProgressEvent::DocumentProcessing(DocumentProcessing {
            batch_id: Some(batch()),
            document_id: id,
            filename: format!("doc-{}.pdf", id),
            status: DocumentStatus::Processing,
            stage: stage.to_string(),
            stage_detail: String::new(),
            progress,
            current: Some(current),
            total: Some(3),
        })
    }

    fn complete_doc(id: DocumentId) -> ProgressEvent {
        ProgressEvent::DocumentComplete(DocumentComplete {
            batch_id: Some(batch()),
            document_id: id,
            filename: format!("doc-{}.pdf", id),
            status: DocumentStatus::Completed,
            duration: 1200,
            outcome: DocumentOutcome::Analyzed,
            analysis: None,
        })
    }

    fn error_doc(id: DocumentId) -> ProgressEvent {
        ProgressEvent::DocumentError(DocumentError {
            batch_id: Some(batch()),
            document_id: id,
            filename: format!("doc-{}.pdf", id),
            status: DocumentStatus::Failed,
            error: "unreadable".to_string(),
            kind: FailureKind::Extraction,
            duration: 300,
        })
    }

    fn result_of(event: &ProgressEvent) -> DocumentResult {
        match event {
            ProgressEvent::DocumentComplete(c) => DocumentResult::from(c),
            ProgressEvent::DocumentError(e) => DocumentResult::from(e),
            other => panic!("not terminal: {:?}", other),
        }
    }

    fn batch_complete(results: Vec<DocumentResult>, cancelled: bool) -> ProgressEvent {
        ProgressEvent::Complete(BatchComplete {
            batch_id: Some(batch()),
            summary: BatchSummary::from_results(3, &results),
            results,
            cancelled,
        })
    }

    fn full_run() -> Vec<ProgressEvent> {
        vec![
            ProgressEvent::QueueStatus(QueueStatus {
                pending: 3,
                processing: 1,
                is_processing: true,
                total_in_queue: 1,
                queued: 0,
            }),
            processing(101, "starting", 0, 1),
            processing(101, "model_call", 40, 1),
            complete_doc(101),
            processing(102, "starting", 0, 2),
            error_doc(102),
            processing(103, "starting", 0, 3),
            complete_doc(103),
            batch_complete(
                vec![
                    result_of(&complete_doc(101)),
                    result_of(&error_doc(102)),
                    result_of(&complete_doc(103)),
                ],
                false,
            ),
        ]
    }

    #[test]
    fn test_processing_upserts_and_tracks_current_file() {
        let now = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[101, 102, 103]), now);
        assert!(view.files.iter().all(|f| f.status == DocumentStatus::Pending));

        view.apply_at(&processing(101, "model_call", 40, 1), now);
        let file = view.current_file().unwrap();
        assert_eq!(file.id, 101);
        assert_eq!(file.status, DocumentStatus::Processing);
        assert_eq!(file.stage.as_deref(), Some("model_call"));
        assert_eq!(file.progress, 40);
        assert_eq!(view.current, 1);
        assert_eq!(view.total, 3);
    }

    #[test]
    fn test_unseen_document_is_inserted() {
        let now = Instant::now();
        let mut view = ClientViewState::new(Some(batch()), 0, now);
        view.apply_at(&processing(7, "starting", 0, 1), now);
        assert_eq!(view.files.len(), 1);
        assert_eq!(view.total, 3);
    }

    #[test]
    fn test_terminal_status_never_regresses() {
        let now = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[101]), now);
        view.apply_at(&complete_doc(101), now);
        view.apply_at(&processing(101, "model_call", 10, 1), now);
        view.apply_at(&error_doc(101), now);

        let file = view.file(101).unwrap();
        assert_eq!(file.status, DocumentStatus::Completed);
        assert_eq!(file.progress, 100);
        assert!(file.error.is_none());
        assert_eq!(view.results.len(), 1);
    }

    #[test]
    fn test_terminal_events_do_not_move_current() {
        let now = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[101, 102, 103]), now);
        view.apply_at(&processing(101, "starting", 0, 1), now);
        view.apply_at(&complete_doc(101), now);
        view.apply_at(&complete_doc(102), now);
        assert_eq!(view.current, 1);
        assert_eq!(view.processed(), 2);
    }

    #[test]
    fn test_current_is_monotonic() {
        let now = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[101, 102, 103]), now);
        view.apply_at(&processing(102, "starting", 0, 2), now);
        view.apply_at(&processing(101, "starting", 0, 1), now);
        assert_eq!(view.current, 2);
    }

    #[test]
    fn test_estimated_remaining() {
        let start = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[101, 102, 103]), start);
        view.apply_at(&processing(101, "starting", 0, 1), start + Duration::from_secs(10));
        assert_eq!(view.estimated_remaining, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_complete_merges_missing_results() {
        let now = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[101, 102, 103]), now);
        view.apply_at(&complete_doc(101), now);

        // 102 and 103 terminal events were lost
        let flow = view.apply_at(
            &batch_complete(
                vec![
                    result_of(&complete_doc(101)),
                    result_of(&error_doc(102)),
                    result_of(&complete_doc(103)),
                ],
                false,
            ),
            now,
        );
        assert_eq!(flow, Flow::Done);
        assert_eq!(view.phase, Phase::Completed);
        assert_eq!(view.current, 3);
        assert_eq!(view.results.len(), 3);
        assert_eq!(view.file(102).unwrap().status, DocumentStatus::Failed);
        assert_eq!(view.file(103).unwrap().status, DocumentStatus::Completed);
        assert_eq!(view.summary.unwrap().failed, 1);
    }

    #[test]
    fn test_events_after_terminal_are_ignored() {
        let now = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[101]), now);
        view.apply_at(&batch_complete(vec![], false), now);
        assert_eq!(view.apply_at(&complete_doc(101), now), Flow::Done);
        assert!(view.results.is_empty());
    }

    #[test]
    fn test_other_batches_are_ignored() {
        let now = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[101]), now);
        let mut foreign = processing(101, "starting", 0, 1);
        if let ProgressEvent::DocumentProcessing(p) = &mut foreign {
            p.batch_id = Some(Uuid::from_u128(1));
        }
        view.apply_at(&foreign, now);
        assert_eq!(view.file(101).unwrap().status, DocumentStatus::Pending);
    }

    #[test]
    fn test_cancelled_complete() {
        let now = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[101, 102, 103]), now);
        view.apply_at(&complete_doc(101), now);
        view.apply_at(
            &batch_complete(vec![result_of(&complete_doc(101))], true),
            now,
        );
        assert_eq!(view.phase, Phase::Cancelled);
        assert_eq!(view.current, 1);
        assert_eq!(view.summary.unwrap().cancelled, 2);
    }

    #[test]
    fn test_batch_error_before_any_document() {
        let now = Instant::now();
        let mut view = ClientViewState::for_batch(batch(), &docs(&[201]), now);
        let flow = view.apply_at(
            &ProgressEvent::Error(BatchError {
                batch_id: Some(batch()),
                error: "extraction backend unreachable".to_string(),
                summary: BatchSummary::from_results(1, &[]),
                results: vec![],
            }),
            now,
        );
        assert_eq!(flow, Flow::Done);
        assert_eq!(view.phase, Phase::Aborted);
        assert_eq!(view.processed(), 0);
        assert_eq!(view.total, 1);
        assert_eq!(view.current, 0);
        assert!(view.message.contains("stopped early"));
    }

    fn encoded(events: &[ProgressEvent]) -> Vec<u8> {
        events
            .iter()
            .map(|e| encode_frame(e).unwrap())
            .collect::<String>()
            .into_bytes()
    }

    fn run_chunks(bytes: &[u8], splits: &[usize], now: Instant) -> ClientViewState {
        let mut reconciler =
            Reconciler::new(ClientViewState::for_batch(batch(), &docs(&[101, 102, 103]), now));
        let mut last = 0;
        for &split in splits.iter().chain(std::iter::once(&bytes.len())) {
            reconciler.feed_at(&bytes[last..split], now);
            last = split;
        }
        reconciler.into_view()
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_outcome() {
        let now = Instant::now();
        let bytes = encoded(&full_run());
        let whole = run_chunks(&bytes, &[], now);
        assert_eq!(whole.phase, Phase::Completed);
        assert_eq!(whole.results.len(), 3);

        for split in 1..bytes.len() {
            assert_eq!(run_chunks(&bytes, &[split], now), whole, "split at {}", split);
        }
        let every_seventh: Vec<usize> = (7..bytes.len()).step_by(7).collect();
        assert_eq!(run_chunks(&bytes, &every_seventh, now), whole);
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let now = Instant::now();
        let mut bytes = b"event: document_processing\ndata: {not json\n\n".to_vec();
        bytes.extend(b": heartbeat\n\n");
        bytes.extend(b"event: brand_new_kind\ndata: {}\n\n");
        bytes.extend(encoded(&full_run()));

        let mut reconciler =
            Reconciler::new(ClientViewState::for_batch(batch(), &docs(&[101, 102, 103]), now));
        assert_eq!(reconciler.feed_at(&bytes, now), Flow::Done);
        assert_eq!(reconciler.desyncs(), 1);
        assert_eq!(reconciler.view().phase, Phase::Completed);
    }

    #[test]
    fn test_malformed_error_frame_aborts() {
        let now = Instant::now();
        let mut reconciler =
            Reconciler::new(ClientViewState::for_batch(batch(), &docs(&[101]), now));
        let flow = reconciler.feed_at(b"event: error\ndata: backend exploded\n\n", now);
        assert_eq!(flow, Flow::Done);
        assert_eq!(reconciler.view().phase, Phase::Aborted);
        assert_eq!(reconciler.view().error.as_deref(), Some("backend exploded"));
    }

    #[test]
    fn test_idle_queue_after_reconnect_ends_watch() {
        let now = Instant::now();
        let mut reconciler =
            Reconciler::new(ClientViewState::for_batch(batch(), &docs(&[101]), now));
        reconciler.feed_at(b"event: queue_status\ndata: {\"pending\":1", now);
        reconciler.resubscribed();

        let idle = ProgressEvent::QueueStatus(QueueStatus::default());
        assert_eq!(reconciler.feed_at(&encoded(&[idle]), now), Flow::Done);
        assert_eq!(reconciler.view().phase, Phase::Disconnected);
    }

    #[test]
    fn test_busy_queue_after_reconnect_keeps_watching() {
        let now = Instant::now();
        let mut reconciler =
            Reconciler::new(ClientViewState::for_batch(batch(), &docs(&[101]), now));
        reconciler.resubscribed();
        let busy = ProgressEvent::QueueStatus(QueueStatus {
            processing: 1,
            is_processing: true,
            total_in_queue: 1,
            ..QueueStatus::default()
        });
        assert_eq!(reconciler.feed_at(&encoded(&[busy]), now), Flow::Continue);
        assert_eq!(reconciler.view().queue.unwrap().processing, 1);
    }

    #[test]
    fn test_idle_queue_after_other_batch_ends_watch() {
        let now = Instant::now();
        let mut reconciler =
            Reconciler::new(ClientViewState::for_batch(batch(), &docs(&[101]), now));
        reconciler.resubscribed();

        let busy = ProgressEvent::QueueStatus(QueueStatus {
            processing: 1,
            is_processing: true,
            total_in_queue: 1,
            ..QueueStatus::default()
        });
        let other = ProgressEvent::Complete(BatchComplete {
            batch_id: Some(Uuid::from_u128(0x07e5)),
            summary: BatchSummary::from_results(1, &[]),
            results: vec![],
            cancelled: false,
        });
        let idle = ProgressEvent::QueueStatus(QueueStatus::default());

        assert_eq!(reconciler.feed_at(&encoded(&[busy, other]), now), Flow::Continue);
        assert_eq!(reconciler.view().phase, Phase::Running);
        assert_eq!(reconciler.feed_at(&encoded(&[idle.clone(), idle]), now), Flow::Done);
        assert_eq!(reconciler.view().phase, Phase::Disconnected);
    }

    #[test]
    fn test_idle_queue_before_reconnect_is_not_terminal() {
        let now = Instant::now();
        let mut reconciler =
            Reconciler::new(ClientViewState::for_batch(batch(), &docs(&[101]), now));
        let idle = ProgressEvent::QueueStatus(QueueStatus::default());
        assert_eq!(reconciler.feed_at(&encoded(&[idle]), now), Flow::Continue);
        assert_eq!(reconciler.view().phase, Phase::Running);
    }

    #[test]
    fn test_terminal_learned_after_reconnect_wins() {
        let now = Instant::now();
        let mut reconciler =
            Reconciler::new(ClientViewState::for_batch(batch(), &docs(&[101]), now));
        reconciler.feed_at(&encoded(&[processing(101, "starting", 0, 1)]), now);
        reconciler.resubscribed();

        let done = complete_doc(101);
        let terminal = batch_complete(vec![result_of(&done)], false);
        assert_eq!(reconciler.apply_at(&terminal, now), Flow::Done);
        assert_eq!(reconciler.view().phase, Phase::Completed);
        assert_eq!(reconciler.view().results.len(), 1);

        // Already finished; a later idle queue or lookup miss changes nothing
        reconciler.lost_track();
        let idle = ProgressEvent::QueueStatus(QueueStatus::default());
        reconciler.apply_at(&idle, now);
        assert_eq!(reconciler.view().phase, Phase::Completed);
    }

    #[test]
    fn test_lost_track_marks_disconnected() {
        let now = Instant::now();
        let mut reconciler =
            Reconciler::new(ClientViewState::for_batch(batch(), &docs(&[101]), now));
        reconciler.lost_track();
        assert_eq!(reconciler.view().phase, Phase::Disconnected);
        assert!(reconciler.view().is_done());
    }
}
