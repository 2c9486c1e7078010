//! Stage emitter
//!
//! Translates worker progress into [`ProgressEvent`]s without knowing about
//! transport. The emitter is the only place a document reaches a terminal
//! status, and it guards the two counting rules observers rely on:
//!
//! - exactly one `document_complete`/`document_error` per started document
//! - exactly one `complete`/`error` per batch
//!
//! All calls take `&self` and serialize on an internal mutex, so documents
//! running concurrently within one batch can share an emitter.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use ihale_common::events::{
    BatchComplete, BatchError, BatchSummary, DocumentComplete, DocumentError, DocumentId,
    DocumentOutcome, DocumentProcessing, DocumentResult, DocumentStatus, FailureKind,
    ProgressEvent,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broadcaster::Broadcaster;

/// Stage label of the first `document_processing` event
pub const STAGE_STARTING: &str = "starting";

/// Document identity as seen by the emitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub id: DocumentId,
    pub filename: String,
    /// 1-based position in the batch
    pub position: usize,
}

/// Terminal result of one document
#[derive(Debug, Clone)]
pub enum DocumentDone {
    Succeeded {
        outcome: DocumentOutcome,
        analysis: Option<serde_json::Value>,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

struct Track {
    percent: u8,
    started_at: Option<Instant>,
    terminal: bool,
}

#[derive(Default)]
struct EmitterState {
    docs: HashMap<DocumentId, Track>,
    results: Vec<(usize, DocumentResult)>,
    batch_done: bool,
}

pub struct StageEmitter {
    broadcaster: Broadcaster,
    batch_id: Uuid,
    total: usize,
    state: Mutex<EmitterState>,
}

impl StageEmitter {
    pub fn new(broadcaster: Broadcaster, batch_id: Uuid, total: usize) -> Self {
        Self {
            broadcaster,
            batch_id,
            total,
            state: Mutex::new(EmitterState::default()),
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    fn state(&self) -> MutexGuard<'_, EmitterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn processing_event(
        &self,
        doc: &DocumentRef,
        stage: &str,
        detail: &str,
        percent: u8,
    ) -> ProgressEvent {
        ProgressEvent::DocumentProcessing(DocumentProcessing {
            batch_id: Some(self.batch_id),
            document_id: doc.id,
            filename: doc.filename.clone(),
            status: DocumentStatus::Processing,
            stage: stage.to_string(),
            stage_detail: detail.to_string(),
            progress: percent,
            current: Some(doc.position),
            total: Some(self.total),
        })
    }

    /// Emit `document_processing` with stage `starting`.
    ///
    /// Returns false if the document was already started.
    pub fn on_document_start(&self, doc: &DocumentRef) -> bool {
        let mut state = self.state();
        if state.docs.contains_key(&doc.id) {
            warn!(
                batch_id = %self.batch_id,
                document_id = doc.id,
                "Document started twice, ignoring"
            );
            return false;
        }
        state.docs.insert(
            doc.id,
            Track {
                percent: 0,
                started_at: Some(Instant::now()),
                terminal: false,
            },
        );
        self.broadcaster
            .publish(self.processing_event(doc, STAGE_STARTING, "", 0));
        true
    }

    /// Emit an updated `document_processing`.
    ///
    /// Percent never moves backwards within a document. Calls for a document
    /// that is not running are dropped.
    pub fn on_stage_change(
        &self,
        doc: &DocumentRef,
        stage: &str,
        detail: &str,
        percent: u8,
    ) -> bool {
        let mut state = self.state();
        let percent = match state.docs.get_mut(&doc.id) {
            Some(track) if !track.terminal => {
                track.percent = track.percent.max(percent.min(100));
                track.percent
            }
            _ => {
                debug!(
                    batch_id = %self.batch_id,
                    document_id = doc.id,
                    stage,
                    "Stage change for inactive document dropped"
                );
                return false;
            }
        };
        self.broadcaster
            .publish(self.processing_event(doc, stage, detail, percent));
        true
    }

    /// Emit the terminal event for a document.
    ///
    /// Returns the recorded result, or `None` if the document already had
    /// its terminal event.
    pub fn on_document_done(
        &self,
        doc: &DocumentRef,
        done: DocumentDone,
    ) -> Option<DocumentResult> {
        let mut state = self.state();
        let track = state.docs.entry(doc.id).or_insert(Track {
            percent: 0,
            started_at: None,
            terminal: false,
        });
        if track.terminal {
            warn!(
                batch_id = %self.batch_id,
                document_id = doc.id,
                "Second terminal event suppressed"
            );
            return None;
        }
        track.terminal = true;
        let duration = track
            .started_at
            .map_or(0, |t| t.elapsed().as_millis() as u64);

        let (event, result) = match done {
            DocumentDone::Succeeded { outcome, analysis } => {
                let payload = DocumentComplete {
                    batch_id: Some(self.batch_id),
                    document_id: doc.id,
                    filename: doc.filename.clone(),
                    status: DocumentStatus::Completed,
                    duration,
                    outcome,
                    analysis,
                };
                let result = DocumentResult::from(&payload);
                (ProgressEvent::DocumentComplete(payload), result)
            }
            DocumentDone::Failed { kind, message } => {
                let payload = DocumentError {
                    batch_id: Some(self.batch_id),
                    document_id: doc.id,
                    filename: doc.filename.clone(),
                    status: DocumentStatus::Failed,
                    error: message,
                    kind,
                    duration,
                };
                let result = DocumentResult::from(&payload);
                (ProgressEvent::DocumentError(payload), result)
            }
        };

        state.results.push((doc.position, result.clone()));
        self.broadcaster.publish(event);
        Some(result)
    }

    /// Emit the batch `complete` event carrying every recorded result.
    ///
    /// Returns false if the batch already had its terminal event.
    pub fn on_batch_done(&self, cancelled: bool) -> bool {
        let mut state = self.state();
        if state.batch_done {
            return false;
        }
        state.batch_done = true;
        let results = sorted_results(&state.results);
        let summary = BatchSummary::from_results(self.total, &results);
        self.broadcaster.publish(ProgressEvent::Complete(BatchComplete {
            batch_id: Some(self.batch_id),
            summary,
            results,
            cancelled,
        }));
        true
    }

    /// Emit the batch-level `error` event. Results recorded so far are kept
    /// in the payload.
    pub fn on_batch_error(&self, error: &str) -> bool {
        let mut state = self.state();
        if state.batch_done {
            return false;
        }
        state.batch_done = true;
        let results = sorted_results(&state.results);
        let summary = BatchSummary::from_results(self.total, &results);
        self.broadcaster.publish(ProgressEvent::Error(BatchError {
            batch_id: Some(self.batch_id),
            error: error.to_string(),
            summary,
            results,
        }));
        true
    }

    /// Recorded results in batch order
    pub fn results(&self) -> Vec<DocumentResult> {
        sorted_results(&self.state().results)
    }

    /// True once the document has had its terminal event
    pub fn is_terminal(&self, document_id: DocumentId) -> bool {
        self.state()
            .docs
            .get(&document_id)
            .is_some_and(|t| t.terminal)
    }
}

fn sorted_results(results: &[(usize, DocumentResult)]) -> Vec<DocumentResult> {
    let mut ordered: Vec<_> = results.to_vec();
    ordered.sort_by_key(|(position, _)| *position);
    ordered.into_iter().map(|(_, r)| r).collect()
}

/// `complete` event for a batch cancelled before it started
pub fn cancelled_before_start(batch_id: Uuid, total: usize) -> ProgressEvent {
    ProgressEvent::Complete(BatchComplete {
        batch_id: Some(batch_id),
        summary: BatchSummary::from_results(total, &[]),
        results: Vec::new(),
        cancelled: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::{Subscription, SubscriptionKind};
    use crate::hub::AnalysisHub;
    use ihale_common::config::AnalysisConfig;
    use std::sync::Arc;

    fn setup(total: usize) -> (AnalysisHub, StageEmitter, Subscription) {
        let hub = AnalysisHub::new(&AnalysisConfig::default());
        let mut sub = hub.broadcaster.subscribe(SubscriptionKind::Progress);
        sub.try_recv();
        let emitter = StageEmitter::new(hub.broadcaster.clone(), Uuid::new_v4(), total);
        (hub, emitter, sub)
    }

    fn doc(id: DocumentId, position: usize) -> DocumentRef {
        DocumentRef {
            id,
            filename: format!("doc-{}.pdf", id),
            position,
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    fn ok() -> DocumentDone {
        DocumentDone::Succeeded {
            outcome: DocumentOutcome::Analyzed,
            analysis: None,
        }
    }

    #[test]
    fn test_start_emits_starting_stage() {
        let (_hub, emitter, mut sub) = setup(3);
        assert!(emitter.on_document_start(&doc(101, 1)));
        match drain(&mut sub).as_slice() {
            [ProgressEvent::DocumentProcessing(p)] => {
                assert_eq!(p.stage, STAGE_STARTING);
                assert_eq!(p.progress, 0);
                assert_eq!(p.current, Some(1));
                assert_eq!(p.total, Some(3));
                assert_eq!(p.batch_id, Some(emitter.batch_id()));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_percent_is_monotonic_within_document() {
        let (_hub, emitter, mut sub) = setup(1);
        let d = doc(1, 1);
        emitter.on_document_start(&d);
        emitter.on_stage_change(&d, "text_extraction", "", 50);
        emitter.on_stage_change(&d, "model_call", "", 30);
        emitter.on_stage_change(&d, "post_processing", "", 250);
        let percents: Vec<u8> = drain(&mut sub)
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::DocumentProcessing(p) => Some(p.progress),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![0, 50, 50, 100]);
    }

    #[test]
    fn test_percent_resets_for_next_document() {
        let (_hub, emitter, mut sub) = setup(2);
        let a = doc(1, 1);
        let b = doc(2, 2);
        emitter.on_document_start(&a);
        emitter.on_stage_change(&a, "model_call", "", 80);
        emitter.on_document_done(&a, ok());
        emitter.on_document_start(&b);
        let last = drain(&mut sub).pop().unwrap();
        assert!(matches!(
            last,
            ProgressEvent::DocumentProcessing(p) if p.progress == 0 && p.document_id == 2
        ));
    }

    #[test]
    fn test_single_terminal_event_per_document() {
        let (_hub, emitter, mut sub) = setup(1);
        let d = doc(7, 1);
        emitter.on_document_start(&d);
        assert!(emitter.on_document_done(&d, ok()).is_some());
        assert!(emitter
            .on_document_done(
                &d,
                DocumentDone::Failed {
                    kind: FailureKind::Extraction,
                    message: "late".into()
                }
            )
            .is_none());
        // Stage changes after the terminal event are dropped
        assert!(!emitter.on_stage_change(&d, "model_call", "", 90));

        let terminals = drain(&mut sub)
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ProgressEvent::DocumentComplete(_) | ProgressEvent::DocumentError(_)
                )
            })
            .count();
        assert_eq!(terminals, 1);
        assert!(emitter.is_terminal(7));
    }

    #[test]
    fn test_single_batch_terminal_event() {
        let (_hub, emitter, mut sub) = setup(1);
        assert!(emitter.on_batch_done(false));
        assert!(!emitter.on_batch_done(false));
        assert!(!emitter.on_batch_error("late failure"));
        assert_eq!(drain(&mut sub).len(), 1);
    }

    #[test]
    fn test_batch_done_carries_ordered_results_and_summary() {
        let (_hub, emitter, mut sub) = setup(3);
        let docs = [doc(10, 1), doc(11, 2), doc(12, 3)];
        // Finish out of order
        emitter.on_document_done(
            &docs[2],
            DocumentDone::Failed {
                kind: FailureKind::Timeout,
                message: "timed out".into(),
            },
        );
        emitter.on_document_done(&docs[0], ok());
        emitter.on_document_done(
            &docs[1],
            DocumentDone::Succeeded {
                outcome: DocumentOutcome::Skipped,
                analysis: None,
            },
        );
        emitter.on_batch_done(false);

        match drain(&mut sub).pop() {
            Some(ProgressEvent::Complete(c)) => {
                let ids: Vec<_> = c.results.iter().map(|r| r.document_id).collect();
                assert_eq!(ids, vec![10, 11, 12]);
                assert_eq!(c.summary.total, 3);
                assert_eq!(c.summary.success, 1);
                assert_eq!(c.summary.skipped, 1);
                assert_eq!(c.summary.failed, 1);
                assert!(!c.cancelled);
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_error_keeps_completed_results() {
        let (_hub, emitter, mut sub) = setup(3);
        let first = doc(1, 1);
        emitter.on_document_start(&first);
        emitter.on_document_done(&first, ok());
        emitter.on_batch_error("extraction backend unreachable");

        match drain(&mut sub).pop() {
            Some(ProgressEvent::Error(e)) => {
                assert_eq!(e.results.len(), 1);
                assert_eq!(e.summary.success, 1);
                assert_eq!(e.summary.cancelled, 2);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_completions_keep_invariant() {
        let (_hub, emitter, mut sub) = setup(20);
        let emitter = Arc::new(emitter);
        let mut tasks = Vec::new();
        for i in 0..20 {
            let emitter = emitter.clone();
            tasks.push(tokio::spawn(async move {
                let d = doc(i, i as usize + 1);
                emitter.on_document_start(&d);
                // Two racing terminal calls per document
                let a = emitter.on_document_done(&d, ok());
                let b = emitter.on_document_done(
                    &d,
                    DocumentDone::Failed {
                        kind: FailureKind::Extraction,
                        message: "race".into(),
                    },
                );
                a.is_some() as usize + b.is_some() as usize
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), 1);
        }
        let terminals = drain(&mut sub)
            .iter()
            .filter(|e| {
                e.document_id().is_some() && !matches!(e, ProgressEvent::DocumentProcessing(_))
            })
            .count();
        assert_eq!(terminals, 20);
        assert_eq!(emitter.results().len(), 20);
    }

    #[test]
    fn test_cancelled_before_start_event() {
        let id = Uuid::new_v4();
        match cancelled_before_start(id, 4) {
            ProgressEvent::Complete(c) => {
                assert!(c.cancelled);
                assert_eq!(c.summary.cancelled, 4);
                assert!(c.results.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
