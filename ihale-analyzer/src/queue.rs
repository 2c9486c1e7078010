//! Job queue
//!
//! Holds submitted batches and serializes their execution: one batch sits in
//! the processing slot, the rest wait in FIFO order. Every transition
//! (accept, document start, cancel, finish) publishes a fresh
//! `queue_status` to subscribers under the same lock, so observers see
//! transitions in the order they happened.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
pub use ihale_common::batch::CancelOutcome;
use ihale_common::batch::{BatchState, BatchStateResponse};
use ihale_common::events::{DocumentId, ProgressEvent, QueueStatus};
use ihale_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::emitter;
use crate::hub::{self, Shared, SharedState};

/// Terminal events kept for clients that reconnect after their batch ended
pub const RECENT_TERMINALS: usize = 64;

/// Returned to the caller of [`JobQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchHandle {
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// 0 when the batch went straight to the processing slot
    pub position: usize,
    pub document_ids: Vec<DocumentId>,
}

struct BatchEntry {
    id: Uuid,
    document_ids: Vec<DocumentId>,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    started: bool,
    /// Documents not yet started
    remaining: usize,
}

impl BatchEntry {
    fn handle(&self, position: usize) -> BatchHandle {
        BatchHandle {
            batch_id: self.id,
            created_at: self.created_at,
            position,
            document_ids: self.document_ids.clone(),
        }
    }
}

/// Queue bookkeeping (guarded by the hub mutex)
pub(crate) struct QueueBook {
    active: Option<BatchEntry>,
    waiting: VecDeque<BatchEntry>,
    /// Most recent batch terminal events, oldest first
    finished: VecDeque<(Uuid, ProgressEvent)>,
    open: bool,
}

impl Default for QueueBook {
    fn default() -> Self {
        Self {
            active: None,
            waiting: VecDeque::new(),
            finished: VecDeque::new(),
            open: true,
        }
    }
}

impl QueueBook {
    /// Instantaneous counts
    pub fn status(&self) -> QueueStatus {
        let processing = usize::from(self.active.is_some());
        let queued = self.waiting.len();
        let pending = self.active.as_ref().map_or(0, |b| b.remaining)
            + self
                .waiting
                .iter()
                .map(|b| b.document_ids.len())
                .sum::<usize>();
        QueueStatus {
            pending,
            queued,
            processing,
            is_processing: processing > 0,
            total_in_queue: queued + processing,
        }
    }

    /// Keep a batch `complete`/`error` for later lookups
    pub fn remember_terminal(&mut self, event: &ProgressEvent) {
        let Some(batch_id) = event.batch_id().filter(|_| event.is_batch_terminal()) else {
            return;
        };
        if self.finished.iter().any(|(id, _)| *id == batch_id) {
            return;
        }
        if self.finished.len() == RECENT_TERMINALS {
            self.finished.pop_front();
        }
        self.finished.push_back((batch_id, event.clone()));
    }

    pub fn batch_state(&self, batch_id: Uuid) -> BatchStateResponse {
        // The terminal event is published before the slot is released
        if let Some((_, event)) = self.finished.iter().find(|(id, _)| *id == batch_id) {
            return BatchStateResponse::new(batch_id, BatchState::Finished, Some(event));
        }
        let state = if self.active.as_ref().is_some_and(|b| b.id == batch_id) {
            BatchState::Processing
        } else if self.waiting.iter().any(|b| b.id == batch_id) {
            BatchState::Queued
        } else {
            BatchState::Unknown
        };
        BatchStateResponse::new(batch_id, state, None)
    }
}

/// A batch handed to the worker
#[derive(Debug, Clone)]
pub struct ActiveBatch {
    pub id: Uuid,
    pub document_ids: Vec<DocumentId>,
    pub created_at: DateTime<Utc>,
    /// Cooperative cancel flag, checked between documents
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct JobQueue {
    shared: SharedState,
    notify: Arc<Notify>,
}

fn publish_status(shared: &mut Shared) {
    let status = shared.book.status();
    shared.subscribers.publish(ProgressEvent::QueueStatus(status));
}

impl JobQueue {
    pub(crate) fn new(shared: SharedState) -> Self {
        Self {
            shared,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Accept a batch.
    ///
    /// Rejects empty or duplicate-containing lists. If nothing is running
    /// the batch takes the processing slot at once, otherwise it waits.
    pub fn enqueue(&self, document_ids: Vec<DocumentId>) -> Result<BatchHandle> {
        if document_ids.is_empty() {
            return Err(Error::InvalidArgument(
                "documentIds must contain at least one id".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = document_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(Error::InvalidArgument(format!(
                "document {} listed more than once",
                dup
            )));
        }

        let entry = BatchEntry {
            id: Uuid::new_v4(),
            remaining: document_ids.len(),
            document_ids,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            started: false,
        };

        let handle = {
            let mut shared = hub::lock(&self.shared);
            if !shared.book.open {
                return Err(Error::Unavailable("analysis queue is shut down".to_string()));
            }
            let handle = if shared.book.active.is_none() {
                let handle = entry.handle(0);
                shared.book.active = Some(entry);
                handle
            } else {
                let handle = entry.handle(shared.book.waiting.len() + 1);
                shared.book.waiting.push_back(entry);
                handle
            };
            publish_status(&mut shared);
            handle
        };

        info!(
            batch_id = %handle.batch_id,
            documents = handle.document_ids.len(),
            position = handle.position,
            "Batch accepted"
        );
        self.notify.notify_one();
        Ok(handle)
    }

    /// Instantaneous counts; never waits on the worker
    pub fn status(&self) -> QueueStatus {
        hub::lock(&self.shared).book.status()
    }

    /// Cancel a batch.
    ///
    /// A waiting batch is removed and its watchers get a `complete` with
    /// `cancelled = true`. A running batch is flagged; the worker finishes
    /// the current document and then reports partial results. Unknown or
    /// finished batches are a no-op.
    pub fn cancel(&self, batch_id: Uuid) -> CancelOutcome {
        let mut shared = hub::lock(&self.shared);

        if let Some(active) = shared.book.active.as_ref().filter(|b| b.id == batch_id) {
            active.cancel.cancel();
            info!(batch_id = %batch_id, "Cancellation requested for running batch");
            return CancelOutcome::Requested;
        }

        let index = shared.book.waiting.iter().position(|b| b.id == batch_id);
        match index.and_then(|i| shared.book.waiting.remove(i)) {
            Some(entry) => {
                entry.cancel.cancel();
                let event = emitter::cancelled_before_start(entry.id, entry.document_ids.len());
                shared.book.remember_terminal(&event);
                shared.subscribers.publish(event);
                publish_status(&mut shared);
                info!(batch_id = %batch_id, "Waiting batch removed");
                CancelOutcome::Removed
            }
            None => {
                debug!(batch_id = %batch_id, "Cancel for inactive batch ignored");
                CancelOutcome::NotActive
            }
        }
    }

    /// Wait for the batch in the processing slot.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn next_batch(&self) -> Option<ActiveBatch> {
        loop {
            let notified = self.notify.notified();
            {
                let mut shared = hub::lock(&self.shared);
                if !shared.book.open {
                    return None;
                }
                if let Some(active) = shared.book.active.as_mut().filter(|b| !b.started) {
                    active.started = true;
                    return Some(ActiveBatch {
                        id: active.id,
                        document_ids: active.document_ids.clone(),
                        created_at: active.created_at,
                        cancel: active.cancel.clone(),
                    });
                }
            }
            notified.await;
        }
    }

    /// Record that the worker started one document of the running batch
    pub fn document_started(&self, batch_id: Uuid) {
        let mut shared = hub::lock(&self.shared);
        let updated = match shared.book.active.as_mut().filter(|b| b.id == batch_id) {
            Some(active) => {
                active.remaining = active.remaining.saturating_sub(1);
                true
            }
            None => false,
        };
        if updated {
            publish_status(&mut shared);
        }
    }

    /// Release the processing slot and promote the next waiting batch
    pub fn finish_batch(&self, batch_id: Uuid) {
        {
            let mut shared = hub::lock(&self.shared);
            if shared.book.active.as_ref().map(|b| b.id) != Some(batch_id) {
                return;
            }
            shared.book.active = shared.book.waiting.pop_front();
            publish_status(&mut shared);
            if let Some(next) = &shared.book.active {
                info!(batch_id = %next.id, "Batch promoted to processing");
            }
        }
        self.notify.notify_one();
    }

    /// Stop accepting work and signal running batches to stop
    pub fn close(&self) {
        {
            let mut shared = hub::lock(&self.shared);
            shared.book.open = false;
            if let Some(active) = &shared.book.active {
                active.cancel.cancel();
            }
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
        info!("Analysis queue closed");
    }

    pub fn is_open(&self) -> bool {
        hub::lock(&self.shared).book.open
    }

    /// Current state of a batch, with its terminal event once finished
    pub fn batch_state(&self, batch_id: Uuid) -> BatchStateResponse {
        hub::lock(&self.shared).book.batch_state(batch_id)
    }
}
