//! Cancellation controller
//!
//! Two independent signals:
//! - [`CancelController::close`] stops delivery of events to this client.
//!   The server keeps working on the batch.
//! - [`StreamClient::cancel_batch`](crate::client::StreamClient::cancel_batch)
//!   asks the server to stop after the current document.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct CancelController {
    delivery: CancellationToken,
    batch_id: Arc<OnceLock<Uuid>>,
}

impl CancelController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop listening. Safe to call any number of times, also after the
    /// stream already ended on its own.
    pub fn close(&self) {
        if !self.delivery.is_cancelled() {
            debug!(batch_id = ?self.batch_id(), "Closing progress stream");
        }
        self.delivery.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.delivery.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) was called
    pub async fn closed(&self) {
        self.delivery.cancelled().await
    }

    /// Batch accepted for this watch, once known
    pub fn batch_id(&self) -> Option<Uuid> {
        self.batch_id.get().copied()
    }

    pub(crate) fn bind(&self, batch_id: Uuid) {
        let _ = self.batch_id.set(batch_id);
    }
}
