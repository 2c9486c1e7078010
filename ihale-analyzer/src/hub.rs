//! Shared mutable state of the analysis service
//!
//! The queue book and the subscriber list live behind one mutex. Nothing
//! awaits or touches a socket while holding it: publishing only does
//! `try_send` into per-subscriber buffers, socket writes happen in each
//! subscriber's own SSE task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ihale_common::config::AnalysisConfig;

use crate::broadcaster::{Broadcaster, SubscriberList};
use crate::queue::{JobQueue, QueueBook};

pub(crate) struct Shared {
    pub book: QueueBook,
    pub subscribers: SubscriberList,
}

pub(crate) type SharedState = Arc<Mutex<Shared>>;

/// Lock the shared state, recovering from a poisoned mutex
pub(crate) fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queue and broadcaster handles over the same state
#[derive(Clone)]
pub struct AnalysisHub {
    pub queue: JobQueue,
    pub broadcaster: Broadcaster,
}

impl AnalysisHub {
    pub fn new(config: &AnalysisConfig) -> Self {
        let shared: SharedState = Arc::new(Mutex::new(Shared {
            book: QueueBook::default(),
            subscribers: SubscriberList::new(config.subscriber_buffer),
        }));
        Self {
            queue: JobQueue::new(shared.clone()),
            broadcaster: Broadcaster::new(shared),
        }
    }
}
