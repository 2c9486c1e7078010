//! HTTP API handlers for the analysis service
//!
//! Batch submission and cancellation over REST, progress over SSE.

pub mod batches;
pub mod health;
pub mod sse;

pub use batches::batch_routes;
pub use health::health_routes;
pub use sse::{event_stream, queue_event_stream};
