//! # Ihale Common Library
//!
//! Shared code for the document-analysis services:
//! - Progress event types (`ProgressEvent` tagged union)
//! - Batch request/response bodies of the HTTP API
//! - Server-Sent Events framing (encode, chunk-tolerant decode)
//! - Configuration loading
//! - Error taxonomy

pub mod batch;
pub mod config;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
pub use events::{DocumentId, ProgressEvent, QueueStatus};
