//! ihale-monitor library
//!
//! Client side of the analysis pipeline: submits batches, follows their
//! progress stream and folds it into a view a UI can render.

pub mod cancel;
pub mod client;
pub mod error;
pub mod reconciler;

pub use cancel::CancelController;
pub use client::{BatchReport, ClientOptions, StreamClient};
pub use error::{MonitorError, Result};
pub use reconciler::{ClientViewState, FileProgress, Flow, Phase, Reconciler};
