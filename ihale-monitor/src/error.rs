//! Client error type

use thiserror::Error;

/// Errors surfaced by the monitor client
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Transport failure talking to the analysis service
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with an error body
    #[error("Service error {status}: {message}")]
    Api { status: u16, message: String },

    /// Protocol or pipeline condition (stream closed, no work done, ...)
    #[error(transparent)]
    Common(#[from] ihale_common::Error),
}

impl MonitorError {
    /// True when a cancelled watch ended before any document finished
    pub fn is_no_work_done(&self) -> bool {
        matches!(self, MonitorError::Common(ihale_common::Error::NoWorkDone))
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
