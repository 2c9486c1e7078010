//! Extraction backends
//!
//! The worker hands each document to an [`Extractor`]. The production
//! implementation posts to an HTTP extraction service; tests plug in
//! scripted extractors.

use std::sync::Arc;
use std::time::Duration;

use ihale_common::events::DocumentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::emitter::{DocumentRef, StageEmitter};

pub const STAGE_TEXT_EXTRACTION: &str = "text_extraction";
pub const STAGE_DISPATCH: &str = "dispatch";
pub const STAGE_MODEL_CALL: &str = "model_call";
pub const STAGE_POST_PROCESSING: &str = "post_processing";

const USER_AGENT: &str = concat!("ihale-analyzer/", env!("CARGO_PKG_VERSION"));
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
/// Added to the per-document deadline for the HTTP client's own timeout, so
/// the worker's deadline always fires first
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(30);

/// Extraction errors
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Backend cannot be reached; no further document can succeed
    #[error("Extraction backend unavailable: {0}")]
    Unavailable(String),

    /// Backend answered with a non-success status
    #[error("Extraction rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The document itself cannot be analysed
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ExtractionError {
    /// True when the failure concerns the backend rather than the document
    pub fn is_fatal(&self) -> bool {
        match self {
            ExtractionError::Unavailable(_) => true,
            ExtractionError::Http(e) => e.is_connect(),
            _ => false,
        }
    }

    /// Map onto the pipeline taxonomy: backend failures become
    /// `Unavailable`, everything else a per-document `DocumentFailed`
    pub fn into_common(self, document_id: DocumentId) -> ihale_common::Error {
        if self.is_fatal() {
            return ihale_common::Error::Unavailable(self.to_string());
        }
        ihale_common::Error::DocumentFailed {
            document_id,
            message: self.to_string(),
        }
    }
}

/// One document to analyse
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRequest {
    pub document_id: DocumentId,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
}

/// Lets an extractor report sub-stages of the running document
#[derive(Clone)]
pub struct StageReporter {
    emitter: Arc<StageEmitter>,
    document: DocumentRef,
}

impl StageReporter {
    pub fn new(emitter: Arc<StageEmitter>, document: DocumentRef) -> Self {
        Self { emitter, document }
    }

    pub fn stage(&self, stage: &str, detail: &str, percent: u8) {
        self.emitter
            .on_stage_change(&self.document, stage, detail, percent);
    }
}

/// Document analysis backend
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Fail fast when the backend is unreachable
    ///
    /// Called before each document is started. A fatal error here aborts the
    /// remaining documents of the batch.
    async fn ensure_available(&self) -> Result<(), ExtractionError> {
        Ok(())
    }

    /// Analyse one document, reporting stages along the way
    async fn extract(
        &self,
        request: &ExtractionRequest,
        reporter: &StageReporter,
    ) -> Result<serde_json::Value, ExtractionError>;
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    analysis: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Extractor backed by the HTTP extraction service
pub struct HttpExtractor {
    http_client: reqwest::Client,
    endpoint: String,
}

/// HTTP client timeout for a given per-document deadline
pub fn client_timeout(document_deadline: Duration) -> Duration {
    document_deadline + CLIENT_TIMEOUT_SLACK
}

impl HttpExtractor {
    /// `document_deadline` is the worker's per-document limit; the client
    /// timeout is set past it
    pub fn new(
        endpoint: impl Into<String>,
        document_deadline: Duration,
    ) -> Result<Self, ExtractionError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(client_timeout(document_deadline))
            .build()?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl Extractor for HttpExtractor {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn ensure_available(&self) -> Result<(), ExtractionError> {
        // Any HTTP answer means the service is up; only transport failures count
        match self
            .http_client
            .head(&self.endpoint)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_connect() || e.is_timeout() => {
                warn!(endpoint = %self.endpoint, error = %e, "Extraction backend unreachable");
                Err(ExtractionError::Unavailable(format!(
                    "{} unreachable: {}",
                    self.endpoint, e
                )))
            }
            Err(e) => Err(ExtractionError::Http(e)),
        }
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
        reporter: &StageReporter,
    ) -> Result<serde_json::Value, ExtractionError> {
        reporter.stage(
            STAGE_TEXT_EXTRACTION,
            &format!("Reading {}", request.filename),
            10,
        );
        debug!(
            document_id = request.document_id,
            endpoint = %self.endpoint,
            "Posting document to extraction backend"
        );

        reporter.stage(STAGE_DISPATCH, "Sending to extraction backend", 20);
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        reporter.stage(
            STAGE_MODEL_CALL,
            &format!("Backend answered {}", status.as_u16()),
            60,
        );
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        reporter.stage(STAGE_POST_PROCESSING, "Parsing analysis", 90);
        let body: ExtractionResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(ExtractionError::InvalidDocument(error));
        }
        let analysis = body.analysis.ok_or_else(|| {
            ExtractionError::InvalidDocument("response carried no analysis".to_string())
        })?;

        info!(document_id = request.document_id, "Extraction finished");
        Ok(analysis)
    }
}
