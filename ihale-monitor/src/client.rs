//! Stream client
//!
//! Talks to the analysis service: submits batches, follows the SSE progress
//! stream through a [`Reconciler`], and reconnects a bounded number of times
//! when the connection drops before the batch finished.

use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures::StreamExt;
use ihale_common::batch::{
    AnalyzeBatchRequest, AnalyzeBatchResponse, BatchState, BatchStateResponse,
    CancelBatchResponse,
};
use ihale_common::events::{BatchSummary, DocumentId, DocumentResult, ProgressEvent};
use ihale_common::sse::{decode_event, FrameDecoder};
use ihale_common::{Error, QueueStatus};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelController;
use crate::error::{MonitorError, Result};
use crate::reconciler::{ClientViewState, Flow, Phase, Reconciler};

pub const EVENTS_PATH: &str = "/events";
pub const QUEUE_EVENTS_PATH: &str = "/queue/events";

const USER_AGENT: &str = concat!("ihale-monitor/", env!("CARGO_PKG_VERSION"));

type ByteStream = BoxStream<'static, reqwest::Result<Vec<u8>>>;

/// Connection tuning
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Reconnect attempts per watch before giving up
    pub max_reconnects: u32,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_reconnects: 5,
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Final outcome of a watched batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub phase: Phase,
    pub summary: BatchSummary,
    pub results: Vec<DocumentResult>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl BatchReport {
    fn from_view(batch_id: Uuid, view: ClientViewState) -> Self {
        let summary = view
            .summary
            .unwrap_or_else(|| BatchSummary::from_results(view.total, &view.results));
        Self {
            batch_id,
            phase: view.phase,
            summary,
            results: view.results,
            error: view.error,
            elapsed: view.start_time.elapsed(),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Clone)]
pub struct StreamClient {
    http: reqwest::Client,
    base_url: String,
    options: ClientOptions,
}

impl StreamClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_options(base_url, ClientOptions::default())
    }

    pub fn with_options(base_url: impl Into<String>, options: ClientOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            options,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error.message)
            .unwrap_or(text);
        Err(MonitorError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Submit a batch
    pub async fn enqueue(&self, document_ids: &[DocumentId]) -> Result<AnalyzeBatchResponse> {
        let response = self
            .http
            .post(self.url("/analyze-batch"))
            .json(&AnalyzeBatchRequest {
                document_ids: document_ids.to_vec(),
            })
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Ask the server to stop working on a batch
    pub async fn cancel_batch(&self, batch_id: Uuid) -> Result<CancelBatchResponse> {
        let response = self
            .http
            .post(self.url(&format!("/batches/{}/cancel", batch_id)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Where the server says a batch stands
    pub async fn batch_state(&self, batch_id: Uuid) -> Result<BatchStateResponse> {
        let response = self
            .http
            .get(self.url(&format!("/batches/{}", batch_id)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        let response = self.http.get(self.url("/queue/status")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn open_stream(&self, path: &str) -> Result<ByteStream> {
        let response = self
            .http
            .get(self.url(path))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = Self::check(response).await?;
        debug!(path, "Subscribed to event stream");
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed())
    }

    /// Re-open the stream after a drop. `Ok(None)` if closed meanwhile.
    async fn reopen(
        &self,
        path: &str,
        controller: &CancelController,
        attempts: &mut u32,
    ) -> Result<Option<ByteStream>> {
        loop {
            *attempts += 1;
            if *attempts > self.options.max_reconnects {
                return Err(Error::StreamClosed.into());
            }
            warn!(attempt = *attempts, path, "Event stream lost, reconnecting");
            tokio::select! {
                _ = controller.closed() => return Ok(None),
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
            }
            match self.open_stream(path).await {
                Ok(stream) => return Ok(Some(stream)),
                Err(e) => warn!(error = %e, "Reconnect failed"),
            }
        }
    }

    /// Submit a batch and follow it to its end.
    ///
    /// Subscribes before submitting so no event of the batch is missed.
    /// `on_update` sees the view after every chunk. Closing `controller`
    /// resolves with the partial results, or [`Error::NoWorkDone`] if no
    /// document had finished.
    pub async fn analyze<F>(
        &self,
        document_ids: &[DocumentId],
        controller: &CancelController,
        mut on_update: F,
    ) -> Result<BatchReport>
    where
        F: FnMut(&ClientViewState),
    {
        let mut stream = self.open_stream(EVENTS_PATH).await?;
        let accepted = self.enqueue(document_ids).await?;
        let batch = accepted.batch;
        controller.bind(batch.batch_id);
        info!(
            batch_id = %batch.batch_id,
            documents = batch.documents.len(),
            position = batch.position,
            "Batch accepted"
        );

        let mut view = ClientViewState::for_batch(batch.batch_id, &batch.documents, Instant::now());
        view.queue = Some(accepted.queue_status);
        let mut reconciler = Reconciler::new(view);
        on_update(reconciler.view());

        let mut attempts = 0;
        loop {
            let next = tokio::select! {
                _ = controller.closed() => {
                    return finish_closed(batch.batch_id, reconciler.into_view());
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let flow = reconciler.feed_at(&chunk, Instant::now());
                    on_update(reconciler.view());
                    if flow == Flow::Done {
                        break;
                    }
                    continue;
                }
                Some(Err(e)) => warn!(error = %e, "Event stream read failed"),
                None => debug!("Event stream ended"),
            }

            match self.reopen(EVENTS_PATH, controller, &mut attempts).await? {
                Some(reopened) => {
                    stream = reopened;
                    reconciler.resubscribed();
                }
                None => return finish_closed(batch.batch_id, reconciler.into_view()),
            }
            // The terminal event may have gone out while we were away
            if self.catch_up(batch.batch_id, &mut reconciler).await == Flow::Done {
                on_update(reconciler.view());
                break;
            }
        }

        finish(batch.batch_id, reconciler.into_view())
    }

    /// Ask the server how the batch ended after a reconnect
    async fn catch_up(&self, batch_id: Uuid, reconciler: &mut Reconciler) -> Flow {
        let state = match self.batch_state(batch_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "Batch lookup failed");
                return Flow::Continue;
            }
        };
        match (state.state, state.terminal()) {
            (BatchState::Finished, Some(terminal)) => {
                info!(batch_id = %batch_id, "Batch finished while disconnected");
                reconciler.apply_at(&terminal, Instant::now())
            }
            (BatchState::Unknown, _) => {
                warn!(batch_id = %batch_id, "Server no longer knows the batch");
                reconciler.lost_track();
                Flow::Done
            }
            _ => Flow::Continue,
        }
    }

    /// Print-style watch of a raw stream (`/events` or `/queue/events`)
    /// until `controller` is closed or `on_event` returns [`Flow::Done`].
    pub async fn watch<F>(
        &self,
        path: &str,
        controller: &CancelController,
        mut on_event: F,
    ) -> Result<()>
    where
        F: FnMut(&ProgressEvent) -> Flow,
    {
        let mut stream = self.open_stream(path).await?;
        let mut decoder = FrameDecoder::new();
        let mut attempts = 0;

        loop {
            let next = tokio::select! {
                _ = controller.closed() => return Ok(()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let frames = decoder.push(&chunk).unwrap_or_else(|e| {
                        warn!(error = %e, "Dropping unterminated frame");
                        Vec::new()
                    });
                    for frame in frames {
                        match decode_event(&frame) {
                            Ok(Some(event)) => {
                                if on_event(&event) == Flow::Done {
                                    return Ok(());
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "Skipping malformed frame"),
                        }
                    }
                    continue;
                }
                Some(Err(e)) => warn!(error = %e, "Event stream read failed"),
                None => debug!("Event stream ended"),
            }

            match self.reopen(path, controller, &mut attempts).await? {
                Some(reopened) => {
                    stream = reopened;
                    decoder.reset();
                }
                None => return Ok(()),
            }
        }
    }
}

fn finish(batch_id: Uuid, view: ClientViewState) -> Result<BatchReport> {
    if view.phase == Phase::Cancelled && view.processed() == 0 {
        return Err(Error::NoWorkDone.into());
    }
    Ok(BatchReport::from_view(batch_id, view))
}

fn finish_closed(batch_id: Uuid, mut view: ClientViewState) -> Result<BatchReport> {
    if view.phase == Phase::Running {
        view.phase = Phase::Cancelled;
        view.message = format!("Cancelled ({}/{} processed)", view.processed(), view.total);
    }
    info!(batch_id = %batch_id, processed = view.processed(), "Stopped watching batch");
    finish(batch_id, view)
}
