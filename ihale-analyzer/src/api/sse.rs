//! Server-Sent Events for analysis progress
//!
//! `/events` carries every event kind; `/queue/events` is the dashboard side
//! channel with `queue_status` only, pushed on each transition and on a
//! fixed period.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use ihale_common::config::AnalysisConfig;
use ihale_common::ProgressEvent;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::broadcaster::{Subscription, SubscriptionKind};
use crate::AppState;

fn to_sse_event(event: &ProgressEvent) -> Option<Event> {
    match event.payload_json() {
        Ok(json) => Some(Event::default().event(event.event_type()).data(json)),
        Err(e) => {
            warn!("SSE: Failed to serialize event {}: {}", event.event_type(), e);
            None
        }
    }
}

fn keep_alive(config: &AnalysisConfig) -> KeepAlive {
    KeepAlive::new()
        .interval(config.keepalive())
        .text("heartbeat")
}

/// GET /events - progress stream for all batches
///
/// Opens with a `queue_status` snapshot. The stream ends if this client
/// falls too far behind; dropping the connection unsubscribes.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.hub.broadcaster.subscribe(SubscriptionKind::Progress);
    info!(
        subscription_id = subscription.id(),
        "New SSE client connected to progress events"
    );

    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            if let Some(sse) = to_sse_event(&event) {
                debug!("SSE: Sending {}", event.event_type());
                yield Ok(sse);
            }
        }
        debug!(subscription_id = subscription.id(), "SSE: Progress stream ended");
    };

    Sse::new(stream).keep_alive(keep_alive(&state.config))
}

/// GET /queue/events - queue status side channel
pub async fn queue_event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state
        .hub
        .broadcaster
        .subscribe(SubscriptionKind::QueueStatus);
    info!(
        subscription_id = subscription.id(),
        "New SSE client connected to queue events"
    );

    let queue = state.hub.queue.clone();
    let period = state.config.status_interval();
    let stream = async_stream::stream! {
        let mut subscription: Subscription = subscription;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires at once; the snapshot already covers it
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(sse) = to_sse_event(&ProgressEvent::QueueStatus(queue.status())) {
                        yield Ok(sse);
                    }
                }
                next = subscription.recv() => {
                    match next {
                        Some(event) => {
                            if let Some(sse) = to_sse_event(&event) {
                                yield Ok(sse);
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        debug!(subscription_id = subscription.id(), "SSE: Queue stream ended");
    };

    Sse::new(stream).keep_alive(keep_alive(&state.config))
}
