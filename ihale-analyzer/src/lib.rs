//! ihale-analyzer library interface
//!
//! Batch document analysis with streamed progress: the job queue, the
//! worker and its stage emitter, the event broadcaster, and the HTTP API.

pub mod api;
pub mod broadcaster;
pub mod db;
pub mod emitter;
pub mod error;
pub mod extraction;
pub mod hub;
pub mod queue;
pub mod worker;

pub use crate::error::{ApiError, ApiResult};
pub use crate::hub::AnalysisHub;

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use ihale_common::config::AnalysisConfig;
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Queue and broadcaster
    pub hub: AnalysisHub,
    /// Document repository
    pub db: SqlitePool,
    pub config: Arc<AnalysisConfig>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(hub: AnalysisHub, db: SqlitePool, config: AnalysisConfig) -> Self {
        Self {
            hub,
            db,
            config: Arc::new(config),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::batch_routes())
        .route("/events", get(api::event_stream))
        .route("/queue/events", get(api::queue_event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
