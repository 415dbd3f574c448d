//! HTTP surface: ad serving, event tracking and reporting.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;
use crate::matching::MatchingOrchestrator;
use crate::middleware::request_logging;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<MatchingOrchestrator>,
    /// Absent when no Prometheus recorder was installed (tests)
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(orchestrator: Arc<MatchingOrchestrator>) -> Self {
        Self {
            orchestrator,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn create_router(state: AppState) -> Router {
    let tracking = Router::new()
        .route("/impression/:impression_id", post(handlers::track_impression))
        .route("/pixel/:impression_id", get(handlers::tracking_pixel))
        .route("/click/:impression_id", get(handlers::track_click))
        .route("/viewability/:impression_id", post(handlers::track_viewability))
        .route("/conversion/:impression_id", post(handlers::track_conversion));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/api/ads/serve", get(handlers::serve_ads))
        .nest("/api/track", tracking)
        .route("/api/campaigns/:campaign_id/budget", get(handlers::campaign_budget))
        .route("/api/reports/ivt", get(handlers::ivt_report))
        .with_state(state)
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
