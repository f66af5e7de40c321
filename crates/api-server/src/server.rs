//! API server: HTTP trigger surface plus the Prometheus exporter.

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use dripline_core::config::AppConfig;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::rest::{self, AppState};

/// Builds the full router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Triggers
        .route("/v1/triggers/enroll", post(rest::handle_enroll))
        .route("/v1/triggers/cancel", post(rest::handle_cancel_trigger))
        // Operator actions
        .route("/v1/drafts", get(rest::list_pending_drafts))
        .route("/v1/drafts/:id", get(rest::get_draft))
        .route("/v1/drafts/:id/decision", post(rest::handle_decision))
        .route("/v1/processes/:id", get(rest::get_process))
        .route("/v1/processes/:id/pause", post(rest::pause_process))
        .route("/v1/processes/:id/resume", post(rest::resume_process))
        .route("/v1/processes/:id/cancel", post(rest::cancel_process))
        .route("/v1/subscribers/:id", get(rest::get_subscriber))
        .route("/v1/chains", get(rest::list_chains))
        .route("/v1/chains/:id/stats", get(rest::chain_stats))
        // Interaction ingestion
        .route("/v1/interactions", post(rest::record_interaction))
        .route("/v1/webhooks/email", post(rest::handle_email_webhook))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve HTTP until `shutdown` resolves.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the metrics exporter on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
