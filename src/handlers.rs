use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::adf_handler;
use crate::adf_validator::AdfValidator;
use crate::auth::{ReadAuth, VendorAuth};
use crate::config::Config;
use crate::guard::IngestGuard;
use crate::lead_storage::LeadRepository;
use crate::metrics::{self, IngestMetrics};

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Lead persistence (Postgres in production, in-memory in tests).
    pub leads: Arc<dyn LeadRepository>,
    /// Payload size and per-IP rate admission.
    pub guard: IngestGuard,
    /// Vendor signature and source allowlist checks.
    pub vendor_auth: VendorAuth,
    pub read_auth: ReadAuth,
    pub validator: AdfValidator,
    pub metrics: Arc<IngestMetrics>,
}

impl AppState {
    pub fn new(config: Config, leads: Arc<dyn LeadRepository>) -> anyhow::Result<Self> {
        let region = config
            .default_phone_region
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown phone region '{}'", config.default_phone_region))?;
        let metrics = IngestMetrics::new()
            .map_err(|e| anyhow::anyhow!("failed to register metrics: {}", e))?;

        Ok(Self {
            guard: IngestGuard::from_config(&config),
            vendor_auth: VendorAuth::from_config(&config),
            read_auth: ReadAuth::from_config(&config),
            validator: AdfValidator::new(region),
            metrics: Arc::new(metrics),
            leads,
            config,
        })
    }
}

/// GET /metrics
///
/// Prometheus text exposition of the ingest counters and histogram.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "adf-lead-ingest",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Builds the HTTP surface.
///
/// The metrics middleware is a route layer on the ingest endpoint, so every
/// response it produces (including extractor and guard rejections) is counted.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ingest_routes = Router::new()
        .route("/api/adf/lead", post(adf_handler::ingest_adf_lead))
        .route_layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            metrics::track_ingest,
        ))
        .layer(DefaultBodyLimit::max(state.guard.max_payload_bytes()));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/adf/lead/:id", get(adf_handler::get_adf_lead))
        .merge(ingest_routes)
        .with_state(state)
}
