use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::adf_models::{AdfLead, IngestMetadata, LeadCreatedResponse, NewAdfLead};
use crate::adf_parser::parse_with_timeout;
use crate::errors::{AppError, IngestOutcome, ResultExt};
use crate::guard::client_ip;
use crate::handlers::AppState;
use crate::submission::AdfSubmission;

/// POST /api/adf/lead
///
/// Flow:
/// 1. Guard: record the hit, reject bodies over the size limit (413), then
///    reject IPs over their window budget (429).
/// 2. Source checks: allowlist (403) and vendor signature (401), when configured.
/// 3. Decode the body by content type (raw XML or `{ xmlContent }` envelope).
/// 4. Parse the XML with DTDs refused, on the blocking pool under a timeout.
/// 5. Validate the ADF structure and normalize the lead.
/// 6. Persist one row and answer `201 { leadId }`.
///
/// Every exit is an `AppError` or the 201 below; `track_ingest` records both.
pub async fn ingest_adf_lead(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, AppError> {
    let received_at = Utc::now();
    let ip = client_ip(
        &headers,
        connect_info.map(|ConnectInfo(addr)| addr),
        state.config.trust_proxy_headers,
    );

    let body = state.guard.admit(ip, body).await?;
    state.vendor_auth.check_ip(ip)?;
    state.vendor_auth.verify_signature(&headers, &body)?;
    let raw_size_bytes = body.len();
    let raw_sha256 = hex::encode(Sha256::digest(&body));

    tracing::info!(
        "Received ADF submission from {} ({} bytes, sha256={})",
        ip,
        raw_size_bytes,
        &raw_sha256[..12]
    );

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let (xml, context) = AdfSubmission::decode(content_type, body)?.into_parts()?;

    let root = parse_with_timeout(xml, Duration::from_millis(state.config.parse_timeout_ms)).await?;
    let lead = state.validator.validate(&root)?;

    let new_lead = NewAdfLead {
        lead,
        metadata: IngestMetadata {
            source_ip: ip,
            received_at,
            raw_size_bytes,
            raw_sha256,
            source: context.source,
            dealership_id: context.dealership_id,
        },
    };

    let lead_id = state
        .leads
        .insert(&new_lead)
        .await
        .context("persisting ADF lead")?;

    tracing::info!(
        "✅ ADF lead {} stored (source={}, vehicle={})",
        lead_id,
        new_lead.metadata.source,
        new_lead
            .lead
            .vehicle
            .as_ref()
            .map(|v| format!("{} {} {}", v.year, v.make, v.model))
            .unwrap_or_else(|| "none".to_string())
    );

    Ok((
        StatusCode::CREATED,
        Extension(IngestOutcome::Created),
        Json(LeadCreatedResponse { lead_id }),
    )
        .into_response())
}

/// GET /api/adf/lead/:id
///
/// Reads back a persisted lead by the id returned from ingestion.
/// Requires a bearer token when `INTERNAL_JWT_SECRET` is set.
pub async fn get_adf_lead(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<AdfLead>, AppError> {
    if let Some(claims) = state.read_auth.verify(&headers)? {
        tracing::debug!("Lead read by {}", claims.sub);
    }
    let id = Uuid::parse_str(id.trim())
        .map_err(|_| AppError::validation("id", "is not a valid UUID"))?;

    let lead = state
        .leads
        .find(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("ADF lead {} not found", id)))?;

    Ok(Json(lead))
}
