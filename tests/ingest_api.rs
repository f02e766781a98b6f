/// End-to-end tests for the ADF ingest endpoint
/// Drives the real router against the in-memory lead repository
use adf_lead_ingest::adf_models::{AdfLead, NewAdfLead};
use adf_lead_ingest::auth::{self, InternalClaims, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use adf_lead_ingest::config::Config;
use adf_lead_ingest::errors::{AppError, IngestOutcome, MALFORMED_INPUT_MESSAGE};
use adf_lead_ingest::handlers::{build_router, AppState};
use adf_lead_ingest::lead_storage::{InMemoryLeadRepository, LeadRepository};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

const HONDA_ACCORD: &str = include_str!("fixtures/honda_accord.xml");

struct TestApp {
    router: Router,
    leads: Arc<InMemoryLeadRepository>,
}

/// Helper function to create test config
fn create_test_config() -> Config {
    Config {
        database_url: "postgresql://test".to_string(),
        trust_proxy_headers: true,
        ..Config::default()
    }
}

fn test_app() -> TestApp {
    test_app_with(create_test_config())
}

fn test_app_with(config: Config) -> TestApp {
    let leads = Arc::new(InMemoryLeadRepository::new());
    let state = AppState::new(config, leads.clone()).unwrap();
    TestApp {
        router: build_router(Arc::new(state)),
        leads,
    }
}

/// Honda document padded with a leading comment to exactly `len` bytes.
fn honda_padded_to(len: usize) -> String {
    let overhead = HONDA_ACCORD.len() + "<!--  -->".len();
    let doc = HONDA_ACCORD.replace(
        "<adf>",
        &format!("<!-- {} --><adf>", "x".repeat(len - overhead)),
    );
    assert_eq!(doc.len(), len);
    doc
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, String::from_utf8_lossy(&bytes).into_owned())
}

fn post(content_type: &str, ip: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/adf/lead")
        .header(header::CONTENT_TYPE, content_type)
        .header("x-forwarded-for", ip)
        .body(body.into())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn lead_id_of(body: &str) -> Uuid {
    let value: Value = serde_json::from_str(body).unwrap();
    value["leadId"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_honda_accord_xml_is_created() {
    let app = test_app();

    let (status, _, body) = send(&app, post("application/xml", "198.51.100.1", HONDA_ACCORD)).await;
    assert_eq!(status, StatusCode::CREATED, "body: {}", body);

    let id = lead_id_of(&body);
    let lead = app.leads.find(id).await.unwrap().unwrap();
    let vehicle = lead.lead.vehicle.as_ref().unwrap();
    assert_eq!(vehicle.make, "Honda");
    assert_eq!(vehicle.model, "Accord");
    assert_eq!(vehicle.year, 2024);
    assert_eq!(lead.lead.customer.email.as_deref(), Some("john.doe@example.com"));
    assert_eq!(lead.metadata.source, "adf_xml");
    assert_eq!(lead.metadata.raw_size_bytes, HONDA_ACCORD.len());
    assert_eq!(lead.metadata.source_ip.to_string(), "198.51.100.1");
}

#[tokio::test]
async fn test_json_envelope_behaves_like_raw_xml() {
    let app = test_app();
    let envelope = json!({
        "xmlContent": HONDA_ACCORD,
        "source": "test_api",
        "dealershipId": 17
    });

    let (status, _, body) = send(
        &app,
        post("application/json", "198.51.100.2", envelope.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {}", body);

    let lead = app.leads.find(lead_id_of(&body)).await.unwrap().unwrap();
    assert_eq!(lead.lead.vehicle.unwrap().make, "Honda");
    assert_eq!(lead.metadata.source, "test_api");
    assert_eq!(lead.metadata.dealership_id, Some(17));
}

#[tokio::test]
async fn test_round_trip_via_get() {
    let app = test_app();
    let (_, _, body) = send(&app, post("application/xml", "198.51.100.3", HONDA_ACCORD)).await;
    let id = lead_id_of(&body);

    let (status, _, body) = send(&app, get(&format!("/api/adf/lead/{}", id))).await;
    assert_eq!(status, StatusCode::OK);

    let lead: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(lead["id"], json!(id.to_string()));
    assert_eq!(lead["vehicle"]["make"], json!("Honda"));
    assert_eq!(lead["vehicle"]["model"], json!("Accord"));
    assert_eq!(lead["vehicle"]["interestType"], json!("buy"));
    assert_eq!(lead["customer"]["firstName"], json!("John"));
    assert_eq!(lead["customer"]["lastName"], json!("Doe"));
    assert_eq!(lead["customer"]["phone"], json!("+15551234567"));
    assert_eq!(lead["vendor"]["name"], json!("Test Dealership"));
}

#[tokio::test]
async fn test_get_unknown_and_invalid_ids() {
    let app = test_app();

    let (status, _, _) = send(&app, get(&format!("/api/adf/lead/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, get("/api/adf/lead/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_payload_is_413_regardless_of_content() {
    let app = test_app();

    // Valid document padded past the limit with a comment
    let padding = "x".repeat(600 * 1024);
    let oversized = HONDA_ACCORD.replace("<adf>", &format!("<!-- {} --><adf>", padding));
    let (status, _, _) = send(&app, post("application/xml", "198.51.100.4", oversized)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let garbage = vec![b'z'; 500 * 1024 + 1];
    let (status, _, _) = send(&app, post("application/xml", "198.51.100.4", garbage)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    assert!(app.leads.is_empty().await);
}

#[tokio::test]
async fn test_payload_limit_boundary_is_inclusive() {
    let app = test_app();

    let (status, _, body) = send(
        &app,
        post("application/xml", "198.51.100.40", honda_padded_to(512_000)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {}", body);

    let (status, _, _) = send(
        &app,
        post("application/xml", "198.51.100.41", honda_padded_to(512_001)),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    assert_eq!(app.leads.len().await, 1);
}

#[tokio::test]
async fn test_xxe_attempt_never_leaks_file_contents() {
    let app = test_app();
    let xxe = r#"<?xml version="1.0"?>
<!DOCTYPE adf [ <!ENTITY xxe SYSTEM "file:///etc/passwd"> ]>
<adf><prospect><requestdate>2024-01-15T10:30:00Z</requestdate>
<vehicle><year>2024</year><make>&xxe;</make><model>Accord</model></vehicle>
<customer><contact><name part="full">Eve</name><email>eve@example.com</email></contact></customer>
</prospect></adf>"#;

    for content_type in ["application/xml", "application/json"] {
        let body = if content_type == "application/json" {
            json!({ "xmlContent": xxe }).to_string()
        } else {
            xxe.to_string()
        };
        let (status, _, body) = send(&app, post(content_type, "198.51.100.5", body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.contains("root:"));
        assert!(!body.contains("/bin/"));
        assert!(!body.contains("passwd"));
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["error"], json!(MALFORMED_INPUT_MESSAGE));
    }
    assert!(app.leads.is_empty().await);
}

#[tokio::test]
async fn test_rate_limit_35_requests_yields_429s() {
    let app = test_app();

    let mut created = 0;
    let mut limited = 0;
    for _ in 0..35 {
        let (status, headers, _) =
            send(&app, post("application/xml", "203.0.113.7", HONDA_ACCORD)).await;
        match status {
            StatusCode::CREATED => created += 1,
            StatusCode::TOO_MANY_REQUESTS => {
                assert!(headers.contains_key(header::RETRY_AFTER));
                limited += 1;
            }
            other => panic!("unexpected status {}", other),
        }
    }

    assert_eq!(created, 30);
    assert!(limited >= 5);

    // Another source is unaffected
    let (status, _, _) = send(&app, post("application/xml", "203.0.113.8", HONDA_ACCORD)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_missing_contact_channel_is_400() {
    let app = test_app();
    let xml = HONDA_ACCORD
        .replace("<email>john.doe@example.com</email>", "")
        .replace(r#"<phone type="voice" time="morning">555-123-4567</phone>"#, "");

    let (status, _, body) = send(&app, post("application/xml", "198.51.100.6", xml)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let value: Value = serde_json::from_str(&body).unwrap();
    let error = value["error"].as_str().unwrap();
    assert!(error.contains("email or phone"), "error: {}", error);
    assert_eq!(value["field"], json!("customer.contact"));
}

#[tokio::test]
async fn test_malformed_xml_is_400() {
    let app = test_app();
    let truncated = &HONDA_ACCORD[..HONDA_ACCORD.len() / 2];

    let (status, _, body) = send(&app, post("application/xml", "198.51.100.7", truncated)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains(MALFORMED_INPUT_MESSAGE));
}

#[tokio::test]
async fn test_unsupported_content_type_is_400() {
    let app = test_app();
    let (status, _, _) = send(&app, post("text/plain", "198.51.100.8", HONDA_ACCORD)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_storage_unavailable_is_500() {
    let app = test_app();
    app.leads.set_unavailable(true);

    let (status, _, body) = send(&app, post("application/xml", "198.51.100.9", HONDA_ACCORD)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.contains("in-memory"));
}

#[tokio::test]
async fn test_metrics_record_every_outcome() {
    let app = test_app();

    send(&app, post("application/xml", "192.0.2.10", HONDA_ACCORD)).await;
    send(&app, post("application/xml", "192.0.2.10", "<adf><unclosed>")).await;
    send(&app, post("application/xml", "192.0.2.10", vec![b'a'; 600 * 1024])).await;

    let (status, headers, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert!(body.contains(r#"adf_ingest_success_total{outcome="created"} 1"#));
    assert!(body.contains(r#"adf_parse_failure_total{outcome="malformed_input"} 1"#));
    assert!(body.contains(r#"adf_parse_failure_total{outcome="payload_too_large"} 1"#));
    assert!(body.contains(r#"adf_ingest_duration_seconds_count{outcome="created"} 1"#));
}

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let (status, _, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("healthy"));
}

/// Repository whose writes never finish within a test's patience.
struct StalledRepository;

#[async_trait]
impl LeadRepository for StalledRepository {
    async fn insert(&self, _lead: &NewAdfLead) -> Result<Uuid, AppError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Uuid::new_v4())
    }

    async fn find(&self, _id: Uuid) -> Result<Option<AdfLead>, AppError> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_request_timeout_is_still_metered() {
    let state = Arc::new(AppState::new(create_test_config(), Arc::new(StalledRepository)).unwrap());
    let router = build_router(state.clone()).layer(TimeoutLayer::new(Duration::from_millis(200)));

    let response = router
        .clone()
        .oneshot(post("application/xml", "198.51.100.50", HONDA_ACCORD))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    drop(response);

    assert_eq!(state.metrics.failure_count(IngestOutcome::Aborted), 1);
    assert_eq!(state.metrics.success_count(IngestOutcome::Created), 0);

    let response = router.oneshot(get("/metrics")).await.unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8_lossy(&bytes);
    assert!(body.contains(r#"adf_parse_failure_total{outcome="aborted"} 1"#));
}

#[tokio::test]
async fn test_fresh_metrics_endpoint_lists_every_series() {
    let app = test_app();
    let (status, _, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("adf_ingest_success_total"));
    assert!(body.contains("adf_parse_failure_total"));
    assert!(body.contains("adf_ingest_duration_seconds"));
}

const VENDOR_SECRET: &str = "vendor-test-secret";
const READ_SECRET: &str = "internal-test-secret";

fn secured_app() -> TestApp {
    test_app_with(Config {
        vendor_hmac_secret: Some(VENDOR_SECRET.to_string()),
        ip_allowlist: vec!["198.51.100.0/24".parse().unwrap()],
        internal_jwt_secret: Some(READ_SECRET.to_string()),
        ..create_test_config()
    })
}

fn signed_post(ip: &str, body: &str, secret: &str) -> Request<Body> {
    let timestamp = chrono::Utc::now().timestamp();
    let signature = auth::sign(secret.as_bytes(), timestamp, body.as_bytes()).unwrap();
    let mut request = post("application/xml", ip, body.to_string());
    let headers = request.headers_mut();
    headers.insert(SIGNATURE_HEADER, signature.parse().unwrap());
    headers.insert(TIMESTAMP_HEADER, timestamp.to_string().parse().unwrap());
    request
}

fn read_token() -> String {
    let claims = InternalClaims {
        sub: "crm-sync".to_string(),
        exp: (chrono::Utc::now().timestamp() + 600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(READ_SECRET.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_signed_submission_from_allowlisted_ip_is_created() {
    let app = secured_app();

    let (status, _, body) = send(&app, signed_post("198.51.100.60", HONDA_ACCORD, VENDOR_SECRET)).await;
    assert_eq!(status, StatusCode::CREATED, "body: {}", body);
    let id = lead_id_of(&body);

    let (status, _, _) = send(&app, get(&format!("/api/adf/lead/{}", id))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri(format!("/api/adf/lead/{}", id))
        .header(header::AUTHORIZATION, format!("Bearer {}", read_token()))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("Honda"));
}

#[tokio::test]
async fn test_unsigned_or_missigned_submission_is_401() {
    let app = secured_app();

    let (status, _, _) = send(&app, post("application/xml", "198.51.100.61", HONDA_ACCORD)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = send(&app, signed_post("198.51.100.61", HONDA_ACCORD, "wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(app.leads.is_empty().await);

    let (_, _, metrics) = send(&app, get("/metrics")).await;
    assert!(metrics.contains(r#"adf_parse_failure_total{outcome="unauthorized"} 2"#));
}

#[tokio::test]
async fn test_submission_outside_allowlist_is_403() {
    let app = secured_app();

    let (status, _, body) = send(&app, signed_post("203.0.113.99", HONDA_ACCORD, VENDOR_SECRET)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("allowlist"));
    assert!(app.leads.is_empty().await);
}
