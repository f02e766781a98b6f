use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adf_lead_ingest::config::Config;
use adf_lead_ingest::db::Database;
use adf_lead_ingest::handlers::{build_router, AppState};
use adf_lead_ingest::lead_storage::PgLeadRepository;

/// Main entry point for the application.
///
/// Initializes tracing, loads configuration, connects to Postgres (running
/// migrations), builds the router and serves it with connect info so the
/// rate limiter can key on the peer address.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adf_lead_ingest=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established, migrations applied");

    let leads = Arc::new(PgLeadRepository::new(db.pool.clone()));
    let request_timeout = Duration::from_secs(config.request_timeout_secs);
    let port = config.port;

    let app_state = Arc::new(AppState::new(config, leads)?);
    tracing::info!(
        "ADF ingest ready: max payload {} bytes",
        app_state.guard.max_payload_bytes()
    );

    let app = build_router(app_state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(request_timeout))
            .layer(CorsLayer::permissive()),
    );

    // Start server
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
