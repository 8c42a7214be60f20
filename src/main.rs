use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header},
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

mod audit;
mod config;
mod error;
mod forward;
mod middleware;
mod telemetry;
mod token;

pub struct AppState {
    settings: config::Settings,
    tokens: token::TokenProvider,
    /// Client for the backend, carrying the fixed request timeout.
    backend: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = config::load_config()?;
    let _otel_guard = telemetry::init(&settings.telemetry)?;

    if settings.backend_url.is_none() {
        tracing::warn!("BACKEND_URL is not set, /chat will answer 500 until it is");
    }

    let identity_client = reqwest::Client::builder()
        .timeout(token::FETCH_TIMEOUT)
        .build()?;
    let source = token::source_from_settings(&settings, identity_client)?;

    let backend = reqwest::Client::builder()
        .timeout(forward::BACKEND_TIMEOUT)
        .build()?;

    let addr = format!("{}:{}", settings.host, settings.port);
    let shared_state = Arc::new(AppState {
        settings,
        tokens: token::TokenProvider::new(source, token::FETCH_TIMEOUT),
        backend,
    });

    let app = router(shared_state)?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: Arc<AppState>) -> anyhow::Result<Router> {
    let cors = cors_layer(&state.settings.frontend_origin)?;

    Ok(Router::new()
        .route("/", get(forward::health))
        .route("/chat", post(forward::chat))
        // Payloads are passed through whole, whatever their size.
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::RequestContextLayer::new())
        .layer(cors)
        .with_state(state))
}

/// Browsers may only read responses from the configured frontend origin.
fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    let origin = HeaderValue::from_str(origin)?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::exact(origin))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
