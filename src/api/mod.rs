//! HTTP API: Axum server over the engine operations.
//!
//! CORS enabled for local development.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use routes::AppState;

/// Bind `port` and serve the API on a background task.
pub async fn spawn_api(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    info!(port, "API server listening on http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server error");
        }
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        // Props & options
        .route("/api/props", post(routes::create_prop))
        .route("/api/props/:id", delete(routes::remove_prop))
        .route("/api/props/:id/reprice", post(routes::reprice_prop))
        .route("/api/props/:id/estimate", get(routes::get_estimate))
        .route("/api/props/:id/price", get(routes::price_option))
        .route("/api/props/:id/options", post(routes::create_option))
        .route("/api/options/:id", delete(routes::remove_option))
        // Tallies
        .route("/api/props/:id/tallies", post(routes::add_tally))
        .route("/api/tallies/:id", delete(routes::remove_tally))
        // Parlays
        .route("/api/parlays", post(routes::place_parlay))
        .route("/api/parlays/:id", get(routes::get_parlay))
        .route("/api/parlays/:id/cash-out", post(routes::cash_out))
        // Users
        .route("/api/users/:id/resolve", post(routes::resolve_user))
        .route("/api/users/:id/settlement-preview", get(routes::settlement_preview))
        .route("/api/users/:id/coins", get(routes::get_balance).post(routes::credit_coins))
        // Odds tools
        .route("/api/odds/complement", get(routes::get_complement))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
