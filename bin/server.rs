// Wish Ledger - Web Server
// REST API exposing the wish read/write endpoints with Axum.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use wish_ledger::{
    setup_database, Config, FingerprintGenerator, LedgerWriter, SqliteTallySource, TallyCache,
    WishError, WishSubmission,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    writer: Arc<LedgerWriter>,
    tallies: Arc<TallyCache<SqliteTallySource>>,
}

#[derive(Deserialize)]
struct WishQuery {
    banner: String,
}

/// Generic client-facing error body. Internal detail stays in the logs.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

fn reject(status: StatusCode, message: &'static str) -> axum::response::Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health - Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": wish_ledger::VERSION }))
}

/// GET /wish?banner=<id> - Cached-or-computed tally for a banner.
async fn get_wish_tally(
    State(state): State<AppState>,
    Query(query): Query<WishQuery>,
) -> impl IntoResponse {
    match state.tallies.get(&query.banner).await {
        Ok(tally) => (StatusCode::OK, Json(tally)).into_response(),
        Err(err) => {
            // Any computation failure (unknown banner included) surfaces as
            // the same generic client error.
            error!(banner = %query.banner, %err, "tally lookup failed");
            reject(StatusCode::BAD_REQUEST, "invalid banner")
        }
    }
}

/// POST /wish - Submit a wish history for a banner.
async fn post_wish(
    State(state): State<AppState>,
    Json(data): Json<WishSubmission>,
) -> impl IntoResponse {
    let mut conn = state.db.lock().unwrap();

    match state.writer.submit(&mut conn, &data) {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err @ WishError::NotFound(_)) => {
            error!(banner = %data.banner, %err, "submission rejected");
            reject(StatusCode::BAD_REQUEST, "invalid banner")
        }
        Err(err @ WishError::InvalidInput(_)) => {
            error!(banner = %data.banner, %err, "submission rejected");
            reject(StatusCode::BAD_REQUEST, "invalid wish data")
        }
        Err(err) => {
            error!(banner = %data.banner, %err, "submission failed");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let conn = Connection::open(&config.db_path)?;
    setup_database(&conn)?;
    info!(path = %config.db_path, "database opened");

    let db = Arc::new(Mutex::new(conn));
    let state = AppState {
        db: db.clone(),
        writer: Arc::new(LedgerWriter::new(FingerprintGenerator::new(config.hash_seed))),
        tallies: Arc::new(TallyCache::new(
            SqliteTallySource::new(db),
            Duration::from_secs(config.tally_ttl_secs),
        )),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/wish", get(get_wish_tally).post(post_wish))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "wish server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
