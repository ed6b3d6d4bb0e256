//! HTTP API for health checks, status, and swap inspection

use crate::config::ApiConfig;
use crate::coordination::{EscrowRelayer, EscrowResolver, RelayerStatus};
use crate::error::{RelayerError, RelayerResult};
use crate::state::{LifecycleState, SwapRecord};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub relayer: Arc<EscrowRelayer>,
    pub resolver: Arc<EscrowResolver>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(relayer: Arc<EscrowRelayer>, resolver: Arc<EscrowResolver>) -> Self {
        Self {
            relayer,
            resolver,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/swaps", get(list_swaps))
        .route("/swaps/pending", get(get_pending))
        .route("/swaps/stuck", get(get_stuck))
        .route("/swaps/:id", get(get_swap))
        .route("/swaps/:id/processed", post(mark_processed))
        .route("/swaps/:id/claim", post(accept_claim))
        .route("/swaps/:id/reveal", post(reveal_secret))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("Failed to bind API server on {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Maps relayer errors onto HTTP status codes
pub struct ApiError(RelayerError);

impl From<RelayerError> for ApiError {
    fn from(err: RelayerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayerError::NotFound { .. } => StatusCode::NOT_FOUND,
            RelayerError::StateConflict { .. } | RelayerError::InvalidStateTransition { .. } => {
                StatusCode::CONFLICT
            }
            RelayerError::Integrity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                kind: self.0.kind(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    crate::metrics::record_health_check();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - source chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chain_ok = state.relayer.health_check().await;
    if !chain_ok {
        crate::metrics::record_health_check_failure();
    }

    let status = if chain_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready: chain_ok }))
}

/// Get relayer status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        relayer: state.relayer.status().await,
    })
}

async fn list_swaps(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<SwapRecord>> {
    Json(state.relayer.list(query.state))
}

async fn get_pending(State(state): State<AppState>) -> Json<Vec<SwapRecord>> {
    Json(state.relayer.pending())
}

async fn get_stuck(State(state): State<AppState>) -> Json<Vec<SwapRecord>> {
    Json(state.relayer.stuck())
}

async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SwapRecord>, ApiError> {
    Ok(Json(state.relayer.get(&id)?))
}

async fn mark_processed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SwapRecord>, ApiError> {
    Ok(Json(state.relayer.mark_processed(&id)?))
}

/// Record a secret revealed by a claim on the destination chain
async fn accept_claim(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ClaimRequest>,
) -> Result<Json<SwapRecord>, ApiError> {
    Ok(Json(state.resolver.accept_claim(
        &id,
        body.preimage,
        body.claim_tx_ref,
    )?))
}

/// Claim the destination escrow with an operator-supplied secret
async fn reveal_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RevealRequest>,
) -> Result<Json<SwapRecord>, ApiError> {
    Ok(Json(state.resolver.reveal_secret(&id, body.preimage).await?))
}

// Request / response types

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub state: Option<LifecycleState>,
}

#[derive(Debug, Deserialize)]
pub struct RevealRequest {
    pub preimage: H256,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub preimage: H256,
    #[serde(default)]
    pub claim_tx_ref: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    relayer: RelayerStatus,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}
