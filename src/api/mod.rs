//! HTTP API for health checks, status, and operator actions

use crate::chain::{ChainWatcher, ConnectionStatus, EscrowContract};
use crate::config::ApiConfig;
use crate::coordination::{SettlementCoordinator, SettlementCounts, SettlementRecord};
use crate::error::{RelayerError, RelayerResult};
use crate::events::Chain;
use crate::state::EscrowState;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SettlementCoordinator>,
    pub watchers: Vec<Arc<dyn ChainWatcher>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(coordinator: Arc<SettlementCoordinator>, watchers: Vec<Arc<dyn ChainWatcher>>) -> Self {
        Self {
            coordinator,
            watchers,
            started_at: Instant::now(),
        }
    }

    fn watcher(&self, chain: &str) -> Result<&Arc<dyn ChainWatcher>, ApiError> {
        let chain: Chain = chain.parse().map_err(ApiError::BadRequest)?;
        self.watchers
            .iter()
            .find(|w| w.chain() == chain)
            .ok_or_else(|| ApiError::NotFound(format!("no {} watcher configured", chain)))
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/settlements", get(list_settlements))
        .route("/settlements/:id", get(get_settlement))
        .route("/escrows/:chain", get(list_escrows))
        .route("/contracts/:chain", post(add_contract))
        .route("/contracts/:chain/:reference", delete(remove_contract))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| RelayerError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - coordinator running with a ready executor
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let operational = state.coordinator.is_operational().await;
    let code = if operational {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ReadinessResponse { ready: operational }))
}

/// Get relayer status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let mut watchers = Vec::with_capacity(state.watchers.len());
    for watcher in &state.watchers {
        watchers.push(WatcherStatus {
            chain: watcher.chain(),
            connection: watcher.connection_status().await,
            escrows: watcher.all_escrow_states().await.len(),
        });
    }

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        operational: state.coordinator.is_operational().await,
        watchers,
        settlements: state.coordinator.status().await,
    })
}

async fn list_settlements(State(state): State<AppState>) -> Json<Vec<SettlementRecord>> {
    Json(state.coordinator.all_settlements().await)
}

async fn get_settlement(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SettlementRecord>, ApiError> {
    Ok(Json(state.coordinator.settlement_record(&id).await?))
}

async fn list_escrows(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<Vec<EscrowState>>, ApiError> {
    let watcher = state.watcher(&chain)?;
    Ok(Json(watcher.all_escrow_states().await))
}

async fn add_contract(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Json(contract): Json<EscrowContract>,
) -> Result<StatusCode, ApiError> {
    if contract.reference.trim().is_empty() {
        return Err(ApiError::BadRequest("reference must not be empty".into()));
    }
    state.watcher(&chain)?.add_contract(contract);
    Ok(StatusCode::CREATED)
}

async fn remove_contract(
    State(state): State<AppState>,
    Path((chain, reference)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .watcher(&chain)?
        .remove_contract(&reference)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| ApiError::NotFound(format!("{} is not watched", reference)))
}

enum ApiError {
    BadRequest(String),
    NotFound(String),
}

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        match e {
            RelayerError::SettlementNotFound { .. } => ApiError::NotFound(e.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, error) = match self {
            ApiError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            ApiError::NotFound(e) => (StatusCode::NOT_FOUND, e),
        };
        (code, Json(ErrorResponse { error })).into_response()
    }
}

// Response types

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
struct WatcherStatus {
    chain: Chain,
    connection: ConnectionStatus,
    escrows: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    operational: bool,
    watchers: Vec<WatcherStatus>,
    settlements: SettlementCounts,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
