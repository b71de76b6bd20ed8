//! HTTP API for bagsimd
//!
//! Read routes are open. Mutating routes require the `x-admin-passkey`
//! header when a passkey is configured.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bagsim_core::{EngineHealth, SimulationEngine};
use bagsim_store::{Device, NewDevice};
use bagsim_util::{DeviceCode, RunId, SimError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

pub const ADMIN_PASSKEY_HEADER: &str = "x-admin-passkey";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SimulationEngine>,
    pub admin_passkey: Option<Arc<str>>,
}

impl AppState {
    pub fn new(engine: Arc<SimulationEngine>, admin_passkey: Option<String>) -> Self {
        Self {
            engine,
            admin_passkey: admin_passkey.map(Arc::from),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/devices", post(register_device))
        .route("/devices/{code}/claim", post(claim_device))
        .route("/devices/{code}/unclaim", post(unclaim_device))
        .route("/devices/{code}/power", post(set_power))
        .route("/simulations/init", post(init_simulations))
        .route("/simulations/stop-all", post(stop_all_simulations))
        .route("/simulations/{code}/start", post(start_simulation))
        .route("/simulations/{code}/stop", post(stop_simulation))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_passkey,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/devices", get(list_devices))
        .route("/devices/{code}", get(get_device))
        .route("/simulations", get(list_simulations))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn require_admin_passkey(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.admin_passkey.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get(ADMIN_PASSKEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        warn!(path = %req.uri().path(), "Rejected request without valid admin passkey");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

/// Engine error rendered as a JSON body with a matching status code
#[derive(Debug)]
pub struct ApiError(SimError);

impl From<SimError> for ApiError {
    fn from(e: SimError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self.0 {
            SimError::DeviceNotFound(_) => (StatusCode::NOT_FOUND, "device_not_found"),
            SimError::AlreadyRunning(_) => (StatusCode::CONFLICT, "already_running"),
            SimError::NotRunning(_) => (StatusCode::CONFLICT, "not_running"),
            SimError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            SimError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            SimError::Timeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "timeout"),
            SimError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        };
        let body = ErrorBody {
            error,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    engine: EngineHealth,
}

async fn health(State(state): State<AppState>) -> Response {
    let engine = state.engine.health().await;
    let (status, label) = if engine.store_healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(HealthResponse {
            status: label,
            engine,
        }),
    )
        .into_response()
}

async fn list_devices(State(state): State<AppState>) -> ApiResult<Json<Vec<Device>>> {
    Ok(Json(state.engine.list_devices().await?))
}

async fn get_device(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<Device>> {
    Ok(Json(state.engine.get_device(&DeviceCode::new(code)).await?))
}

async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<NewDevice>,
) -> ApiResult<(StatusCode, Json<Device>)> {
    let device = state.engine.register_device(req).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

#[derive(Deserialize)]
struct ClaimRequest {
    owner: String,
}

async fn claim_device(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Json<Device>> {
    let code = DeviceCode::new(code);
    Ok(Json(state.engine.claim_device(&code, &req.owner).await?))
}

async fn unclaim_device(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Json<Device>> {
    Ok(Json(state.engine.unclaim_device(&DeviceCode::new(code)).await?))
}

#[derive(Deserialize)]
struct PowerRequest {
    on: bool,
}

async fn set_power(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<PowerRequest>,
) -> ApiResult<Json<Device>> {
    let code = DeviceCode::new(code);
    Ok(Json(state.engine.set_power(&code, req.on).await?))
}

#[derive(Serialize)]
struct RunningResponse {
    running: Vec<DeviceCode>,
}

async fn list_simulations(State(state): State<AppState>) -> Json<RunningResponse> {
    Json(RunningResponse {
        running: state.engine.get_running_simulations(),
    })
}

#[derive(Serialize)]
struct CountResponse {
    count: usize,
}

async fn init_simulations(State(state): State<AppState>) -> ApiResult<Json<CountResponse>> {
    let count = state.engine.initialize_all_simulations().await?;
    Ok(Json(CountResponse { count }))
}

async fn stop_all_simulations(State(state): State<AppState>) -> Json<CountResponse> {
    let count = state.engine.stop_all_simulations().await;
    Json(CountResponse { count })
}

#[derive(Serialize)]
struct StartedResponse {
    device: DeviceCode,
    run_id: RunId,
}

async fn start_simulation(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<(StatusCode, Json<StartedResponse>)> {
    let device = DeviceCode::new(code);
    let run_id = state.engine.start_simulation(&device).await?;
    Ok((StatusCode::CREATED, Json(StartedResponse { device, run_id })))
}

async fn stop_simulation(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.stop_simulation(&DeviceCode::new(code)).await?;
    Ok(StatusCode::NO_CONTENT)
}
