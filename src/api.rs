use std::{sync::Arc, time::Instant};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;
use walletd_core::{BalanceCache, JournalEntry, LedgerStore};

use crate::{error::LedgerError, ledger::LedgerEngine};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LedgerEngine>,
    pub store: Arc<dyn LedgerStore>,
    pub cache: Arc<dyn BalanceCache>,
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub username: String,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub amount: f64,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: f64,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub success: bool,
    pub journal_ids: [i64; 2],
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Ledger(LedgerError),
    MalformedRequest(String),
    Internal(String),
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError::Ledger(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Ledger(e) => {
                let status = match &e {
                    LedgerError::Validation(_) | LedgerError::InsufficientFunds { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    LedgerError::AccountNotFound(_) => StatusCode::NOT_FOUND,
                    LedgerError::MutationFailed { .. } | LedgerError::DependencyUnavailable(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.kind(), e.to_string())
            }
            ApiError::MalformedRequest(message) => {
                (StatusCode::BAD_REQUEST, "validation_error", message)
            }
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };
        let body = ErrorBody {
            success: false,
            error: ErrorDetail { kind, message },
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let wallet_routes = Router::new()
        .route("/deposit", post(deposit))
        .route("/withdraw", post(withdraw))
        .route("/transfer", post(transfer))
        .route("/balance/:username", get(balance))
        .route("/transactions/:username", get(transactions))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_dependencies))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(wallet_routes)
        .layer(middleware::from_fn(trace_request))
}

/// Runs a synchronous engine call on the blocking pool inside the current
/// request span. A dropped request does not cancel the call.
async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::Span::current();
    match tokio::task::spawn_blocking(move || span.in_scope(f)).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError::Internal(format!("engine task failed: {}", e))),
    }
}

fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::MalformedRequest(rejection.body_text()))
}

async fn deposit(
    State(state): State<AppState>,
    payload: Result<Json<AmountRequest>, JsonRejection>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let req = parse_body(payload)?;
    let engine = state.engine.clone();
    let balance = run_blocking(move || engine.deposit(&req.username, req.amount)).await?;
    Ok(Json(BalanceResponse { balance }))
}

async fn withdraw(
    State(state): State<AppState>,
    payload: Result<Json<AmountRequest>, JsonRejection>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let req = parse_body(payload)?;
    let engine = state.engine.clone();
    let balance = run_blocking(move || engine.withdraw(&req.username, req.amount)).await?;
    Ok(Json(BalanceResponse { balance }))
}

async fn transfer(
    State(state): State<AppState>,
    payload: Result<Json<TransferRequest>, JsonRejection>,
) -> Result<Json<TransferResponse>, ApiError> {
    let req = parse_body(payload)?;
    let engine = state.engine.clone();
    let receipt = run_blocking(move || engine.transfer(&req.from, &req.to, req.amount)).await?;
    Ok(Json(TransferResponse {
        success: true,
        journal_ids: [receipt.debit_entry_id, receipt.credit_entry_id],
    }))
}

async fn balance(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let engine = state.engine.clone();
    let balance = run_blocking(move || engine.get_balance(&username)).await?;
    Ok(Json(BalanceResponse { balance }))
}

async fn transactions(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Vec<JournalEntry>>, ApiError> {
    let engine = state.engine.clone();
    let entries = run_blocking(move || engine.get_history(&username)).await?;
    Ok(Json(entries))
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    store: String,
    cache: String,
}

struct DependencyStatus {
    store: Result<(), String>,
    cache: Result<(), String>,
}

impl DependencyStatus {
    fn healthy(&self) -> bool {
        self.store.is_ok() && self.cache.is_ok()
    }

    fn failures(&self) -> String {
        let mut failures = Vec::new();
        if let Err(e) = &self.store {
            failures.push(format!("account store: {}", e));
        }
        if let Err(e) = &self.cache {
            failures.push(format!("balance cache: {}", e));
        }
        failures.join("; ")
    }
}

async fn check_dependencies(state: &AppState) -> Result<DependencyStatus, ApiError> {
    let store = state.store.clone();
    let cache = state.cache.clone();
    tokio::task::spawn_blocking(move || DependencyStatus {
        store: store.ping().map_err(|e| e.to_string()),
        cache: cache.ping().map_err(|e| e.to_string()),
    })
    .await
    .map_err(|e| ApiError::Internal(format!("dependency check failed: {}", e)))
}

/// Rejects wallet requests up front while the store or cache is unreachable.
async fn require_dependencies<B>(
    State(state): State<AppState>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    match check_dependencies(&state).await {
        Ok(status) if status.healthy() => next.run(req).await,
        Ok(status) => {
            let failures = status.failures();
            tracing::warn!(%failures, "Rejecting request, dependency down");
            ApiError::from(LedgerError::DependencyUnavailable(failures)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let dependencies = match check_dependencies(&state).await {
        Ok(dependencies) => dependencies,
        Err(e) => return e.into_response(),
    };
    let (status, label) = if dependencies.healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let report = HealthReport {
        status: label,
        store: dependencies.store.err().unwrap_or_else(|| "ok".to_string()),
        cache: dependencies.cache.err().unwrap_or_else(|| "ok".to_string()),
    };
    (status, Json(report)).into_response()
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn trace_request<B>(req: Request<B>, next: Next<B>) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "http_request",
        %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    async move {
        let started = Instant::now();
        let mut response = next.run(req).await;
        tracing::info!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
    .instrument(span)
    .await
}
