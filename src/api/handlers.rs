use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use super::models::*;
use crate::error::{AppError, AppResult};
use crate::store::models::{ReconResult, SettlementFilter};
use crate::store::SettlementStore;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SettlementStore>,
    /// Operator pause flag - checked by the bridge at the top of each cycle
    pub paused: Arc<AtomicBool>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        paused: state.paused.load(Ordering::Relaxed),
    })
}

/// GET /api/v1/accounts/:account
pub async fn get_account(
    State(state): State<AppState>,
    Path(account): Path<String>,
) -> AppResult<Json<AccountResponse>> {
    let projection = state
        .store
        .get_projection(&account)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("account {}", account)))?;

    Ok(Json(projection.into()))
}

/// GET /api/v1/settlements
pub async fn list_settlements(
    State(state): State<AppState>,
    Query(query): Query<SettlementsQuery>,
) -> AppResult<Json<Vec<SettlementResponse>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let filter = SettlementFilter {
        account: query.account,
        from: query.from,
        to: query.to,
        limit,
        offset: query.offset.unwrap_or(0).max(0),
    };

    let deliveries = state.store.list_deliveries(&filter).await?;
    Ok(Json(deliveries.into_iter().map(Into::into).collect()))
}

/// GET /api/v1/settlements/:ref_id
pub async fn get_settlement(
    State(state): State<AppState>,
    Path(ref_id): Path<String>,
) -> AppResult<Json<SettlementDetailResponse>> {
    let delivery = state
        .store
        .get_delivery(&ref_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("settlement {}", ref_id)))?;
    let recon = state.store.get_recon(&ref_id).await?;

    Ok(Json(SettlementDetailResponse {
        settlement: delivery.into(),
        recon,
    }))
}

/// GET /api/v1/recon/summary
pub async fn recon_summary(
    State(state): State<AppState>,
) -> AppResult<Json<ReconSummaryResponse>> {
    let counts = state.store.recon_counts().await?;
    Ok(Json(counts.into()))
}

/// GET /api/v1/recon/breaks
pub async fn list_breaks(State(state): State<AppState>) -> AppResult<Json<Vec<ReconResult>>> {
    Ok(Json(state.store.list_breaks().await?))
}

/// GET /api/v1/pool
pub async fn get_pool(State(state): State<AppState>) -> AppResult<Json<PoolResponse>> {
    let point = state
        .store
        .latest_pool_point()
        .await?
        .ok_or_else(|| AppError::NotFound("pool balance (no ledger history yet)".to_string()))?;

    Ok(Json(point.into()))
}

/// GET /api/v1/pool/history
pub async fn pool_history(
    State(state): State<AppState>,
    Query(query): Query<PoolHistoryQuery>,
) -> AppResult<Json<Vec<PoolResponse>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let history = state.store.pool_history(limit).await?;
    Ok(Json(history.into_iter().map(Into::into).collect()))
}

/// POST /api/v1/admin/pause
pub async fn pause_bridge(State(state): State<AppState>) -> Json<PauseResponse> {
    state.paused.store(true, Ordering::Relaxed);
    info!("⏸️  Settlement bridge paused by operator");
    Json(PauseResponse { paused: true })
}

/// POST /api/v1/admin/unpause
pub async fn unpause_bridge(State(state): State<AppState>) -> Json<PauseResponse> {
    state.paused.store(false, Ordering::Relaxed);
    info!("▶️  Settlement bridge unpaused by operator");
    Json(PauseResponse { paused: false })
}
