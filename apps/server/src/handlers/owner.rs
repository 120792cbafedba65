use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;

use crate::engine::schedule_impact::{ReassignReport, ScheduleChange, ScheduleConflict, StaffImpact};
use crate::error::AppResult;
use crate::models::*;
use crate::AppState;

// ── Bookings ──

/// GET /api/owner/shops/{shop_id}/bookings
pub async fn shop_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(shop_id): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<BookingView>>>> {
    let actor = super::owner(&state, &headers)?;
    let bookings = state.engine.shop_bookings(&actor.user_id, &shop_id).await?;
    Ok(Json(ApiResponse::success(bookings)))
}

/// POST /api/owner/bookings/{id}/start
pub async fn start_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<BookingView>>> {
    let actor = super::owner(&state, &headers)?;
    let booking = state
        .engine
        .start_service(&actor.user_id, &id, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/owner/bookings/{id}/complete
pub async fn complete_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<BookingView>>> {
    let actor = super::owner(&state, &headers)?;
    let booking = state
        .engine
        .complete_service(&actor.user_id, &id, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(booking)))
}

// ── Weekly schedule ──

/// GET /api/owner/shops/{shop_id}/schedule. `data` is null until one is saved.
pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(shop_id): Path<String>,
) -> AppResult<Json<ApiResponse<Option<WeeklySchedule>>>> {
    let actor = super::owner(&state, &headers)?;
    let schedule = state.engine.shop_schedule(&actor.user_id, &shop_id).await?;
    Ok(Json(ApiResponse::success(schedule)))
}

/// POST /api/owner/shops/{shop_id}/schedule/preview
pub async fn preview_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(shop_id): Path<String>,
    Json(req): Json<ScheduleChangeRequest>,
) -> AppResult<Json<ApiResponse<Vec<ScheduleConflict>>>> {
    let actor = super::owner(&state, &headers)?;
    let conflicts = state
        .engine
        .preview_schedule_conflicts(&actor.user_id, &shop_id, &req.schedule, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(conflicts)))
}

/// PUT /api/owner/shops/{shop_id}/schedule
///
/// 409 with the affected bookings in `details` unless `force_update` is set.
pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(shop_id): Path<String>,
    Json(req): Json<ScheduleChangeRequest>,
) -> AppResult<Json<ApiResponse<ScheduleChange>>> {
    let actor = super::owner(&state, &headers)?;
    let change = state
        .engine
        .apply_schedule_change(
            &actor.user_id,
            &shop_id,
            &req.schedule,
            req.force_update,
            state.clock.now(),
        )
        .await?;
    Ok(Json(ApiResponse::success(change)))
}

// ── Staff ──

/// GET /api/owner/staff/{staff_id}/deactivation-impact
pub async fn deactivation_impact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(staff_id): Path<String>,
) -> AppResult<Json<ApiResponse<StaffImpact>>> {
    let actor = super::owner(&state, &headers)?;
    let impact = state
        .engine
        .staff_deactivation_impact(&actor.user_id, &staff_id, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(impact)))
}

/// POST /api/owner/staff/{staff_id}/deactivate
pub async fn deactivate_staff(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(staff_id): Path<String>,
) -> AppResult<Json<ApiResponse<StaffImpact>>> {
    let actor = super::owner(&state, &headers)?;
    let impact = state
        .engine
        .deactivate_staff(&actor.user_id, &staff_id, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(impact)))
}

/// POST /api/owner/staff/{staff_id}/activate
pub async fn activate_staff(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(staff_id): Path<String>,
) -> AppResult<Json<ApiResponse<Staff>>> {
    let actor = super::owner(&state, &headers)?;
    let staff = state.engine.activate_staff(&actor.user_id, &staff_id).await?;
    Ok(Json(ApiResponse::success(staff)))
}

/// POST /api/owner/staff/{staff_id}/reassign
pub async fn reassign_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(staff_id): Path<String>,
    Json(req): Json<ReassignRequest>,
) -> AppResult<Json<ApiResponse<ReassignReport>>> {
    let actor = super::owner(&state, &headers)?;
    let report = state
        .engine
        .reassign_bookings(&actor.user_id, &staff_id, &req.new_staff_id, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(report)))
}
