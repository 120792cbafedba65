use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use crate::engine::checkin::CheckInCredential;
use crate::engine::reschedule::RescheduleStatus;
use crate::error::AppResult;
use crate::models::*;
use crate::AppState;

/// POST /api/bookings: create a booking and open a payment session.
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateBookingRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<CreateBookingResponse>>)> {
    let actor = super::customer(&state, &headers)?;
    let created = state
        .engine
        .create_booking(&actor.user_id, &req, state.clock.now())
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

/// GET /api/bookings/my
pub async fn my_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<ApiResponse<Vec<BookingView>>>> {
    let actor = super::customer(&state, &headers)?;
    let bookings = state.engine.customer_bookings(&actor.user_id).await?;
    Ok(Json(ApiResponse::success(bookings)))
}

/// GET /api/bookings/{id}
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<BookingView>>> {
    let actor = super::customer(&state, &headers)?;
    let booking = state.engine.customer_booking_view(&actor.user_id, &id).await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/bookings/check-in/qr
pub async fn check_in_qr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<QrCheckInRequest>,
) -> AppResult<Json<ApiResponse<BookingView>>> {
    let actor = super::customer(&state, &headers)?;
    let booking = state
        .engine
        .check_in(
            &actor.user_id,
            CheckInCredential::QrCode(&req.qr_token),
            state.clock.now(),
        )
        .await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/bookings/check-in/pin
pub async fn check_in_pin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PinCheckInRequest>,
) -> AppResult<Json<ApiResponse<BookingView>>> {
    let actor = super::customer(&state, &headers)?;
    let credential = CheckInCredential::Pin {
        shop_id: &req.shop_id,
        pin: &req.pin,
    };
    let booking = state
        .engine
        .check_in(&actor.user_id, credential, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/bookings/{id}/confirm-completion
pub async fn confirm_completion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<BookingView>>> {
    let actor = super::customer(&state, &headers)?;
    let booking = state
        .engine
        .confirm_completion(&actor.user_id, &id, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// POST /api/bookings/{id}/reschedule
pub async fn reschedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RescheduleRequest>,
) -> AppResult<Json<ApiResponse<BookingView>>> {
    let actor = super::customer(&state, &headers)?;
    let booking = state
        .engine
        .reschedule(&actor.user_id, &id, req.new_booking_time, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(booking)))
}

/// GET /api/bookings/{id}/reschedule-status
pub async fn reschedule_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<RescheduleStatus>>> {
    let actor = super::customer(&state, &headers)?;
    let status = state
        .engine
        .reschedule_status(&actor.user_id, &id, state.clock.now())
        .await?;
    Ok(Json(ApiResponse::success(status)))
}
