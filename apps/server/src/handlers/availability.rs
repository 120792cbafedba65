use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{NaiveDate, NaiveTime};
use std::sync::Arc;

use crate::engine::availability::{Availability, DEFAULT_DURATION_MINUTES};
use crate::engine::store;
use crate::error::{AppError, AppResult};
use crate::models::*;
use crate::AppState;

/// GET /api/availability?shop_id=&date=YYYY-MM-DD[&time=HH:MM][&service_id=]
///
/// With `time`: which staff are busy then. Without: fully booked slots of the day.
pub async fn availability(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailabilityQuery>,
) -> AppResult<Json<ApiResponse<Availability>>> {
    let date = NaiveDate::parse_from_str(&query.date, "%Y-%m-%d")
        .map_err(|_| AppError::invalid("date must be YYYY-MM-DD"))?;

    let duration = match query.service_id.as_deref() {
        Some(service_id) => {
            store::service(state.engine.db(), service_id)
                .await?
                .filter(|s| s.shop_id == query.shop_id)
                .ok_or_else(|| AppError::not_found("Service not offered by this shop"))?
                .duration_minutes
        }
        None => DEFAULT_DURATION_MINUTES,
    };

    let data = match query.time.as_deref() {
        Some(time) => {
            let time = NaiveTime::parse_from_str(time, hhmm::FORMAT)
                .map_err(|_| AppError::invalid("time must be HH:MM"))?;
            let staff = state
                .engine
                .staff_availability(&query.shop_id, date, time, duration)
                .await?;
            Availability::Staff(staff)
        }
        None => {
            let day = state
                .engine
                .fully_booked_slots(&query.shop_id, date, duration)
                .await?;
            Availability::Day(day)
        }
    };

    Ok(Json(ApiResponse::success(data)))
}
