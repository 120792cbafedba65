use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::engine::schedule_impact::ScheduleConflict;
use crate::gateway::GatewayError;
use crate::models::ApiResponse;

pub type AppResult<T> = Result<T, AppError>;

/// Why a request collided with existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The requested staff member already has an overlapping booking.
    StaffBusy,
    /// Every active staff member is busy in the requested window.
    FullyBooked,
    /// The staff member no longer accepts bookings.
    StaffInactive,
    /// The booking is not in a state that permits the transition.
    InvalidState,
    /// The single reschedule has already been used, or the booking is not late.
    RescheduleUnavailable,
    /// Late again after a reschedule; the booking was forfeited.
    ForfeitedNoShow,
    /// The proposed schedule invalidates upcoming bookings.
    ScheduleConflict,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::StaffBusy => "staff_busy",
            ConflictReason::FullyBooked => "fully_booked",
            ConflictReason::StaffInactive => "staff_inactive",
            ConflictReason::InvalidState => "invalid_state",
            ConflictReason::RescheduleUnavailable => "reschedule_unavailable",
            ConflictReason::ForfeitedNoShow => "forfeited_no_show",
            ConflictReason::ScheduleConflict => "schedule_conflict",
        }
    }
}

/// Check-in attempted outside the allowed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInRejection {
    TooEarly,
    TooLate,
}

impl CheckInRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInRejection::TooEarly => "too_early",
            CheckInRejection::TooLate => "too_late",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{message}")]
    CheckInWindow {
        rejection: CheckInRejection,
        message: String,
    },

    #[error("{message}")]
    Conflict {
        reason: ConflictReason,
        message: String,
    },

    #[error("schedule change affects {} upcoming booking(s)", .0.len())]
    ScheduleConflicts(Vec<ScheduleConflict>),

    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        AppError::Forbidden(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        AppError::InvalidInput(msg.into())
    }

    pub fn conflict(reason: ConflictReason, msg: impl Into<String>) -> Self {
        AppError::Conflict {
            reason,
            message: msg.into(),
        }
    }

    /// Machine-checkable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden(_) => "forbidden",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::InvalidInput(_) | AppError::CheckInWindow { .. } => "invalid_input",
            AppError::Conflict { .. } | AppError::ScheduleConflicts(_) => "conflict",
            AppError::Gateway(_) => "gateway_error",
            AppError::Database(_) => "internal",
        }
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            AppError::CheckInWindow { rejection, .. } => Some(rejection.as_str()),
            AppError::Conflict { reason, .. } => Some(reason.as_str()),
            AppError::ScheduleConflicts(_) => Some(ConflictReason::ScheduleConflict.as_str()),
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::InvalidInput(_) | AppError::CheckInWindow { .. } => StatusCode::BAD_REQUEST,
            AppError::Conflict { .. } | AppError::ScheduleConflicts(_) => StatusCode::CONFLICT,
            AppError::Gateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match &self {
            AppError::Database(e) => {
                tracing::error!("database error: {}", e);
                "Internal server error".to_string()
            }
            AppError::Gateway(e) => {
                tracing::error!("payment gateway error: {}", e);
                "Payment could not be created. Please try again later.".to_string()
            }
            other => other.to_string(),
        };

        let details = match &self {
            AppError::ScheduleConflicts(conflicts) => serde_json::to_value(conflicts).ok(),
            _ => None,
        };

        let mut body = ApiResponse::<()>::error(message);
        body.kind = Some(self.kind());
        body.reason = self.reason();
        body.details = details;

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_in_window_is_invalid_input_with_reason() {
        let err = AppError::CheckInWindow {
            rejection: CheckInRejection::TooLate,
            message: "late".into(),
        };
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(err.reason(), Some("too_late"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_conflict_names_reason() {
        let err = AppError::conflict(ConflictReason::FullyBooked, "all staff busy");
        assert_eq!(err.kind(), "conflict");
        assert_eq!(err.reason(), Some("fully_booked"));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "all staff busy");
    }

    #[test]
    fn test_schedule_conflicts_message_counts() {
        let err = AppError::ScheduleConflicts(vec![]);
        assert_eq!(err.to_string(), "schedule change affects 0 upcoming booking(s)");
        assert_eq!(err.reason(), Some("schedule_conflict"));
    }
}
