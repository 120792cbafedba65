use axum::{extract::State, Json};
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::gateway;
use crate::models::*;
use crate::AppState;

/// POST /api/payments/webhook: gateway payment-status notification.
///
/// With a server key configured, every notification must carry a valid
/// `signature_key` over `status_code` and `gross_amount`.
///
/// Acknowledged with 200 once the booking is found or known to be absent, so
/// the gateway stops retrying. Storage failures return 500 to get a retry.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    Json(notification): Json<PaymentNotification>,
) -> AppResult<Json<ApiResponse<serde_json::Value>>> {
    if !state.gateway_server_key.is_empty() {
        verify_notification(&state.gateway_server_key, &notification)?;
    }

    let result = state
        .engine
        .handle_payment_notification(
            &notification.order_id,
            &notification.transaction_status,
            notification.fraud_status.as_deref(),
            state.clock.now(),
        )
        .await;

    match result {
        Ok(outcome) => Ok(Json(ApiResponse::success(serde_json::json!({
            "order_id": notification.order_id,
            "outcome": format!("{:?}", outcome),
        })))),
        Err(AppError::NotFound(msg)) => {
            tracing::warn!(order_id = %notification.order_id, "Webhook for unknown order: {}", msg);
            Ok(Json(ApiResponse::success(serde_json::json!({
                "order_id": notification.order_id,
                "outcome": "unknown_order",
            }))))
        }
        Err(e) => {
            tracing::error!("payment_webhook: {}", e);
            Err(e)
        }
    }
}

fn verify_notification(server_key: &str, notification: &PaymentNotification) -> AppResult<()> {
    let (Some(signature), Some(status_code), Some(gross_amount)) = (
        notification.signature_key.as_deref(),
        notification.status_code.as_deref(),
        notification.gross_amount.as_deref(),
    ) else {
        tracing::warn!(order_id = %notification.order_id, "Unsigned payment notification rejected");
        return Err(AppError::Unauthorized("Missing notification signature".into()));
    };

    if !gateway::verify_signature(server_key, &notification.order_id, status_code, gross_amount, signature) {
        tracing::warn!(order_id = %notification.order_id, "Webhook signature mismatch");
        return Err(AppError::Unauthorized("Invalid notification signature".into()));
    }
    Ok(())
}
