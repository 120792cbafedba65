pub mod alert_layer;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod notifier;
pub mod rate_limit;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use clock::Clock;
use engine::automation::AutomationScheduler;
use engine::Engine;
use rate_limit::{rate_limit_booking, rate_limit_customer, rate_limit_owner, rate_limit_public, RateLimiter};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub clock: Arc<dyn Clock>,
    pub automation: Arc<AutomationScheduler>,
    pub auth_secret: String,
    /// Empty when the gateway is not configured; webhook signatures are then not checked.
    pub gateway_server_key: String,
    pub started_at: Instant,
}

/// All routes, grouped by rate-limit tier. CORS is left to the caller.
pub fn router(state: Arc<AppState>, limiter: RateLimiter) -> Router {
    // 1. No-limit: health checks + payment webhooks
    let no_limit_routes = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route("/api/payments/webhook", post(handlers::payment::payment_webhook));

    // 2. Public: availability lookups
    let public_routes = Router::new()
        .route("/api/availability", get(handlers::availability::availability))
        .layer(from_fn_with_state(limiter.clone(), rate_limit_public));

    // 3. Booking creation: strictest limit
    let booking_routes = Router::new()
        .route("/api/bookings", post(handlers::customer::create_booking))
        .layer(from_fn_with_state(limiter.clone(), rate_limit_booking));

    // 4. Customer
    let customer_routes = Router::new()
        .route("/api/bookings/my", get(handlers::customer::my_bookings))
        .route("/api/bookings/check-in/qr", post(handlers::customer::check_in_qr))
        .route("/api/bookings/check-in/pin", post(handlers::customer::check_in_pin))
        .route("/api/bookings/{id}", get(handlers::customer::get_booking))
        .route(
            "/api/bookings/{id}/confirm-completion",
            post(handlers::customer::confirm_completion),
        )
        .route("/api/bookings/{id}/reschedule", post(handlers::customer::reschedule))
        .route(
            "/api/bookings/{id}/reschedule-status",
            get(handlers::customer::reschedule_status),
        )
        .layer(from_fn_with_state(limiter.clone(), rate_limit_customer));

    // 5. Shop owner
    let owner_routes = Router::new()
        .route(
            "/api/owner/shops/{shop_id}/bookings",
            get(handlers::owner::shop_bookings),
        )
        .route("/api/owner/bookings/{id}/start", post(handlers::owner::start_service))
        .route(
            "/api/owner/bookings/{id}/complete",
            post(handlers::owner::complete_service),
        )
        .route(
            "/api/owner/shops/{shop_id}/schedule",
            get(handlers::owner::get_schedule).put(handlers::owner::update_schedule),
        )
        .route(
            "/api/owner/shops/{shop_id}/schedule/preview",
            post(handlers::owner::preview_schedule),
        )
        .route(
            "/api/owner/staff/{staff_id}/deactivation-impact",
            get(handlers::owner::deactivation_impact),
        )
        .route(
            "/api/owner/staff/{staff_id}/deactivate",
            post(handlers::owner::deactivate_staff),
        )
        .route(
            "/api/owner/staff/{staff_id}/activate",
            post(handlers::owner::activate_staff),
        )
        .route(
            "/api/owner/staff/{staff_id}/reassign",
            post(handlers::owner::reassign_bookings),
        )
        .layer(from_fn_with_state(limiter, rate_limit_owner));

    Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(booking_routes)
        .merge(customer_routes)
        .merge(owner_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
