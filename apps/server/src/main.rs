use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use barbershop_booking::alert_layer::AlertLayer;
use barbershop_booking::clock::{Clock, SystemClock};
use barbershop_booking::config::AppConfig;
use barbershop_booking::engine::automation::AutomationScheduler;
use barbershop_booking::engine::{Engine, EngineSettings};
use barbershop_booking::gateway::MidtransGateway;
use barbershop_booking::notifier::StoreNotifier;
use barbershop_booking::rate_limit::RateLimiter;
use barbershop_booking::{db, router, AppState};

/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;

    // ── Tracing: console + optional alert webhook for errors ──
    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    let fmt_layer = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    match config.alert_webhook_url.clone() {
        Some(url) => registry
            .with(AlertLayer::new(url, "barbershop-booking"))
            .init(),
        None => registry.init(),
    }

    if config.midtrans_server_key.is_empty() {
        tracing::warn!("MIDTRANS_SERVER_KEY not set, payments will fail");
    }

    // ── Database ──
    let pool = db::connect(&config.database_url, 5).await?;
    db::run_migrations(&pool).await?;

    // ── Engine ──
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway = Arc::new(MidtransGateway::new(
        config.midtrans_server_key.clone(),
        config.midtrans_snap_url.clone(),
        config.midtrans_api_url.clone(),
    ));
    let notifier = Arc::new(StoreNotifier::new(pool.clone(), clock.clone()));
    let engine = Arc::new(Engine::new(
        pool,
        gateway,
        notifier,
        EngineSettings {
            utc_offset: config.utc_offset,
            frontend_url: config.frontend_url.clone(),
            verify_expiry_with_gateway: config.expiry_verify_with_gateway,
        },
    ));

    // ── Background task: expiry, no-shows, auto-complete, reminders ──
    let automation = Arc::new(AutomationScheduler::new(engine.clone(), clock.clone()));
    automation
        .clone()
        .spawn(Duration::from_secs(config.automation_interval_secs));

    // ── Rate limiter + cleanup of stale entries ──
    let rate_limiter = RateLimiter::standard();
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    // ── CORS: whitelist CORS_ORIGIN when configured, otherwise allow any ──
    let cors = match config.cors_origin.as_deref() {
        Some(origin) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(origin.parse()?))
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    let state = Arc::new(AppState {
        engine,
        clock,
        automation,
        auth_secret: config.auth_secret.clone(),
        gateway_server_key: config.midtrans_server_key.clone(),
        started_at: Instant::now(),
    });

    let app = router(state, rate_limiter).layer(cors);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Barbershop booking server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
