use std::env;

use chrono::FixedOffset;

/// Default shop-local offset: UTC+7.
const DEFAULT_UTC_OFFSET_MINUTES: i32 = 7 * 60;
/// Automation sweep interval (seconds).
const DEFAULT_AUTOMATION_INTERVAL_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub auth_secret: String,
    pub utc_offset: FixedOffset,
    pub automation_interval_secs: u64,
    pub expiry_verify_with_gateway: bool,
    pub midtrans_server_key: String,
    pub midtrans_snap_url: String,
    pub midtrans_api_url: String,
    pub frontend_url: String,
    pub alert_webhook_url: Option<String>,
    pub cors_origin: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let auth_secret = env::var("AUTH_SECRET")
            .map_err(|_| anyhow::anyhow!("AUTH_SECRET must be set"))?;

        let offset_minutes: i32 = env::var("SHOP_UTC_OFFSET_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_UTC_OFFSET_MINUTES);
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60)
            .ok_or_else(|| anyhow::anyhow!("SHOP_UTC_OFFSET_MINUTES out of range: {offset_minutes}"))?;

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:barbershop.db?mode=rwc".into()),
            auth_secret,
            utc_offset,
            automation_interval_secs: env::var("AUTOMATION_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_AUTOMATION_INTERVAL_SECS),
            expiry_verify_with_gateway: env::var("EXPIRY_VERIFY_WITH_GATEWAY")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            midtrans_server_key: env::var("MIDTRANS_SERVER_KEY").unwrap_or_default(),
            midtrans_snap_url: env::var("MIDTRANS_SNAP_URL")
                .unwrap_or_else(|_| "https://app.sandbox.midtrans.com".into()),
            midtrans_api_url: env::var("MIDTRANS_API_URL")
                .unwrap_or_else(|_| "https://api.sandbox.midtrans.com".into()),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "https://example.com".into()),
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            cors_origin: env::var("CORS_ORIGIN").ok().filter(|v| !v.is_empty()),
        })
    }
}
