use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::ApiResponse;

/// Request budget groups, one per class of route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Unauthenticated lookups (availability).
    Public,
    /// Authenticated customer routes.
    Customer,
    /// Booking creation only.
    Booking,
    /// Shop-owner routes.
    Owner,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Public, Tier::Customer, Tier::Booking, Tier::Owner];

    pub fn default_config(&self) -> RateLimitConfig {
        let (max_requests, secs) = match self {
            Tier::Public => (60, 60),
            Tier::Customer => (30, 60),
            Tier::Booking => (5, 300),
            Tier::Owner => (120, 60),
        };
        RateLimitConfig {
            max_requests,
            window: Duration::from_secs(secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

type TierMap = DashMap<Tier, (RateLimitConfig, DashMap<IpAddr, Vec<Instant>>)>;

/// In-memory per-IP sliding-window limiter. Tiers that were never
/// registered are unlimited.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    tiers: Arc<TierMap>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every tier with its default budget.
    pub fn standard() -> Self {
        let limiter = Self::new();
        for tier in Tier::ALL {
            limiter.add_tier(tier, tier.default_config());
        }
        limiter
    }

    pub fn add_tier(&self, tier: Tier, config: RateLimitConfig) {
        self.tiers.insert(tier, (config, DashMap::new()));
    }

    pub fn check(&self, tier: Tier, ip: IpAddr) -> Result<(), u64> {
        self.check_at(tier, ip, Instant::now())
    }

    /// `Err(retry_after_secs)` when `ip` has used up the tier's window.
    pub fn check_at(&self, tier: Tier, ip: IpAddr, now: Instant) -> Result<(), u64> {
        let Some(tier_entry) = self.tiers.get(&tier) else {
            return Ok(());
        };
        let (config, ip_map) = tier_entry.value();

        let mut entry = ip_map.entry(ip).or_default();
        entry.retain(|t| now.saturating_duration_since(*t) < config.window);

        if entry.len() >= config.max_requests as usize {
            let oldest = entry[0];
            let retry_after = (oldest + config.window)
                .saturating_duration_since(now)
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        entry.push(now);
        Ok(())
    }

    /// Drop addresses idle for more than two windows.
    pub fn cleanup_at(&self, now: Instant) {
        for tier_entry in self.tiers.iter() {
            let (config, ip_map) = tier_entry.value();
            let cutoff = config.window * 2;
            ip_map.retain(|_ip, timestamps| {
                timestamps.retain(|t| now.saturating_duration_since(*t) < cutoff);
                !timestamps.is_empty()
            });
        }
    }

    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }
}

/// Client address: first `X-Forwarded-For` entry, then the socket peer.
pub fn extract_client_ip(req: &Request) -> IpAddr {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());

    forwarded
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip())
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn too_many_requests(retry_after: u64) -> Response {
    let mut body = ApiResponse::<()>::error(format!(
        "Too many requests. Try again in {} seconds",
        retry_after
    ));
    body.kind = Some("rate_limited");
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        Json(body),
    )
        .into_response()
}

async fn enforce(tier: Tier, limiter: &RateLimiter, req: Request, next: Next) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check(tier, ip).map_err(|retry_after| {
        tracing::debug!(?tier, %ip, "Rate limited");
        too_many_requests(retry_after)
    })?;
    Ok(next.run(req).await)
}

pub async fn rate_limit_public(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    enforce(Tier::Public, &limiter, req, next).await
}

pub async fn rate_limit_customer(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    enforce(Tier::Customer, &limiter, req, next).await
}

pub async fn rate_limit_booking(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    enforce(Tier::Booking, &limiter, req, next).await
}

pub async fn rate_limit_owner(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    enforce(Tier::Owner, &limiter, req, next).await
}
