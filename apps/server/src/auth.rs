use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Customer,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Owner => "owner",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "customer" => Some(Role::Customer),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

fn mac_for(secret: &str, payload: &str) -> AppResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Unauthorized("Invalid signing key".into()))?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Issue `<role>:<user_id>:<expires_unix>:<hex hmac>`. Session issuance lives
/// elsewhere; this is for tooling and tests.
pub fn sign_token(secret: &str, role: Role, user_id: &str, expires_at: DateTime<Utc>) -> AppResult<String> {
    let payload = format!("{}:{}:{}", role.as_str(), user_id, expires_at.timestamp());
    let signature = hex::encode(mac_for(secret, &payload)?.finalize().into_bytes());
    Ok(format!("{payload}:{signature}"))
}

pub fn verify_token(secret: &str, token: &str, now: DateTime<Utc>) -> AppResult<Actor> {
    let invalid = || AppError::Unauthorized("Invalid session token".into());

    let (payload, signature) = token.rsplit_once(':').ok_or_else(invalid)?;
    let mut parts = payload.splitn(3, ':');
    let (Some(role), Some(user_id), Some(expires)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };

    let signature = hex::decode(signature).map_err(|_| invalid())?;
    mac_for(secret, payload)?.verify_slice(&signature).map_err(|_| {
        tracing::warn!("Session token signature mismatch");
        invalid()
    })?;

    let expires: i64 = expires.parse().map_err(|_| invalid())?;
    if now.timestamp() >= expires {
        return Err(AppError::Unauthorized("Session expired".into()));
    }

    let role = Role::parse(role).ok_or_else(invalid)?;
    if user_id.is_empty() {
        return Err(invalid());
    }

    Ok(Actor {
        user_id: user_id.to_string(),
        role,
    })
}

/// Resolve the caller from `Authorization: Bearer <token>`.
pub fn extract_actor(headers: &HeaderMap, secret: &str, now: DateTime<Utc>) -> AppResult<Actor> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".into()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("Expected a Bearer token".into()))?;
    verify_token(secret, token.trim(), now)
}

pub fn require_role(headers: &HeaderMap, secret: &str, now: DateTime<Utc>, role: Role) -> AppResult<Actor> {
    let actor = extract_actor(headers, secret, now)?;
    if actor.role != role {
        return Err(AppError::forbidden(format!("This action requires the {} role", role.as_str())));
    }
    Ok(actor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::{Duration, TimeZone};

    const SECRET: &str = "test-secret";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap()
    }

    fn headers(token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        h
    }

    #[test]
    fn test_roundtrip() {
        let token = sign_token(SECRET, Role::Customer, "cust-1", now() + Duration::hours(1)).unwrap();
        let actor = verify_token(SECRET, &token, now()).unwrap();
        assert_eq!(actor.user_id, "cust-1");
        assert_eq!(actor.role, Role::Customer);
    }

    #[test]
    fn test_rejects_wrong_secret_and_tampering() {
        let token = sign_token(SECRET, Role::Customer, "cust-1", now() + Duration::hours(1)).unwrap();
        assert!(verify_token("other", &token, now()).is_err());

        let forged = token.replacen("customer", "owner", 1);
        assert_eq!(verify_token(SECRET, &forged, now()).unwrap_err().kind(), "unauthorized");
    }

    #[test]
    fn test_rejects_expired() {
        let token = sign_token(SECRET, Role::Owner, "owner-1", now()).unwrap();
        let err = verify_token(SECRET, &token, now()).unwrap_err();
        assert_eq!(err.to_string(), "Session expired");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(verify_token(SECRET, "", now()).is_err());
        assert!(verify_token(SECRET, "customer:cust-1:zz", now()).is_err());
        assert!(verify_token(SECRET, "a:b:c:d:e", now()).is_err());
    }

    #[test]
    fn test_role_mismatch_is_forbidden() {
        let token = sign_token(SECRET, Role::Customer, "cust-1", now() + Duration::hours(1)).unwrap();
        let err = require_role(&headers(&token), SECRET, now(), Role::Owner).unwrap_err();
        assert_eq!(err.kind(), "forbidden");

        let err = require_role(&HeaderMap::new(), SECRET, now(), Role::Customer).unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
    }
}
