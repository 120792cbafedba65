pub mod availability;
pub mod customer;
pub mod health;
pub mod owner;
pub mod payment;

use axum::http::HeaderMap;

use crate::auth::{self, Actor, Role};
use crate::error::AppResult;
use crate::AppState;

fn customer(state: &AppState, headers: &HeaderMap) -> AppResult<Actor> {
    auth::require_role(headers, &state.auth_secret, state.clock.now(), Role::Customer)
}

fn owner(state: &AppState, headers: &HeaderMap) -> AppResult<Actor> {
    auth::require_role(headers, &state.auth_secret, state.clock.now(), Role::Owner)
}
