//! HTTP API surface.
//!
//! Thin collaborators around the core: authentication, zone administration,
//! the debug surface, and a health probe. All handlers share [`AppState`]
//! and report failures through `ApiError`.

pub mod auth;
pub mod debug;
pub mod zones;

use crate::config::Config;
use crate::engine::TickEngine;
use crate::error::{ApiError, ApiResult};
use crate::intents::IntentQueue;
use crate::registry::SubscriptionRegistry;
use crate::store::{Player, Store};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

/// Shared state for HTTP handlers and the WebSocket ingress.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<SubscriptionRegistry>,
    pub intents: Arc<IntentQueue>,
    pub engine: Arc<TickEngine>,
    pub config: Arc<Config>,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/auth", auth::routes())
        .nest("/api/zones", zones::routes())
        .nest("/api/debug", debug::routes())
        .with_state(state)
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Resolve the authenticated player from a bearer token.
pub(crate) async fn require_player(state: &AppState, headers: &HeaderMap) -> ApiResult<Player> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    let session = state
        .store
        .find_session(token)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    if session.is_expired() {
        let _ = state.store.delete_session(token).await;
        return Err(ApiError::Unauthorized);
    }
    state
        .store
        .get_player(session.player_id)
        .await?
        .ok_or(ApiError::Unauthorized)
}

/// Like [`require_player`], but the player must hold debug access: either
/// the stored debug flag, or the configured `debug_user` while `debug_mode`
/// is on.
pub(crate) async fn require_debug(state: &AppState, headers: &HeaderMap) -> ApiResult<Player> {
    let player = require_player(state, headers).await?;
    let is_debug_user = state.config.debug_mode
        && !state.config.debug_user.is_empty()
        && player.username == state.config.debug_user;
    if player.is_debug || is_debug_user {
        Ok(player)
    } else {
        Err(ApiError::Forbidden)
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    tick_engine_running: bool,
    tick_number: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        tick_engine_running: state.engine.state() == crate::engine::EngineState::Running,
        tick_number: state.engine.tick_number(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-123"),
        );
        assert_eq!(bearer_token(&headers), Some("tok-123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert!(bearer_token(&headers).is_none());
    }
}
