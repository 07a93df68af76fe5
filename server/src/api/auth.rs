//! Authentication routes.
//!
//! Username/password registration and opaque session tokens. The simulation
//! core never sees any of this; it consumes only the player id that a
//! resolved session yields.

use crate::api::{require_player, AppState};
use crate::error::{ApiError, ApiResult};
use crate::store::{NewPlayer, Player};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct PlayerResponse {
    pub id: Uuid,
    pub username: String,
    pub is_debug: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<Player> for PlayerResponse {
    fn from(player: Player) -> Self {
        Self {
            id: player.id,
            username: player.username,
            is_debug: player.is_debug,
            created_at: player.created_at,
            last_login: player.last_login,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub player_id: Uuid,
}

fn issue_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<PlayerResponse>)> {
    if request.username.is_empty() || request.username.len() > 50 {
        return Err(ApiError::Validation(
            "username must be 1-50 characters".to_string(),
        ));
    }
    if request.password.len() < state.config.min_password_length {
        return Err(ApiError::Validation(format!(
            "password must be at least {} characters",
            state.config.min_password_length
        )));
    }

    let password_hash = bcrypt::hash(&request.password, bcrypt::DEFAULT_COST)
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let player = state
        .store
        .create_player(NewPlayer {
            username: request.username,
            password_hash,
            is_debug: false,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(player.into())))
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let player = state
        .store
        .find_player_by_username(&request.username)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let verified = bcrypt::verify(&request.password, &player.password_hash)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    if !verified {
        return Err(ApiError::Unauthorized);
    }

    let token = issue_token();
    let expires_at = state
        .config
        .session_ttl()
        .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .map(|ttl| Utc::now() + ttl);
    state
        .store
        .create_session(player.id, &token, expires_at)
        .await?;
    state.store.record_login(player.id).await?;

    Ok(Json(TokenResponse {
        token,
        player_id: player.id,
    }))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    // Resolve the caller first so an invalid token cannot probe sessions.
    require_player(&state, &headers).await?;
    if let Some(token) = crate::api::bearer_token(&headers) {
        state.store.delete_session(token).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<PlayerResponse>> {
    let player = require_player(&state, &headers).await?;
    Ok(Json(player.into()))
}
