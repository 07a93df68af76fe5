//! Zone administration routes.
//!
//! Zones are created and destroyed here, out of band of the simulation; the
//! tick engine only ever reads them. Creation enforces the global name
//! uniqueness and positive dimensions.

use crate::api::{require_debug, require_player, AppState};
use crate::error::{ApiError, ApiResult};
use crate::store::NewZone;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::Zone;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_zones).post(create_zone))
        .route("/:id", get(get_zone).delete(delete_zone))
}

#[derive(Debug, Deserialize)]
pub struct ZoneCreateRequest {
    pub name: String,
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ZoneResponse {
    pub id: Uuid,
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub metadata: Option<Value>,
}

impl From<Zone> for ZoneResponse {
    fn from(zone: Zone) -> Self {
        Self {
            id: zone.id,
            name: zone.name,
            width: zone.width,
            height: zone.height,
            metadata: zone.metadata,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ZoneListResponse {
    pub zones: Vec<ZoneResponse>,
}

async fn list_zones(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ZoneListResponse>> {
    require_player(&state, &headers).await?;
    let zones = state.store.list_zones().await?;
    Ok(Json(ZoneListResponse {
        zones: zones.into_iter().map(ZoneResponse::from).collect(),
    }))
}

async fn get_zone(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(zone_id): Path<Uuid>,
) -> ApiResult<Json<ZoneResponse>> {
    require_player(&state, &headers).await?;
    let zone = state
        .store
        .get_zone(zone_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("zone {zone_id} not found")))?;
    Ok(Json(zone.into()))
}

async fn create_zone(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ZoneCreateRequest>,
) -> ApiResult<(StatusCode, Json<ZoneResponse>)> {
    require_debug(&state, &headers).await?;

    if request.name.is_empty() || request.name.len() > 100 {
        return Err(ApiError::Validation(
            "zone name must be 1-100 characters".to_string(),
        ));
    }
    if request.width <= 0 || request.height <= 0 {
        return Err(ApiError::Validation(
            "zone dimensions must be positive".to_string(),
        ));
    }

    let zone = state
        .store
        .create_zone(NewZone {
            name: request.name,
            width: request.width,
            height: request.height,
            metadata: request.metadata,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(zone.into())))
}

async fn delete_zone(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(zone_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_debug(&state, &headers).await?;
    if state.store.delete_zone(zone_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("zone {zone_id} not found")))
    }
}
