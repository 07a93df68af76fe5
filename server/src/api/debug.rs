//! Debug routes.
//!
//! Tick-engine control (pause/resume/step/status), read-only inspection of a
//! zone's entities and of the live connection roster, and out-of-band entity
//! manipulation. Zone-state inspection goes through the same scoped
//! transactional read path the tick pipeline uses, so it sees a consistent
//! snapshot even while ticks are running.

use crate::api::{require_debug, AppState};
use crate::engine::{EngineStatus, TickStats};
use crate::error::{ApiError, ApiResult};
use crate::game::EntityUpdate;
use crate::registry::ConnectionSnapshot;
use crate::store::NewEntity;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{Entity, Zone};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tick/pause", post(pause_tick))
        .route("/tick/resume", post(resume_tick))
        .route("/tick/step", post(step_tick))
        .route("/tick/status", get(tick_status))
        .route("/zones/:id/state", get(zone_state))
        .route("/zones/:id/entities", get(entities_in_area))
        .route("/connections", get(connections))
        .route("/entities", post(create_entity))
        .route(
            "/entities/:id",
            get(get_entity).patch(update_entity).delete(delete_entity),
        )
}

async fn pause_tick(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<EngineStatus>> {
    require_debug(&state, &headers).await?;
    state.engine.pause();
    Ok(Json(state.engine.status()))
}

async fn resume_tick(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<EngineStatus>> {
    require_debug(&state, &headers).await?;
    state.engine.resume();
    Ok(Json(state.engine.status()))
}

#[derive(Debug, Serialize)]
pub struct StepResponse {
    pub status: EngineStatus,
    pub stats: TickStats,
}

async fn step_tick(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<StepResponse>> {
    require_debug(&state, &headers).await?;
    let stats = state
        .engine
        .step()
        .await
        .ok_or_else(|| ApiError::BadRequest("tick engine is not paused".to_string()))?;
    Ok(Json(StepResponse {
        status: state.engine.status(),
        stats,
    }))
}

#[derive(Debug, Serialize)]
pub struct TickStatusResponse {
    #[serde(flatten)]
    pub status: EngineStatus,
    pub recent_stats: Vec<TickStats>,
}

async fn tick_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<TickStatusResponse>> {
    require_debug(&state, &headers).await?;
    Ok(Json(TickStatusResponse {
        status: state.engine.status(),
        recent_stats: state.engine.recent_stats(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ZoneStateResponse {
    #[serde(flatten)]
    pub zone: Zone,
    pub entities: Vec<Entity>,
}

async fn zone_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(zone_id): Path<Uuid>,
) -> ApiResult<Json<ZoneStateResponse>> {
    require_debug(&state, &headers).await?;

    // Same transactional read path as the tick pipeline.
    let mut session = state.store.begin().await?;
    let zone = match session.get_zone(zone_id).await {
        Ok(Some(zone)) => zone,
        Ok(None) => {
            let _ = session.rollback().await;
            return Err(ApiError::NotFound(format!("zone {zone_id} not found")));
        }
        Err(err) => {
            let _ = session.rollback().await;
            return Err(err.into());
        }
    };
    let entities = match session.list_entities(zone_id).await {
        Ok(entities) => entities,
        Err(err) => {
            let _ = session.rollback().await;
            return Err(err.into());
        }
    };
    let _ = session.rollback().await;

    Ok(Json(ZoneStateResponse { zone, entities }))
}

#[derive(Debug, Deserialize)]
pub struct AreaQuery {
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    /// Omitted dimensions mean "the whole zone": no area filter is applied.
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct EntitiesInAreaResponse {
    pub entities: Vec<Entity>,
}

/// Entities of a zone, read through the same transactional path as the tick
/// pipeline. With a rectangular query area, only entities overlapping it are
/// returned; without one, every entity in the zone.
async fn entities_in_area(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(zone_id): Path<Uuid>,
    Query(area): Query<AreaQuery>,
) -> ApiResult<Json<EntitiesInAreaResponse>> {
    require_debug(&state, &headers).await?;
    let area_filter = match (area.width, area.height) {
        (Some(width), Some(height)) => {
            if width < 0 || height < 0 {
                return Err(ApiError::Validation(
                    "query area dimensions must be non-negative".to_string(),
                ));
            }
            Some((width, height))
        }
        (None, None) => None,
        _ => {
            return Err(ApiError::Validation(
                "width and height must be provided together".to_string(),
            ));
        }
    };

    let mut session = state.store.begin().await?;
    match session.get_zone(zone_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            let _ = session.rollback().await;
            return Err(ApiError::NotFound(format!("zone {zone_id} not found")));
        }
        Err(err) => {
            let _ = session.rollback().await;
            return Err(err.into());
        }
    }
    let entities = match session.list_entities(zone_id).await {
        Ok(entities) => entities,
        Err(err) => {
            let _ = session.rollback().await;
            return Err(err.into());
        }
    };
    let _ = session.rollback().await;

    let entities = match area_filter {
        Some((width, height)) => entities
            .into_iter()
            .filter(|e| e.overlaps(area.x, area.y, width, height))
            .collect(),
        None => entities,
    };
    Ok(Json(EntitiesInAreaResponse { entities }))
}

#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionSnapshot>,
}

async fn connections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ConnectionsResponse>> {
    require_debug(&state, &headers).await?;
    Ok(Json(ConnectionsResponse {
        connections: state.registry.snapshot(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct EntityCreateRequest {
    pub zone_id: Uuid,
    pub x: i32,
    pub y: i32,
    #[serde(default = "default_dimension")]
    pub width: i32,
    #[serde(default = "default_dimension")]
    pub height: i32,
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn default_dimension() -> i32 {
    1
}

async fn create_entity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EntityCreateRequest>,
) -> ApiResult<(StatusCode, Json<Entity>)> {
    require_debug(&state, &headers).await?;

    let zone = state
        .store
        .get_zone(request.zone_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("zone {} not found", request.zone_id)))?;
    if request.width < 0 || request.height < 0 {
        return Err(ApiError::Validation(
            "entity dimensions must be non-negative".to_string(),
        ));
    }
    if !zone.is_entity_in_bounds(request.x, request.y, request.width, request.height) {
        return Err(ApiError::Validation(
            "entity does not fit within the zone".to_string(),
        ));
    }

    let entity = state
        .store
        .create_entity(NewEntity {
            zone_id: request.zone_id,
            x: request.x,
            y: request.y,
            width: request.width,
            height: request.height,
            metadata: request.metadata,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn get_entity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(entity_id): Path<Uuid>,
) -> ApiResult<Json<Entity>> {
    require_debug(&state, &headers).await?;
    let entity = state
        .store
        .get_entity(entity_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("entity {entity_id} not found")))?;
    Ok(Json(entity))
}

#[derive(Debug, Deserialize)]
pub struct EntityPatchRequest {
    #[serde(default)]
    pub x: Option<i32>,
    #[serde(default)]
    pub y: Option<i32>,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

async fn update_entity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(entity_id): Path<Uuid>,
    Json(request): Json<EntityPatchRequest>,
) -> ApiResult<Json<Entity>> {
    require_debug(&state, &headers).await?;

    let entity = state
        .store
        .get_entity(entity_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("entity {entity_id} not found")))?;
    let zone = state
        .store
        .get_zone(entity.zone_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("zone {} not found", entity.zone_id)))?;

    let x = request.x.unwrap_or(entity.x);
    let y = request.y.unwrap_or(entity.y);
    let width = request.width.unwrap_or(entity.width);
    let height = request.height.unwrap_or(entity.height);
    if width < 0 || height < 0 {
        return Err(ApiError::Validation(
            "entity dimensions must be non-negative".to_string(),
        ));
    }
    if !zone.is_entity_in_bounds(x, y, width, height) {
        return Err(ApiError::Validation(
            "entity does not fit within the zone".to_string(),
        ));
    }

    let update = EntityUpdate {
        id: entity_id,
        x: request.x,
        y: request.y,
        width: request.width,
        height: request.height,
        metadata: request.metadata,
    };
    let updated = state
        .store
        .update_entity(&update)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("entity {entity_id} not found")))?;
    Ok(Json(updated))
}

async fn delete_entity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(entity_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    require_debug(&state, &headers).await?;
    if state.store.delete_entity(entity_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("entity {entity_id} not found")))
    }
}
