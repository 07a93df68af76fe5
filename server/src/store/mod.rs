//! Persistence gateway.
//!
//! [`Store`] is the process-wide surface: administrative zone and entity
//! operations, externally-owned auth state, and [`Store::begin`] which opens
//! a scoped transactional session for one zone's tick work. A session is
//! consumed by `commit` or `rollback`; a failure inside one session never
//! poisons another, because every session runs on its own pooled connection.
//!
//! Two implementations exist behind the same traits: [`postgres::PostgresStore`]
//! (the transactional source of truth) and [`memory::MemoryStore`] (staged-op
//! transactions for tests).

pub mod memory;
pub mod postgres;

use crate::error::StoreResult;
use crate::game::{EntityUpdate, TickResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{Entity, Zone};
use uuid::Uuid;

/// Request to create a zone through the administrative path.
#[derive(Debug, Clone)]
pub struct NewZone {
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub metadata: Option<Value>,
}

/// Request to create an entity through the administrative path.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub zone_id: Uuid,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub metadata: Option<Value>,
}

/// An authenticated principal. The simulation core only ever uses the id;
/// the remaining fields belong to the auth surface.
#[derive(Debug, Clone)]
pub struct Player {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub is_debug: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Request to register a player.
#[derive(Debug, Clone)]
pub struct NewPlayer {
    pub username: String,
    pub password_hash: String,
    pub is_debug: bool,
}

/// A login session row.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub player_id: Uuid,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }
}

/// Rows actually written by [`ZoneSession::apply_deltas`].
///
/// Creates get framework-assigned ids; updates are returned as the full rows
/// the store committed, so the snapshot builder can merge without re-reading.
/// Deltas that would violate zone bounds are skipped and counted.
#[derive(Debug, Clone, Default)]
pub struct AppliedDeltas {
    pub created: Vec<Entity>,
    pub updated: Vec<Entity>,
    pub skipped: usize,
}

/// The transactional store surface.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a scoped transactional session. All reads inside the session see
    /// one snapshot; nothing is visible outside until `commit`.
    async fn begin(&self) -> StoreResult<Box<dyn ZoneSession>>;

    // Zone administration (out-of-band path).
    async fn create_zone(&self, new: NewZone) -> StoreResult<Zone>;
    async fn get_zone(&self, zone_id: Uuid) -> StoreResult<Option<Zone>>;
    async fn list_zones(&self) -> StoreResult<Vec<Zone>>;
    async fn delete_zone(&self, zone_id: Uuid) -> StoreResult<bool>;

    // Entity administration (out-of-band path; bounds are validated by the
    // caller against the owning zone).
    async fn create_entity(&self, new: NewEntity) -> StoreResult<Entity>;
    async fn get_entity(&self, entity_id: Uuid) -> StoreResult<Option<Entity>>;
    async fn zone_entities(&self, zone_id: Uuid) -> StoreResult<Vec<Entity>>;
    async fn update_entity(&self, update: &EntityUpdate) -> StoreResult<Option<Entity>>;
    async fn delete_entity(&self, entity_id: Uuid) -> StoreResult<bool>;

    // Externally-owned auth state.
    async fn create_player(&self, new: NewPlayer) -> StoreResult<Player>;
    async fn get_player(&self, player_id: Uuid) -> StoreResult<Option<Player>>;
    async fn find_player_by_username(&self, username: &str) -> StoreResult<Option<Player>>;
    async fn record_login(&self, player_id: Uuid) -> StoreResult<()>;
    async fn create_session(
        &self,
        player_id: Uuid,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Session>;
    async fn find_session(&self, token: &str) -> StoreResult<Option<Session>>;
    async fn delete_session(&self, token: &str) -> StoreResult<bool>;
}

/// One zone's scoped transaction within a tick (or an administrative read).
///
/// Commit and rollback both consume the session; dropping an uncommitted
/// session rolls back.
#[async_trait]
pub trait ZoneSession: Send {
    async fn get_zone(&mut self, zone_id: Uuid) -> StoreResult<Option<Zone>>;

    /// Entities of the zone as of this transaction's snapshot.
    async fn list_entities(&mut self, zone_id: Uuid) -> StoreResult<Vec<Entity>>;

    /// Stage the tick result's creates, updates, and deletes. Does not
    /// commit; commit happens at the zone-processing boundary.
    async fn apply_deltas(&mut self, zone: &Zone, result: &TickResult)
        -> StoreResult<AppliedDeltas>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Merge an update into an entity row, returning the resulting row without
/// touching bounds. Shared by both store implementations.
pub(crate) fn patched_entity(entity: &Entity, update: &EntityUpdate, now: DateTime<Utc>) -> Entity {
    let mut patched = entity.clone();
    if let Some(x) = update.x {
        patched.x = x;
    }
    if let Some(y) = update.y {
        patched.y = y;
    }
    if let Some(width) = update.width {
        patched.width = width;
    }
    if let Some(height) = update.height {
        patched.height = height;
    }
    if let Some(metadata) = &update.metadata {
        patched.metadata = Some(metadata.clone());
    }
    patched.updated_at = now;
    patched
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_expiry() {
        let mut session = Session {
            id: Uuid::new_v4(),
            player_id: Uuid::new_v4(),
            token: "tok".to_string(),
            created_at: Utc::now(),
            expires_at: None,
        };
        assert!(!session.is_expired());

        session.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(session.is_expired());

        session.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        assert!(!session.is_expired());
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let entity = Entity {
            id: Uuid::new_v4(),
            zone_id: Uuid::new_v4(),
            x: 1,
            y: 2,
            width: 3,
            height: 4,
            metadata: Some(json!({"kind": "rock"})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let mut update = EntityUpdate::new(entity.id);
        update.x = Some(9);
        let patched = patched_entity(&entity, &update, Utc::now());

        assert_eq!(patched.x, 9);
        assert_eq!(patched.y, 2);
        assert_eq!(patched.width, 3);
        assert_eq!(patched.metadata, Some(json!({"kind": "rock"})));
    }
}
