//! In-memory store.
//!
//! Behaves like the PostgreSQL store behind the same traits: sessions stage
//! their writes and publish them atomically on commit, name and token
//! uniqueness raise conflicts, and nothing staged is visible to other
//! sessions until commit. Used by unit and integration tests.

use crate::error::{StoreError, StoreResult};
use crate::game::{EntityUpdate, TickResult};
use crate::store::{
    patched_entity, AppliedDeltas, NewEntity, NewPlayer, NewZone, Player, Session, Store,
    ZoneSession,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use shared::{Entity, Zone};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct WorldData {
    zones: HashMap<Uuid, Zone>,
    entities: HashMap<Uuid, Entity>,
    players: HashMap<Uuid, Player>,
    sessions: HashMap<String, Session>,
}

impl WorldData {
    fn zone_entities_sorted(&self, zone_id: Uuid) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self
            .entities
            .values()
            .filter(|e| e.zone_id == zone_id)
            .cloned()
            .collect();
        entities.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        entities
    }
}

/// In-memory twin of the PostgreSQL store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    world: Arc<Mutex<WorldData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

enum StagedOp {
    Insert(Entity),
    Replace(Entity),
    Remove(Uuid),
}

struct MemoryZoneSession {
    world: Arc<Mutex<WorldData>>,
    staged: Vec<StagedOp>,
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn ZoneSession>> {
        Ok(Box::new(MemoryZoneSession {
            world: Arc::clone(&self.world),
            staged: Vec::new(),
        }))
    }

    async fn create_zone(&self, new: NewZone) -> StoreResult<Zone> {
        let mut world = self.world.lock();
        if world.zones.values().any(|z| z.name == new.name) {
            return Err(StoreError::Conflict(format!(
                "zone name {} already exists",
                new.name
            )));
        }
        let now = Utc::now();
        let zone = Zone {
            id: Uuid::new_v4(),
            name: new.name,
            width: new.width,
            height: new.height,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        world.zones.insert(zone.id, zone.clone());
        Ok(zone)
    }

    async fn get_zone(&self, zone_id: Uuid) -> StoreResult<Option<Zone>> {
        Ok(self.world.lock().zones.get(&zone_id).cloned())
    }

    async fn list_zones(&self) -> StoreResult<Vec<Zone>> {
        let mut zones: Vec<Zone> = self.world.lock().zones.values().cloned().collect();
        zones.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(zones)
    }

    async fn delete_zone(&self, zone_id: Uuid) -> StoreResult<bool> {
        let mut world = self.world.lock();
        let removed = world.zones.remove(&zone_id).is_some();
        if removed {
            world.entities.retain(|_, e| e.zone_id != zone_id);
        }
        Ok(removed)
    }

    async fn create_entity(&self, new: NewEntity) -> StoreResult<Entity> {
        let now = Utc::now();
        let entity = Entity {
            id: Uuid::new_v4(),
            zone_id: new.zone_id,
            x: new.x,
            y: new.y,
            width: new.width,
            height: new.height,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        self.world.lock().entities.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn get_entity(&self, entity_id: Uuid) -> StoreResult<Option<Entity>> {
        Ok(self.world.lock().entities.get(&entity_id).cloned())
    }

    async fn zone_entities(&self, zone_id: Uuid) -> StoreResult<Vec<Entity>> {
        Ok(self.world.lock().zone_entities_sorted(zone_id))
    }

    async fn update_entity(&self, update: &EntityUpdate) -> StoreResult<Option<Entity>> {
        let mut world = self.world.lock();
        let existing = match world.entities.get(&update.id) {
            Some(entity) => entity.clone(),
            None => return Ok(None),
        };
        let patched = patched_entity(&existing, update, Utc::now());
        world.entities.insert(patched.id, patched.clone());
        Ok(Some(patched))
    }

    async fn delete_entity(&self, entity_id: Uuid) -> StoreResult<bool> {
        Ok(self.world.lock().entities.remove(&entity_id).is_some())
    }

    async fn create_player(&self, new: NewPlayer) -> StoreResult<Player> {
        let mut world = self.world.lock();
        if world.players.values().any(|p| p.username == new.username) {
            return Err(StoreError::Conflict(format!(
                "username {} already exists",
                new.username
            )));
        }
        let player = Player {
            id: Uuid::new_v4(),
            username: new.username,
            password_hash: new.password_hash,
            is_debug: new.is_debug,
            created_at: Utc::now(),
            last_login: None,
        };
        world.players.insert(player.id, player.clone());
        Ok(player)
    }

    async fn get_player(&self, player_id: Uuid) -> StoreResult<Option<Player>> {
        Ok(self.world.lock().players.get(&player_id).cloned())
    }

    async fn find_player_by_username(&self, username: &str) -> StoreResult<Option<Player>> {
        Ok(self
            .world
            .lock()
            .players
            .values()
            .find(|p| p.username == username)
            .cloned())
    }

    async fn record_login(&self, player_id: Uuid) -> StoreResult<()> {
        if let Some(player) = self.world.lock().players.get_mut(&player_id) {
            player.last_login = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_session(
        &self,
        player_id: Uuid,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Session> {
        let mut world = self.world.lock();
        if world.sessions.contains_key(token) {
            return Err(StoreError::Conflict("session token collision".to_string()));
        }
        let session = Session {
            id: Uuid::new_v4(),
            player_id,
            token: token.to_string(),
            created_at: Utc::now(),
            expires_at,
        };
        world.sessions.insert(token.to_string(), session.clone());
        Ok(session)
    }

    async fn find_session(&self, token: &str) -> StoreResult<Option<Session>> {
        Ok(self.world.lock().sessions.get(token).cloned())
    }

    async fn delete_session(&self, token: &str) -> StoreResult<bool> {
        Ok(self.world.lock().sessions.remove(token).is_some())
    }
}

#[async_trait]
impl ZoneSession for MemoryZoneSession {
    async fn get_zone(&mut self, zone_id: Uuid) -> StoreResult<Option<Zone>> {
        Ok(self.world.lock().zones.get(&zone_id).cloned())
    }

    async fn list_entities(&mut self, zone_id: Uuid) -> StoreResult<Vec<Entity>> {
        Ok(self.world.lock().zone_entities_sorted(zone_id))
    }

    async fn apply_deltas(
        &mut self,
        zone: &Zone,
        result: &TickResult,
    ) -> StoreResult<AppliedDeltas> {
        let now = Utc::now();
        let mut applied = AppliedDeltas::default();
        let world = self.world.lock();

        for create in &result.creates {
            if !zone.is_entity_in_bounds(create.x, create.y, create.width, create.height) {
                warn!(
                    "zone {}: dropping out-of-bounds create at ({}, {})",
                    zone.id, create.x, create.y
                );
                applied.skipped += 1;
                continue;
            }
            let entity = Entity {
                id: Uuid::new_v4(),
                zone_id: zone.id,
                x: create.x,
                y: create.y,
                width: create.width,
                height: create.height,
                metadata: create.metadata.clone(),
                created_at: now,
                updated_at: now,
            };
            self.staged.push(StagedOp::Insert(entity.clone()));
            applied.created.push(entity);
        }

        for update in &result.updates {
            let existing = match world.entities.get(&update.id) {
                Some(entity) if entity.zone_id == zone.id => entity.clone(),
                _ => {
                    applied.skipped += 1;
                    continue;
                }
            };
            let patched = patched_entity(&existing, update, now);
            if !zone.is_entity_in_bounds(patched.x, patched.y, patched.width, patched.height) {
                warn!(
                    "zone {}: dropping out-of-bounds update for entity {}",
                    zone.id, update.id
                );
                applied.skipped += 1;
                continue;
            }
            self.staged.push(StagedOp::Replace(patched.clone()));
            applied.updated.push(patched);
        }

        for entity_id in &result.deletes {
            if matches!(world.entities.get(entity_id), Some(e) if e.zone_id == zone.id) {
                self.staged.push(StagedOp::Remove(*entity_id));
            }
        }

        Ok(applied)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut world = self.world.lock();
        for op in self.staged {
            match op {
                StagedOp::Insert(entity) | StagedOp::Replace(entity) => {
                    world.entities.insert(entity.id, entity);
                }
                StagedOp::Remove(entity_id) => {
                    world.entities.remove(&entity_id);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Nothing was published; dropping the staged ops is the rollback.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::EntityCreate;
    use serde_json::json;

    async fn seeded_zone(store: &MemoryStore) -> Zone {
        store
            .create_zone(NewZone {
                name: "plains".to_string(),
                width: 10,
                height: 10,
                metadata: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_zone_name_conflicts() {
        let store = MemoryStore::new();
        seeded_zone(&store).await;
        let err = store
            .create_zone(NewZone {
                name: "plains".to_string(),
                width: 5,
                height: 5,
                metadata: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn staged_creates_invisible_until_commit() {
        let store = MemoryStore::new();
        let zone = seeded_zone(&store).await;

        let mut session = store.begin().await.unwrap();
        let result = TickResult {
            creates: vec![EntityCreate {
                x: 3,
                y: 4,
                width: 1,
                height: 1,
                metadata: None,
            }],
            ..TickResult::default()
        };
        let applied = session.apply_deltas(&zone, &result).await.unwrap();
        assert_eq!(applied.created.len(), 1);

        // Not yet visible outside the session.
        assert!(store.zone_entities(zone.id).await.unwrap().is_empty());

        session.commit().await.unwrap();
        let entities = store.zone_entities(zone.id).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!((entities[0].x, entities[0].y), (3, 4));
    }

    #[tokio::test]
    async fn rollback_discards_staged_work() {
        let store = MemoryStore::new();
        let zone = seeded_zone(&store).await;

        let mut session = store.begin().await.unwrap();
        let result = TickResult {
            creates: vec![EntityCreate {
                x: 1,
                y: 1,
                width: 1,
                height: 1,
                metadata: None,
            }],
            ..TickResult::default()
        };
        session.apply_deltas(&zone, &result).await.unwrap();
        session.rollback().await.unwrap();

        assert!(store.zone_entities(zone.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_bounds_deltas_are_skipped() {
        let store = MemoryStore::new();
        let zone = seeded_zone(&store).await;

        let mut session = store.begin().await.unwrap();
        let result = TickResult {
            creates: vec![
                EntityCreate {
                    x: 20,
                    y: 20,
                    width: 1,
                    height: 1,
                    metadata: None,
                },
                EntityCreate {
                    x: 2,
                    y: 2,
                    width: 1,
                    height: 1,
                    metadata: None,
                },
            ],
            ..TickResult::default()
        };
        let applied = session.apply_deltas(&zone, &result).await.unwrap();
        assert_eq!(applied.created.len(), 1);
        assert_eq!(applied.skipped, 1);
        session.commit().await.unwrap();

        let entities = store.zone_entities(zone.id).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!((entities[0].x, entities[0].y), (2, 2));
    }

    #[tokio::test]
    async fn update_and_delete_round_trip() {
        let store = MemoryStore::new();
        let zone = seeded_zone(&store).await;
        let entity = store
            .create_entity(NewEntity {
                zone_id: zone.id,
                x: 0,
                y: 0,
                width: 1,
                height: 1,
                metadata: Some(json!({"kind": "tree"})),
            })
            .await
            .unwrap();

        let mut update = EntityUpdate::new(entity.id);
        update.x = Some(5);
        let patched = store.update_entity(&update).await.unwrap().unwrap();
        assert_eq!(patched.x, 5);
        assert_eq!(patched.metadata, Some(json!({"kind": "tree"})));

        assert!(store.delete_entity(entity.id).await.unwrap());
        assert!(store.get_entity(entity.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sessions_and_players() {
        let store = MemoryStore::new();
        let player = store
            .create_player(NewPlayer {
                username: "alice".to_string(),
                password_hash: "hash".to_string(),
                is_debug: false,
            })
            .await
            .unwrap();

        assert!(store
            .create_player(NewPlayer {
                username: "alice".to_string(),
                password_hash: "hash2".to_string(),
                is_debug: false,
            })
            .await
            .is_err());

        store
            .create_session(player.id, "tok-1", None)
            .await
            .unwrap();
        let found = store.find_session("tok-1").await.unwrap().unwrap();
        assert_eq!(found.player_id, player.id);

        assert!(store.delete_session("tok-1").await.unwrap());
        assert!(store.find_session("tok-1").await.unwrap().is_none());
    }
}
