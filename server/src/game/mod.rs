//! Game-logic module contract.
//!
//! The framework owns zones, entities, and the tick cadence; everything
//! game-specific lives behind the [`GameModule`] trait. A module is resolved
//! once at startup from the [`ModuleRegistry`] by its configured identifier,
//! initialized with a read-only [`FrameworkHandle`], and then driven by the
//! tick engine. Modules describe state changes exclusively through
//! [`TickResult`] deltas; the framework persists them and builds the
//! authoritative post-apply snapshot itself.

pub mod example;

use crate::error::{ModuleError, ModuleResult, StoreResult};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::{Entity, Zone};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A queued player intent, delivered to `on_tick` at most once.
#[derive(Debug, Clone)]
pub struct Intent {
    pub player_id: Uuid,
    /// Connection the intent arrived on, for provenance.
    pub connection_id: u64,
    pub zone_id: Uuid,
    /// Opaque body; never inspected by the framework.
    pub data: Value,
    pub queued_at: DateTime<Utc>,
}

/// A new entity requested by the game module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityCreate {
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A partial update to an existing entity. Only `Some` fields change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub id: Uuid,
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

impl EntityUpdate {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            x: None,
            y: None,
            width: None,
            height: None,
            metadata: None,
        }
    }
}

/// Everything a game module returns for one (zone, tick).
///
/// Entity authority resides with the framework: modules hand back deltas and
/// an opaque extras payload, never a snapshot. Extras are merged into the
/// broadcast base state, but the framework-owned keys (`zone_id`,
/// `tick_number`, `entities`) always win.
#[derive(Debug, Clone, Default)]
pub struct TickResult {
    pub creates: Vec<EntityCreate>,
    pub updates: Vec<EntityUpdate>,
    pub deletes: Vec<Uuid>,
    pub extras: Map<String, Value>,
}

/// Read-only capability set handed to modules at init time.
#[derive(Clone)]
pub struct FrameworkHandle {
    store: Arc<dyn Store>,
}

impl FrameworkHandle {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Look up a zone by id.
    pub async fn zone(&self, zone_id: Uuid) -> StoreResult<Option<Zone>> {
        self.store.get_zone(zone_id).await
    }

    /// List all entities currently in a zone.
    pub async fn zone_entities(&self, zone_id: Uuid) -> StoreResult<Vec<Entity>> {
        self.store.zone_entities(zone_id).await
    }

    /// Look up a single entity by id.
    pub async fn entity(&self, entity_id: Uuid) -> StoreResult<Option<Entity>> {
        self.store.get_entity(entity_id).await
    }
}

/// The pluggable game-logic contract.
///
/// The tick engine guarantees that `on_tick` is never invoked concurrently
/// for the same zone. `player_state` may be invoked concurrently for
/// different subscribers, which is why the trait requires `Sync`.
#[async_trait]
pub trait GameModule: Send + Sync {
    /// Called once when the module is loaded, before the first tick.
    async fn on_init(&self, framework: FrameworkHandle) -> ModuleResult<()>;

    /// Resolve one tick for one zone: consume the drained intents against
    /// the pre-tick entity list and return the deltas to apply.
    async fn on_tick(
        &self,
        zone_id: Uuid,
        entities: &[Entity],
        intents: &[Intent],
        tick_number: u64,
    ) -> ModuleResult<TickResult>;

    /// Per-subscriber redaction hook. The sole place where fog-of-war is
    /// enforced; it is invoked for every subscriber on every tick, even when
    /// it is an identity function.
    fn player_state(&self, zone_id: Uuid, player_id: Uuid, base_state: &Value)
        -> ModuleResult<Value>;
}

type ModuleBuilder = fn() -> Arc<dyn GameModule>;

/// Maps configured module identifiers to constructors.
pub struct ModuleRegistry {
    builders: HashMap<String, ModuleBuilder>,
}

impl ModuleRegistry {
    /// Registry pre-populated with the builtin modules.
    pub fn builtin() -> Self {
        let mut registry = Self {
            builders: HashMap::new(),
        };
        registry.register("example", || Arc::new(example::ExampleModule::new()));
        registry
    }

    pub fn register(&mut self, name: &str, builder: ModuleBuilder) {
        self.builders.insert(name.to_string(), builder);
    }

    /// Instantiate the module registered under `name`.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn GameModule>> {
        self.builders.get(name).map(|build| build())
    }

    pub fn names(&self) -> Vec<String> {
        self.builders.keys().cloned().collect()
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(err: serde_json::Error) -> Self {
        ModuleError::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_builtin_example() {
        let registry = ModuleRegistry::builtin();
        assert!(registry.resolve("example").is_some());
        assert!(registry.resolve("no-such-module").is_none());
        assert!(registry.names().contains(&"example".to_string()));
    }

    #[test]
    fn entity_update_starts_empty() {
        let update = EntityUpdate::new(Uuid::new_v4());
        assert!(update.x.is_none());
        assert!(update.metadata.is_none());
    }
}
