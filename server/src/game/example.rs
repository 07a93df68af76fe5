//! Builtin example module with basic grid movement.
//!
//! Supported intent bodies:
//! - `{"action": "move", "entity_id": "...", "dx": 1, "dy": 0}`
//! - `{"action": "create_entity", "x": 0, "y": 0, "width": 1, "height": 1}`
//! - `{"action": "delete_entity", "entity_id": "..."}`
//!
//! Malformed intents are logged and skipped; one bad intent never fails the
//! zone. The per-player filter passes the base state through unchanged and
//! tags it with the viewer's id.

use crate::error::ModuleResult;
use crate::game::{
    EntityCreate, EntityUpdate, FrameworkHandle, GameModule, Intent, TickResult,
};
use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::Entity;
use std::collections::HashMap;
use std::sync::OnceLock;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Action {
    Move {
        entity_id: Uuid,
        #[serde(default)]
        dx: i32,
        #[serde(default)]
        dy: i32,
    },
    CreateEntity {
        #[serde(default)]
        x: i32,
        #[serde(default)]
        y: i32,
        #[serde(default = "default_dimension")]
        width: i32,
        #[serde(default = "default_dimension")]
        height: i32,
        #[serde(default)]
        metadata: Option<Value>,
    },
    DeleteEntity {
        entity_id: Uuid,
    },
}

fn default_dimension() -> i32 {
    1
}

/// Movement demo module registered as `example`.
pub struct ExampleModule {
    framework: OnceLock<FrameworkHandle>,
}

impl ExampleModule {
    pub fn new() -> Self {
        Self {
            framework: OnceLock::new(),
        }
    }

    fn handle_move(
        entities: &HashMap<Uuid, &Entity>,
        entity_id: Uuid,
        dx: i32,
        dy: i32,
    ) -> Option<EntityUpdate> {
        let entity = entities.get(&entity_id)?;
        let new_x = entity.x + dx;
        let new_y = entity.y + dy;
        if new_x < 0 || new_y < 0 {
            return None;
        }
        let mut update = EntityUpdate::new(entity_id);
        update.x = Some(new_x);
        update.y = Some(new_y);
        Some(update)
    }
}

impl Default for ExampleModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GameModule for ExampleModule {
    async fn on_init(&self, framework: FrameworkHandle) -> ModuleResult<()> {
        let _ = self.framework.set(framework);
        info!("example game module initialized");
        Ok(())
    }

    async fn on_tick(
        &self,
        _zone_id: Uuid,
        entities: &[Entity],
        intents: &[Intent],
        _tick_number: u64,
    ) -> ModuleResult<TickResult> {
        let mut result = TickResult::default();
        let by_id: HashMap<Uuid, &Entity> = entities.iter().map(|e| (e.id, e)).collect();

        for intent in intents {
            let action: Action = match serde_json::from_value(intent.data.clone()) {
                Ok(action) => action,
                Err(err) => {
                    warn!(
                        "skipping malformed intent from player {}: {}",
                        intent.player_id, err
                    );
                    continue;
                }
            };

            match action {
                Action::Move { entity_id, dx, dy } => {
                    if let Some(update) = Self::handle_move(&by_id, entity_id, dx, dy) {
                        result.updates.push(update);
                    }
                }
                Action::CreateEntity {
                    x,
                    y,
                    width,
                    height,
                    metadata,
                } => {
                    if x < 0 || y < 0 || width < 0 || height < 0 {
                        continue;
                    }
                    result.creates.push(EntityCreate {
                        x,
                        y,
                        width,
                        height,
                        metadata,
                    });
                }
                Action::DeleteEntity { entity_id } => {
                    if by_id.contains_key(&entity_id) {
                        result.deletes.push(entity_id);
                    }
                }
            }
        }

        if !result.creates.is_empty() {
            result.extras.insert(
                "events".to_string(),
                json!([{"type": "entities_created", "count": result.creates.len()}]),
            );
        }

        Ok(result)
    }

    fn player_state(
        &self,
        _zone_id: Uuid,
        player_id: Uuid,
        base_state: &Value,
    ) -> ModuleResult<Value> {
        let mut state = base_state.clone();
        if let Some(obj) = state.as_object_mut() {
            obj.insert("viewer_id".to_string(), json!(player_id));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entity(id: Uuid, x: i32, y: i32) -> Entity {
        Entity {
            id,
            zone_id: Uuid::new_v4(),
            x,
            y,
            width: 1,
            height: 1,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn intent(data: Value) -> Intent {
        Intent {
            player_id: Uuid::new_v4(),
            connection_id: 1,
            zone_id: Uuid::new_v4(),
            data,
            queued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn move_intent_produces_update() {
        let module = ExampleModule::new();
        let id = Uuid::new_v4();
        let entities = vec![entity(id, 2, 3)];
        let intents = vec![intent(json!({
            "action": "move", "entity_id": id, "dx": 1, "dy": -1
        }))];

        let result = module.on_tick(Uuid::new_v4(), &entities, &intents, 1).await.unwrap();
        assert_eq!(result.updates.len(), 1);
        assert_eq!(result.updates[0].x, Some(3));
        assert_eq!(result.updates[0].y, Some(2));
    }

    #[tokio::test]
    async fn move_below_origin_is_ignored() {
        let module = ExampleModule::new();
        let id = Uuid::new_v4();
        let entities = vec![entity(id, 0, 0)];
        let intents = vec![intent(json!({
            "action": "move", "entity_id": id, "dx": -1, "dy": 0
        }))];

        let result = module.on_tick(Uuid::new_v4(), &entities, &intents, 1).await.unwrap();
        assert!(result.updates.is_empty());
    }

    #[tokio::test]
    async fn create_intent_emits_create_and_event() {
        let module = ExampleModule::new();
        let intents = vec![intent(json!({
            "action": "create_entity", "x": 3, "y": 4
        }))];

        let result = module.on_tick(Uuid::new_v4(), &[], &intents, 1).await.unwrap();
        assert_eq!(result.creates.len(), 1);
        assert_eq!(result.creates[0].x, 3);
        assert_eq!(result.creates[0].width, 1);
        assert!(result.extras.contains_key("events"));
    }

    #[tokio::test]
    async fn delete_of_unknown_entity_is_ignored() {
        let module = ExampleModule::new();
        let intents = vec![intent(json!({
            "action": "delete_entity", "entity_id": Uuid::new_v4()
        }))];

        let result = module.on_tick(Uuid::new_v4(), &[], &intents, 1).await.unwrap();
        assert!(result.deletes.is_empty());
    }

    #[tokio::test]
    async fn malformed_intent_is_skipped() {
        let module = ExampleModule::new();
        let intents = vec![
            intent(json!({"action": "warp"})),
            intent(json!({"action": "create_entity", "x": 1, "y": 1})),
        ];

        let result = module.on_tick(Uuid::new_v4(), &[], &intents, 1).await.unwrap();
        assert_eq!(result.creates.len(), 1);
    }

    #[test]
    fn filter_tags_viewer() {
        let module = ExampleModule::new();
        let player = Uuid::new_v4();
        let base = json!({"tick_number": 1, "entities": []});

        let state = module.player_state(Uuid::new_v4(), player, &base).unwrap();
        assert_eq!(state["viewer_id"], json!(player));
        assert_eq!(state["entities"], json!([]));
    }
}
