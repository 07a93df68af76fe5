//! # Shared Grid Library
//!
//! This crate contains the data model and wire protocol shared between the
//! shard server and any native client. It is the foundation of the push
//! channel: both directions speak the self-describing tagged envelopes
//! defined here, and both sides agree on what a zone and an entity look like.
//!
//! ## Core Components
//!
//! ### Data Model
//! - **Zone**: a uniquely named rectangular simulation region with opaque
//!   metadata. Zones own entities and are the unit of transactional
//!   isolation on the server.
//! - **Entity**: a positioned object inside exactly one zone. Entities carry
//!   an integer position and footprint plus opaque metadata the framework
//!   never interprets. Zero-dimension (0x0) entities are allowed for
//!   markers, equipment and similar point objects.
//!
//! ### Wire Protocol
//! `ClientMessage` and `ServerMessage` define the complete message set of
//! the push channel. Every message is a JSON object tagged with a `type`
//! field, so either side can dispatch without knowing the payload shape in
//! advance. The `state` payload of a `tick` message is produced by the
//! server's game module and is deliberately opaque at this layer.
//!
//! ## Design Philosophy
//!
//! The server is authoritative: clients render what the server sends and
//! express themselves only through opaque intents. Nothing in this crate
//! performs simulation; it is types and geometry helpers only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A rectangular simulation region.
///
/// Zones are created and destroyed through the administrative path, never
/// by the simulation itself. The name is globally unique and the dimensions
/// are positive; both are enforced by the server at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: Uuid,
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Zone {
    /// Whether a grid position lies within this zone.
    pub fn is_position_valid(&self, x: i32, y: i32) -> bool {
        x >= 0 && x < self.width && y >= 0 && y < self.height
    }

    /// Whether an entity with the given footprint fits entirely inside the
    /// zone. Zero-dimension entities only need a valid position.
    pub fn is_entity_in_bounds(&self, x: i32, y: i32, width: i32, height: i32) -> bool {
        if width == 0 && height == 0 {
            return self.is_position_valid(x, y);
        }
        x >= 0 && y >= 0 && x + width <= self.width && y + height <= self.height
    }
}

/// A positioned object inside exactly one zone.
///
/// The framework manages entity rows authoritatively; game modules describe
/// changes as deltas and never hold references across ticks. Metadata is an
/// opaque JSON payload that is persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Entity bounds as `(x, y, width, height)`.
    pub fn bounds(&self) -> (i32, i32, i32, i32) {
        (self.x, self.y, self.width, self.height)
    }

    /// Whether this entity overlaps a rectangular query area.
    ///
    /// Zero-dimension entities overlap only if their position is inside the
    /// area; a zero-dimension query area is treated as a point.
    pub fn overlaps(&self, x: i32, y: i32, width: i32, height: i32) -> bool {
        if self.width == 0 && self.height == 0 {
            return x <= self.x && self.x < x + width && y <= self.y && self.y < y + height;
        }
        if width == 0 && height == 0 {
            return self.x <= x
                && x < self.x + self.width
                && self.y <= y
                && y < self.y + self.height;
        }
        self.x < x + width
            && self.x + self.width > x
            && self.y < y + height
            && self.y + self.height > y
    }
}

/// Messages a client may send over the push channel.
///
/// A connection first subscribes to a zone, then submits opaque intents
/// targeting that zone. The intent body is never inspected by the
/// framework; it flows to the game module verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe this connection to a zone, replacing any prior subscription.
    Subscribe { zone_id: Uuid },
    /// Submit an opaque intent for the currently subscribed zone.
    ///
    /// The server acknowledges with `intent_received` only after the intent
    /// has been durably placed in the zone's queue.
    Intent { data: Value },
}

/// Messages the server pushes to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges a successful zone subscription.
    Subscribed { zone_id: Uuid },
    /// Acknowledges that an intent is queued for the next tick.
    IntentReceived,
    /// One tick's filtered state for this subscriber.
    ///
    /// `state` is whatever the game module's per-player filter returned;
    /// its shape is module-defined while this envelope is framework-defined.
    Tick { tick_number: u64, state: Value },
    /// A non-fatal error. The server closes the connection separately on
    /// policy violations.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn zone(width: i32, height: i32) -> Zone {
        Zone {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            width,
            height,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn entity(x: i32, y: i32, width: i32, height: i32) -> Entity {
        Entity {
            id: Uuid::new_v4(),
            zone_id: Uuid::new_v4(),
            x,
            y,
            width,
            height,
            metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn position_validity() {
        let z = zone(10, 5);
        assert!(z.is_position_valid(0, 0));
        assert!(z.is_position_valid(9, 4));
        assert!(!z.is_position_valid(10, 0));
        assert!(!z.is_position_valid(0, 5));
        assert!(!z.is_position_valid(-1, 0));
    }

    #[test]
    fn entity_bounds_checking() {
        let z = zone(10, 10);
        assert!(z.is_entity_in_bounds(0, 0, 10, 10));
        assert!(z.is_entity_in_bounds(9, 9, 1, 1));
        assert!(!z.is_entity_in_bounds(9, 9, 2, 1));
        // Zero-dimension entities only need a valid position.
        assert!(z.is_entity_in_bounds(9, 9, 0, 0));
        assert!(!z.is_entity_in_bounds(10, 9, 0, 0));
    }

    #[test]
    fn overlap_semantics() {
        let sized = entity(2, 2, 3, 3);
        assert_eq!(sized.bounds(), (2, 2, 3, 3));
        assert!(sized.overlaps(0, 0, 3, 3));
        assert!(!sized.overlaps(5, 5, 2, 2));
        // Point query against a sized entity.
        assert!(sized.overlaps(3, 3, 0, 0));
        assert!(!sized.overlaps(5, 2, 0, 0));

        let marker = entity(4, 4, 0, 0);
        assert!(marker.overlaps(3, 3, 3, 3));
        assert!(!marker.overlaps(0, 0, 3, 3));
    }

    #[test]
    fn client_message_envelope_tags() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "intent", "data": {"action": "move"}})).unwrap();
        assert!(matches!(msg, ClientMessage::Intent { .. }));

        let zone_id = Uuid::new_v4();
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "subscribe", "zone_id": zone_id})).unwrap();
        match msg {
            ClientMessage::Subscribe { zone_id: z } => assert_eq!(z, zone_id),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn server_message_envelope_tags() {
        let encoded = serde_json::to_value(ServerMessage::IntentReceived).unwrap();
        assert_eq!(encoded, json!({"type": "intent_received"}));

        let encoded = serde_json::to_value(ServerMessage::Tick {
            tick_number: 7,
            state: json!({"entities": []}),
        })
        .unwrap();
        assert_eq!(encoded["type"], "tick");
        assert_eq!(encoded["tick_number"], 7);

        let encoded = serde_json::to_value(ServerMessage::Error {
            message: "nope".to_string(),
        })
        .unwrap();
        assert_eq!(encoded["type"], "error");
    }
}
