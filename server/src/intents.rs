//! Per-zone intent buffering.
//!
//! Ingress handlers enqueue concurrently; the tick engine drains each zone at
//! most once per tick. A single async lock serializes enqueue against drain,
//! which gives the two guarantees the push channel depends on: an intent is
//! durably queued before the handler acknowledges it, and an enqueue that
//! races a drain lands in the next tick's buffer instead of being lost.

use crate::game::Intent;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// FIFO intent buffers, one per zone.
#[derive(Default)]
pub struct IntentQueue {
    queues: Mutex<HashMap<Uuid, Vec<Intent>>>,
}

impl IntentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an intent to its zone's buffer. The caller must not
    /// acknowledge the intent to the client until this returns.
    pub async fn enqueue(&self, intent: Intent) {
        let mut queues = self.queues.lock().await;
        queues.entry(intent.zone_id).or_default().push(intent);
    }

    /// Remove and return everything queued for a zone, in enqueue order.
    pub async fn drain(&self, zone_id: Uuid) -> Vec<Intent> {
        let mut queues = self.queues.lock().await;
        queues.remove(&zone_id).unwrap_or_default()
    }

    /// Zones that currently have at least one queued intent. Feeds the tick
    /// engine's active zone set.
    pub async fn zones_with_intents(&self) -> Vec<Uuid> {
        let queues = self.queues.lock().await;
        queues
            .iter()
            .filter(|(_, intents)| !intents.is_empty())
            .map(|(zone_id, _)| *zone_id)
            .collect()
    }

    /// Number of intents queued for one zone.
    pub async fn pending(&self, zone_id: Uuid) -> usize {
        let queues = self.queues.lock().await;
        queues.get(&zone_id).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn intent(zone_id: Uuid, ordinal: usize) -> Intent {
        Intent {
            player_id: Uuid::new_v4(),
            connection_id: 1,
            zone_id,
            data: json!({"ordinal": ordinal}),
            queued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn drain_returns_enqueue_order() {
        let queue = IntentQueue::new();
        let zone_id = Uuid::new_v4();
        for ordinal in 0..5 {
            queue.enqueue(intent(zone_id, ordinal)).await;
        }

        let drained = queue.drain(zone_id).await;
        assert_eq!(drained.len(), 5);
        for (ordinal, intent) in drained.iter().enumerate() {
            assert_eq!(intent.data["ordinal"], json!(ordinal));
        }

        // A drain consumes; the next one is empty.
        assert!(queue.drain(zone_id).await.is_empty());
    }

    #[tokio::test]
    async fn zones_interleave_independently() {
        let queue = IntentQueue::new();
        let zone_a = Uuid::new_v4();
        let zone_b = Uuid::new_v4();
        queue.enqueue(intent(zone_a, 0)).await;
        queue.enqueue(intent(zone_b, 0)).await;
        queue.enqueue(intent(zone_a, 1)).await;

        let mut with_intents = queue.zones_with_intents().await;
        with_intents.sort();
        let mut expected = vec![zone_a, zone_b];
        expected.sort();
        assert_eq!(with_intents, expected);

        assert_eq!(queue.drain(zone_a).await.len(), 2);
        assert_eq!(queue.pending(zone_b).await, 1);
    }

    #[tokio::test]
    async fn enqueue_after_drain_is_preserved() {
        let queue = Arc::new(IntentQueue::new());
        let zone_id = Uuid::new_v4();
        queue.enqueue(intent(zone_id, 0)).await;

        let first = queue.drain(zone_id).await;
        assert_eq!(first.len(), 1);

        queue.enqueue(intent(zone_id, 1)).await;
        let second = queue.drain(zone_id).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data["ordinal"], json!(1));
    }

    #[tokio::test]
    async fn concurrent_enqueues_are_not_lost() {
        let queue = Arc::new(IntentQueue::new());
        let zone_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for ordinal in 0..100 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.enqueue(intent(zone_id, ordinal)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let drained = queue.drain(zone_id).await;
        assert_eq!(drained.len(), 100);
    }
}
