//! Connection and subscription registry.
//!
//! Process-wide roster of live push-channel connections: at most one per
//! player, each holding at most one zone subscription. Every connection gets
//! a process-unique id at registration, and all connection-scoped mutations
//! are gated on that id — a stale handler left over from a superseded
//! connection can never disconnect or resubscribe the newer one.
//!
//! Sinks are channel senders to per-connection writer tasks, so nothing here
//! performs I/O while holding the lock; reads hand out snapshots.

use parking_lot::Mutex;
use serde::Serialize;
use shared::ServerMessage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound handle for one connection's writer task.
pub type Sink = mpsc::UnboundedSender<ServerMessage>;

/// Fanout view of one subscriber.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub player_id: Uuid,
    pub connection_id: u64,
    pub sink: Sink,
}

/// Administrative view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub player_id: Uuid,
    pub username: String,
    pub connection_id: u64,
    pub zone_id: Option<Uuid>,
}

/// Why a connection-scoped operation was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("player has no active connection")]
    NotConnected,

    /// The stored connection id no longer matches the caller's; a newer
    /// connection has superseded it.
    #[error("connection is no longer current")]
    StaleConnection,
}

struct Connection {
    connection_id: u64,
    username: String,
    zone_id: Option<Uuid>,
    sink: Sink,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<Uuid, Connection>,
    zones: HashMap<Uuid, HashSet<Uuid>>,
}

impl Inner {
    fn leave_zone(&mut self, player_id: Uuid, zone_id: Option<Uuid>) {
        if let Some(zone_id) = zone_id {
            if let Some(members) = self.zones.get_mut(&zone_id) {
                members.remove(&player_id);
                if members.is_empty() {
                    self.zones.remove(&zone_id);
                }
            }
        }
    }
}

/// Registry of live connections and their zone subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_connection_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new connection for a player, superseding and best-effort
    /// closing any prior one atomically. Returns the fresh connection id.
    pub fn register(&self, player_id: Uuid, username: &str, sink: Sink) -> u64 {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner.lock();

        if let Some(prior) = inner.connections.remove(&player_id) {
            let _ = prior.sink.send(ServerMessage::Error {
                message: "superseded by a newer connection".to_string(),
            });
            // Dropping the prior sink ends its writer task, which closes the
            // socket.
            inner.leave_zone(player_id, prior.zone_id);
            log::info!(
                "player {player_id}: connection {} superseded by {connection_id}",
                prior.connection_id
            );
        }

        inner.connections.insert(
            player_id,
            Connection {
                connection_id,
                username: username.to_string(),
                zone_id: None,
                sink,
            },
        );
        log::info!("player {player_id} ({username}) connected as connection {connection_id}");
        connection_id
    }

    /// Move a connection into a zone, leaving any prior zone. Valid only for
    /// the player's current connection.
    pub fn subscribe(
        &self,
        player_id: Uuid,
        connection_id: u64,
        zone_id: Uuid,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let current = inner
            .connections
            .get(&player_id)
            .ok_or(RegistryError::NotConnected)?;
        if current.connection_id != connection_id {
            return Err(RegistryError::StaleConnection);
        }

        let prior_zone = current.zone_id;
        inner.leave_zone(player_id, prior_zone);
        inner.zones.entry(zone_id).or_default().insert(player_id);
        if let Some(connection) = inner.connections.get_mut(&player_id) {
            connection.zone_id = Some(zone_id);
        }
        log::info!("player {player_id} subscribed to zone {zone_id}");
        Ok(())
    }

    /// Remove a connection, but only if the stored id still matches.
    /// Idempotent: a repeat or stale call is a no-op.
    pub fn disconnect(&self, player_id: Uuid, connection_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let current = matches!(
            inner.connections.get(&player_id),
            Some(connection) if connection.connection_id == connection_id
        );
        if !current {
            return false;
        }
        if let Some(removed) = inner.connections.remove(&player_id) {
            inner.leave_zone(player_id, removed.zone_id);
        }
        log::info!("player {player_id}: connection {connection_id} disconnected");
        true
    }

    /// Zone the player's current connection is subscribed to. Gated on the
    /// connection id like every other connection-scoped operation.
    pub fn subscribed_zone(
        &self,
        player_id: Uuid,
        connection_id: u64,
    ) -> Result<Option<Uuid>, RegistryError> {
        let inner = self.inner.lock();
        let current = inner
            .connections
            .get(&player_id)
            .ok_or(RegistryError::NotConnected)?;
        if current.connection_id != connection_id {
            return Err(RegistryError::StaleConnection);
        }
        Ok(current.zone_id)
    }

    /// Snapshot of all zones with at least one subscriber.
    pub fn subscribed_zone_ids(&self) -> Vec<Uuid> {
        let inner = self.inner.lock();
        inner
            .zones
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(zone_id, _)| *zone_id)
            .collect()
    }

    /// Snapshot of a zone's subscribers for fanout.
    pub fn subscribers_of(&self, zone_id: Uuid) -> Vec<Subscriber> {
        let inner = self.inner.lock();
        let Some(members) = inner.zones.get(&zone_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|player_id| {
                inner.connections.get(player_id).map(|connection| Subscriber {
                    player_id: *player_id,
                    connection_id: connection.connection_id,
                    sink: connection.sink.clone(),
                })
            })
            .collect()
    }

    /// Administrative snapshot of every live connection.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let inner = self.inner.lock();
        inner
            .connections
            .iter()
            .map(|(player_id, connection)| ConnectionSnapshot {
                player_id: *player_id,
                username: connection.username.clone(),
                connection_id: connection.connection_id,
                zone_id: connection.zone_id,
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (Sink, mpsc::UnboundedReceiver<ServerMessage>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn register_allocates_unique_ids() {
        let registry = SubscriptionRegistry::new();
        let (sink_a, _rx_a) = sink();
        let (sink_b, _rx_b) = sink();

        let id_a = registry.register(Uuid::new_v4(), "a", sink_a);
        let id_b = registry.register(Uuid::new_v4(), "b", sink_b);
        assert_ne!(id_a, id_b);
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn newer_connection_supersedes_and_closes_prior() {
        let registry = SubscriptionRegistry::new();
        let player = Uuid::new_v4();
        let zone = Uuid::new_v4();
        let (sink1, mut rx1) = sink();
        let (sink2, _rx2) = sink();

        let c1 = registry.register(player, "p", sink1);
        registry.subscribe(player, c1, zone).unwrap();

        let c2 = registry.register(player, "p", sink2);
        assert_ne!(c1, c2);
        assert_eq!(registry.connection_count(), 1);

        // The old sink got a best-effort notice and was then dropped.
        assert!(matches!(
            rx1.try_recv(),
            Ok(ServerMessage::Error { .. })
        ));
        assert!(rx1.try_recv().is_err());

        // The superseded connection's subscription is gone.
        assert!(registry.subscribers_of(zone).is_empty());
    }

    #[test]
    fn stale_disconnect_is_a_no_op() {
        let registry = SubscriptionRegistry::new();
        let player = Uuid::new_v4();
        let zone = Uuid::new_v4();
        let (sink1, _rx1) = sink();
        let (sink2, _rx2) = sink();

        let c1 = registry.register(player, "p", sink1);
        let c2 = registry.register(player, "p", sink2);
        registry.subscribe(player, c2, zone).unwrap();

        // The old handler tries to clean up with its own id.
        assert!(!registry.disconnect(player, c1));
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.subscribers_of(zone).len(), 1);

        // The current connection can still disconnect, exactly once.
        assert!(registry.disconnect(player, c2));
        assert!(!registry.disconnect(player, c2));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn stale_subscribe_is_refused() {
        let registry = SubscriptionRegistry::new();
        let player = Uuid::new_v4();
        let (sink1, _rx1) = sink();
        let (sink2, _rx2) = sink();

        let c1 = registry.register(player, "p", sink1);
        let _c2 = registry.register(player, "p", sink2);

        assert_eq!(
            registry.subscribe(player, c1, Uuid::new_v4()),
            Err(RegistryError::StaleConnection)
        );
    }

    #[test]
    fn resubscribe_moves_the_single_binding() {
        let registry = SubscriptionRegistry::new();
        let player = Uuid::new_v4();
        let zone_a = Uuid::new_v4();
        let zone_b = Uuid::new_v4();
        let (sink1, _rx1) = sink();

        let c1 = registry.register(player, "p", sink1);
        registry.subscribe(player, c1, zone_a).unwrap();
        registry.subscribe(player, c1, zone_b).unwrap();

        assert!(registry.subscribers_of(zone_a).is_empty());
        assert_eq!(registry.subscribers_of(zone_b).len(), 1);
        assert_eq!(registry.subscribed_zone_ids(), vec![zone_b]);
        assert_eq!(
            registry.subscribed_zone(player, c1).unwrap(),
            Some(zone_b)
        );
    }

    #[test]
    fn disconnect_clears_zone_membership() {
        let registry = SubscriptionRegistry::new();
        let player = Uuid::new_v4();
        let zone = Uuid::new_v4();
        let (sink1, _rx1) = sink();

        let c1 = registry.register(player, "p", sink1);
        registry.subscribe(player, c1, zone).unwrap();
        registry.disconnect(player, c1);

        assert!(registry.subscribed_zone_ids().is_empty());
        assert!(registry.subscribers_of(zone).is_empty());
        assert!(registry.snapshot().is_empty());
    }
}
