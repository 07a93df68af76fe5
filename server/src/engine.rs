//! The tick engine.
//!
//! A single logical driver advances the whole shard at a fixed cadence. Each
//! tick it computes the active zone set (subscribed zones plus zones with
//! queued intents — everything else costs nothing), then runs one pipeline
//! per active zone, concurrently up to a configured cap:
//!
//! 1. open a scoped transactional session
//! 2. load the zone and its entities
//! 3. drain the zone's intent queue
//! 4. invoke the game module's `on_tick`
//! 5. apply the returned deltas
//! 6. commit — or roll back this zone alone on any failure
//! 7. build the post-apply snapshot and broadcast it per subscriber
//!
//! Failures are isolated at two scopes: a zone that fails rolls back without
//! touching its siblings and is retried next tick; a subscriber whose filter
//! or sink fails is skipped without affecting other subscribers.
//!
//! Cadence compensates for work duration. If a tick overruns its interval the
//! engine records a timing slip and proceeds to the next boundary; it never
//! bursts ticks to catch up.

use crate::config::Config;
use crate::error::ZoneTickError;
use crate::game::GameModule;
use crate::intents::IntentQueue;
use crate::registry::SubscriptionRegistry;
use crate::snapshot;
use crate::store::Store;
use futures_util::stream::{self, StreamExt};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use shared::{Entity, ServerMessage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use uuid::Uuid;

const STATS_HISTORY: usize = 100;
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Running,
    Paused,
    Stopping,
}

/// Timing record for one executed tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickStats {
    pub tick_number: u64,
    pub duration_ms: f64,
    pub zones_processed: usize,
    pub zones_failed: usize,
    pub intents_processed: usize,
    /// The tick overran its interval; the engine rebased to the next
    /// boundary instead of bursting.
    pub slipped: bool,
}

/// Snapshot of the engine for the administrative surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub tick_number: u64,
    pub state: EngineState,
    pub tick_interval_ms: u64,
}

/// Fixed-cadence driver over per-zone pipelines.
pub struct TickEngine {
    store: Arc<dyn Store>,
    module: Arc<dyn GameModule>,
    registry: Arc<SubscriptionRegistry>,
    intents: Arc<IntentQueue>,
    tick_interval: Duration,
    zone_parallelism: usize,
    filter_failure_limit: u32,
    tick_number: AtomicU64,
    state: Mutex<EngineState>,
    shutdown: watch::Sender<bool>,
    filter_failures: Mutex<HashMap<u64, u32>>,
    stats: Mutex<VecDeque<TickStats>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TickEngine {
    pub fn new(
        store: Arc<dyn Store>,
        module: Arc<dyn GameModule>,
        registry: Arc<SubscriptionRegistry>,
        intents: Arc<IntentQueue>,
        config: &Config,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            store,
            module,
            registry,
            intents,
            tick_interval: config.tick_interval(),
            zone_parallelism: config.zone_parallelism,
            filter_failure_limit: config.filter_failure_limit,
            tick_number: AtomicU64::new(0),
            state: Mutex::new(EngineState::Running),
            shutdown,
            filter_failures: Mutex::new(HashMap::new()),
            stats: Mutex::new(VecDeque::new()),
            task: Mutex::new(None),
        })
    }

    /// Spawn the cadence loop.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.run_loop().await;
        });
        *self.task.lock() = Some(handle);
        info!("tick engine started (interval {:?})", self.tick_interval);
    }

    /// Signal shutdown and wait for the in-flight tick to finish. A tick
    /// that does not complete within the grace period is aborted; its zones
    /// roll back through their dropped transactions.
    pub async fn stop(&self) {
        *self.state.lock() = EngineState::Stopping;
        let _ = self.shutdown.send(true);

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("tick engine did not stop within {STOP_GRACE:?}, aborting");
                handle.abort();
            }
        }
        info!("tick engine stopped at tick {}", self.tick_number());
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if *state == EngineState::Running {
            *state = EngineState::Paused;
            info!("tick engine paused at tick {}", self.tick_number());
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == EngineState::Paused {
            *state = EngineState::Running;
            info!("tick engine resumed at tick {}", self.tick_number());
        }
    }

    /// Execute exactly one tick while paused. Returns `None` when the
    /// engine is not paused.
    pub async fn step(&self) -> Option<TickStats> {
        if self.state() != EngineState::Paused {
            return None;
        }
        let stats = self.run_tick().await;
        info!("manual tick step executed: {}", stats.tick_number);
        Some(stats)
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn tick_number(&self) -> u64 {
        self.tick_number.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            tick_number: self.tick_number(),
            state: self.state(),
            tick_interval_ms: self.tick_interval.as_millis() as u64,
        }
    }

    pub fn recent_stats(&self) -> Vec<TickStats> {
        self.stats.lock().iter().cloned().collect()
    }

    async fn run_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut next_deadline = Instant::now();

        loop {
            match self.state() {
                EngineState::Stopping => break,
                EngineState::Running => {
                    self.run_tick().await;
                }
                // Paused: skip straight to timing accounting. Steps happen
                // through `step`, outside this loop.
                EngineState::Paused => {}
            }

            next_deadline += self.tick_interval;
            let now = Instant::now();
            if next_deadline <= now {
                next_deadline = now + self.tick_interval;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep_until(next_deadline) => {}
            }
        }
    }

    /// Execute one full tick over the active zone set.
    pub async fn run_tick(&self) -> TickStats {
        let started = Instant::now();
        let tick_number = self.tick_number.fetch_add(1, Ordering::SeqCst) + 1;

        let mut active: HashSet<Uuid> = self.registry.subscribed_zone_ids().into_iter().collect();
        active.extend(self.intents.zones_with_intents().await);

        let outcomes: Vec<(Uuid, Result<usize, ZoneTickError>)> =
            stream::iter(active.into_iter().map(|zone_id| async move {
                (zone_id, self.process_zone(zone_id, tick_number).await)
            }))
            .buffer_unordered(self.zone_parallelism)
            .collect()
            .await;

        let mut zones_processed = 0;
        let mut zones_failed = 0;
        let mut intents_processed = 0;
        for (zone_id, outcome) in outcomes {
            match outcome {
                Ok(intent_count) => {
                    zones_processed += 1;
                    intents_processed += intent_count;
                }
                Err(err) => {
                    zones_failed += 1;
                    warn!("zone {zone_id}: tick {tick_number} rolled back: {err}");
                }
            }
        }

        let duration = started.elapsed();
        let slipped = duration > self.tick_interval;
        if slipped {
            warn!(
                "tick {tick_number} took {duration:?} (target {:?})",
                self.tick_interval
            );
        }

        let stats = TickStats {
            tick_number,
            duration_ms: duration.as_secs_f64() * 1000.0,
            zones_processed,
            zones_failed,
            intents_processed,
            slipped,
        };
        let mut history = self.stats.lock();
        history.push_back(stats.clone());
        if history.len() > STATS_HISTORY {
            history.pop_front();
        }
        drop(history);
        stats
    }

    /// Run one zone's pipeline inside its own transaction scope. Any failure
    /// rolls back this zone only.
    async fn process_zone(&self, zone_id: Uuid, tick_number: u64) -> Result<usize, ZoneTickError> {
        let mut session = self.store.begin().await?;

        let zone = match session.get_zone(zone_id).await {
            Ok(Some(zone)) => zone,
            Ok(None) => {
                let _ = session.rollback().await;
                let orphaned = self.intents.drain(zone_id).await;
                if !orphaned.is_empty() {
                    warn!(
                        "zone {zone_id}: discarding {} intents for a deleted zone",
                        orphaned.len()
                    );
                }
                return Err(ZoneTickError::ZoneGone(zone_id));
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

        let intents = self.intents.drain(zone_id).await;
        let intent_count = intents.len();

        let result = match self
            .module
            .on_tick(zone_id, &entities, &intents, tick_number)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                let _ = session.rollback().await;
                return Err(err.into());
            }
        };

        let applied = match session.apply_deltas(&zone, &result).await {
            Ok(applied) => applied,
            Err(err) => {
                let _ = session.rollback().await;
                return Err(err.into());
            }
        };
        session.commit().await?;

        let entities = snapshot::post_apply(entities, &result.deletes, &applied);
        let base_state = build_base_state(zone_id, tick_number, &entities, &result.extras);
        self.broadcast(zone_id, tick_number, &base_state);

        Ok(intent_count)
    }

    /// Filter and emit one tick's state to every subscriber of a zone.
    /// Filter and emission failures are isolated per subscriber.
    fn broadcast(&self, zone_id: Uuid, tick_number: u64, base_state: &Value) {
        for subscriber in self.registry.subscribers_of(zone_id) {
            match self
                .module
                .player_state(zone_id, subscriber.player_id, base_state)
            {
                Ok(state) => {
                    self.filter_failures.lock().remove(&subscriber.connection_id);
                    let message = ServerMessage::Tick { tick_number, state };
                    if subscriber.sink.send(message).is_err() {
                        warn!(
                            "player {}: sink closed, scheduling disconnect",
                            subscriber.player_id
                        );
                        self.registry
                            .disconnect(subscriber.player_id, subscriber.connection_id);
                    }
                }
                Err(err) => {
                    warn!(
                        "player {}: state filter failed for zone {zone_id}: {err}",
                        subscriber.player_id
                    );
                    if self.record_filter_failure(subscriber.connection_id) {
                        warn!(
                            "player {}: filter failed {} consecutive ticks, disconnecting",
                            subscriber.player_id, self.filter_failure_limit
                        );
                        self.registry
                            .disconnect(subscriber.player_id, subscriber.connection_id);
                    }
                }
            }
        }
    }

    /// Returns true once the consecutive-failure limit is reached.
    fn record_filter_failure(&self, connection_id: u64) -> bool {
        let mut failures = self.filter_failures.lock();
        let count = failures.entry(connection_id).or_insert(0);
        *count += 1;
        if *count >= self.filter_failure_limit {
            failures.remove(&connection_id);
            true
        } else {
            false
        }
    }
}

/// Compose the framework-owned base state for one (zone, tick).
///
/// Module extras are merged in, but the framework keys — `zone_id`,
/// `tick_number`, `entities` — always win: entity authority resides with
/// the framework, so extras can never smuggle in a snapshot.
pub fn build_base_state(
    zone_id: Uuid,
    tick_number: u64,
    entities: &[Entity],
    extras: &Map<String, Value>,
) -> Value {
    let mut state = Map::new();
    state.insert("zone_id".to_string(), json!(zone_id));
    state.insert("tick_number".to_string(), json!(tick_number));
    state.insert(
        "entities".to_string(),
        serde_json::to_value(entities).unwrap_or_else(|_| json!([])),
    );

    for (key, value) in extras {
        if state.contains_key(key) {
            warn!("ignoring extras key {key:?}: reserved for the framework");
            continue;
        }
        state.insert(key.clone(), value.clone());
    }

    Value::Object(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entity(x: i32, y: i32) -> Entity {
        Entity {
            id: Uuid::new_v4(),
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

    #[test]
    fn base_state_carries_framework_keys() {
        let zone_id = Uuid::new_v4();
        let state = build_base_state(zone_id, 42, &[entity(1, 2)], &Map::new());

        assert_eq!(state["zone_id"], json!(zone_id));
        assert_eq!(state["tick_number"], json!(42));
        assert_eq!(state["entities"].as_array().unwrap().len(), 1);
        assert_eq!(state["entities"][0]["x"], json!(1));
    }

    #[test]
    fn extras_merge_without_overriding_framework_keys() {
        let mut extras = Map::new();
        extras.insert("events".to_string(), json!(["boom"]));
        extras.insert("entities".to_string(), json!("forged snapshot"));
        extras.insert("tick_number".to_string(), json!(999));

        let state = build_base_state(Uuid::new_v4(), 7, &[], &extras);

        assert_eq!(state["events"], json!(["boom"]));
        assert_eq!(state["tick_number"], json!(7));
        assert_eq!(state["entities"], json!([]));
    }
}
