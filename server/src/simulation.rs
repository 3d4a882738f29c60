//! Simulation side of the server: the world collaborator, the snapshot
//! producer and the queue that hands snapshots to the network loop.

use log::{debug, trace};
use parking_lot::Mutex;
use shared::{EntityId, EntitySnapshot, GameMessage, Message, PlayerId, SnapshotBroadcast, MAX_DATAGRAM_SIZE};
use std::sync::Arc;

use crate::error::ServerError;

/// Bytes reserved for the packet frame around a snapshot payload.
const FRAME_HEADROOM: usize = 32;

/// The game world as seen by the networking core.
pub trait Simulation: Send {
    /// Advances the world by a fixed step in seconds.
    fn advance(&mut self, dt: f32);

    /// One record per live entity.
    fn collect_snapshots(&self) -> Vec<EntitySnapshot>;

    fn spawn_entity(&mut self, player_id: PlayerId) -> EntityId;

    /// Returns false if the entity was not alive.
    fn despawn_entity(&mut self, entity: EntityId) -> bool;

    fn entity_is_alive(&self, entity: EntityId) -> bool;

    fn apply_input(&mut self, entity: EntityId, input: u32);
}

/// Messages built by the simulation loop, waiting for the network loop.
///
/// The lock is held only to push or to take the whole batch, never while
/// anything is sent.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: Mutex<Vec<Message>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.messages.lock().push(message);
    }

    /// Takes everything queued so far, leaving the queue empty.
    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not a snapshot tick.
    Skipped,
    /// Snapshot tick with nothing alive to report.
    NoEntities,
    Enqueued { entities: usize },
}

/// Fixed-step driver for the simulation
///
/// Ticks are numbered from 1. Every tick advances the world by the same
/// delta; every `snapshot_every`-th tick also builds a snapshot broadcast
/// and pushes it onto the outbound queue.
pub struct SimulationLoop<S: Simulation> {
    simulation: Arc<Mutex<S>>,
    queue: Arc<OutboundQueue>,
    tick: u64,
    snapshot_every: u32,
    dt: f32,
}

impl<S: Simulation> SimulationLoop<S> {
    pub fn new(simulation: Arc<Mutex<S>>, queue: Arc<OutboundQueue>, snapshot_every: u32, dt: f32) -> Self {
        Self {
            simulation,
            queue,
            tick: 0,
            snapshot_every: snapshot_every.max(1),
            dt,
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn tick(&mut self) -> Result<TickOutcome, ServerError> {
        self.tick += 1;
        let tick = self.tick;

        let entities = {
            let mut simulation = self.simulation.lock();
            simulation.advance(self.dt);

            if tick % u64::from(self.snapshot_every) != 0 {
                return Ok(TickOutcome::Skipped);
            }
            simulation.collect_snapshots()
        };

        if entities.is_empty() {
            trace!("Tick {}: no live entities, snapshot skipped", tick);
            return Ok(TickOutcome::NoEntities);
        }

        let count = entities.len();
        let message = SnapshotBroadcast { tick, entities }
            .to_message()
            .map_err(|e| ServerError::SnapshotBuildFailure {
                tick,
                reason: e.to_string(),
            })?;

        if message.payload.len() + FRAME_HEADROOM > MAX_DATAGRAM_SIZE {
            return Err(ServerError::SnapshotBuildFailure {
                tick,
                reason: format!("{} entities do not fit in one datagram", count),
            });
        }

        self.queue.push(message);
        debug!("Tick {}: snapshot of {} entities queued", tick, count);
        Ok(TickOutcome::Enqueued { entities: count })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;

    /// Minimal in-memory world that records what it was asked to do.
    #[derive(Debug, Default)]
    pub struct StubWorld {
        pub entities: BTreeMap<EntityId, (PlayerId, u32)>,
        pub next_entity: EntityId,
        pub advanced: u32,
        pub spawned: u32,
    }

    impl Simulation for StubWorld {
        fn advance(&mut self, _dt: f32) {
            self.advanced += 1;
        }

        fn collect_snapshots(&self) -> Vec<EntitySnapshot> {
            self.entities
                .iter()
                .map(|(&entity_id, &(player_id, _))| EntitySnapshot {
                    entity_id,
                    player_id,
                    x: 0.0,
                    y: 0.0,
                    vel_x: 0.0,
                    vel_y: 0.0,
                    view_id: 1,
                })
                .collect()
        }

        fn spawn_entity(&mut self, player_id: PlayerId) -> EntityId {
            self.next_entity += 1;
            self.spawned += 1;
            self.entities.insert(self.next_entity, (player_id, 0));
            self.next_entity
        }

        fn despawn_entity(&mut self, entity: EntityId) -> bool {
            self.entities.remove(&entity).is_some()
        }

        fn entity_is_alive(&self, entity: EntityId) -> bool {
            self.entities.contains_key(&entity)
        }

        fn apply_input(&mut self, entity: EntityId, input: u32) {
            if let Some((_, last_input)) = self.entities.get_mut(&entity) {
                *last_input = input;
            }
        }
    }
}
