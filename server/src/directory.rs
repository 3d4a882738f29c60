//! Maps logins to durable player ids and connections to the entities they drive.
//!
//! Player records live for the whole process. An entity belongs to its
//! player across reconnects and is reachable from at most one connection:
//! binding it to a new connection takes it away from the old one.

use log::{debug, info};
use shared::{ConnectionId, EntityId, PlayerId};
use std::collections::HashMap;

use crate::error::ServerError;
use crate::simulation::Simulation;

/// Result of binding a connection to a player's entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub player_id: PlayerId,
    pub entity: EntityId,
    /// A new entity was spawned because the player had none alive.
    pub spawned: bool,
    /// Connection that drove the entity until now.
    pub displaced: Option<ConnectionId>,
}

#[derive(Debug, Default)]
pub struct Directory {
    players: HashMap<String, PlayerId>,
    /// Wider than `PlayerId` so running past the last id is detectable.
    next_player_id: u32,
    entities: HashMap<PlayerId, EntityId>,
    by_connection: HashMap<ConnectionId, EntityId>,
    by_entity: HashMap<EntityId, ConnectionId>,
}

impl Directory {
    /// Player ids `1..=reserved` are never handed out to logins.
    pub fn new(reserved: PlayerId) -> Self {
        Self {
            next_player_id: u32::from(reserved) + 1,
            ..Default::default()
        }
    }

    /// Returns the player id for a login, allocating one on first sight.
    ///
    /// Ids are never reused, so a new login fails once the id space is spent.
    pub fn join(&mut self, login: &str) -> Result<PlayerId, ServerError> {
        if let Some(&player_id) = self.players.get(login) {
            return Ok(player_id);
        }

        let player_id = PlayerId::try_from(self.next_player_id).map_err(|_| ServerError::PlayerIdsExhausted {
            login: login.to_string(),
        })?;
        self.next_player_id += 1;
        self.players.insert(login.to_string(), player_id);
        info!("New player {} for login {:?}", player_id, login);
        Ok(player_id)
    }

    /// Records an entity that exists without a connection, such as a bot.
    pub fn attach(&mut self, player_id: PlayerId, entity: EntityId) {
        self.entities.insert(player_id, entity);
    }

    /// Binds a connection to the player's live entity, spawning one if needed.
    pub fn bind<S: Simulation + ?Sized>(
        &mut self,
        connection: ConnectionId,
        player_id: PlayerId,
        simulation: &mut S,
    ) -> Binding {
        let (entity, spawned) = match self.entities.get(&player_id) {
            Some(&entity) if simulation.entity_is_alive(entity) => (entity, false),
            _ => {
                let entity = simulation.spawn_entity(player_id);
                self.entities.insert(player_id, entity);
                (entity, true)
            }
        };

        // a connection drives one entity at a time
        if let Some(previous) = self.by_connection.insert(connection, entity) {
            if previous != entity && self.by_entity.get(&previous) == Some(&connection) {
                self.by_entity.remove(&previous);
            }
        }

        let displaced = match self.by_entity.insert(entity, connection) {
            Some(old) if old != connection => {
                if self.by_connection.get(&old) == Some(&entity) {
                    self.by_connection.remove(&old);
                }
                debug!("Entity {} moved from connection {} to {}", entity, old, connection);
                Some(old)
            }
            _ => None,
        };

        Binding {
            player_id,
            entity,
            spawned,
            displaced,
        }
    }

    pub fn resolve(&self, connection: ConnectionId) -> Option<EntityId> {
        self.by_connection.get(&connection).copied()
    }

    pub fn connection_of(&self, entity: EntityId) -> Option<ConnectionId> {
        self.by_entity.get(&entity).copied()
    }

    pub fn entity_of(&self, player_id: PlayerId) -> Option<EntityId> {
        self.entities.get(&player_id).copied()
    }

    /// Forgets the connection's mapping and returns the entity it drove.
    pub fn unbind(&mut self, connection: ConnectionId) -> Option<EntityId> {
        let entity = self.by_connection.remove(&connection)?;
        if self.by_entity.get(&entity) == Some(&connection) {
            self.by_entity.remove(&entity);
        }
        Some(entity)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn bound_connections(&self) -> usize {
        self.by_connection.len()
    }
}
