//! Game-facing server context
//!
//! `GameServer` owns the transport [`Peer`], the [`Directory`] and handles
//! to the shared simulation and outbound queue. It is the single place
//! where inbound game messages are dispatched and where transport events
//! turn into directory and world changes:
//! - `JoinRequest` allocates or reuses a player and binds the connection to
//!   its entity, answering with a reliable `JoinResponse`
//! - `InputRequest` is routed to the entity the sending connection drives
//! - a closed connection releases its entity from the world
//!
//! Nothing in here is global. The async runner in [`crate::network`] drives
//! one `GameServer` from a single task, which keeps inbound dispatch and the
//! network tick from ever running at the same time.

use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{
    ConnectionId, DecodeError, EntityId, GameMessage, InputRequest, JoinRequest, JoinResponse, Message, MessageKind,
    PlayerId,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{RebindPolicy, ServerConfig};
use crate::connection::DisconnectReason;
use crate::directory::Directory;
use crate::error::ServerError;
use crate::peer::{Peer, PeerEvent};
use crate::simulation::{OutboundQueue, Simulation};
use crate::transport::DatagramSink;

/// Decides whether a login may join.
pub trait CredentialCheck: Send {
    fn authenticate(&self, login: &str, password: &str) -> bool;
}

/// Lets everyone in.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl CredentialCheck for AcceptAll {
    fn authenticate(&self, _login: &str, _password: &str) -> bool {
        true
    }
}

/// What one network tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NetworkTick {
    /// Messages taken from the outbound queue.
    pub messages: usize,
    /// Datagrams those messages turned into.
    pub datagrams: usize,
    /// Delayed events fired.
    pub events: usize,
}

pub struct GameServer<S: Simulation, D: DatagramSink> {
    peer: Peer<D>,
    directory: Directory,
    simulation: Arc<Mutex<S>>,
    outbound: Arc<OutboundQueue>,
    credentials: Box<dyn CredentialCheck>,
    config: ServerConfig,
}

impl<S: Simulation, D: DatagramSink> GameServer<S, D> {
    pub fn new(sink: D, simulation: Arc<Mutex<S>>, outbound: Arc<OutboundQueue>, config: ServerConfig) -> Self {
        Self {
            peer: Peer::new(sink, config.clone()),
            directory: Directory::new(config.reserved_player_ids),
            simulation,
            outbound,
            credentials: Box::new(AcceptAll),
            config,
        }
    }

    pub fn with_credentials(mut self, credentials: Box<dyn CredentialCheck>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn peer(&self) -> &Peer<D> {
        &self.peer
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Registers an entity that exists without a connection, such as a bot.
    pub fn attach_entity(&mut self, player_id: PlayerId, entity: EntityId) {
        self.directory.attach(player_id, entity);
    }

    /// Feeds one inbound datagram through the transport and dispatches what it produced.
    pub fn handle_datagram(&mut self, bytes: &[u8], addr: SocketAddr, now: Instant) -> Result<(), ServerError> {
        let result = self.peer.receive(bytes, addr, now);
        self.process_events(now);
        result
    }

    /// Broadcasts everything the simulation queued, then runs due delayed events.
    pub fn network_tick(&mut self, now: Instant) -> NetworkTick {
        let batch = self.outbound.drain();
        let mut tick = NetworkTick {
            messages: batch.len(),
            ..Default::default()
        };

        for message in batch {
            match self.peer.broadcast(message) {
                Ok(sent) => tick.datagrams += sent,
                Err(e) => warn!("Broadcast failed: {}", e),
            }
        }

        tick.events = self.peer.update(now);
        self.process_events(now);
        tick
    }

    /// Disconnects everyone and releases their entities.
    pub fn shutdown(&mut self, now: Instant) {
        let notified = self.peer.shutdown();
        info!("Shutdown: notified {} connections", notified);
        self.process_events(now);
    }

    fn process_events(&mut self, now: Instant) {
        loop {
            let events = self.peer.drain_events();
            if events.is_empty() {
                break;
            }

            for event in events {
                if let Err(e) = self.handle_event(event, now) {
                    warn!("{}", e);
                }
            }
        }
    }

    fn handle_event(&mut self, event: PeerEvent, now: Instant) -> Result<(), ServerError> {
        match event {
            PeerEvent::Connected(connection) => {
                debug!("Connection {} ready for game messages", connection);
                Ok(())
            }

            PeerEvent::Message { connection, message } => self.handle(connection, message, now),

            PeerEvent::DeliveryFailed {
                connection,
                message_id,
                kind,
            } => {
                if self.config.close_on_delivery_failure {
                    warn!(
                        "Closing connection {} after message {} (kind {}) was not delivered",
                        connection, message_id, kind
                    );
                    self.peer.disconnect(connection, DisconnectReason::DeliveryFailure, now)?;
                }
                Ok(())
            }

            PeerEvent::Disconnected { connection, reason } => {
                if let Some(entity) = self.directory.unbind(connection) {
                    self.simulation.lock().despawn_entity(entity);
                    info!(
                        "Released entity {} of connection {} ({})",
                        entity,
                        connection,
                        reason.as_str()
                    );
                }
                Ok(())
            }
        }
    }

    /// Dispatches one inbound game message by its kind tag.
    pub fn handle(&mut self, connection: ConnectionId, message: Message, now: Instant) -> Result<(), ServerError> {
        let kind = message.kind;
        let malformed = |source: DecodeError| ServerError::MalformedMessage {
            connection,
            kind,
            source,
        };

        match MessageKind::from_tag(kind) {
            Some(MessageKind::JoinRequest) => {
                let request = JoinRequest::from_message(&message).map_err(malformed)?;
                self.handle_join(connection, request, now)
            }

            Some(MessageKind::InputRequest) => {
                let entity = self
                    .directory
                    .resolve(connection)
                    .ok_or(ServerError::UnregisteredSender(connection))?;
                let request = InputRequest::from_message(&message).map_err(malformed)?;
                self.simulation.lock().apply_input(entity, request.input);
                Ok(())
            }

            _ => Err(ServerError::UnexpectedMessage { connection, kind }),
        }
    }

    fn handle_join(&mut self, connection: ConnectionId, request: JoinRequest, now: Instant) -> Result<(), ServerError> {
        if !self.credentials.authenticate(&request.login, &request.password) {
            self.peer.disconnect(connection, DisconnectReason::Rejected, now)?;
            return Err(ServerError::AuthenticationFailed { login: request.login });
        }

        let player_id = match self.directory.join(&request.login) {
            Ok(player_id) => player_id,
            Err(e) => {
                self.peer.disconnect(connection, DisconnectReason::Rejected, now)?;
                return Err(e);
            }
        };
        let binding = {
            let mut simulation = self.simulation.lock();
            self.directory.bind(connection, player_id, &mut *simulation)
        };

        if let Some(previous) = binding.displaced {
            match self.config.rebind_policy {
                RebindPolicy::DisconnectPrevious => {
                    if let Err(e) = self.peer.disconnect(previous, DisconnectReason::Superseded, now) {
                        debug!("Superseded connection {} already gone: {}", previous, e);
                    }
                }
                RebindPolicy::KeepPrevious => {
                    info!(
                        "Connection {} no longer drives entity {}",
                        previous, binding.entity
                    );
                }
            }
        }

        let response = JoinResponse {
            player_id,
            entity_id: binding.entity,
        }
        .to_message()?;
        self.peer.send_reliable(connection, response, now)?;

        info!(
            "Connection {} joined as player {} ({:?}) driving entity {}{}",
            connection,
            player_id,
            request.login,
            binding.entity,
            if binding.spawned { ", newly spawned" } else { "" }
        );
        Ok(())
    }
}
