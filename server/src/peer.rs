//! Server-side transport endpoint
//!
//! `Peer` turns raw datagrams into connection lifecycle changes and
//! application messages, and owns everything that happens later in time:
//! reliable resends, heartbeats and delayed closes all run through one
//! [`Scheduler`] pumped by [`Peer::update`].
//!
//! Delayed events never get cancelled. Each one carries the state it was
//! scheduled against and does nothing if that state has moved on:
//! - a resend carries the message's [`SendStamp`]
//! - a heartbeat carries the connection's heartbeat epoch
//! - a close only acts on a connection still in the state it was scheduled for

use log::{debug, info, trace, warn};
use shared::{ConnectionId, Message, MessageId, Packet, PROTOCOL_VERSION};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::ServerConfig;
use crate::connection::{Admission, ConnectionManager, ConnectionState, DisconnectReason};
use crate::error::ServerError;
use crate::reliability::{PendingMessage, SendStamp};
use crate::scheduler::Scheduler;
use crate::transport::DatagramSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayedEvent {
    Resend {
        connection: ConnectionId,
        message_id: MessageId,
        stamp: SendStamp,
    },
    Heartbeat {
        connection: ConnectionId,
        epoch: u32,
    },
    CloseRejected {
        connection: ConnectionId,
    },
    Close {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
}

/// Notifications for the layer above the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected(ConnectionId),
    Message {
        connection: ConnectionId,
        message: Message,
    },
    DeliveryFailed {
        connection: ConnectionId,
        message_id: MessageId,
        kind: u16,
    },
    /// Emitted exactly once per connection, whatever closed it.
    Disconnected {
        connection: ConnectionId,
        reason: DisconnectReason,
    },
}

pub struct Peer<D: DatagramSink> {
    sink: D,
    connections: ConnectionManager,
    scheduler: Scheduler<DelayedEvent>,
    events: VecDeque<PeerEvent>,
    config: ServerConfig,
}

impl<D: DatagramSink> Peer<D> {
    pub fn new(sink: D, config: ServerConfig) -> Self {
        Self {
            sink,
            connections: ConnectionManager::new(config.max_connections),
            scheduler: Scheduler::new(),
            events: VecDeque::new(),
            config,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn connection_state(&self, connection: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(connection).map(|c| c.state())
    }

    pub fn pending_message(
        &self,
        connection: ConnectionId,
        message_id: MessageId,
    ) -> Option<&PendingMessage> {
        self.connections.get(connection)?.pending(message_id)
    }

    pub fn scheduled_events(&self) -> usize {
        self.scheduler.len()
    }

    pub fn drain_events(&mut self) -> Vec<PeerEvent> {
        self.events.drain(..).collect()
    }

    /// Handles one inbound datagram.
    pub fn receive(&mut self, bytes: &[u8], addr: SocketAddr, now: Instant) -> Result<(), ServerError> {
        let packet = shared::decode(bytes)
            .map_err(|source| ServerError::MalformedDatagram { addr, source })?;

        if let Packet::Connect { client_version } = packet {
            return self.handle_connect(client_version, addr, now);
        }

        let Some(id) = self.connections.find_by_addr(&addr) else {
            debug!("Dropping {:?} from unknown address {}", packet, addr);
            return Ok(());
        };

        if let Some(connection) = self.connections.get_mut(id) {
            connection.touch(now);
        }

        match packet {
            Packet::AcceptedAck => {
                self.promote(id);
            }

            Packet::Disconnect => {
                info!("Connection {} disconnected by remote", id);
                self.close(id, DisconnectReason::Graceful);
            }

            Packet::Heartbeat { ping_id } => {
                if let Err(e) = self.send_packet(&Packet::HeartbeatAck { ping_id }, addr) {
                    warn!("Failed to answer heartbeat from connection {}: {}", id, e);
                }
            }

            Packet::HeartbeatAck { ping_id } => {
                if let Some(connection) = self.connections.get_mut(id) {
                    if let Some(rtt) = connection.record_pong(ping_id, now) {
                        trace!("Connection {} heartbeat rtt {:?}", id, rtt);
                    }
                }
            }

            Packet::Reliable {
                id: message_id,
                message,
            } => {
                // acked even when it is a duplicate: the earlier ack may have been lost
                if let Err(e) = self.send_packet(&Packet::Ack { id: message_id }, addr) {
                    warn!("Failed to ack message {} from connection {}: {}", message_id, id, e);
                }

                if !self.accepts_data(id) {
                    debug!("Dropping reliable message {} from connection {} in its current state", message_id, id);
                    return Ok(());
                }

                let first_delivery = self
                    .connections
                    .get_mut(id)
                    .map(|c| c.received.record(message_id))
                    .unwrap_or(false);

                if first_delivery {
                    self.events.push_back(PeerEvent::Message {
                        connection: id,
                        message,
                    });
                } else {
                    trace!("Duplicate reliable message {} from connection {}", message_id, id);
                }
            }

            Packet::Ack { id: message_id } => {
                if let Some(connection) = self.connections.get_mut(id) {
                    if let Some(acked) = connection.remove_pending(message_id) {
                        // only unambiguous samples feed the estimate
                        if acked.attempts() == 1 {
                            let sample = now.saturating_duration_since(acked.last_send_time());
                            connection.rtt.update(sample);
                        }
                    }
                }
            }

            Packet::Unreliable { message } => {
                if self.accepts_data(id) {
                    self.events.push_back(PeerEvent::Message {
                        connection: id,
                        message,
                    });
                }
            }

            Packet::Connect { .. } | Packet::Accepted { .. } | Packet::Rejected { .. } => {
                warn!("Unexpected {:?} from connection {}", packet, id);
            }
        }

        Ok(())
    }

    fn handle_connect(&mut self, client_version: u32, addr: SocketAddr, now: Instant) -> Result<(), ServerError> {
        if client_version != PROTOCOL_VERSION {
            warn!(
                "Refusing {} with protocol version {} (expected {})",
                addr, client_version, PROTOCOL_VERSION
            );
            let reason = "protocol version mismatch".to_string();
            return self.send_packet(&Packet::Rejected { reason }, addr);
        }

        // a connect after the handshake completed comes from a restarted client
        if let Some(id) = self.connections.find_by_addr(&addr) {
            if self.connection_state(id) == Some(ConnectionState::Connected) {
                info!("Connection {} restarted from {}, starting a new session", id, addr);
                self.close(id, DisconnectReason::Superseded);
            }
        }

        match self.connections.admit(addr, now) {
            Admission::Accepted(id) => {
                self.start_heartbeat(id, now);
                self.send_packet(&Packet::Accepted { connection_id: id }, addr)
            }
            Admission::Existing(id) => {
                let state = self.connection_state(id);
                if let Some(connection) = self.connections.get_mut(id) {
                    connection.touch(now);
                }
                match state {
                    // the first answer may have been lost
                    Some(ConnectionState::Pending) => {
                        self.send_packet(&Packet::Accepted { connection_id: id }, addr)
                    }
                    Some(ConnectionState::Rejected) => self.send_packet(
                        &Packet::Rejected {
                            reason: "server full".to_string(),
                        },
                        addr,
                    ),
                    _ => Ok(()),
                }
            }
            Admission::Rejected(id) => {
                self.scheduler.schedule(
                    now,
                    self.config.reject_grace,
                    DelayedEvent::CloseRejected { connection: id },
                );
                self.send_packet(
                    &Packet::Rejected {
                        reason: "server full".to_string(),
                    },
                    addr,
                )
            }
        }
    }

    /// Data from a pending connection completes its handshake.
    fn accepts_data(&mut self, id: ConnectionId) -> bool {
        match self.connection_state(id) {
            Some(ConnectionState::Connected) => true,
            Some(ConnectionState::Pending) => {
                self.promote(id);
                true
            }
            _ => false,
        }
    }

    fn promote(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        if connection.state() == ConnectionState::Pending && connection.transition(ConnectionState::Connected) {
            info!("Connection {} established from {}", id, connection.addr);
            self.events.push_back(PeerEvent::Connected(id));
        }
    }

    fn start_heartbeat(&mut self, id: ConnectionId, now: Instant) {
        if let Some(connection) = self.connections.get_mut(id) {
            let epoch = connection.next_heartbeat_epoch();
            self.scheduler.schedule(
                now,
                self.config.heartbeat_interval,
                DelayedEvent::Heartbeat {
                    connection: id,
                    epoch,
                },
            );
        }
    }

    /// Sends a message that is retransmitted until acknowledged or the retry cap is hit.
    pub fn send_reliable(
        &mut self,
        connection: ConnectionId,
        message: Message,
        now: Instant,
    ) -> Result<MessageId, ServerError> {
        let target = self
            .connections
            .get_mut(connection)
            .ok_or(ServerError::UnknownConnection(connection))?;
        if !target.is_connected() {
            return Err(ServerError::NotConnected {
                connection,
                state: target.state(),
            });
        }

        let message_id = target.allocate_message_id();
        let datagram = shared::encode(&Packet::Reliable {
            id: message_id,
            message: message.clone(),
        })?;

        let mut pending = PendingMessage::new(
            message_id,
            connection,
            message,
            datagram,
            self.config.retry_cap,
            now,
        );
        let stamp = pending.record_send(now);
        let addr = target.addr;

        if let Err(e) = self.sink.send_datagram(pending.datagram(), addr) {
            warn!("Failed to send reliable message {} to {}: {}", message_id, addr, e);
        }
        target.insert_pending(pending);

        self.scheduler.schedule(
            now,
            self.config.retry_backoff.delay(self.config.retry_interval, 0),
            DelayedEvent::Resend {
                connection,
                message_id,
                stamp,
            },
        );

        Ok(message_id)
    }

    pub fn send_unreliable(&mut self, connection: ConnectionId, message: Message) -> Result<(), ServerError> {
        let target = self
            .connections
            .get(connection)
            .ok_or(ServerError::UnknownConnection(connection))?;
        if !target.is_connected() {
            return Err(ServerError::NotConnected {
                connection,
                state: target.state(),
            });
        }

        let addr = target.addr;
        self.send_packet(&Packet::Unreliable { message }, addr)
    }

    /// Sends an unreliable message to every connected endpoint.
    ///
    /// The datagram is encoded once. A failed send is logged and skipped.
    /// Returns how many endpoints it was sent to.
    pub fn broadcast(&mut self, message: Message) -> Result<usize, ServerError> {
        let datagram = shared::encode(&Packet::Unreliable { message })?;

        let mut sent = 0;
        for (id, addr) in self.connections.connected_addrs() {
            match self.sink.send_datagram(&datagram, addr) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to broadcast to connection {}: {}", id, e),
            }
        }
        Ok(sent)
    }

    /// Starts a graceful disconnect
    ///
    /// The connection stops accepting new reliable sends, the remote is told
    /// to disconnect, and outstanding messages keep resending until the drain
    /// period closes the connection. Disconnecting an already closing
    /// connection does nothing.
    pub fn disconnect(
        &mut self,
        connection: ConnectionId,
        reason: DisconnectReason,
        now: Instant,
    ) -> Result<(), ServerError> {
        let target = self
            .connections
            .get_mut(connection)
            .ok_or(ServerError::UnknownConnection(connection))?;

        if !target.transition(ConnectionState::Disconnecting) {
            return Ok(());
        }

        info!("Disconnecting connection {}: {}", connection, reason.as_str());
        let addr = target.addr;
        self.scheduler.schedule(
            now,
            self.config.disconnect_drain,
            DelayedEvent::Close { connection, reason },
        );
        self.send_packet(&Packet::Disconnect, addr)
    }

    /// Runs every delayed event due at `now`.
    ///
    /// Events scheduled by a firing event run in the same call if they are
    /// already due. Failures are logged and do not stop the remaining events.
    /// Returns the number of events fired.
    pub fn update(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(event) = self.scheduler.pop_due(now) {
            fired += 1;
            if let Err(e) = self.fire(event, now) {
                warn!("{}", e);
            }
        }
        fired
    }

    fn fire(&mut self, event: DelayedEvent, now: Instant) -> Result<(), ServerError> {
        match event {
            DelayedEvent::Resend {
                connection,
                message_id,
                stamp,
            } => self.resend(connection, message_id, stamp, now),

            DelayedEvent::Heartbeat { connection, epoch } => self.heartbeat(connection, epoch, now),

            DelayedEvent::CloseRejected { connection } => {
                if self.connection_state(connection) == Some(ConnectionState::Rejected) {
                    self.close(connection, DisconnectReason::Rejected);
                }
                Ok(())
            }

            DelayedEvent::Close { connection, reason } => {
                if self.connection_state(connection) == Some(ConnectionState::Disconnecting) {
                    self.close(connection, reason);
                }
                Ok(())
            }
        }
    }

    fn resend(
        &mut self,
        connection: ConnectionId,
        message_id: MessageId,
        stamp: SendStamp,
        now: Instant,
    ) -> Result<(), ServerError> {
        let Some(target) = self.connections.get_mut(connection) else {
            return Ok(());
        };
        if !matches!(
            target.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            return Ok(());
        }
        let addr = target.addr;
        let Some(pending) = target.pending_mut(message_id) else {
            trace!("Resend of acknowledged message {} skipped", message_id);
            return Ok(());
        };
        if !pending.is_current(stamp) {
            trace!("Stale resend of message {} skipped", message_id);
            return Ok(());
        }

        if pending.retries_exhausted() {
            let retries = pending.retries();
            let kind = pending.message.kind;
            target.remove_pending(message_id);
            target.failed_deliveries += 1;

            self.events.push_back(PeerEvent::DeliveryFailed {
                connection,
                message_id,
                kind,
            });
            return Err(ServerError::DeliveryFailure {
                connection,
                message_id,
                kind,
                retries,
            });
        }

        let stamp = pending.record_send(now);
        let retries = pending.retries();
        if let Err(e) = self.sink.send_datagram(pending.datagram(), addr) {
            warn!("Failed to resend message {} to {}: {}", message_id, addr, e);
        }
        debug!("Resent message {} to connection {} (retry {})", message_id, connection, retries);

        self.scheduler.schedule(
            now,
            self.config.retry_backoff.delay(self.config.retry_interval, retries),
            DelayedEvent::Resend {
                connection,
                message_id,
                stamp,
            },
        );
        Ok(())
    }

    fn heartbeat(&mut self, connection: ConnectionId, epoch: u32, now: Instant) -> Result<(), ServerError> {
        let Some(target) = self.connections.get_mut(connection) else {
            return Ok(());
        };
        if target.heartbeat_epoch() != epoch
            || !matches!(target.state(), ConnectionState::Pending | ConnectionState::Connected)
        {
            return Ok(());
        }

        if target.is_timed_out(now, self.config.heartbeat_timeout) {
            let silent_for = target.silent_for(now);
            self.disconnect(connection, DisconnectReason::Timeout, now)?;
            return Err(ServerError::ConnectionTimeout {
                connection,
                silent_for,
            });
        }

        let ping_id = target.record_ping(now);
        let addr = target.addr;
        self.scheduler.schedule(
            now,
            self.config.heartbeat_interval,
            DelayedEvent::Heartbeat { connection, epoch },
        );
        self.send_packet(&Packet::Heartbeat { ping_id }, addr)
    }

    /// Removes a connection and reports it. Everything still scheduled for it goes stale.
    fn close(&mut self, connection: ConnectionId, reason: DisconnectReason) -> bool {
        let Some(closed) = self.connections.remove(connection) else {
            return false;
        };

        if closed.pending_count() > 0 {
            debug!(
                "Connection {} closed with {} unacknowledged messages",
                connection,
                closed.pending_count()
            );
        }
        info!("Connection {} closed: {}", connection, reason.as_str());
        self.events.push_back(PeerEvent::Disconnected { connection, reason });
        true
    }

    /// Tells every open connection to disconnect and closes them all.
    pub fn shutdown(&mut self) -> usize {
        let open: Vec<(ConnectionId, SocketAddr)> = self
            .connections
            .iter()
            .filter(|c| c.state().occupies_slot())
            .map(|c| (c.id, c.addr))
            .collect();
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.id).collect();

        for (id, addr) in &open {
            if let Err(e) = self.send_packet(&Packet::Disconnect, *addr) {
                warn!("Failed to notify connection {} of shutdown: {}", id, e);
            }
        }
        for id in ids {
            self.close(id, DisconnectReason::Shutdown);
        }
        open.len()
    }

    fn send_packet(&self, packet: &Packet, addr: SocketAddr) -> Result<(), ServerError> {
        let bytes = shared::encode(packet)?;
        self.sink.send_datagram(&bytes, addr)?;
        Ok(())
    }
}
