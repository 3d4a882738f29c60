//! Connection lifecycle and bookkeeping for remote endpoints
//!
//! This module handles the server-side view of every remote endpoint:
//! - Connection states (pending, connected, disconnecting, rejected, closed)
//! - Admission against the connection capacity
//! - Liveness tracking and round-trip time estimation
//! - Ownership of the reliable messages still awaiting acknowledgment
//!
//! Connection ids are handed out monotonically and never reused, so an id
//! captured by a delayed event can never point at a different endpoint later.

use log::info;
use shared::{ConnectionId, MessageId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::reliability::{PendingMessage, ReceivedWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted by the server, waiting for the remote to confirm.
    Pending,
    Connected,
    /// Draining outstanding reliable sends before closing.
    Disconnecting,
    /// Refused; kept around briefly so the rejection can reach the remote.
    Rejected,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Pending, Connected)
                | (Pending, Rejected)
                | (Pending, Disconnecting)
                | (Pending, Closed)
                | (Connected, Disconnecting)
                | (Connected, Rejected)
                | (Connected, Closed)
                | (Disconnecting, Closed)
                | (Rejected, Closed)
        )
    }

    /// Counts against the connection capacity.
    pub fn occupies_slot(self) -> bool {
        matches!(
            self,
            ConnectionState::Pending | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote asked to leave.
    Graceful,
    Timeout,
    /// Refused at admission.
    Rejected,
    /// The player joined again from another connection.
    Superseded,
    DeliveryFailure,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Rejected => "rejected",
            DisconnectReason::Superseded => "superseded by a newer connection",
            DisconnectReason::DeliveryFailure => "dropped after a delivery failure",
            DisconnectReason::Shutdown => "closed by server shutdown",
        }
    }
}

/// Smoothed round-trip time estimate (SRTT / RTTVAR).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: f32,
    rtt_var_ms: f32,
    samples: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt_ms: 100.0,
            rtt_var_ms: 50.0,
            samples: 0,
        }
    }
}

impl RttEstimator {
    pub fn update(&mut self, sample: Duration) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let rtt = sample.as_secs_f32() * 1000.0;
        if self.samples == 0 {
            self.srtt_ms = rtt;
            self.rtt_var_ms = rtt / 2.0;
        } else {
            let diff = (rtt - self.srtt_ms).abs();
            self.rtt_var_ms = (1.0 - BETA) * self.rtt_var_ms + BETA * diff;
            self.srtt_ms = (1.0 - ALPHA) * self.srtt_ms + ALPHA * rtt;
        }
        self.samples += 1;
    }

    pub fn srtt_ms(&self) -> f32 {
        self.srtt_ms
    }

    pub fn rtt_var_ms(&self) -> f32 {
        self.rtt_var_ms
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

/// One remote endpoint as seen by the server
///
/// Each connection owns:
/// - Its lifecycle state and last-heard time for liveness checks
/// - The reliable messages it still has to see acknowledged
/// - The window of reliable ids it already delivered to the application
/// - Heartbeat bookkeeping and the RTT estimate derived from it
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    state: ConnectionState,
    /// Last time any datagram arrived from this endpoint
    pub last_heard: Instant,
    pub connected_at: Instant,
    pending: HashMap<MessageId, PendingMessage>,
    next_message_id: MessageId,
    pub received: ReceivedWindow,
    pub rtt: RttEstimator,
    heartbeat_epoch: u32,
    next_ping_id: u16,
    outstanding_ping: Option<(u16, Instant)>,
    pub failed_deliveries: u32,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, state: ConnectionState, now: Instant) -> Self {
        Self {
            id,
            addr,
            state,
            last_heard: now,
            connected_at: now,
            pending: HashMap::new(),
            next_message_id: 0,
            received: ReceivedWindow::default(),
            rtt: RttEstimator::default(),
            heartbeat_epoch: 0,
            next_ping_id: 0,
            outstanding_ping: None,
            failed_deliveries: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Moves to `next` if the lifecycle allows it. Returns whether the state changed.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Records inbound traffic, which resets the liveness timer.
    pub fn touch(&mut self, now: Instant) {
        self.last_heard = now;
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heard)
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.silent_for(now) >= timeout
    }

    pub fn allocate_message_id(&mut self) -> MessageId {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    pub fn insert_pending(&mut self, message: PendingMessage) {
        self.pending.insert(message.id, message);
    }

    pub fn pending(&self, id: MessageId) -> Option<&PendingMessage> {
        self.pending.get(&id)
    }

    pub fn pending_mut(&mut self, id: MessageId) -> Option<&mut PendingMessage> {
        self.pending.get_mut(&id)
    }

    pub fn remove_pending(&mut self, id: MessageId) -> Option<PendingMessage> {
        self.pending.remove(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Starts a new heartbeat chain; older chains become stale.
    pub fn next_heartbeat_epoch(&mut self) -> u32 {
        self.heartbeat_epoch = self.heartbeat_epoch.wrapping_add(1);
        self.heartbeat_epoch
    }

    pub fn heartbeat_epoch(&self) -> u32 {
        self.heartbeat_epoch
    }

    pub fn record_ping(&mut self, now: Instant) -> u16 {
        let ping_id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.outstanding_ping = Some((ping_id, now));
        ping_id
    }

    /// Matches a heartbeat ack against the outstanding ping and feeds the RTT estimate.
    pub fn record_pong(&mut self, ping_id: u16, now: Instant) -> Option<Duration> {
        match self.outstanding_ping {
            Some((expected, sent_at)) if expected == ping_id => {
                self.outstanding_ping = None;
                let sample = now.saturating_duration_since(sent_at);
                self.rtt.update(sample);
                Some(sample)
            }
            _ => None,
        }
    }
}

/// Result of admitting a remote address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted(ConnectionId),
    /// The address already has a connection.
    Existing(ConnectionId),
    Rejected(ConnectionId),
}

/// Tracks every connection and enforces the connection capacity
///
/// Connections are indexed both by id and by remote address so inbound
/// datagrams can be demultiplexed without scanning.
#[derive(Debug)]
pub struct ConnectionManager {
    connections: HashMap<ConnectionId, Connection>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    next_connection_id: ConnectionId,
    max_connections: usize,
}

impl ConnectionManager {
    /// Creates an empty manager. Connection ids start from 1.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            by_addr: HashMap::new(),
            next_connection_id: 1,
            max_connections,
        }
    }

    /// Admits a remote address
    ///
    /// A known address returns its existing connection. Otherwise a new
    /// connection is created, `Pending` when a slot is free and `Rejected`
    /// when the server is at capacity.
    pub fn admit(&mut self, addr: SocketAddr, now: Instant) -> Admission {
        if let Some(&id) = self.by_addr.get(&addr) {
            return Admission::Existing(id);
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let at_capacity = self.occupied_slots() >= self.max_connections;
        let state = if at_capacity {
            ConnectionState::Rejected
        } else {
            ConnectionState::Pending
        };

        self.connections
            .insert(id, Connection::new(id, addr, state, now));
        self.by_addr.insert(addr, id);

        if at_capacity {
            info!("Rejecting connection {} from {}: server full", id, addr);
            Admission::Rejected(id)
        } else {
            info!("Connection {} pending from {}", id, addr);
            Admission::Accepted(id)
        }
    }

    /// Removes a connection, marking it closed. Returns `None` if it was already gone.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut connection = self.connections.remove(&id)?;
        self.by_addr.remove(&connection.addr);
        connection.transition(ConnectionState::Closed);
        Some(connection)
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<ConnectionId> {
        self.by_addr.get(addr).copied()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Ids and addresses of all fully connected endpoints, used for broadcasts.
    pub fn connected_addrs(&self) -> Vec<(ConnectionId, SocketAddr)> {
        self.connections
            .values()
            .filter(|c| c.is_connected())
            .map(|c| (c.id, c.addr))
            .collect()
    }

    pub fn occupied_slots(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state().occupies_slot())
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
