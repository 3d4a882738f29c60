//! Error kinds surfaced by the transport and the tick loops.
//!
//! None of these are fatal: every per-tick or per-message operation logs the
//! error and carries on serving the remaining connections.

use shared::{ConnectionId, DecodeError, MessageId};
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::connection::ConnectionState;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("malformed message (kind {kind}) from connection {connection}: {source}")]
    MalformedMessage {
        connection: ConnectionId,
        kind: u16,
        #[source]
        source: DecodeError,
    },

    #[error("undecodable datagram from {addr}: {source}")]
    MalformedDatagram {
        addr: std::net::SocketAddr,
        #[source]
        source: DecodeError,
    },

    #[error("message from unregistered connection {0} dropped")]
    UnregisteredSender(ConnectionId),

    #[error("reliable message {message_id} (kind {kind}) to connection {connection} dropped after {retries} retries")]
    DeliveryFailure {
        connection: ConnectionId,
        message_id: MessageId,
        kind: u16,
        retries: u32,
    },

    #[error("connection {connection} timed out after {silent_for:?} without traffic")]
    ConnectionTimeout {
        connection: ConnectionId,
        silent_for: Duration,
    },

    #[error("snapshot for tick {tick} could not be built: {reason}")]
    SnapshotBuildFailure { tick: u64, reason: String },

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {connection} cannot send in state {state:?}")]
    NotConnected {
        connection: ConnectionId,
        state: ConnectionState,
    },

    #[error("unexpected message kind {kind} from connection {connection}")]
    UnexpectedMessage { connection: ConnectionId, kind: u16 },

    #[error("credentials for login {login:?} rejected")]
    AuthenticationFailed { login: String },

    #[error("no player id left for login {login:?}")]
    PlayerIdsExhausted { login: String },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("heartbeat timeout {timeout:?} must be a multiple of the heartbeat interval {interval:?} and at least twice it")]
    HeartbeatTimeout { timeout: Duration, interval: Duration },
}
