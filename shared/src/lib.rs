//! Wire protocol shared by the server and its clients.
//!
//! Every datagram is one bincode-encoded [`Packet`]. The transport layer only
//! looks at the packet frame; application data travels inside a [`Message`],
//! which is an opaque payload tagged with a [`MessageKind`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_DATAGRAM_SIZE: usize = 8192;

pub type ConnectionId = u32;
pub type MessageId = u16;
pub type PlayerId = u16;
pub type EntityId = u32;

pub const INPUT_UP: u32 = 1 << 0;
pub const INPUT_DOWN: u32 = 1 << 1;
pub const INPUT_LEFT: u32 = 1 << 2;
pub const INPUT_RIGHT: u32 = 1 << 3;
pub const INPUT_ATTACK_1: u32 = 1 << 4;
pub const INPUT_ATTACK_2: u32 = 1 << 5;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect { client_version: u32 },
    Accepted { connection_id: ConnectionId },
    AcceptedAck,
    Rejected { reason: String },
    Disconnect,

    Heartbeat { ping_id: u16 },
    HeartbeatAck { ping_id: u16 },

    Reliable { id: MessageId, message: Message },
    Ack { id: MessageId },
    Unreliable { message: Message },
}

/// Application payload as seen by the transport: a kind tag and raw bytes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: u16, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinRequest,
    JoinResponse,
    InputRequest,
    SnapshotBroadcast,
}

impl MessageKind {
    pub fn tag(self) -> u16 {
        match self {
            MessageKind::JoinRequest => 1,
            MessageKind::JoinResponse => 2,
            MessageKind::InputRequest => 3,
            MessageKind::SnapshotBroadcast => 4,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(MessageKind::JoinRequest),
            2 => Some(MessageKind::JoinResponse),
            3 => Some(MessageKind::InputRequest),
            4 => Some(MessageKind::SnapshotBroadcast),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("expected message kind {expected}, got {actual}")]
    KindMismatch { expected: u16, actual: u16 },
    #[error("datagram of {0} bytes exceeds the datagram size limit")]
    Oversized(usize),
    #[error("invalid payload: {0}")]
    Payload(#[from] bincode::Error),
}

/// Typed application message carried inside a [`Message`].
pub trait GameMessage: Serialize + DeserializeOwned {
    const KIND: MessageKind;

    fn to_message(&self) -> Result<Message, bincode::Error> {
        Ok(Message::new(Self::KIND.tag(), bincode::serialize(self)?))
    }

    fn from_message(message: &Message) -> Result<Self, DecodeError> {
        if message.kind != Self::KIND.tag() {
            return Err(DecodeError::KindMismatch {
                expected: Self::KIND.tag(),
                actual: message.kind,
            });
        }
        Ok(bincode::deserialize(&message.payload)?)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JoinRequest {
    pub login: String,
    pub password: String,
}

impl GameMessage for JoinRequest {
    const KIND: MessageKind = MessageKind::JoinRequest;
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JoinResponse {
    pub player_id: PlayerId,
    pub entity_id: EntityId,
}

impl GameMessage for JoinResponse {
    const KIND: MessageKind = MessageKind::JoinResponse;
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct InputRequest {
    pub input: u32,
}

impl InputRequest {
    pub fn is_pressed(&self, flag: u32) -> bool {
        self.input & flag != 0
    }
}

impl GameMessage for InputRequest {
    const KIND: MessageKind = MessageKind::InputRequest;
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SnapshotBroadcast {
    pub tick: u64,
    pub entities: Vec<EntitySnapshot>,
}

impl GameMessage for SnapshotBroadcast {
    const KIND: MessageKind = MessageKind::SnapshotBroadcast;
}

/// Authoritative state of one live entity at a snapshot tick.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    pub player_id: PlayerId,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub view_id: u8,
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(packet)
}

pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DecodeError::Oversized(bytes.len()));
    }
    Ok(bincode::deserialize(bytes)?)
}
