//! Outstanding reliable messages and the stamps that keep their resends honest.

use shared::{ConnectionId, Message, MessageId};
use std::collections::VecDeque;
use std::time::Instant;

/// Snapshot of a pending message's send state, captured by its resend event.
///
/// The attempt count is part of the stamp so that two sends at the same clock
/// reading still produce different stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendStamp {
    pub sent_at: Instant,
    pub attempt: u32,
}

/// One reliable message awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: MessageId,
    pub connection: ConnectionId,
    pub message: Message,
    /// Encoded datagram, retransmitted verbatim.
    datagram: Vec<u8>,
    last_send_time: Instant,
    attempts: u32,
    max_retries: u32,
}

impl PendingMessage {
    pub fn new(
        id: MessageId,
        connection: ConnectionId,
        message: Message,
        datagram: Vec<u8>,
        max_retries: u32,
        now: Instant,
    ) -> Self {
        Self {
            id,
            connection,
            message,
            datagram,
            last_send_time: now,
            attempts: 0,
            max_retries,
        }
    }

    /// Marks a (re)transmission at `now` and returns the stamp for the next resend event.
    pub fn record_send(&mut self, now: Instant) -> SendStamp {
        self.last_send_time = now;
        self.attempts += 1;
        self.stamp()
    }

    pub fn stamp(&self) -> SendStamp {
        SendStamp {
            sent_at: self.last_send_time,
            attempt: self.attempts,
        }
    }

    pub fn is_current(&self, stamp: SendStamp) -> bool {
        self.stamp() == stamp
    }

    pub fn datagram(&self) -> &[u8] {
        &self.datagram
    }

    pub fn last_send_time(&self) -> Instant {
        self.last_send_time
    }

    /// Total transmissions so far, the first send included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries() >= self.max_retries
    }
}

/// Remembers recently delivered reliable ids so retransmissions reach the
/// application only once.
#[derive(Debug)]
pub struct ReceivedWindow {
    recent: VecDeque<MessageId>,
    capacity: usize,
}

impl Default for ReceivedWindow {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ReceivedWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true the first time an id is seen within the window.
    pub fn record(&mut self, id: MessageId) -> bool {
        if self.recent.contains(&id) {
            return false;
        }

        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(id);

        true
    }
}
