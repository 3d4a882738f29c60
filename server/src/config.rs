use std::time::Duration;

use crate::error::ConfigError;

/// What happens to an older connection when its player's entity is rebound
/// to a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RebindPolicy {
    /// The superseded connection is gracefully disconnected.
    DisconnectPrevious,
    /// The superseded connection stays open but can no longer drive the entity.
    KeepPrevious,
}

/// Delay between retransmissions of an unacknowledged reliable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    Fixed,
    /// Doubles the interval on every retry, capped at `max`.
    Exponential { max: Duration },
}

impl RetryBackoff {
    pub fn delay(&self, base: Duration, retries: u32) -> Duration {
        match self {
            RetryBackoff::Fixed => base,
            RetryBackoff::Exponential { max } => {
                let factor = 1u32.checked_shl(retries.min(16)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interval of both the network loop and the simulation loop.
    pub tick_interval: Duration,
    /// Emit a snapshot every K simulation ticks.
    pub snapshot_every: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub retry_interval: Duration,
    pub retry_cap: u32,
    pub retry_backoff: RetryBackoff,
    pub max_connections: usize,
    /// How long a rejected connection lingers so the rejection can reach the peer.
    pub reject_grace: Duration,
    /// How long a disconnecting connection keeps resending before it is closed.
    pub disconnect_drain: Duration,
    pub rebind_policy: RebindPolicy,
    pub close_on_delivery_failure: bool,
    /// Player ids `1..=reserved_player_ids` belong to server-side bots.
    pub reserved_player_ids: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(33),
            snapshot_every: 3,
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_timeout: Duration::from_millis(5000),
            retry_interval: Duration::from_millis(200),
            retry_cap: 10,
            retry_backoff: RetryBackoff::Fixed,
            max_connections: 100,
            reject_grace: Duration::from_millis(500),
            disconnect_drain: Duration::from_millis(1000),
            rebind_policy: RebindPolicy::DisconnectPrevious,
            close_on_delivery_failure: false,
            reserved_player_ids: 0,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Zero("tick interval"));
        }
        if self.snapshot_every == 0 {
            return Err(ConfigError::Zero("snapshot decimation factor"));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::Zero("retry interval"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat interval"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Zero("max connections"));
        }

        let interval = self.heartbeat_interval.as_nanos();
        let timeout = self.heartbeat_timeout.as_nanos();
        if timeout < interval * 2 || timeout % interval != 0 {
            return Err(ConfigError::HeartbeatTimeout {
                timeout: self.heartbeat_timeout,
                interval: self.heartbeat_interval,
            });
        }

        Ok(())
    }

    /// Fixed simulation step in seconds.
    pub fn tick_seconds(&self) -> f32 {
        self.tick_interval.as_secs_f32()
    }
}
