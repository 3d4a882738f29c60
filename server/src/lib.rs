//! # Game Server Library
//!
//! This library provides an authoritative game server speaking a small
//! reliable-delivery protocol over UDP. It accepts connections, tracks their
//! liveness, routes player input into a simulation and broadcasts snapshots
//! of the simulated world back to every connected client.
//!
//! ## Core Responsibilities
//!
//! ### Reliable Delivery
//! Messages that must arrive (joins, join responses, inputs) are resent on a
//! timer until the remote acknowledges them or a retry cap is reached.
//! Frequent state (snapshots) goes out unreliably, since a newer snapshot
//! replaces a lost one anyway.
//!
//! ### Connection Lifecycle
//! Every remote endpoint moves through `Pending`, `Connected`,
//! `Disconnecting` or `Rejected`, and finally `Closed`. Heartbeats measure
//! round-trip time and detect silent peers; a connection that stays silent
//! for the configured timeout is closed exactly once.
//!
//! ### Player Directory
//! Logins map to durable player ids. A player keeps its entity across
//! reconnects: joining again binds the new connection to the existing
//! entity instead of spawning a second one.
//!
//! ## Architecture Design
//!
//! ### Staleness Instead Of Cancellation
//! Everything that happens later (resends, heartbeats, delayed closes) is a
//! one-shot event in a single scheduler. Events are never removed; each
//! captures the state it was scheduled against and does nothing if that
//! state has changed by the time it fires.
//!
//! ### Two Independent Loops
//! The network loop and the simulation loop run on separate fixed-rate
//! timers. The only state they share is the outbound queue: the simulation
//! pushes snapshot broadcasts, the network loop drains and sends them.
//!
//! ### Single-Threaded Dispatch
//! Inbound datagrams, network ticks and delayed events are all handled by
//! one task, so connection and directory state need no locking of their own.
//!
//! ## Module Organization
//!
//! - `scheduler`: wall-clock scheduler for one-shot delayed events
//! - `reliability`: pending reliable messages and duplicate suppression
//! - `connection`: connection states, RTT estimation and admission
//! - `transport`: the datagram output seam
//! - `peer`: the protocol endpoint tying the above together
//! - `directory`: login, player and entity bookkeeping
//! - `simulation`: the world interface, snapshot loop and outbound queue
//! - `world`: a reference top-down world with bots
//! - `server`: game message dispatch on top of the transport
//! - `network`: the async runner binding it all to a socket
//! - `config` and `error`: settings and error kinds
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use parking_lot::Mutex;
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::world::World;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let world = Arc::new(Mutex::new(World::new()));
//!     let server = Server::bind("127.0.0.1:8080", world, ServerConfig::default()).await?;
//!
//!     // Runs the receiver, network loop and simulation loop until shut down
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod network;
pub mod peer;
pub mod reliability;
pub mod scheduler;
pub mod server;
pub mod simulation;
pub mod transport;
pub mod world;

pub use config::ServerConfig;
pub use error::ServerError;
