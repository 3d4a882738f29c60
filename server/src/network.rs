//! Async runner tying the server core to a UDP socket and the two tick loops

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use shared::{EntityId, PlayerId, MAX_DATAGRAM_SIZE};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::server::{CredentialCheck, GameServer};
use crate::simulation::{OutboundQueue, Simulation, SimulationLoop, TickOutcome};

/// Datagrams handed from the receiver task to the network loop
#[derive(Debug)]
pub struct Inbound {
    pub bytes: Vec<u8>,
    pub addr: SocketAddr,
}

/// Stops a running [`Server`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Server bound to a UDP socket
///
/// Runs three tasks once started:
/// - **Receiver**: reads datagrams and forwards them to the network loop
/// - **Network loop**: dispatches inbound datagrams and, on every tick,
///   broadcasts queued snapshots and pumps the delayed events
/// - **Simulation loop**: advances the world on its own timer and queues
///   snapshots
///
/// The network loop is the only task touching connections and the
/// directory, so inbound dispatch never overlaps with itself or with the
/// network tick.
pub struct Server<S: Simulation + 'static> {
    socket: Arc<UdpSocket>,
    game: GameServer<S, Arc<UdpSocket>>,
    simulation: Arc<Mutex<S>>,
    outbound: Arc<OutboundQueue>,
    config: ServerConfig,
    shutdown: ShutdownHandle,
}

impl<S: Simulation + 'static> Server<S> {
    pub async fn bind(addr: &str, simulation: Arc<Mutex<S>>, config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let outbound = Arc::new(OutboundQueue::new());
        let game = GameServer::new(
            Arc::clone(&socket),
            Arc::clone(&simulation),
            Arc::clone(&outbound),
            config.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            socket,
            game,
            simulation,
            outbound,
            config,
            shutdown: ShutdownHandle(Arc::new(shutdown_tx)),
        })
    }

    pub fn with_credentials(mut self, credentials: Box<dyn CredentialCheck>) -> Self {
        self.game = self.game.with_credentials(credentials);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn attach_entity(&mut self, player_id: PlayerId, entity: EntityId) {
        self.game.attach_entity(player_id, entity);
    }

    /// Runs until the shutdown handle fires, then disconnects every client.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let mut shutdown_rx = self.shutdown.0.subscribe();

        let receiver = spawn_network_receiver(Arc::clone(&self.socket), inbound_tx);
        let simulation = spawn_simulation_loop(
            SimulationLoop::new(
                Arc::clone(&self.simulation),
                Arc::clone(&self.outbound),
                self.config.snapshot_every,
                self.config.tick_seconds(),
            ),
            self.config.tick_interval,
            self.shutdown.0.subscribe(),
        );

        let mut network_interval = interval(self.config.tick_interval);
        network_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        info!(
            "Server started: {:?} ticks, snapshot every {} ticks",
            self.config.tick_interval, self.config.snapshot_every
        );

        loop {
            tokio::select! {
                received = inbound_rx.recv() => {
                    match received {
                        Some(Inbound { bytes, addr }) => {
                            if let Err(e) = self.game.handle_datagram(&bytes, addr, Instant::now()) {
                                warn!("{}", e);
                            }
                        }
                        None => {
                            error!("Network receiver stopped");
                            break;
                        }
                    }
                }

                _ = network_interval.tick() => {
                    let tick = self.game.network_tick(Instant::now());
                    ticks += 1;

                    if tick.messages > 0 {
                        trace!("Network tick {}: {} messages in {} datagrams", ticks, tick.messages, tick.datagrams);
                    }
                    if ticks % 300 == 0 {
                        let connections = self.game.peer().connections().len();
                        if connections > 0 {
                            debug!("Network tick {}: {} connections", ticks, connections);
                        }
                    }
                }

                _ = shutdown_rx.changed() => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        self.shutdown.shutdown();
        self.game.shutdown(Instant::now());
        receiver.abort();
        if let Err(e) = simulation.await {
            error!("Simulation loop task failed: {}", e);
        }

        Ok(())
    }
}

/// Spawns the task that reads datagrams off the socket.
fn spawn_network_receiver(socket: Arc<UdpSocket>, inbound_tx: mpsc::UnboundedSender<Inbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => {
                    let inbound = Inbound {
                        bytes: buffer[..len].to_vec(),
                        addr,
                    };
                    if inbound_tx.send(inbound).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP errors from departed clients surface here on some platforms
                    warn!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
}

/// Spawns the fixed-rate simulation loop.
fn spawn_simulation_loop<S: Simulation + 'static>(
    mut driver: SimulationLoop<S>,
    tick_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match driver.tick() {
                        Ok(TickOutcome::Enqueued { entities }) => {
                            trace!("Simulation tick {}: {} entities", driver.current_tick(), entities);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("{}", e),
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        debug!("Simulation loop stopped after {} ticks", driver.current_tick());
    })
}
