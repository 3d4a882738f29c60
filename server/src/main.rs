use clap::Parser;
use log::info;
use parking_lot::Mutex;
use server::config::{RebindPolicy, ServerConfig};
use server::network::Server;
use server::world::World;
use std::sync::Arc;
use std::time::Duration;

/// Reliable UDP game server with fixed-rate network and simulation loops.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Network and simulation tick interval in milliseconds
    #[clap(long, default_value = "33")]
    tick_ms: u64,
    /// Broadcast a snapshot every N simulation ticks
    #[clap(long, default_value = "3")]
    snapshot_every: u32,
    /// Heartbeat interval in milliseconds
    #[clap(long, default_value = "1000")]
    heartbeat_ms: u64,
    /// Close connections silent for this long (multiple of the heartbeat interval)
    #[clap(long, default_value = "5000")]
    heartbeat_timeout_ms: u64,
    /// Delay before an unacknowledged reliable message is resent
    #[clap(long, default_value = "200")]
    retry_ms: u64,
    /// Resends before a reliable message is dropped
    #[clap(long, default_value = "10")]
    retry_cap: u32,
    /// Maximum number of simultaneous connections
    #[clap(short, long, default_value = "100")]
    max_connections: usize,
    /// Server-side bots, using player ids 1..=N
    #[clap(short, long, default_value = "0")]
    bots: u16,
    /// What happens to a connection whose player joins again elsewhere
    #[clap(long, value_enum, default_value = "disconnect-previous")]
    rebind_policy: RebindPolicy,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            tick_interval: Duration::from_millis(self.tick_ms),
            snapshot_every: self.snapshot_every,
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            retry_interval: Duration::from_millis(self.retry_ms),
            retry_cap: self.retry_cap,
            max_connections: self.max_connections,
            rebind_policy: self.rebind_policy,
            reserved_player_ids: self.bots,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config();

    let mut world = World::new();
    let bots: Vec<_> = (1..=args.bots)
        .map(|player_id| (player_id, world.spawn_bot(player_id)))
        .collect();
    let world = Arc::new(Mutex::new(world));

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::bind(&address, world, config).await?;
    for (player_id, entity) in bots {
        server.attach_entity(player_id, entity);
    }
    if args.bots > 0 {
        info!("Spawned {} bots", args.bots);
    }

    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    shutdown.shutdown();

    server_task.await??;
    Ok(())
}
