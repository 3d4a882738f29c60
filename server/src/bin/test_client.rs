use clap::Parser;
use shared::{
    GameMessage, InputRequest, JoinRequest, JoinResponse, Message, MessageId, MessageKind, Packet,
    SnapshotBroadcast, INPUT_DOWN, INPUT_LEFT, INPUT_RIGHT, INPUT_UP, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Headless client that joins the server, steers for a while and leaves.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,
    /// Login to join with
    #[clap(short, long, default_value = "test_client")]
    login: String,
    /// How long to stay connected, in seconds
    #[clap(short, long, default_value = "10")]
    duration: u64,
}

/// Client half of the reliable channel: resends until acked.
struct ReliableSender {
    next_id: MessageId,
    unacked: HashMap<MessageId, (Vec<u8>, Instant)>,
}

impl ReliableSender {
    const RETRY: Duration = Duration::from_millis(200);

    fn new() -> Self {
        Self {
            next_id: 0,
            unacked: HashMap::new(),
        }
    }

    async fn send(&mut self, socket: &UdpSocket, server: SocketAddr, message: Message) -> Result<(), Box<dyn std::error::Error>> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let datagram = shared::encode(&Packet::Reliable { id, message })?;
        socket.send_to(&datagram, server).await?;
        self.unacked.insert(id, (datagram, Instant::now()));
        Ok(())
    }

    async fn resend_due(&mut self, socket: &UdpSocket, server: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
        let now = Instant::now();
        for (datagram, sent_at) in self.unacked.values_mut() {
            if now.duration_since(*sent_at) >= Self::RETRY {
                socket.send_to(&datagram[..], server).await?;
                *sent_at = now;
            }
        }
        Ok(())
    }

    fn ack(&mut self, id: MessageId) {
        self.unacked.remove(&id);
    }
}

async fn send(socket: &UdpSocket, server: SocketAddr, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
    socket.send_to(&shared::encode(packet)?, server).await?;
    Ok(())
}

fn print_message(message: &Message) {
    match MessageKind::from_tag(message.kind) {
        Some(MessageKind::JoinResponse) => match JoinResponse::from_message(message) {
            Ok(response) => println!(
                "Joined as player {} driving entity {}",
                response.player_id, response.entity_id
            ),
            Err(e) => println!("Bad join response: {}", e),
        },
        Some(MessageKind::SnapshotBroadcast) => match SnapshotBroadcast::from_message(message) {
            Ok(snapshot) => {
                println!("Snapshot tick {}: {} entities", snapshot.tick, snapshot.entities.len());
                for e in snapshot.entities.iter().take(3) {
                    println!(
                        "  Entity {} (player {}): pos=({:.2}, {:.2}) vel=({:.2}, {:.2})",
                        e.entity_id, e.player_id, e.x, e.y, e.vel_x, e.vel_y
                    );
                }
            }
            Err(e) => println!("Bad snapshot: {}", e),
        },
        _ => println!("Unexpected message kind {}", message.kind),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    println!("Sending connection request to {}", args.server);
    send(&socket, args.server, &Packet::Connect { client_version: PROTOCOL_VERSION }).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await??;
    match shared::decode(&buf[..len])? {
        Packet::Accepted { connection_id } => {
            println!("Connection accepted with id {}", connection_id);
            send(&socket, args.server, &Packet::AcceptedAck).await?;
        }
        Packet::Rejected { reason } => {
            println!("Connection rejected: {}", reason);
            return Ok(());
        }
        other => {
            println!("Expected Accepted but got: {:?}", other);
            return Ok(());
        }
    }

    let mut reliable = ReliableSender::new();
    let join = JoinRequest {
        login: args.login.clone(),
        password: String::new(),
    };
    reliable.send(&socket, args.server, join.to_message()?).await?;

    let directions = [INPUT_UP, INPUT_RIGHT, INPUT_DOWN, INPUT_LEFT];
    let started = Instant::now();
    let mut last_input = Instant::now();
    let mut direction = 0;

    while started.elapsed() < Duration::from_secs(args.duration) {
        if last_input.elapsed() >= Duration::from_secs(1) {
            let input = InputRequest {
                input: directions[direction % directions.len()],
            };
            println!("Sending input: {:#06b}", input.input);
            reliable.send(&socket, args.server, input.to_message()?).await?;
            direction += 1;
            last_input = Instant::now();
        }
        reliable.resend_due(&socket, args.server).await?;

        let len = match timeout(Duration::from_millis(50), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => len,
            Ok(Err(e)) => {
                println!("Error receiving: {}", e);
                continue;
            }
            Err(_) => continue,
        };

        match shared::decode(&buf[..len]) {
            Ok(Packet::Reliable { id, message }) => {
                send(&socket, args.server, &Packet::Ack { id }).await?;
                print_message(&message);
            }
            Ok(Packet::Unreliable { message }) => print_message(&message),
            Ok(Packet::Ack { id }) => reliable.ack(id),
            Ok(Packet::Heartbeat { ping_id }) => {
                send(&socket, args.server, &Packet::HeartbeatAck { ping_id }).await?;
            }
            Ok(Packet::Disconnect) => {
                println!("Server closed the connection");
                return Ok(());
            }
            Ok(other) => println!("Unexpected packet: {:?}", other),
            Err(e) => println!("Failed to decode datagram: {}", e),
        }
    }

    println!("Sending disconnect request");
    send(&socket, args.server, &Packet::Disconnect).await?;
    println!("Test client finished");

    Ok(())
}
