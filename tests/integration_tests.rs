//! Integration tests for the networked server
//!
//! These tests run the real server on a loopback UDP socket and talk to it
//! with a minimal hand-driven client.

use assert_approx_eq::assert_approx_eq;
use parking_lot::Mutex;
use server::config::{RebindPolicy, ServerConfig};
use server::network::{Server, ShutdownHandle};
use server::world::{World, MOVE_SPEED};
use shared::{
    EntityId, EntitySnapshot, GameMessage, InputRequest, JoinRequest, JoinResponse, Message, MessageId, Packet,
    SnapshotBroadcast, INPUT_RIGHT, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(3);

fn test_config() -> ServerConfig {
    ServerConfig {
        tick_interval: Duration::from_millis(10),
        snapshot_every: 2,
        retry_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<(), server::ServerError>>,
}

impl RunningServer {
    async fn start(config: ServerConfig) -> Self {
        let world = Arc::new(Mutex::new(World::with_seed(42)));
        let server = assert_ok!(Server::bind("127.0.0.1:0", world, config).await);
        let addr = assert_ok!(server.local_addr());
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        Self { addr, shutdown, task }
    }

    async fn stop(self) {
        self.shutdown.shutdown();
        let result = timeout(WAIT, self.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}

/// Hand-driven client that answers heartbeats while waiting for packets.
struct TestClient {
    socket: UdpSocket,
    server: SocketAddr,
    next_id: MessageId,
}

impl TestClient {
    async fn new(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self {
            socket,
            server,
            next_id: 0,
        }
    }

    async fn send(&self, packet: &Packet) {
        let bytes = shared::encode(packet).unwrap();
        self.socket.send_to(&bytes, self.server).await.unwrap();
    }

    async fn send_reliable(&mut self, message: Message) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&Packet::Reliable { id, message }).await;
        id
    }

    async fn recv(&self) -> Packet {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _) = timeout(WAIT, self.socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for the server")
                .unwrap();
            let packet = shared::decode(&buf[..len]).unwrap();
            if let Packet::Heartbeat { ping_id } = packet {
                self.send(&Packet::HeartbeatAck { ping_id }).await;
                continue;
            }
            return packet;
        }
    }

    /// Receives until `pick` returns something, acking reliable packets along the way.
    async fn recv_until<T>(&self, mut pick: impl FnMut(&Packet) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            let packet = self.recv().await;
            if let Packet::Reliable { id, .. } = packet {
                self.send(&Packet::Ack { id }).await;
            }
            if let Some(found) = pick(&packet) {
                return found;
            }
        }
        panic!("expected packet did not arrive");
    }

    async fn connect(&self) -> Packet {
        self.send(&Packet::Connect {
            client_version: PROTOCOL_VERSION,
        })
        .await;
        let answer = self.recv().await;
        if let Packet::Accepted { .. } = answer {
            self.send(&Packet::AcceptedAck).await;
        }
        answer
    }

    async fn join(&mut self, login: &str) -> JoinResponse {
        let request = JoinRequest {
            login: login.to_string(),
            password: "password".to_string(),
        };
        self.send_reliable(request.to_message().unwrap()).await;
        self.recv_until(|packet| match packet {
            Packet::Reliable { message, .. } => JoinResponse::from_message(message).ok(),
            _ => None,
        })
        .await
    }

    async fn snapshot_with(
        &self,
        entity: EntityId,
        mut accept: impl FnMut(&EntitySnapshot) -> bool,
    ) -> SnapshotBroadcast {
        self.recv_until(|packet| match packet {
            Packet::Unreliable { message } => SnapshotBroadcast::from_message(message)
                .ok()
                .filter(|s| s.entities.iter().any(|e| e.entity_id == entity && accept(e))),
            _ => None,
        })
        .await
    }
}

/// CONNECTION LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;

    /// Tests the handshake, join and first snapshot over a real socket
    #[tokio::test]
    async fn join_and_receive_snapshot() {
        let server = RunningServer::start(test_config()).await;
        let mut client = TestClient::new(server.addr).await;

        assert_eq!(client.connect().await, Packet::Accepted { connection_id: 1 });
        let joined = client.join("alice").await;
        assert_eq!(joined.player_id, 1);

        let snapshot = client.snapshot_with(joined.entity_id, |_| true).await;
        assert_eq!(snapshot.tick % 2, 0);
        assert!(snapshot.entities.iter().any(|e| e.player_id == joined.player_id));

        server.stop().await;
    }

    /// Tests that a full server rejects the extra connection
    #[tokio::test]
    async fn full_server_rejects() {
        let config = ServerConfig {
            max_connections: 1,
            ..test_config()
        };
        let server = RunningServer::start(config).await;

        let first = TestClient::new(server.addr).await;
        assert!(matches!(first.connect().await, Packet::Accepted { .. }));

        let second = TestClient::new(server.addr).await;
        match second.connect().await {
            Packet::Rejected { reason } => assert_eq!(reason, "server full"),
            other => panic!("Expected rejection, got {:?}", other),
        }

        server.stop().await;
    }

    /// Tests that a wrong protocol version is refused
    #[tokio::test]
    async fn protocol_mismatch_rejected() {
        let server = RunningServer::start(test_config()).await;
        let client = TestClient::new(server.addr).await;

        client
            .send(&Packet::Connect {
                client_version: PROTOCOL_VERSION + 1,
            })
            .await;
        assert!(matches!(client.recv().await, Packet::Rejected { .. }));

        server.stop().await;
    }

    /// Tests that shutdown tells connected clients to leave
    #[tokio::test]
    async fn shutdown_disconnects_clients() {
        let server = RunningServer::start(test_config()).await;
        let client = TestClient::new(server.addr).await;
        client.connect().await;

        server.shutdown.shutdown();
        client
            .recv_until(|packet| matches!(packet, Packet::Disconnect).then_some(()))
            .await;

        let result = timeout(WAIT, server.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}

/// RELIABILITY TESTS
mod reliability_tests {
    use super::*;

    /// Tests that an unacknowledged join response is resent with the same id
    #[tokio::test]
    async fn unacked_response_is_resent() {
        let server = RunningServer::start(test_config()).await;
        let mut client = TestClient::new(server.addr).await;
        client.connect().await;

        let request = JoinRequest {
            login: "bob".to_string(),
            password: String::new(),
        };
        client.send_reliable(request.to_message().unwrap()).await;

        let mut copies = Vec::new();
        while copies.len() < 2 {
            if let Packet::Reliable { id, message } = client.recv().await {
                copies.push((id, message));
            }
        }
        assert_eq!(copies[0], copies[1]);

        server.stop().await;
    }

    /// Tests that a duplicated join request is acknowledged twice but handled once
    #[tokio::test]
    async fn duplicate_request_handled_once() {
        let server = RunningServer::start(test_config()).await;
        let client = TestClient::new(server.addr).await;
        client.connect().await;

        let message = JoinRequest {
            login: "carol".to_string(),
            password: String::new(),
        }
        .to_message()
        .unwrap();
        let request = Packet::Reliable { id: 7, message };
        client.send(&request).await;
        client.send(&request).await;

        let mut acks = 0;
        let mut responses = 0;
        let deadline = Instant::now() + Duration::from_millis(300);
        while acks < 2 || Instant::now() < deadline {
            match client.recv().await {
                Packet::Ack { id: 7 } => acks += 1,
                Packet::Reliable { id, message } => {
                    client.send(&Packet::Ack { id }).await;
                    if JoinResponse::from_message(&message).is_ok() {
                        responses += 1;
                    }
                }
                _ => {}
            }
        }

        assert_eq!(acks, 2);
        assert_eq!(responses, 1);

        server.stop().await;
    }
}

/// GAMEPLAY TESTS
mod gameplay_tests {
    use super::*;

    /// Tests that input reaches the entity and shows up in snapshots
    #[tokio::test]
    async fn input_moves_entity() {
        let server = RunningServer::start(test_config()).await;
        let mut client = TestClient::new(server.addr).await;
        client.connect().await;
        let joined = client.join("dave").await;

        let input = InputRequest { input: INPUT_RIGHT };
        client.send_reliable(input.to_message().unwrap()).await;

        let snapshot = client
            .snapshot_with(joined.entity_id, |e| (e.vel_x - MOVE_SPEED).abs() < 0.001)
            .await;
        let entity = snapshot
            .entities
            .iter()
            .find(|e| e.entity_id == joined.entity_id)
            .unwrap();
        assert_approx_eq!(entity.vel_x, MOVE_SPEED, 0.001);
        assert_approx_eq!(entity.vel_y, 0.0, 0.001);

        server.stop().await;
    }

    /// Tests that joining again from a new socket takes over the same entity
    #[tokio::test]
    async fn rejoin_takes_over_entity() {
        let config = ServerConfig {
            rebind_policy: RebindPolicy::DisconnectPrevious,
            ..test_config()
        };
        let server = RunningServer::start(config).await;

        let mut first = TestClient::new(server.addr).await;
        first.connect().await;
        let original = first.join("erin").await;

        let mut second = TestClient::new(server.addr).await;
        second.connect().await;
        let rejoined = second.join("erin").await;

        assert_eq!(rejoined, original);
        first
            .recv_until(|packet| matches!(packet, Packet::Disconnect).then_some(()))
            .await;

        // the entity keeps broadcasting under its new owner
        second.snapshot_with(original.entity_id, |_| true).await;

        server.stop().await;
    }
}
