//! Performance benchmarks for the server's hot paths

use parking_lot::Mutex;
use server::config::ServerConfig;
use server::peer::Peer;
use server::scheduler::Scheduler;
use server::simulation::{OutboundQueue, Simulation, SimulationLoop, TickOutcome};
use server::transport::DatagramSink;
use server::world::World;
use shared::{GameMessage, Message, Packet, SnapshotBroadcast, PROTOCOL_VERSION};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counts datagrams without sending them anywhere
#[derive(Default)]
struct CountingSink {
    sent: AtomicUsize,
}

impl DatagramSink for CountingSink {
    fn send_datagram(&self, _bytes: &[u8], _addr: SocketAddr) -> io::Result<()> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Benchmarks scheduling and pumping delayed events
#[test]
fn benchmark_scheduler_throughput() {
    let mut scheduler = Scheduler::new();
    let iterations = 100_000u64;
    let base = Instant::now();
    let start = Instant::now();

    for i in 0..iterations {
        scheduler.schedule(base, Duration::from_micros(i % 1_000), i);
    }
    let mut sum = 0u64;
    let fired = scheduler.pump(base + Duration::from_secs(1), |event| {
        sum += event;
        Ok::<(), String>(())
    });

    let duration = start.elapsed();
    println!(
        "Scheduler: {} events in {:?} ({:.2} ns/event)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(fired as u64, iterations);
    assert_eq!(sum, iterations * (iterations - 1) / 2);
    assert!(scheduler.is_empty());
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks world advance plus snapshot encoding with many bots
#[test]
fn benchmark_snapshot_encoding() {
    let mut world = World::with_seed(7);
    for player_id in 1..=100 {
        world.spawn_bot(player_id);
    }

    let iterations = 200;
    let start = Instant::now();
    let mut bytes = 0;

    for tick in 0..iterations {
        world.advance(1.0 / 30.0);
        let snapshot = SnapshotBroadcast {
            tick,
            entities: world.collect_snapshots(),
        };
        let packet = Packet::Unreliable {
            message: snapshot.to_message().unwrap(),
        };
        bytes += shared::encode(&packet).unwrap().len();
    }

    let duration = start.elapsed();
    println!(
        "Snapshot build: {} ticks of 100 entities in {:?} ({:.2} μs/tick, {} bytes/tick)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64,
        bytes / iterations as usize
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks the outbound queue under concurrent producers
#[test]
fn benchmark_outbound_queue() {
    let queue = Arc::new(OutboundQueue::new());
    let per_thread = 25_000;
    let start = Instant::now();

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for _ in 0..per_thread {
                    queue.push(Message::new(4, vec![0; 16]));
                }
            })
        })
        .collect();

    let mut drained = 0;
    for producer in producers {
        producer.join().unwrap();
        drained += queue.drain().len();
    }
    drained += queue.drain().len();

    let duration = start.elapsed();
    println!("Outbound queue: {} messages in {:?}", drained, duration);

    assert_eq!(drained, 4 * per_thread);
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks the simulation loop driving a populated world
#[test]
fn benchmark_simulation_loop() {
    let mut world = World::with_seed(11);
    for player_id in 1..=50 {
        world.spawn_bot(player_id);
    }
    let queue = Arc::new(OutboundQueue::new());
    let mut driver = SimulationLoop::new(Arc::new(Mutex::new(world)), Arc::clone(&queue), 3, 1.0 / 30.0);

    let iterations = 600;
    let start = Instant::now();
    let mut enqueued = 0;

    for _ in 0..iterations {
        if let TickOutcome::Enqueued { .. } = driver.tick().unwrap() {
            enqueued += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Simulation loop: {} ticks in {:?} ({:.2} μs/tick)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(enqueued, iterations / 3);
    assert_eq!(queue.len(), iterations / 3);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks retransmission of unacknowledged messages across many connections
#[test]
fn benchmark_reliable_resends() {
    let sink = Arc::new(CountingSink::default());
    let config = ServerConfig {
        retry_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let mut peer = Peer::new(Arc::clone(&sink), config);
    let t0 = Instant::now();

    let connect = shared::encode(&Packet::Connect {
        client_version: PROTOCOL_VERSION,
    })
    .unwrap();
    let accepted_ack = shared::encode(&Packet::AcceptedAck).unwrap();
    let connections = 50u16;
    for port in 0..connections {
        let addr: SocketAddr = format!("127.0.0.1:{}", 20_000 + port).parse().unwrap();
        peer.receive(&connect, addr, t0).unwrap();
        peer.receive(&accepted_ack, addr, t0).unwrap();
    }
    assert_eq!(peer.connections().len(), connections as usize);

    let per_connection = 100;
    for connection in 1..=connections as u32 {
        for _ in 0..per_connection {
            peer.send_reliable(connection, Message::new(2, vec![0; 8]), t0).unwrap();
        }
    }

    let sent_before = sink.sent.load(Ordering::Relaxed);
    let start = Instant::now();
    let fired = peer.update(t0 + Duration::from_millis(100));
    let duration = start.elapsed();
    let resent = sink.sent.load(Ordering::Relaxed) - sent_before;

    println!(
        "Reliable resends: {} messages in {:?} ({:.2} μs/message)",
        resent,
        duration,
        duration.as_micros() as f64 / resent as f64
    );

    assert_eq!(resent, connections as usize * per_connection);
    assert!(fired >= resent);
    assert!(duration.as_millis() < 1000);
}
