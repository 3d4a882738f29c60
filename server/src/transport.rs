//! Datagram output seam between the transport logic and the socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Anything that can put one datagram on the wire without blocking.
pub trait DatagramSink {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()>;
}

impl DatagramSink for tokio::net::UdpSocket {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.try_send_to(bytes, addr).map(|_| ())
    }
}

impl DatagramSink for std::net::UdpSocket {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.send_to(bytes, addr).map(|_| ())
    }
}

impl<T: DatagramSink + ?Sized> DatagramSink for Arc<T> {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        (**self).send_datagram(bytes, addr)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use shared::Packet;

    #[test]
    fn test_arc_sink_forwards() {
        let sink = Arc::new(RecordingSink::default());
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let bytes = shared::encode(&Packet::Disconnect).unwrap();

        let shared_sink: Arc<RecordingSink> = Arc::clone(&sink);
        shared_sink.send_datagram(&bytes, addr).unwrap();

        assert_eq!(sink.packets(), vec![(addr, Packet::Disconnect)]);
    }

    #[test]
    fn test_std_socket_sink_delivers() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let bytes = shared::encode(&Packet::AcceptedAck).unwrap();

        sender
            .send_datagram(&bytes, receiver.local_addr().unwrap())
            .unwrap();

        let mut buffer = [0u8; 64];
        let (len, from) = receiver.recv_from(&mut buffer).unwrap();
        assert_eq!(from, sender.local_addr().unwrap());
        assert_eq!(shared::decode(&buffer[..len]).unwrap(), Packet::AcceptedAck);
    }
}
