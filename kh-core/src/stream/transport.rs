//! Non-blocking UDP endpoints.
//!
//! The sender binds a known port and learns the receiver's address from
//! the receiver's ping, which is awaited until the socket takes it.
//! After that both sides use `try_send_to` / `try_recv_from` with at most
//! a short wait for buffer space, so neither loop stalls on the socket:
//!
//! - would-block on receive → `Ok(None)`, poll again next tick
//! - would-block on send → a short wait for buffer space, then the
//!   datagram is dropped (`Ok(false)`)
//! - a malformed datagram → logged at `debug` and skipped
//! - any other I/O error → [`KhError::Transport`], fatal for the session

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::error::KhError;
use crate::packet::{MTU, ReceiverPacket, SenderPacket};

// ── Constants ────────────────────────────────────────────────────

/// Receiver socket buffer: room for several frames in flight.
pub const RECEIVE_BUFFER_SIZE: usize = 1024 * 1024;

/// Sender socket buffer.
pub const SEND_BUFFER_SIZE: usize = 128 * 1024;

/// Upper bound on datagrams handled per [`ReceiverSocket::drain`].
const MAX_DRAIN_BATCH: usize = 4096;

/// How long a send waits for socket buffer space before dropping.
const SEND_STALL_TIMEOUT: Duration = Duration::from_millis(5);

/// Bind a non-blocking UDP socket with explicit buffer sizes.
fn bind_udp(
    addr: SocketAddr,
    recv_buffer: Option<usize>,
    send_buffer: Option<usize>,
) -> Result<UdpSocket, KhError> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    if let Some(size) = recv_buffer {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = send_buffer {
        socket.set_send_buffer_size(size)?;
    }
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn try_send(socket: &UdpSocket, bytes: &[u8], to: SocketAddr) -> Result<bool, KhError> {
    match socket.try_send_to(bytes, to) {
        Ok(_) => Ok(true),
        Err(e) if is_transient(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// `try_send`, then wait up to [`SEND_STALL_TIMEOUT`] for buffer space
/// and retry once. A freshly registered socket reports would-block until
/// the reactor has seen it writable, so the wait is needed even when the
/// buffer is empty.
async fn send_or_drop(socket: &UdpSocket, bytes: &[u8], to: SocketAddr) -> Result<bool, KhError> {
    if try_send(socket, bytes, to)? {
        return Ok(true);
    }
    match tokio::time::timeout(SEND_STALL_TIMEOUT, socket.writable()).await {
        Ok(ready) => ready?,
        Err(_) => return Ok(false),
    }
    try_send(socket, bytes, to)
}

/// Log and skip a datagram that failed to parse. Anything other than bad
/// peer input is passed back to the caller.
fn discard(e: KhError, kind: &str) -> Result<(), KhError> {
    if e.is_malformed_input() {
        debug!("malformed {kind}: {e}");
        Ok(())
    } else {
        Err(e)
    }
}

// ── SenderListener ───────────────────────────────────────────────

/// Sender socket waiting for a receiver to ping it.
pub struct SenderListener {
    socket: UdpSocket,
}

impl SenderListener {
    /// Bind on `addr` with the sender's buffer size.
    pub fn bind(addr: SocketAddr) -> Result<Self, KhError> {
        Ok(Self {
            socket: bind_udp(addr, None, Some(SEND_BUFFER_SIZE))?,
        })
    }

    /// Bind on all interfaces at `port`.
    pub fn bind_port(port: u16) -> Result<Self, KhError> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, KhError> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for the first ping and lock onto its source address.
    pub async fn accept(self) -> Result<SenderSocket, KhError> {
        let mut buf = [0u8; 64];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match ReceiverPacket::decode(&buf[..len]) {
                Ok(ReceiverPacket::Ping) => {
                    info!("receiver endpoint: {from}");
                    return Ok(SenderSocket {
                        socket: self.socket,
                        receiver: from,
                    });
                }
                Ok(other) => debug!(%from, ?other, "ignoring packet before ping"),
                Err(e) => discard(e, "datagram before ping")?,
            }
        }
    }
}

// ── SenderSocket ─────────────────────────────────────────────────

/// Sender end of an established session.
pub struct SenderSocket {
    socket: UdpSocket,
    receiver: SocketAddr,
}

impl SenderSocket {
    pub fn receiver_addr(&self) -> SocketAddr {
        self.receiver
    }

    pub fn local_addr(&self) -> Result<SocketAddr, KhError> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one packet. Returns `false` if the socket buffer stayed full
    /// and the datagram was dropped.
    pub async fn send(&self, packet: &SenderPacket) -> Result<bool, KhError> {
        send_or_drop(&self.socket, &packet.encode(), self.receiver).await
    }

    /// Next packet from the receiver, if one is waiting.
    pub fn try_receive(&self) -> Result<Option<ReceiverPacket>, KhError> {
        let mut buf = [0u8; 64];
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if is_transient(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if from != self.receiver {
                debug!(%from, "datagram from unknown peer ignored");
                continue;
            }
            match ReceiverPacket::decode(&buf[..len]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => discard(e, "receiver packet")?,
            }
        }
    }
}

// ── ReceiverSocket ───────────────────────────────────────────────

/// Receiver end: pings the sender, drains its packets, sends acks.
pub struct ReceiverSocket {
    socket: UdpSocket,
    sender: SocketAddr,
    buf: Vec<u8>,
}

impl ReceiverSocket {
    /// Bind an ephemeral port for talking to `sender`.
    pub fn connect(sender: SocketAddr) -> Result<Self, KhError> {
        let local = match sender {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        Ok(Self {
            socket: bind_udp(local, Some(RECEIVE_BUFFER_SIZE), None)?,
            sender,
            // Larger than MTU so oversized datagrams are seen whole.
            buf: vec![0u8; MTU * 2],
        })
    }

    pub fn sender_addr(&self) -> SocketAddr {
        self.sender
    }

    pub fn local_addr(&self) -> Result<SocketAddr, KhError> {
        Ok(self.socket.local_addr()?)
    }

    /// Announce ourselves to the sender. Waits until the datagram is
    /// handed to the socket.
    pub async fn ping(&self) -> Result<(), KhError> {
        self.socket
            .send_to(&ReceiverPacket::Ping.encode(), self.sender)
            .await?;
        Ok(())
    }

    /// Report the highest decoded frame id.
    pub async fn ack(&self, frame_id: u32) -> Result<(), KhError> {
        let ack = ReceiverPacket::Ack { frame_id }.encode();
        if !send_or_drop(&self.socket, &ack, self.sender).await? {
            debug!(frame_id, "ack dropped by full socket buffer");
        }
        Ok(())
    }

    /// Next well-formed packet from the sender, if one is waiting.
    pub fn try_receive(&mut self) -> Result<Option<SenderPacket>, KhError> {
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e) if is_transient(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if from != self.sender {
                debug!(%from, "datagram from unknown peer ignored");
                continue;
            }
            if len > MTU {
                debug!(len, "oversized datagram ignored");
                continue;
            }
            match SenderPacket::decode(&self.buf[..len]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => discard(e, "sender packet")?,
            }
        }
    }

    /// Everything currently queued on the socket.
    pub fn drain(&mut self) -> Result<Vec<SenderPacket>, KhError> {
        let mut packets = Vec::new();
        while packets.len() < MAX_DRAIN_BATCH {
            match self.try_receive()? {
                Some(packet) => packets.push(packet),
                None => break,
            }
        }
        Ok(packets)
    }

    /// Wait until a datagram is readable or `tick` elapses.
    pub async fn wait_readable(&self, tick: Duration) -> Result<(), KhError> {
        match tokio::time::timeout(tick, self.socket.readable()).await {
            Ok(ready) => Ok(ready?),
            Err(_) => Ok(()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::packet::VideoPacket;

    async fn session() -> (SenderSocket, ReceiverSocket) {
        let listener = SenderListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let receiver = ReceiverSocket::connect(addr).unwrap();
        receiver.ping().await.unwrap();
        let sender = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("timeout")
            .unwrap();
        (sender, receiver)
    }

    async fn receive_one(receiver: &mut ReceiverSocket) -> SenderPacket {
        loop {
            if let Some(packet) = receiver.try_receive().unwrap() {
                return packet;
            }
            receiver.wait_readable(Duration::from_millis(50)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn ping_establishes_endpoint() {
        let (sender, receiver) = session().await;
        assert_eq!(
            sender.receiver_addr().port(),
            receiver.local_addr().unwrap().port()
        );
    }

    #[tokio::test]
    async fn first_ping_on_fresh_socket_is_delivered() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let receiver = ReceiverSocket::connect(peer.local_addr().unwrap()).unwrap();

        receiver.ping().await.unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).expect("first ping lost");
        assert_eq!(ReceiverPacket::decode(&buf[..len]).unwrap(), ReceiverPacket::Ping);
    }

    #[tokio::test]
    async fn accept_completes_on_single_ping() {
        let listener = SenderListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let receiver = ReceiverSocket::connect(listener.local_addr().unwrap()).unwrap();
        let started = std::time::Instant::now();
        receiver.ping().await.unwrap();
        let sender = tokio::time::timeout(Duration::from_millis(500), listener.accept())
            .await
            .expect("accept needed a second ping")
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(
            sender.receiver_addr().port(),
            receiver.local_addr().unwrap().port()
        );
    }

    #[tokio::test]
    async fn first_ack_on_fresh_socket_is_delivered() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let receiver = ReceiverSocket::connect(peer.local_addr().unwrap()).unwrap();

        receiver.ack(9).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).expect("first ack lost");
        assert_eq!(
            ReceiverPacket::decode(&buf[..len]).unwrap(),
            ReceiverPacket::Ack { frame_id: 9 }
        );
    }

    #[tokio::test]
    async fn packets_and_acks_flow() {
        let (sender, mut receiver) = session().await;

        let packet = SenderPacket::Video(VideoPacket {
            session_id: 3,
            frame_id: 0,
            packet_index: 0,
            packet_count: 1,
            payload: Bytes::from_static(b"hello"),
        });
        assert!(sender.send(&packet).await.unwrap());
        let got = tokio::time::timeout(Duration::from_secs(5), receive_one(&mut receiver))
            .await
            .expect("timeout");
        assert_eq!(got, packet);

        receiver.ack(0).await.unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(p) = sender.try_receive().unwrap() {
                    return p;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timeout");
        assert_eq!(ack, ReceiverPacket::Ack { frame_id: 0 });
    }

    #[tokio::test]
    async fn empty_socket_is_not_an_error() {
        let (sender, mut receiver) = session().await;
        assert!(receiver.try_receive().unwrap().is_none());
        assert!(receiver.drain().unwrap().is_empty());
        assert!(sender.try_receive().unwrap().is_none());
    }

    #[test]
    fn only_malformed_input_is_discarded() {
        assert!(discard(KhError::InvalidPacket("bad index"), "sender packet").is_ok());
        assert!(
            discard(
                KhError::PacketTooShort {
                    expected: 17,
                    actual: 2
                },
                "sender packet"
            )
            .is_ok()
        );
        let fatal = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            discard(fatal.into(), "sender packet"),
            Err(KhError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn malformed_datagrams_are_skipped() {
        let listener = SenderListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let raw = listener.socket;
        let mut receiver = ReceiverSocket::connect(raw.local_addr().unwrap()).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, receiver_addr.port()));

        raw.send_to(&[2, 0, 0], target).await.unwrap();
        let valid = SenderPacket::Video(VideoPacket {
            session_id: 1,
            frame_id: 4,
            packet_index: 0,
            packet_count: 1,
            payload: Bytes::new(),
        });
        raw.send_to(&valid.encode(), target).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), receive_one(&mut receiver))
            .await
            .expect("timeout");
        assert_eq!(got, valid);
    }
}
