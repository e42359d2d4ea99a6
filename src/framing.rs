//! Client-ID framing over transient data channels.
//!
//! A stateless relay sees many short-lived data channels; the framing
//! here lets it stitch them into one logical client session. Every
//! packet carries a one-byte type prefix: the first packet of a fresh
//! conn is `0xFE` followed by the 8-byte client ID and the payload, and
//! once the server has acknowledged the ID (by answering with an `0xFF`
//! packet) all further traffic is `0xFF` plus payload.
//!
//! A packet with any other leading byte is discarded: the read returns
//! `Ok(0)`, which is **not** end-of-file. EOF is only ever signalled by
//! the transport underneath.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::mux::PacketConn;

/// Prefix of the first packet on a conn, announcing the client ID.
pub const PACKET_TYPE_NEW: u8 = 0xfe;

/// Prefix of every packet on an acknowledged conn.
pub const PACKET_TYPE_ESTABLISHED: u8 = 0xff;

/// Length of a client ID in bytes.
pub const CLIENT_ID_LENGTH: usize = 8;

/// Opaque identifier attaching many transient conns to one logical
/// client session. Generated once and reused across peer rotations.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; CLIENT_ID_LENGTH]);

impl ClientId {
    pub fn random() -> Result<Self> {
        let mut id = [0u8; CLIENT_ID_LENGTH];
        getrandom::getrandom(&mut id).map_err(|e| anyhow!("CSPRNG unavailable: {e}"))?;
        Ok(Self(id))
    }

    pub fn from_bytes(bytes: [u8; CLIENT_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

/// `0xFE || id || payload`
pub fn encode_new(id: &ClientId, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + CLIENT_ID_LENGTH + payload.len());
    packet.push(PACKET_TYPE_NEW);
    packet.extend_from_slice(id.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// `0xFF || payload`
pub fn encode_established(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(1 + payload.len());
    packet.push(PACKET_TYPE_ESTABLISHED);
    packet.extend_from_slice(payload);
    packet
}

/// Client side of the framing: prefixes outgoing packets, transitions
/// from `New` to `Acknowledged` on the first `0xFF` packet from the
/// server.
pub struct ClientIdConn<P> {
    inner: P,
    id: ClientId,
    acked: AtomicBool,
}

impl<P> ClientIdConn<P> {
    pub fn new(inner: P, id: ClientId) -> Self {
        Self {
            inner,
            id,
            acked: AtomicBool::new(false),
        }
    }

    /// True once the server has accepted the client ID.
    pub fn acknowledged(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: PacketConn> PacketConn for ClientIdConn<P> {
    /// A packet whose leading byte is not `0xFF` is discarded and yields
    /// `Ok(0)`, which is not EOF.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        if n > 0 && buf[0] == PACKET_TYPE_ESTABLISHED {
            self.acked.store(true, Ordering::SeqCst);
            buf.copy_within(1..n, 0);
            return Ok((n - 1, addr));
        }
        debug!("discarded unknown packet");
        Ok((0, addr))
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        let packet = if self.acknowledged() {
            encode_established(buf)
        } else {
            encode_new(&self.id, buf)
        };
        self.inner.send_to(&packet, addr).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Server side of the framing: captures the client ID from a `0xFE`
/// packet, strips prefixes from established packets, and prefixes every
/// reply with `0xFF`.
pub struct ServerIdConn<P> {
    inner: P,
    client_id: StdMutex<Option<ClientId>>,
}

impl<P> ServerIdConn<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            client_id: StdMutex::new(None),
        }
    }

    /// The client ID, once a `0xFE` packet has been seen.
    pub fn client_id(&self) -> Option<ClientId> {
        *self.client_id.lock().unwrap()
    }
}

#[async_trait]
impl<P: PacketConn> PacketConn for ServerIdConn<P> {
    /// A malformed or unknown packet is discarded and yields `Ok(0)`,
    /// which is not EOF.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        if n == 0 {
            return Ok((0, addr));
        }
        match buf[0] {
            PACKET_TYPE_NEW if n >= 1 + CLIENT_ID_LENGTH => {
                let mut id = [0u8; CLIENT_ID_LENGTH];
                id.copy_from_slice(&buf[1..1 + CLIENT_ID_LENGTH]);
                *self.client_id.lock().unwrap() = Some(ClientId::from_bytes(id));
                buf.copy_within(1 + CLIENT_ID_LENGTH..n, 0);
                Ok((n - 1 - CLIENT_ID_LENGTH, addr))
            }
            PACKET_TYPE_ESTABLISHED => {
                buf.copy_within(1..n, 0);
                Ok((n - 1, addr))
            }
            _ => {
                debug!("discarded unknown packet");
                Ok((0, addr))
            }
        }
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        self.inner.send_to(&encode_established(buf), addr).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Adapts a stream transport into a [`PacketConn`] with fixed local and
/// remote addresses. One read is one packet, one send is one write: the
/// transport must preserve message boundaries (a data channel does; a
/// raw TCP stream does not).
pub struct StreamPacketConn<T> {
    reader: Mutex<ReadHalf<T>>,
    writer: Mutex<WriteHalf<T>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> StreamPacketConn<T> {
    pub fn new(transport: T, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            remote_addr,
        }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Send + 'static> PacketConn for StreamPacketConn<T> {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let n = self.reader.lock().await.read(buf).await?;
        Ok((n, self.remote_addr))
    }

    async fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> Result<usize> {
        let n = self.writer.lock().await.write(buf).await?;
        Ok(n)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn test_id() -> ClientId {
        ClientId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8])
    }

    #[test]
    fn frame_layout() {
        let id = test_id();
        let new = encode_new(&id, b"payload");
        assert_eq!(new[0], PACKET_TYPE_NEW);
        assert_eq!(&new[1..9], id.as_bytes());
        assert_eq!(&new[9..], b"payload");

        let est = encode_established(b"payload");
        assert_eq!(est[0], PACKET_TYPE_ESTABLISHED);
        assert_eq!(&est[1..], b"payload");
    }

    #[test]
    fn client_ids_are_random_and_hex_printable() {
        let a = ClientId::random().unwrap();
        let b = ClientId::random().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 2 * CLIENT_ID_LENGTH);
        assert!(a.to_string().chars().all(|c| c.is_ascii_hexdigit()));
    }

    /// Drive the client conn against a raw peer to observe the wire
    /// format directly: first packet tagged 0xFE with the ID, packets
    /// after acknowledgement tagged 0xFF.
    #[tokio::test]
    async fn client_framing_on_the_wire() {
        let (client_io, mut raw) = tokio::io::duplex(1024);
        let client = ClientIdConn::new(
            StreamPacketConn::new(client_io, addr(1), addr(2)),
            test_id(),
        );

        client.send_to(b"first", addr(2)).await.unwrap();
        let mut buf = [0u8; 64];
        let n = raw.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &encode_new(&test_id(), b"first")[..]);

        // Before acknowledgement, retransmissions still carry the ID.
        client.send_to(b"second", addr(2)).await.unwrap();
        let n = raw.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], PACKET_TYPE_NEW);
        assert_eq!(n, 1 + CLIENT_ID_LENGTH + 6);

        // Server acknowledges; the client switches to 0xFF framing.
        raw.write_all(&encode_established(b"welcome")).await.unwrap();
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"welcome");
        assert_eq!(from, addr(2));
        assert!(client.acknowledged());

        client.send_to(b"third", addr(2)).await.unwrap();
        let n = raw.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &encode_established(b"third")[..]);
    }

    #[tokio::test]
    async fn client_discards_unknown_packets_without_eof() {
        let (client_io, mut raw) = tokio::io::duplex(1024);
        let client = ClientIdConn::new(
            StreamPacketConn::new(client_io, addr(1), addr(2)),
            test_id(),
        );

        raw.write_all(&[0x42, 1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(!client.acknowledged());

        // The conn survives a discard.
        raw.write_all(&encode_established(b"ok")).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
    }

    /// End-to-end over a boundary-preserving pipe: decoding the server's
    /// first read yields (id, payload); later reads yield payloads with
    /// the id already known.
    #[tokio::test]
    async fn client_server_roundtrip() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let client = ClientIdConn::new(
            StreamPacketConn::new(client_io, addr(1), addr(2)),
            test_id(),
        );
        let server = ServerIdConn::new(StreamPacketConn::new(server_io, addr(2), addr(1)));

        assert_eq!(server.client_id(), None);

        let mut buf = [0u8; 64];
        client.send_to(b"hello", addr(2)).await.unwrap();
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(server.client_id(), Some(test_id()));

        server.send_to(b"welcome", addr(1)).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"welcome");

        client.send_to(b"more", addr(2)).await.unwrap();
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"more");
        assert_eq!(server.client_id(), Some(test_id()));
    }

    #[tokio::test]
    async fn server_discards_malformed_packets() {
        let (mut raw, server_io) = tokio::io::duplex(1024);
        let server = ServerIdConn::new(StreamPacketConn::new(server_io, addr(2), addr(1)));

        let mut buf = [0u8; 64];

        // Unknown type byte.
        raw.write_all(&[0x00, 9, 9]).await.unwrap();
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        // 0xFE packet too short to carry an ID.
        raw.write_all(&[PACKET_TYPE_NEW, 1, 2]).await.unwrap();
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(server.client_id(), None);
    }

    #[tokio::test]
    async fn stream_wrapper_reports_fixed_addrs() {
        let (a, mut b) = tokio::io::duplex(64);
        let conn = StreamPacketConn::new(a, addr(10), addr(20));
        assert_eq!(conn.local_addr(), addr(10));

        b.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");
        assert_eq!(from, addr(20));

        conn.send_to(b"back", addr(20)).await.unwrap();
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"back");
    }
}
