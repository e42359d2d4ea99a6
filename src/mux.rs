//! Long-lived packet conn multiplexed over transient peers.
//!
//! A [`MuxPacketConn`] presents one stable datagram endpoint to the
//! session layer while the peers underneath come and go. A dial loop
//! keeps up to `count` transient conns alive, redialing whenever one
//! fails; a multiplexer distributes outgoing packets across the live
//! slots in strict round-robin order. The conn only fails permanently
//! when a dial fails: that first error is latched and returned from
//! every subsequent operation.
//!
//! Addresses are static labels configured at construction; the addresses
//! of the transient conns underneath never surface.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

/// Packets buffered in the global queues and in each slot queue.
const QUEUE_SIZE: usize = 2048;

/// Largest datagram read from a transient conn.
const PACKET_BUF_SIZE: usize = 1500;

/// A connectionless datagram endpoint.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one packet into `buf`, returning its length and source
    /// address. Oversized packets are truncated to `buf`.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Send one packet toward `addr`.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize>;

    fn local_addr(&self) -> SocketAddr;

    async fn close(&self) -> Result<()>;
}

/// Produces a fresh transient conn for each free peer slot.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<Box<dyn PacketConn>>;
}

/// Shared close latch: the first error wins and every later operation
/// reports it.
#[derive(Clone)]
struct CloseState {
    closed: Arc<watch::Sender<bool>>,
    err: Arc<OnceLock<String>>,
}

impl CloseState {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            closed: Arc::new(closed),
            err: Arc::new(OnceLock::new()),
        }
    }

    /// Latch the error and broadcast closure. Returns false if the conn
    /// was already closed.
    fn close_with_error(&self, err: Option<String>) -> bool {
        let first = self
            .err
            .set(err.unwrap_or_else(|| "operation on closed connection".to_owned()))
            .is_ok();
        let _ = self.closed.send(true);
        first
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn error(&self) -> anyhow::Error {
        match self.err.get() {
            Some(msg) => anyhow!("{msg}"),
            None => anyhow!("operation on closed connection"),
        }
    }
}

/// See the module documentation.
pub struct MuxPacketConn {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    recv_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    send_tx: mpsc::Sender<Vec<u8>>,
    state: CloseState,
}

impl MuxPacketConn {
    /// Build the conn and start its dial loop and multiplexer. `count`
    /// is the number of concurrent transient peers to maintain.
    pub fn new(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        count: NonZeroUsize,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (send_tx, send_rx) = mpsc::channel(QUEUE_SIZE);
        let (recv_tx, recv_rx) = mpsc::channel(QUEUE_SIZE);
        let state = CloseState::new();

        tokio::spawn(dial_loop(
            dialer,
            count.get(),
            send_rx,
            recv_tx,
            remote_addr,
            state.clone(),
        ));

        Self {
            local_addr,
            remote_addr,
            recv_rx: Mutex::new(recv_rx),
            send_tx,
            state,
        }
    }
}

#[async_trait]
impl PacketConn for MuxPacketConn {
    /// The packet's original source is replaced with the conn's static
    /// remote address.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.state.is_closed() {
            return Err(self.state.error());
        }
        let mut recv_rx = self.recv_rx.lock().await;
        let mut closed = self.state.subscribe();
        tokio::select! {
            _ = closed.changed() => Err(self.state.error()),
            packet = recv_rx.recv() => match packet {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok((n, self.remote_addr))
                }
                None => Err(self.state.error()),
            }
        }
    }

    /// `addr` is ignored; packets go to the conn's static remote
    /// address. When the send queue is full the packet is dropped
    /// silently: datagram loss tolerance, not an error.
    async fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> Result<usize> {
        if self.state.is_closed() {
            return Err(self.state.error());
        }
        match self.send_tx.try_send(buf.to_vec()) {
            Ok(()) => Ok(buf.len()),
            Err(TrySendError::Full(_)) => Ok(buf.len()),
            Err(TrySendError::Closed(_)) => Err(self.state.error()),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Unblock pending operations and make future ones fail. Closing an
    /// already-closed conn is an error.
    async fn close(&self) -> Result<()> {
        if self.state.close_with_error(None) {
            Ok(())
        } else {
            Err(self.state.error())
        }
    }
}

/// Keep `count` transient peers alive. Each free slot is redialed; the
/// first dial error closes the whole conn permanently.
async fn dial_loop(
    dialer: Arc<dyn Dialer>,
    count: usize,
    send_rx: mpsc::Receiver<Vec<u8>>,
    recv_tx: mpsc::Sender<Vec<u8>>,
    remote: SocketAddr,
    state: CloseState,
) {
    let mut ring = VecDeque::with_capacity(count);
    let (slot_tx, mut slot_rx) = mpsc::channel::<mpsc::Receiver<Vec<u8>>>(count);
    for _ in 0..count {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        ring.push_back(tx);
        // Capacity equals count; this cannot fail.
        let _ = slot_tx.try_send(rx);
    }
    tokio::spawn(multiplex(ring, send_rx, state.clone()));

    let mut closed = state.subscribe();
    loop {
        if state.is_closed() {
            return;
        }
        let queue = tokio::select! {
            _ = closed.changed() => return,
            queue = slot_rx.recv() => match queue {
                Some(queue) => queue,
                None => return,
            }
        };
        let dialer = dialer.clone();
        let recv_tx = recv_tx.clone();
        let slot_tx = slot_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut closed = state.subscribe();
            let conn: Arc<dyn PacketConn> = tokio::select! {
                _ = closed.changed() => return,
                conn = dialer.dial() => match conn {
                    Ok(conn) => Arc::from(conn),
                    Err(e) => {
                        state.close_with_error(Some(format!("dial failed: {e:#}")));
                        return;
                    }
                }
            };
            let mut queue = queue;
            exchange(&conn, &mut queue, &recv_tx, remote, &state).await;
            let _ = conn.close().await;
            // Hand the slot back for the next dial.
            let _ = slot_tx.send(queue).await;
        });
    }
}

/// Round-robin packets from the global send queue into the slot queues.
/// Only this task touches the ring.
async fn multiplex(
    mut ring: VecDeque<mpsc::Sender<Vec<u8>>>,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
    state: CloseState,
) {
    let mut closed = state.subscribe();
    loop {
        if state.is_closed() {
            return;
        }
        let packet = tokio::select! {
            _ = closed.changed() => return,
            packet = send_rx.recv() => match packet {
                Some(packet) => packet,
                None => return,
            }
        };
        let Some(front) = ring.front() else { return };
        if front.send(packet).await.is_err() {
            return;
        }
        ring.rotate_left(1);
    }
}

/// Pump one transient conn: a reader pushes received packets into the
/// global receive queue (dropping when it is full), while this task
/// drains the slot's send queue. Either side's failure tears the peer
/// down and frees its slot.
async fn exchange(
    conn: &Arc<dyn PacketConn>,
    queue: &mut mpsc::Receiver<Vec<u8>>,
    recv_tx: &mpsc::Sender<Vec<u8>>,
    remote: SocketAddr,
    state: &CloseState,
) {
    let mut reader = {
        let conn = conn.clone();
        let recv_tx = recv_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut closed = state.subscribe();
            let mut buf = vec![0u8; PACKET_BUF_SIZE];
            loop {
                if state.is_closed() {
                    return;
                }
                let result = tokio::select! {
                    _ = closed.changed() => return,
                    result = conn.recv_from(&mut buf) => result,
                };
                match result {
                    Ok((n, _)) => {
                        // OK to drop packets when the queue is full.
                        let _ = recv_tx.try_send(buf[..n].to_vec());
                    }
                    Err(e) => {
                        debug!("transient conn read ended: {e:#}");
                        return;
                    }
                }
            }
        })
    };

    let mut closed = state.subscribe();
    loop {
        if state.is_closed() {
            break;
        }
        tokio::select! {
            _ = closed.changed() => break,
            _ = &mut reader => break,
            packet = queue.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = conn.send_to(&packet, remote).await {
                        debug!("transient conn write ended: {e:#}");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    reader.abort();
}
