//! WebRTC session construction and the data-channel conn facade.
//!
//! Two entry points, both synchronous with respect to ICE gathering:
//!
//! - [`from_offer`] builds a peer connection around a client's SDP offer,
//!   waits for candidate gathering, and hands every incoming data channel
//!   to the caller as a [`DataChannelConn`].
//! - [`new_outgoing`] builds an offering peer connection with a locally
//!   created data channel; the NAT prober uses it to test whether a
//!   symmetric-NAT peer can reach us.
//!
//! The facade bridges the stack's callbacks to task-based flow: incoming
//! messages feed a channel whose closure is the EOF sentinel, and sends
//! observe the buffered-amount backpressure contract (a send suspends
//! while the transport holds more than [`BUFFERED_AMOUNT_LOW_THRESHOLD`]
//! bytes, resuming on the buffered-amount-low signal).

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::sdp;
use crate::stats::ByteCounters;

/// Writers suspend while the data channel buffers more than this.
pub(crate) const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 256 * 1024;

/// How long after signaling completes a peer gets to open its data
/// channel before the connection is abandoned.
pub(crate) const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(20);

/// Incoming data-channel messages queued between the stack's callback and
/// the reader task.
const MESSAGE_QUEUE_SIZE: usize = 32;

/// Invoked once per incoming data channel with the conn facade and the
/// client's filtered remote address.
pub(crate) type DataChannelHandler = Arc<dyn Fn(DataChannelConn, Option<IpAddr>) + Send + Sync>;

/// Static WebRTC parameters shared by every peer connection this proxy
/// builds.
#[derive(Clone, Debug)]
pub(crate) struct RtcConfig {
    pub stun_url: String,
    pub ephemeral_ports: Option<(u16, u16)>,
    pub nat_1to1_host: Option<String>,
}

impl RtcConfig {
    fn build_api(&self) -> Result<API> {
        let mut settings = SettingEngine::default();
        if let Some((min, max)) = self.ephemeral_ports {
            let ports = EphemeralUDP::new(min, max)
                .context("invalid ephemeral port range: min > max")?;
            settings.set_udp_network(UDPNetwork::Ephemeral(ports));
        }
        if let Some(host) = &self.nat_1to1_host {
            // Replaces SDP host candidates with the configured address;
            // server-reflexive candidates remain as fallback.
            settings.set_nat_1to1_ips(vec![host.clone()], RTCIceCandidateType::Host);
        }
        settings.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
        // Legacy broker deployments negotiate without ClientHello verify.
        settings.set_dtls_insecure_skip_helo_verify(true);
        Ok(APIBuilder::new().with_setting_engine(settings).build())
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun_url.clone()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

/// Build a peer connection from a remote SDP offer. Returns once ICE
/// gathering is complete with the answer in the local description;
/// answers without a single `a=candidate:` line are rejected. `opened`
/// is signalled when the client's data channel arrives, and `handler`
/// receives the conn facade for it.
pub(crate) async fn from_offer(
    cfg: &RtcConfig,
    offer: RTCSessionDescription,
    opened: Arc<Notify>,
    counters: ByteCounters,
    handler: DataChannelHandler,
) -> Result<Arc<RTCPeerConnection>> {
    let api = cfg.build_api()?;
    let pc = Arc::new(
        api.new_peer_connection(cfg.configuration())
            .await
            .context("accept: new_peer_connection")?,
    );

    let pc_weak = Arc::downgrade(&pc);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let pc_weak = pc_weak.clone();
        let opened = opened.clone();
        let counters = counters.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let Some(pc) = pc_weak.upgrade() else {
                return;
            };
            debug!(label = dc.label(), id = dc.id(), "new data channel");
            opened.notify_one();
            let (conn, remote) = DataChannelConn::accept(pc, dc, counters).await;
            handler(conn, remote);
        })
    }));

    // Trickle ICE is the stack default; gathering must finish before the
    // answer leaves, since the broker forwards one signaling message.
    let mut gathering_done = pc.gathering_complete_promise().await;

    if let Err(e) = pc.set_remote_description(offer).await {
        close_quietly(&pc).await;
        return Err(e).context("accept: set_remote_description");
    }
    let answer = match pc.create_answer(None).await {
        Ok(answer) => answer,
        Err(e) => {
            close_quietly(&pc).await;
            return Err(e).context("accept: create_answer");
        }
    };
    if let Err(e) = pc.set_local_description(answer).await {
        close_quietly(&pc).await;
        return Err(e).context("accept: set_local_description");
    }
    let _ = gathering_done.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("no local description after gathering"))?;
    if !sdp::contains_candidate(&local.sdp) {
        close_quietly(&pc).await;
        bail!("SDP answer contains no candidate");
    }
    Ok(pc)
}

/// Build an offering peer connection with a local data channel (the stack
/// gathers no candidates without one). Returns once gathering is complete
/// with the offer in the local description, plus the signal fired when
/// the data channel opens.
pub(crate) async fn new_outgoing(
    cfg: &RtcConfig,
) -> Result<(Arc<RTCPeerConnection>, Arc<Notify>)> {
    let api = cfg.build_api()?;
    let pc = Arc::new(
        api.new_peer_connection(cfg.configuration())
            .await
            .context("probe: new_peer_connection")?,
    );

    let dc = match pc.create_data_channel("probe", None).await {
        Ok(dc) => dc,
        Err(e) => {
            close_quietly(&pc).await;
            return Err(e).context("probe: create_data_channel");
        }
    };
    let opened = Arc::new(Notify::new());
    {
        let opened = opened.clone();
        dc.on_open(Box::new(move || {
            opened.notify_one();
            Box::pin(async {})
        }));
    }

    let offer = match pc.create_offer(None).await {
        Ok(offer) => offer,
        Err(e) => {
            close_quietly(&pc).await;
            return Err(e).context("probe: create_offer");
        }
    };
    let mut gathering_done = pc.gathering_complete_promise().await;
    if let Err(e) = pc.set_local_description(offer).await {
        close_quietly(&pc).await;
        return Err(e).context("probe: set_local_description");
    }
    let _ = gathering_done.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("no local description after gathering"))?;
    if !sdp::contains_candidate(&local.sdp) {
        close_quietly(&pc).await;
        bail!("probe SDP offer contains no candidate");
    }
    Ok((pc, opened))
}

async fn close_quietly(pc: &RTCPeerConnection) {
    if let Err(e) = pc.close().await {
        debug!("closing failed peer connection: {e}");
    }
}

struct DcShared {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    /// Write end of the message pipe. Taken on close so readers observe
    /// EOF instead of hanging.
    recv_tx: StdMutex<Option<mpsc::Sender<Bytes>>>,
    send_more: Notify,
    close_started: AtomicBool,
    counters: ByteCounters,
}

impl DcShared {
    fn shut_pipe(&self) {
        self.recv_tx.lock().unwrap().take();
        // Wake any writer stuck on backpressure so it can observe the
        // closed state.
        self.send_more.notify_one();
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.recv_tx.lock().unwrap().clone()
    }

    fn is_shut(&self) -> bool {
        self.close_started.load(Ordering::SeqCst) || self.recv_tx.lock().unwrap().is_none()
    }

    async fn close(&self) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shut_pipe();
        if let Err(e) = self.dc.close().await {
            debug!("closing data channel: {e}");
        }
        if let Err(e) = self.pc.close().await {
            warn!("closing peer connection: {e}");
        }
    }
}

/// Stream-like facade over one data channel. Reads come from the message
/// pipe fed by the stack's message callback; writes go through
/// [`DataChannelHandle::send`].
pub struct DataChannelConn {
    shared: Arc<DcShared>,
    recv: mpsc::Receiver<Bytes>,
    remote: Option<IpAddr>,
}

/// Receiving half of a split [`DataChannelConn`].
pub struct DataChannelReader {
    recv: mpsc::Receiver<Bytes>,
}

/// Sending/closing half of a [`DataChannelConn`]. Cheap to clone.
#[derive(Clone)]
pub struct DataChannelHandle {
    shared: Arc<DcShared>,
}

impl DataChannelConn {
    async fn accept(
        pc: Arc<RTCPeerConnection>,
        dc: Arc<RTCDataChannel>,
        counters: ByteCounters,
    ) -> (Self, Option<IpAddr>) {
        let (recv_tx, recv_rx) = mpsc::channel(MESSAGE_QUEUE_SIZE);
        let shared = Arc::new(DcShared {
            pc,
            dc: dc.clone(),
            recv_tx: StdMutex::new(Some(recv_tx)),
            send_more: Notify::new(),
            close_started: AtomicBool::new(false),
            counters,
        });

        dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
            .await;
        {
            let weak = Arc::downgrade(&shared);
            dc.on_buffered_amount_low(Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.send_more.notify_one();
                    }
                })
            }))
            .await;
        }
        {
            let weak = Arc::downgrade(&shared);
            dc.on_close(Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    debug!("data channel closed by peer");
                    if let Some(shared) = weak.upgrade() {
                        shared.shut_pipe();
                    }
                })
            }));
        }
        {
            let weak = Arc::downgrade(&shared);
            dc.on_message(Box::new(move |msg| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    let Some(sender) = shared.sender() else {
                        return;
                    };
                    let n = msg.data.len();
                    if sender.send(msg.data).await.is_ok() {
                        shared.counters.add_up(n);
                    }
                })
            }));
        }

        let remote = selected_remote_addr(&shared.pc).await;
        (
            Self {
                shared,
                recv: recv_rx,
                remote,
            },
            remote,
        )
    }

    /// Next message from the client, or `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.recv.recv().await
    }

    /// The client's remote address, already filtered against local,
    /// loopback, and unspecified ranges.
    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote
    }

    pub fn split(self) -> (DataChannelReader, DataChannelHandle) {
        (
            DataChannelReader { recv: self.recv },
            DataChannelHandle {
                shared: self.shared,
            },
        )
    }

    pub async fn close(&self) {
        self.shared.close().await;
    }
}

impl DataChannelReader {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.recv.recv().await
    }
}

impl DataChannelHandle {
    /// Send one data-channel message. Suspends while the channel buffers
    /// more than the low threshold, resuming on the buffered-amount-low
    /// signal.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        loop {
            if self.shared.is_shut() {
                bail!("data channel closed");
            }
            if self.shared.dc.buffered_amount().await <= BUFFERED_AMOUNT_LOW_THRESHOLD {
                break;
            }
            self.shared.send_more.notified().await;
        }
        let n = self
            .shared
            .dc
            .send(&Bytes::copy_from_slice(data))
            .await
            .context("writing to data channel")?;
        if n != data.len() {
            bail!("short write to data channel: {n} != {}", data.len());
        }
        self.shared.counters.add_down(n);
        Ok(n)
    }

    /// Close the data channel and its peer connection. Idempotent across
    /// concurrent callers; exactly one caller performs the teardown.
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

async fn selected_remote_addr(pc: &RTCPeerConnection) -> Option<IpAddr> {
    let pair = pc
        .sctp()
        .transport()
        .ice_transport()
        .get_selected_candidate_pair()
        .await?;
    let ip: IpAddr = pair.remote.address.parse().ok()?;
    sdp::is_remote_address(ip).then_some(ip)
}
