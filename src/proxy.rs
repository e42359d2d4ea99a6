//! The proxy session engine.
//!
//! A [`Proxy`] repeatedly polls the broker for clients, negotiates a
//! WebRTC peer connection for each offer it receives, and ferries bytes
//! between the client's data channel and an outbound WebSocket to a
//! relay. Concurrency is bounded by the capacity token pool: one token
//! per live session, acquired before polling and released when the
//! session ends on any path.
//!
//! ## Quick start
//!
//! ```ignore
//! let proxy = Proxy::new(ProxyConfig {
//!     broker_url: "https://broker.example.net/".into(),
//!     ..Default::default()
//! })?;
//!
//! let runner = proxy.clone();
//! tokio::spawn(async move { runner.start().await });
//!
//! // ...
//! proxy.stop();
//! ```
//!
//! One session advances through polling, negotiation, waiting for the
//! client, and the active copy loop; shutdown or an error at any stage
//! closes it and returns the token. The session runner itself returns as
//! soon as the client's data channel arrives; from there a spawned
//! handler owns the peer connection and the token until the copy loop
//! finishes.

use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use url::Url;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::messages;
use crate::nat::{self, NatCell, NatType};
use crate::relay::{self, RelayPattern};
use crate::rtc::{self, DataChannelConn, RtcConfig, DATA_CHANNEL_TIMEOUT};
use crate::sdp;
use crate::signaling::SignalingClient;
use crate::stats::{self, ByteCounters};
use crate::tokens::{Token, Tokens};

pub const DEFAULT_BROKER_URL: &str = "https://broker.floe.network/";
pub const DEFAULT_RELAY_URL: &str = "wss://relay.floe.network/";
pub const DEFAULT_NAT_PROBE_URL: &str = "https://probe.floe.network/probe";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_PROXY_TYPE: &str = "standalone";
pub const DEFAULT_RELAY_DOMAIN_PATTERN: &str = "floe.network";

/// Pause between broker polls, and the main loop's tick.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(5);

const SESSION_ID_LENGTH: usize = 16;

/// Proxy configuration. Immutable once the proxy is built; unset string
/// fields fall back to the compiled-in defaults.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Maximum concurrent clients. 0 means unlimited.
    pub capacity: usize,
    /// STUN server used for ICE candidate gathering.
    pub stun_url: String,
    /// Broker to poll for client offers.
    pub broker_url: String,
    /// Relay used when the broker does not name one.
    pub relay_url: String,
    /// Keep local host candidates in outgoing answers.
    pub keep_local_addresses: bool,
    /// Replace SDP host candidates with this address.
    pub outbound_address: Option<String>,
    /// Restrict ICE UDP allocation to this port range; both zero means
    /// unrestricted.
    pub ephemeral_min_port: u16,
    pub ephemeral_max_port: u16,
    /// Allowed relay hostnames: leading `^` means exact match, otherwise
    /// suffix match.
    pub relay_domain_pattern: String,
    /// Accept broker-supplied relay URLs that are not `wss`.
    pub allow_non_tls_relay: bool,
    /// NAT probe service endpoint.
    pub nat_probe_url: String,
    /// How often to re-measure the NAT type. Zero disables retesting.
    pub nat_retest_interval: Duration,
    /// Label reported to the broker.
    pub proxy_type: String,
    /// How often to log a traffic summary. Zero disables summaries.
    pub summary_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            stun_url: DEFAULT_STUN_URL.to_owned(),
            broker_url: DEFAULT_BROKER_URL.to_owned(),
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            keep_local_addresses: false,
            outbound_address: None,
            ephemeral_min_port: 0,
            ephemeral_max_port: 0,
            relay_domain_pattern: DEFAULT_RELAY_DOMAIN_PATTERN.to_owned(),
            allow_non_tls_relay: false,
            nat_probe_url: DEFAULT_NAT_PROBE_URL.to_owned(),
            nat_retest_interval: Duration::from_secs(24 * 60 * 60),
            proxy_type: DEFAULT_PROXY_TYPE.to_owned(),
            summary_interval: Duration::from_secs(60 * 60),
        }
    }
}

fn normalize(config: &mut ProxyConfig) {
    fn fill(field: &mut String, default: &str) {
        if field.is_empty() {
            *field = default.to_owned();
        }
    }
    fill(&mut config.stun_url, DEFAULT_STUN_URL);
    fill(&mut config.broker_url, DEFAULT_BROKER_URL);
    fill(&mut config.relay_url, DEFAULT_RELAY_URL);
    fill(&mut config.nat_probe_url, DEFAULT_NAT_PROBE_URL);
    fill(&mut config.proxy_type, DEFAULT_PROXY_TYPE);
    fill(&mut config.relay_domain_pattern, DEFAULT_RELAY_DOMAIN_PATTERN);
}

/// Handle to a running (or startable) proxy instance. Cheap to clone;
/// every clone drives the same instance.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    config: ProxyConfig,
    broker: SignalingClient,
    rtc: RtcConfig,
    relay_pattern: RelayPattern,
    default_relay: Url,
    tokens: Tokens,
    nat: Arc<NatCell>,
    counters: ByteCounters,
    shutdown_tx: watch::Sender<bool>,
}

impl Proxy {
    /// Validate the configuration and build a proxy instance. URL, port
    /// range, and pattern problems are startup errors; nothing here
    /// touches the network.
    pub fn new(mut config: ProxyConfig) -> Result<Proxy> {
        normalize(&mut config);

        let broker =
            SignalingClient::new(&config.broker_url).context("configuring broker")?;
        Url::parse(&config.stun_url).context("invalid STUN URL")?;
        let default_relay =
            Url::parse(&config.relay_url).context("invalid relay URL")?;
        let relay_pattern = RelayPattern::parse(&config.relay_domain_pattern)
            .context("invalid relay domain pattern")?;

        let ephemeral_ports = match (config.ephemeral_min_port, config.ephemeral_max_port) {
            (0, 0) => None,
            (min, max) if min != 0 && max != 0 && min <= max => Some((min, max)),
            _ => bail!("invalid ephemeral port range"),
        };
        let rtc = RtcConfig {
            stun_url: config.stun_url.clone(),
            ephemeral_ports,
            nat_1to1_host: config.outbound_address.clone(),
        };

        let (shutdown_tx, _) = watch::channel(false);
        let tokens = Tokens::new(config.capacity);

        Ok(Proxy {
            inner: Arc::new(ProxyInner {
                broker,
                rtc,
                relay_pattern,
                default_relay,
                tokens,
                nat: Arc::new(NatCell::default()),
                counters: ByteCounters::new(),
                shutdown_tx,
                config,
            }),
        })
    }

    /// Run the proxy until [`stop`](Proxy::stop) is called: measure the
    /// NAT type once (failure is non-fatal), start the periodic NAT
    /// retester and traffic reporter, then serve sessions on a 5-second
    /// tick.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;

        if let Err(e) =
            nat::check_nat_type(&inner.rtc, &inner.config.nat_probe_url, &inner.nat).await
        {
            warn!("NAT probe failed: {e:#}");
        }
        info!(nat = %inner.nat.get(), "NAT type determined");

        nat::spawn_retester(
            inner.rtc.clone(),
            inner.config.nat_probe_url.clone(),
            inner.nat.clone(),
            inner.config.nat_retest_interval,
            self.shutdown_rx(),
        );
        stats::spawn_reporter(
            inner.counters.clone(),
            inner.tokens.clone(),
            inner.config.summary_interval,
            self.shutdown_rx(),
        );

        let mut shutdown = self.shutdown_rx();
        if *shutdown.borrow() {
            return Ok(());
        }
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let token = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                token = inner.tokens.acquire() => token,
            };
            let sid = gen_session_id().context("generating session ID")?;
            self.run_session(sid, token).await;
        }
    }

    /// Signal shutdown. Every running poll, handshake wait, and copy
    /// loop unwinds; calling this more than once is the same as once.
    pub fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// The most recently measured NAT classification.
    pub fn nat_type(&self) -> NatType {
        self.inner.nat.get()
    }

    /// Number of clients currently being served.
    pub fn in_flight(&self) -> usize {
        self.inner.tokens.in_flight()
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// One pass of the session state machine: poll for an offer, gate the
    /// relay URL, negotiate, deliver the answer, then race the client's
    /// data channel against the open timeout. The token travels into the
    /// data-channel handler on success and is dropped here on every other
    /// path.
    async fn run_session(&self, sid: String, token: Token) {
        let inner = &self.inner;

        let Some((offer, relay_url)) = self.poll_offer(&sid).await else {
            return;
        };

        let relay_url = match relay_url {
            Some(raw) => match relay::validate_relay_url(
                &raw,
                &inner.relay_pattern,
                inner.config.allow_non_tls_relay,
            ) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("bad offer from broker: {e:#}");
                    return;
                }
            },
            None => None,
        };

        let opened = Arc::new(Notify::new());
        let token_cell = Arc::new(StdMutex::new(Some(token)));
        let handler: rtc::DataChannelHandler = {
            let proxy = self.clone();
            let token_cell = token_cell.clone();
            let relay_url = relay_url.clone();
            Arc::new(move |conn, remote_addr| {
                // Exactly one owner: whoever takes the token runs the
                // session; a second data channel on the same peer
                // connection is ignored.
                let Some(token) = token_cell.lock().unwrap().take() else {
                    return;
                };
                let proxy = proxy.clone();
                let relay_url = relay_url.clone();
                tokio::spawn(async move {
                    proxy
                        .handle_data_channel(conn, remote_addr, relay_url, token)
                        .await;
                });
            })
        };

        let pc = match rtc::from_offer(
            &inner.rtc,
            offer,
            opened.clone(),
            inner.counters.clone(),
            handler,
        )
        .await
        {
            Ok(pc) => pc,
            Err(e) => {
                warn!("error making WebRTC connection: {e:#}");
                token_cell.lock().unwrap().take();
                return;
            }
        };

        if let Err(e) = self.send_answer(&sid, &pc).await {
            warn!("error sending answer to client through broker: {e:#}");
            close_pc(&pc).await;
            token_cell.lock().unwrap().take();
            return;
        }

        let mut shutdown = self.shutdown_rx();
        if *shutdown.borrow() {
            close_pc(&pc).await;
            token_cell.lock().unwrap().take();
            return;
        }
        tokio::select! {
            _ = opened.notified() => {
                info!("connection successful");
            }
            _ = tokio::time::sleep(DATA_CHANNEL_TIMEOUT) => {
                info!("timed out waiting for client to open data channel");
                close_pc(&pc).await;
                token_cell.lock().unwrap().take();
            }
            _ = shutdown.changed() => {
                close_pc(&pc).await;
                token_cell.lock().unwrap().take();
            }
        }
    }

    /// Poll the broker until it produces an offer, shutdown fires, or the
    /// exchange fails. A failed round trip ends this session; the main
    /// loop starts a fresh one on its next tick.
    async fn poll_offer(
        &self,
        sid: &str,
    ) -> Option<(RTCSessionDescription, Option<String>)> {
        let inner = &self.inner;
        let mut shutdown = self.shutdown_rx();
        loop {
            if *shutdown.borrow() {
                return None;
            }
            let req = messages::ProxyPollRequest {
                sid: sid.to_owned(),
                version: messages::POLL_VERSION.to_owned(),
                proxy_type: inner.config.proxy_type.clone(),
                nat_type: inner.nat.get().to_string(),
                clients: inner.tokens.num_clients(),
                accepted_relay_pattern: inner.config.relay_domain_pattern.clone(),
            };
            let body = match messages::encode_poll_request(&req) {
                Ok(body) => body,
                Err(e) => {
                    warn!("error encoding poll message: {e:#}");
                    return None;
                }
            };
            match inner.broker.post("proxy", body).await {
                Err(e) => {
                    warn!("error polling broker: {e:#}");
                    return None;
                }
                Ok(resp) => match messages::decode_poll_response(&resp) {
                    Err(e) => {
                        warn!("error reading broker response: {e:#}");
                        return None;
                    }
                    Ok(poll) => {
                        if let Some(offer_json) = poll.offer {
                            match serde_json::from_str::<RTCSessionDescription>(&offer_json)
                            {
                                Ok(offer) => return Some((offer, poll.relay_url)),
                                Err(e) => {
                                    warn!("error processing session description: {e:#}");
                                    return None;
                                }
                            }
                        }
                        // No client waiting; poll again after the interval.
                    }
                },
            }
            tokio::select! {
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Scrub local candidates from the answer unless configured otherwise
    /// and deliver it through the broker. A `false` verdict means the
    /// client gave up waiting.
    async fn send_answer(&self, sid: &str, pc: &RTCPeerConnection) -> Result<()> {
        let inner = &self.inner;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("peer connection has no local description"))?;
        let sdp_text = if inner.config.keep_local_addresses {
            local.sdp.clone()
        } else {
            sdp::strip_local_addresses(&local.sdp)
        };
        let answer = RTCSessionDescription::answer(sdp_text)
            .context("assembling answer description")?;
        let answer_json =
            serde_json::to_string(&answer).context("serializing answer")?;

        let body = messages::encode_answer_request(sid, &answer_json)?;
        let resp = inner.broker.post("answer", body).await?;
        if !messages::decode_answer_response(&resp)? {
            bail!("broker returned client timeout");
        }
        Ok(())
    }

    /// Owns one client session from data-channel arrival to copy-loop
    /// termination. Holds the token for exactly that span.
    async fn handle_data_channel(
        &self,
        conn: DataChannelConn,
        remote_addr: Option<IpAddr>,
        relay_url: Option<Url>,
        token: Token,
    ) {
        let inner = &self.inner;
        let relay_base = relay_url.unwrap_or_else(|| inner.default_relay.clone());
        if remote_addr.is_none() {
            debug!("no usable remote address for client");
        }
        let url = relay::with_client_ip(&relay_base, remote_addr);

        let ws = match relay::connect(&url).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("{e:#}");
                conn.close().await;
                drop(token);
                return;
            }
        };
        info!(relay = %relay_base, "connected to relay");

        relay::copy_loop(conn, ws, self.shutdown_rx()).await;
        inner.counters.connection_done();
        drop(token);
    }
}

async fn close_pc(pc: &RTCPeerConnection) {
    if let Err(e) = pc.close().await {
        warn!("error closing peer connection: {e}");
    }
}

/// 16 random bytes, base64 without padding.
fn gen_session_id() -> Result<String> {
    let mut buf = [0u8; SESSION_ID_LENGTH];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!("CSPRNG unavailable: {e}"))?;
    Ok(STANDARD_NO_PAD.encode(buf))
}
