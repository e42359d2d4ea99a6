//! NAT-type discovery.
//!
//! The broker matches clients behind symmetric NATs only with proxies
//! that can reach them, so the proxy periodically probes a service that
//! sits behind a known symmetric NAT. A probe that opens a data channel
//! classifies this host as unrestricted; a probe that completes signaling
//! but times out waiting for the channel classifies it as restricted. A
//! probe that fails earlier leaves the previous classification in place.

use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::rtc::{self, RtcConfig, DATA_CHANNEL_TIMEOUT};
use crate::signaling::SignalingClient;

/// Coarse classification of this host's reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    /// The probe service was never reached.
    #[default]
    Unknown,
    /// Signaling completed but the symmetric-NAT peer could not connect.
    Restricted,
    /// A symmetric-NAT peer connected successfully.
    Unrestricted,
}

impl NatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::Unknown => "unknown",
            NatType::Restricted => "restricted",
            NatType::Unrestricted => "unrestricted",
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The proxy's current NAT classification: many readers (poll requests),
/// one occasional writer (the prober).
#[derive(Default)]
pub(crate) struct NatCell(RwLock<NatType>);

impl NatCell {
    pub fn get(&self) -> NatType {
        *self.0.read().unwrap()
    }

    pub fn set(&self, nat: NatType) {
        *self.0.write().unwrap() = nat;
    }
}

/// Run one active probe against `probe_url` and update `cell` with the
/// outcome. Errors before the data-channel race leave the cell untouched.
pub(crate) async fn check_nat_type(
    rtc_cfg: &RtcConfig,
    probe_url: &str,
    cell: &NatCell,
) -> Result<()> {
    let probe = SignalingClient::new(probe_url).context("parsing probe URL")?;

    let (pc, opened) = rtc::new_outgoing(rtc_cfg)
        .await
        .context("probe: building peer connection")?;

    if let Err(e) = probe_exchange(&probe, &pc).await {
        close_probe(&pc).await;
        return Err(e);
    }

    let prev = cell.get();
    tokio::select! {
        _ = opened.notified() => cell.set(NatType::Unrestricted),
        _ = tokio::time::sleep(DATA_CHANNEL_TIMEOUT) => cell.set(NatType::Restricted),
    }
    info!("NAT type measurement: {prev} -> {}", cell.get());

    close_probe(&pc).await;
    Ok(())
}

/// Send our offer to the probe service and install its answer.
async fn probe_exchange(probe: &SignalingClient, pc: &RTCPeerConnection) -> Result<()> {
    let offer = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("probe peer connection has no local description"))?;
    let offer_json =
        serde_json::to_string(&offer).context("serializing probe offer")?;
    let body = crate::messages::encode_probe_offer(&offer_json)?;

    let resp = probe.post("", body).await.context("polling probe service")?;
    let answer_json = crate::messages::decode_probe_answer(&resp)?;
    let answer: RTCSessionDescription =
        serde_json::from_str(&answer_json).context("parsing probe answer SDP")?;

    pc.set_remote_description(answer)
        .await
        .context("probe: set_remote_description")
}

async fn close_probe(pc: &RTCPeerConnection) {
    if let Err(e) = pc.close().await {
        debug!("closing probe peer connection: {e}");
    }
}

/// Re-run the probe every `interval` until shutdown. A zero interval
/// disables retesting. A failed probe retains the previous NAT type
/// rather than regressing to unknown.
pub(crate) fn spawn_retester(
    rtc_cfg: RtcConfig,
    probe_url: String,
    cell: std::sync::Arc<NatCell>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = check_nat_type(&rtc_cfg, &probe_url, &cell).await {
                warn!(
                    "periodic NAT probe failed: {e:#}, retaining current NAT type: {}",
                    cell.get()
                );
            }
        }
    });
}
