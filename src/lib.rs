//! # Floe - WebRTC Circumvention Proxy Core
//!
//! Floe lets volunteers relay traffic for censored users: a proxy polls
//! a central **broker** for clients, negotiates a short-lived WebRTC
//! data channel with each one, and ferries bytes between that channel
//! and a secure WebSocket to a **relay** server. On the client side the
//! crate provides the multiplexing machinery that spreads one logical
//! session across many such transient proxies.
//!
//! ## Running a proxy
//!
//! ```ignore
//! let proxy = floe::Proxy::new(floe::ProxyConfig {
//!     capacity: 10,
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
//! ## Architecture
//!
//! Every long-lived activity is its own tokio task: the main loop ticks
//! every five seconds and acquires a capacity token before polling, each
//! accepted client gets a handler task that owns its peer connection and
//! token until the copy loop ends, and the NAT retester and traffic
//! reporter run periodically in the background. A single watch-channel
//! shutdown signal unwinds all of them.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `proxy` | Proxy instance: config, main loop, session runner |
//! | `signaling` | HTTP client for the broker and the NAT probe |
//! | `messages` | Versioned JSON wire messages |
//! | `rtc` | WebRTC session building, data-channel conn facade |
//! | `sdp` | Candidate hygiene and address classification |
//! | `relay` | Relay gate, WebSocket dial, copy loop |
//! | `nat` | NAT-type probing and periodic retesting |
//! | `tokens` | Capacity token pool |
//! | `stats` | Traffic counters and periodic summaries |
//! | `mux` | Client-side multiplexing packet conn |
//! | `framing` | Client-ID framing over transient conns |

mod framing;
mod messages;
mod mux;
mod nat;
mod proxy;
mod relay;
mod rtc;
mod sdp;
mod signaling;
mod stats;
mod tokens;

pub use framing::{
    encode_established, encode_new, ClientId, ClientIdConn, ServerIdConn, StreamPacketConn,
    CLIENT_ID_LENGTH, PACKET_TYPE_ESTABLISHED, PACKET_TYPE_NEW,
};
pub use mux::{Dialer, MuxPacketConn, PacketConn};
pub use nat::NatType;
pub use proxy::{
    Proxy, ProxyConfig, DEFAULT_BROKER_URL, DEFAULT_NAT_PROBE_URL, DEFAULT_PROXY_TYPE,
    DEFAULT_RELAY_DOMAIN_PATTERN, DEFAULT_RELAY_URL, DEFAULT_STUN_URL,
};
pub use relay::RelayPattern;
pub use rtc::{DataChannelConn, DataChannelHandle, DataChannelReader};
pub use stats::{ByteCounters, TrafficSummary};
pub use tokens::{Token, Tokens};
