//! Relay-side plumbing: the allowed-domain gate, the outbound WebSocket,
//! and the bidirectional copy loop.
//!
//! A broker-supplied relay URL is only honored when its hostname matches
//! the configured pattern and its scheme is `wss` (unless non-TLS relays
//! are explicitly allowed). The accepted URL gains a `client_ip` query
//! parameter when the client's remote address is known, so a stateless
//! relay can attribute the flow.

use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::rtc::DataChannelConn;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Hostname pattern restricting which relays this proxy will serve. A
/// leading `^` requires an exact match; otherwise the pattern matches any
/// hostname ending with it.
#[derive(Clone, Debug)]
pub struct RelayPattern {
    exact: bool,
    pattern: String,
}

impl RelayPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let (exact, pattern) = match raw.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if pattern.is_empty() {
            bail!("empty relay domain pattern");
        }
        if pattern.contains(|c: char| c.is_whitespace() || c == '/') {
            bail!("invalid relay domain pattern {raw:?}");
        }
        Ok(Self {
            exact,
            pattern: pattern.to_owned(),
        })
    }

    pub fn accepts(&self, host: &str) -> bool {
        if self.exact {
            host == self.pattern
        } else {
            host.ends_with(&self.pattern)
        }
    }
}

/// Gate a broker-supplied relay URL against the allowed pattern and
/// scheme policy.
pub(crate) fn validate_relay_url(
    raw: &str,
    pattern: &RelayPattern,
    allow_non_tls: bool,
) -> Result<Url> {
    let url = Url::parse(raw).context("rejected relay URL: unparseable")?;
    let host = url
        .host_str()
        .context("rejected relay URL: no hostname")?;
    if !pattern.accepts(host) {
        bail!("rejected relay URL: hostname {host:?} not allowed");
    }
    if !allow_non_tls && url.scheme() != "wss" {
        bail!("rejected relay URL: scheme {:?} is not wss", url.scheme());
    }
    Ok(url)
}

/// Attach the client's remote address as a `client_ip` query parameter.
pub(crate) fn with_client_ip(relay: &Url, client: Option<IpAddr>) -> Url {
    let mut url = relay.clone();
    if let Some(ip) = client {
        url.query_pairs_mut()
            .append_pair("client_ip", &ip.to_string());
    }
    url
}

/// Open the WebSocket to the relay.
pub(crate) async fn connect(url: &Url) -> Result<WsStream> {
    let (ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("error dialing relay {url}"))?;
    Ok(ws)
}

/// Pump bytes both ways between the client's data channel and the relay
/// WebSocket. Returns when either direction ends or shutdown fires; both
/// sides are closed on the way out.
pub(crate) async fn copy_loop(
    conn: DataChannelConn,
    ws: WsStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, handle) = conn.split();
    if *shutdown.borrow() {
        handle.close().await;
        return;
    }
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut up = tokio::spawn(async move {
        while let Some(data) = reader.recv().await {
            if let Err(e) = ws_tx.send(Message::Binary(data.to_vec())).await {
                log_ws_error("writing to relay", &e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut down = {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if let Err(e) = handle.send(&data).await {
                            log_dc_error("writing to data channel", &e);
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        if let Err(e) = handle.send(text.as_bytes()).await {
                            log_dc_error("writing to data channel", &e);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log_ws_error("reading from relay", &e);
                        break;
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = &mut up => {}
        _ = &mut down => {}
        _ = shutdown.changed() => {}
    }
    up.abort();
    down.abort();
    handle.close().await;
    debug!("copy loop ended");
}

/// A data-channel write that fails because the channel closed is the
/// normal end of a session. Anything else, a short write in particular,
/// is a contract violation and must not be mistaken for one.
fn log_dc_error(what: &str, e: &anyhow::Error) {
    let benign = format!("{e:#}").contains("closed");
    if benign {
        debug!("{what}: {e:#}");
    } else {
        warn!("{what}: {e:#}");
    }
}

/// Closed-connection errors are the normal end of a session, not a
/// failure worth a warning.
fn log_ws_error(what: &str, e: &WsError) {
    let benign = matches!(
        e,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    ) || matches!(e, WsError::Io(io) if matches!(
        io.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof
    ));
    if benign {
        debug!("{what}: {e}");
    } else {
        warn!("{what}: {e}");
    }
}
