use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use floe::{Proxy, ProxyConfig};

#[derive(Parser, Debug)]
#[command(name = "floe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum number of clients to serve concurrently (0 = unlimited)
    #[arg(long, default_value = "0")]
    capacity: usize,

    /// Broker URL to poll for clients
    #[arg(long, default_value = floe::DEFAULT_BROKER_URL)]
    broker: String,

    /// Relay URL used when the broker does not name one
    #[arg(long, default_value = floe::DEFAULT_RELAY_URL)]
    relay: String,

    /// STUN server URL for ICE gathering
    #[arg(long, default_value = floe::DEFAULT_STUN_URL)]
    stun: String,

    /// NAT probe service URL
    #[arg(long, default_value = floe::DEFAULT_NAT_PROBE_URL)]
    nat_probe: String,

    /// Keep local host candidates in outgoing answers
    #[arg(long)]
    keep_local_addresses: bool,

    /// Use this address for SDP host candidates
    #[arg(long)]
    outbound_address: Option<String>,

    /// Restrict ICE UDP allocation to PORT_MIN:PORT_MAX
    #[arg(long, value_name = "MIN:MAX", value_parser = parse_port_range)]
    ephemeral_ports_range: Option<(u16, u16)>,

    /// Allowed relay hostnames; a leading ^ requires an exact match,
    /// otherwise the pattern matches hostname suffixes
    #[arg(long, default_value = floe::DEFAULT_RELAY_DOMAIN_PATTERN)]
    allowed_relay_hostname_pattern: String,

    /// Accept broker-supplied relay URLs that are not wss
    #[arg(long)]
    allow_non_tls_relay: bool,

    /// Seconds between NAT type re-measurements (0 disables)
    #[arg(long, default_value = "86400")]
    nat_retest_interval: u64,

    /// Seconds between traffic summaries (0 disables)
    #[arg(long, default_value = "3600")]
    summary_interval: u64,

    /// Proxy type label reported to the broker
    #[arg(long, default_value = floe::DEFAULT_PROXY_TYPE)]
    proxy_type: String,
}

fn parse_port_range(raw: &str) -> Result<(u16, u16), String> {
    let (min, max) = raw
        .split_once(':')
        .ok_or_else(|| "expected MIN:MAX".to_owned())?;
    let min: u16 = min.parse().map_err(|e| format!("invalid min port: {e}"))?;
    let max: u16 = max.parse().map_err(|e| format!("invalid max port: {e}"))?;
    if min == 0 || max == 0 || min > max {
        return Err("expected 0 < MIN <= MAX".to_owned());
    }
    Ok((min, max))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let (ephemeral_min_port, ephemeral_max_port) =
        args.ephemeral_ports_range.unwrap_or((0, 0));

    let proxy = Proxy::new(ProxyConfig {
        capacity: args.capacity,
        stun_url: args.stun,
        broker_url: args.broker,
        relay_url: args.relay,
        keep_local_addresses: args.keep_local_addresses,
        outbound_address: args.outbound_address,
        ephemeral_min_port,
        ephemeral_max_port,
        relay_domain_pattern: args.allowed_relay_hostname_pattern,
        allow_non_tls_relay: args.allow_non_tls_relay,
        nat_probe_url: args.nat_probe,
        nat_retest_interval: Duration::from_secs(args.nat_retest_interval),
        proxy_type: args.proxy_type,
        summary_interval: Duration::from_secs(args.summary_interval),
    })?;

    let runner = proxy.clone();
    let mut serving = tokio::spawn(async move { runner.start().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
            proxy.stop();
            if let Ok(Err(e)) = serving.await {
                warn!(error = %e, "proxy exited with error");
            }
        }
        result = &mut serving => {
            if let Ok(Err(e)) = result {
                warn!(error = %e, "proxy exited with error");
            }
        }
    }

    Ok(())
}
