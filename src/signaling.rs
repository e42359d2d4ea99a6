//! Broker HTTP client.
//!
//! A thin wrapper around a base URL: `post` resolves a path against the
//! base, sends the body, and reads the response under a hard size cap so
//! a misbehaving broker cannot balloon memory. Non-200 statuses are
//! errors carrying the status code.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::StatusCode;
use url::Url;

/// Give up if the broker has not produced response headers in this time.
/// The body itself is bounded by size, not time.
pub(crate) const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of bytes read from a broker response body.
pub(crate) const READ_LIMIT: usize = 100_000;

#[derive(Clone)]
pub struct SignalingClient {
    base: Url,
    client: reqwest::Client,
}

impl SignalingClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url).context("invalid signaling URL")?;
        let client = reqwest::Client::builder()
            .build()
            .context("building HTTP client")?;
        Ok(Self { base, client })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// POST `body` to `path` resolved against the base URL (an empty path
    /// targets the base itself) and return the capped response body.
    pub async fn post(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let url = self
            .base
            .join(path)
            .with_context(|| format!("resolving path {path:?}"))?;
        // `send` resolves once response headers arrive, so this bounds
        // the headers only; the body read below is capped by size.
        let resp = tokio::time::timeout(
            RESPONSE_HEADER_TIMEOUT,
            self.client.post(url.clone()).body(body).send(),
        )
        .await
        .map_err(|_| anyhow!("timed out waiting for response headers from {url}"))?
        .with_context(|| format!("posting to {url}"))?;
        if resp.status() != StatusCode::OK {
            bail!("remote returned status code {}", resp.status().as_u16());
        }
        read_limited(resp, READ_LIMIT).await
    }
}

/// Read at most `limit` bytes of the response body. A body that exceeds
/// the limit is an unexpected-EOF error rather than a silent truncation.
async fn read_limited(mut resp: reqwest::Response, limit: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await.context("reading response body")? {
        body.extend_from_slice(&chunk);
        if body.len() > limit {
            bail!("unexpected EOF: response body exceeds {limit} bytes");
        }
    }
    Ok(body)
}
