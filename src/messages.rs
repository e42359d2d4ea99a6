//! Broker wire protocol messages.
//!
//! All exchanges with the broker are versioned JSON. A proxy poll request
//! (version 1.3) advertises the proxy's capabilities and load; the broker
//! replies with a status-discriminated poll response that either carries a
//! client's SDP offer plus an optional relay URL, or reports that no
//! client is waiting. The answer exchange (version 1.0) delivers the
//! proxy's SDP answer and yields a success boolean.
//!
//! The NAT probe service speaks the same encoding in reverse: the proxy
//! sends its own offer wrapped in a poll-response body, and the probe
//! answers with an answer-request body carrying the peer SDP.
//!
//! | Exchange | Request | Response |
//! |----------|---------|----------|
//! | Poll | `ProxyPollRequest` (v1.3) | `PollResponse` |
//! | Answer | `AnswerRequest` (v1.0) | `AnswerResponse` |
//! | Probe | `PollResponse` (offer) | `AnswerRequest` (answer) |

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Version prefix carried by proxy poll requests.
pub const POLL_VERSION: &str = "1.3";

/// Version prefix carried by answer requests.
pub const ANSWER_VERSION: &str = "1.0";

const STATUS_MATCH: &str = "client match";
const STATUS_NO_MATCH: &str = "no match";
const STATUS_SUCCESS: &str = "success";
const STATUS_CLIENT_GONE: &str = "client gone";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPollRequest {
    #[serde(rename = "Sid")]
    pub sid: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Type")]
    pub proxy_type: String,
    #[serde(rename = "NAT")]
    pub nat_type: String,
    #[serde(rename = "Clients")]
    pub clients: usize,
    #[serde(rename = "AcceptedRelayPattern")]
    pub accepted_relay_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PollResponse {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Offer", default, skip_serializing_if = "Option::is_none")]
    offer: Option<String>,
    #[serde(rename = "NAT", default, skip_serializing_if = "Option::is_none")]
    nat_type: Option<String>,
    #[serde(rename = "RelayURL", default, skip_serializing_if = "Option::is_none")]
    relay_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnswerRequest {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Sid")]
    sid: String,
    #[serde(rename = "Answer")]
    answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnswerResponse {
    #[serde(rename = "Status")]
    status: String,
}

/// A decoded poll response. `offer` is `None` when no client is waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOffer {
    pub offer: Option<String>,
    pub relay_url: Option<String>,
}

pub fn encode_poll_request(req: &ProxyPollRequest) -> Result<Vec<u8>> {
    serde_json::to_vec(req).context("encoding poll request")
}

pub fn decode_poll_response(body: &[u8]) -> Result<PollOffer> {
    let resp: PollResponse =
        serde_json::from_slice(body).context("decoding poll response")?;
    match resp.status.as_str() {
        STATUS_NO_MATCH => Ok(PollOffer {
            offer: None,
            relay_url: None,
        }),
        STATUS_MATCH => {
            let offer = match resp.offer {
                Some(o) if !o.is_empty() => o,
                _ => bail!("poll response reports a match but carries no offer"),
            };
            Ok(PollOffer {
                offer: Some(offer),
                relay_url: resp.relay_url.filter(|u| !u.is_empty()),
            })
        }
        other => bail!("unknown poll response status {other:?}"),
    }
}

pub fn encode_answer_request(sid: &str, answer: &str) -> Result<Vec<u8>> {
    serde_json::to_vec(&AnswerRequest {
        version: ANSWER_VERSION.to_owned(),
        sid: sid.to_owned(),
        answer: answer.to_owned(),
    })
    .context("encoding answer request")
}

/// Decode the broker's verdict on an answer: `true` means delivered,
/// `false` means the client timed out before the answer arrived.
pub fn decode_answer_response(body: &[u8]) -> Result<bool> {
    let resp: AnswerResponse =
        serde_json::from_slice(body).context("decoding answer response")?;
    match resp.status.as_str() {
        STATUS_SUCCESS => Ok(true),
        STATUS_CLIENT_GONE => Ok(false),
        other => bail!("unknown answer response status {other:?}"),
    }
}

/// Encode the proxy's own offer for the NAT probe service, which accepts
/// the poll-response framing.
pub fn encode_probe_offer(offer: &str) -> Result<Vec<u8>> {
    serde_json::to_vec(&PollResponse {
        status: STATUS_MATCH.to_owned(),
        offer: Some(offer.to_owned()),
        nat_type: None,
        relay_url: None,
    })
    .context("encoding probe offer")
}

/// Decode the probe service's reply, an answer-request body carrying the
/// peer's SDP answer.
pub fn decode_probe_answer(body: &[u8]) -> Result<String> {
    let req: AnswerRequest =
        serde_json::from_slice(body).context("decoding probe answer")?;
    if req.version != ANSWER_VERSION {
        bail!("unsupported probe answer version {:?}", req.version);
    }
    if req.answer.is_empty() {
        bail!("probe answer carries no SDP");
    }
    Ok(req.answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_request() -> ProxyPollRequest {
        ProxyPollRequest {
            sid: "abc123".into(),
            version: POLL_VERSION.into(),
            proxy_type: "standalone".into(),
            nat_type: "unknown".into(),
            clients: 8,
            accepted_relay_pattern: "example.net".into(),
        }
    }

    #[test]
    fn poll_request_uses_wire_field_names() {
        let body = encode_poll_request(&poll_request()).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["Sid"], "abc123");
        assert_eq!(v["Version"], "1.3");
        assert_eq!(v["Type"], "standalone");
        assert_eq!(v["NAT"], "unknown");
        assert_eq!(v["Clients"], 8);
        assert_eq!(v["AcceptedRelayPattern"], "example.net");
    }

    #[test]
    fn poll_response_client_match() {
        let body = br#"{"Status":"client match","Offer":"fake offer","RelayURL":"wss://relay.example.net/"}"#;
        let resp = decode_poll_response(body).unwrap();
        assert_eq!(resp.offer.as_deref(), Some("fake offer"));
        assert_eq!(resp.relay_url.as_deref(), Some("wss://relay.example.net/"));
    }

    #[test]
    fn poll_response_no_match_is_empty() {
        let resp = decode_poll_response(br#"{"Status":"no match"}"#).unwrap();
        assert_eq!(resp.offer, None);
        assert_eq!(resp.relay_url, None);
    }

    #[test]
    fn poll_response_match_without_offer_rejected() {
        assert!(decode_poll_response(br#"{"Status":"client match"}"#).is_err());
        assert!(decode_poll_response(br#"{"Status":"client match","Offer":""}"#).is_err());
    }

    #[test]
    fn poll_response_malformed_rejected() {
        assert!(decode_poll_response(b"").is_err());
        assert!(decode_poll_response(b"not json").is_err());
        assert!(decode_poll_response(br#"{"Status":"sideways"}"#).is_err());
        assert!(decode_poll_response(br#"{"Offer":"x"}"#).is_err());
    }

    #[test]
    fn answer_request_roundtrip() {
        let body = encode_answer_request("sid-1", "fake answer").unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["Version"], "1.0");
        assert_eq!(v["Sid"], "sid-1");
        assert_eq!(v["Answer"], "fake answer");
    }

    #[test]
    fn answer_response_statuses() {
        assert!(decode_answer_response(br#"{"Status":"success"}"#).unwrap());
        assert!(!decode_answer_response(br#"{"Status":"client gone"}"#).unwrap());
        assert!(decode_answer_response(br#"{"Status":"lost"}"#).is_err());
        assert!(decode_answer_response(b"{}").is_err());
    }

    #[test]
    fn probe_exchange_roundtrip() {
        let body = encode_probe_offer("probe offer").unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["Status"], "client match");
        assert_eq!(v["Offer"], "probe offer");

        let reply = br#"{"Version":"1.0","Sid":"s","Answer":"probe answer"}"#;
        assert_eq!(decode_probe_answer(reply).unwrap(), "probe answer");
    }

    #[test]
    fn probe_answer_version_and_contents_checked() {
        assert!(decode_probe_answer(br#"{"Version":"2.0","Sid":"s","Answer":"a"}"#).is_err());
        assert!(decode_probe_answer(br#"{"Version":"1.0","Sid":"s","Answer":""}"#).is_err());
    }
}
