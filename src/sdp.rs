//! SDP candidate hygiene.
//!
//! Outgoing answers are scrubbed of candidate lines that point at local,
//! loopback, or unspecified addresses unless the operator opted to keep
//! them. The same address classification decides whether a client's
//! remote address is safe to forward to the relay as `client_ip`.

use std::net::IpAddr;

/// True for addresses that only have meaning on the local network:
/// RFC 1918 and link-local IPv4, unique-local and link-local IPv6.
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            // fc00::/7 unique-local, fe80::/10 link-local
            (seg[0] & 0xfe00) == 0xfc00 || (seg[0] & 0xffc0) == 0xfe80
        }
    }
}

/// True when `ip` is usable as the client's remote address: routable and
/// neither unspecified, loopback, nor local.
pub fn is_remote_address(ip: IpAddr) -> bool {
    !(is_local_address(ip) || ip.is_unspecified() || ip.is_loopback())
}

/// True if the session description contains at least one ICE candidate.
pub fn contains_candidate(sdp: &str) -> bool {
    sdp.contains("\na=candidate:")
}

/// Remove `a=candidate:` lines whose connection address is local,
/// loopback, or unspecified. Lines whose address is not an IP literal
/// (e.g. an mDNS hostname) are left alone; mDNS is disabled separately.
/// Idempotent.
pub fn strip_local_addresses(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len());
    for line in sdp.split_inclusive('\n') {
        if candidate_is_local(line) {
            continue;
        }
        out.push_str(line);
    }
    out
}

fn candidate_is_local(line: &str) -> bool {
    let Some(rest) = line.strip_prefix("a=candidate:") else {
        return false;
    };
    // a=candidate:<foundation> <component> <transport> <priority>
    //             <connection-address> <port> typ <type> ...
    let Some(addr) = rest.split_ascii_whitespace().nth(4) else {
        return false;
    };
    match addr.parse::<IpAddr>() {
        Ok(ip) => is_local_address(ip) || ip.is_unspecified() || ip.is_loopback(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
        o=- 123 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=candidate:1 1 udp 2122260223 192.168.1.10 56688 typ host generation 0\r\n\
        a=candidate:2 1 udp 2122262783 10.0.0.5 49226 typ host generation 0\r\n\
        a=candidate:3 1 udp 1686052607 203.0.113.44 56688 typ srflx raddr 0.0.0.0 rport 0\r\n\
        a=candidate:4 1 udp 2122131711 169.254.7.7 53622 typ host generation 0\r\n\
        a=candidate:5 1 udp 2122136831 fe80::1111 54653 typ host generation 0\r\n\
        a=end-of-candidates\r\n";

    #[test]
    fn strip_removes_local_candidates_only() {
        let stripped = strip_local_addresses(SDP);
        assert!(!stripped.contains("192.168.1.10"));
        assert!(!stripped.contains("10.0.0.5"));
        assert!(!stripped.contains("169.254.7.7"));
        assert!(!stripped.contains("fe80::1111"));
        assert!(stripped.contains("203.0.113.44"));
        // Non-candidate lines survive even when they mention local IPs.
        assert!(stripped.contains("o=- 123 2 IN IP4 127.0.0.1"));
        assert!(stripped.contains("c=IN IP4 0.0.0.0"));
        assert!(stripped.contains("a=end-of-candidates"));
    }

    #[test]
    fn strip_is_idempotent() {
        let once = strip_local_addresses(SDP);
        let twice = strip_local_addresses(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn candidate_detection() {
        assert!(contains_candidate(SDP));
        let stripped = strip_local_addresses(SDP);
        assert!(contains_candidate(&stripped));
        assert!(!contains_candidate("v=0\r\ns=-\r\n"));
    }

    #[test]
    fn remote_address_filter() {
        let cases: &[(&str, bool)] = &[
            ("203.0.113.44", true),
            ("2001:db8::1", true),
            ("192.168.1.10", false),
            ("10.0.0.5", false),
            ("172.16.3.3", false),
            ("169.254.7.7", false),
            ("127.0.0.1", false),
            ("0.0.0.0", false),
            ("::", false),
            ("::1", false),
            ("fe80::1", false),
            ("fd00::2", false),
        ];
        for (addr, want) in cases {
            let ip: IpAddr = addr.parse().unwrap();
            assert_eq!(is_remote_address(ip), *want, "address {addr}");
        }
    }

    #[test]
    fn mdns_hostname_candidates_kept() {
        let sdp = "a=candidate:1 1 udp 1 abcd.local 9 typ host\r\n";
        assert_eq!(strip_local_addresses(sdp), sdp);
    }
}
