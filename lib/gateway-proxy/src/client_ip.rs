//! Client address resolution behind trusted proxies

use hyper::header::{HeaderMap, HeaderName};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Resolves the address a request is attributed to.
///
/// `X-Forwarded-For` is only read when the TCP peer sits inside a trusted
/// network; hops are walked right to left and the first untrusted one wins.
#[derive(Clone, Debug, Default)]
pub struct ClientIpResolver {
    trusted: Vec<IpNetwork>,
}

impl ClientIpResolver {
    pub fn new(trusted: Vec<IpNetwork>) -> Self {
        Self { trusted }
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.trusted.iter().any(|net| net.contains(ip))
    }

    pub fn resolve(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        let peer = peer.to_canonical();
        if self.trusted.is_empty() || !self.is_trusted(peer) {
            return peer;
        }

        let hops: Vec<&str> = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .collect();

        for hop in hops.iter().rev() {
            match hop.parse::<IpAddr>() {
                Ok(ip) if self.is_trusted(ip) => continue,
                Ok(ip) => return ip.to_canonical(),
                Err(_) => return peer,
            }
        }
        peer
    }

    /// The request arrived over HTTPS at a trusted proxy in front of us
    pub fn forwarded_https(&self, peer: IpAddr, headers: &HeaderMap) -> bool {
        self.is_trusted(peer)
            && headers
                .get(&X_FORWARDED_PROTO)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("https"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn resolver() -> ClientIpResolver {
        ClientIpResolver::new(vec!["10.0.0.0/8".parse().expect("cidr")])
    }

    fn xff(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static(value));
        headers
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("ip")
    }

    #[test]
    fn test_untrusted_peer_ignores_header() {
        let r = resolver();
        assert_eq!(r.resolve(ip("203.0.113.9"), &xff("1.2.3.4")), ip("203.0.113.9"));
        assert_eq!(
            ClientIpResolver::default().resolve(ip("10.0.0.1"), &xff("1.2.3.4")),
            ip("10.0.0.1")
        );
    }

    #[test]
    fn test_trusted_peer_walks_right_to_left() {
        let r = resolver();
        assert_eq!(r.resolve(ip("10.0.0.1"), &xff("1.2.3.4")), ip("1.2.3.4"));
        assert_eq!(
            r.resolve(ip("10.0.0.1"), &xff("6.6.6.6, 1.2.3.4, 10.1.1.1")),
            ip("1.2.3.4")
        );
    }

    #[test]
    fn test_all_trusted_or_garbage_falls_back_to_peer() {
        let r = resolver();
        assert_eq!(r.resolve(ip("10.0.0.1"), &xff("10.2.2.2, 10.3.3.3")), ip("10.0.0.1"));
        assert_eq!(r.resolve(ip("10.0.0.1"), &xff("not-an-ip")), ip("10.0.0.1"));
        assert_eq!(r.resolve(ip("10.0.0.1"), &HeaderMap::new()), ip("10.0.0.1"));
    }

    #[test]
    fn test_ipv4_mapped_peer_is_canonical() {
        let r = resolver();
        assert_eq!(r.resolve(ip("::ffff:10.0.0.1"), &xff("1.2.3.4")), ip("1.2.3.4"));
        assert_eq!(r.resolve(ip("::ffff:203.0.113.9"), &HeaderMap::new()), ip("203.0.113.9"));
    }

    #[test]
    fn test_forwarded_https() {
        let r = resolver();
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        assert!(r.forwarded_https(ip("10.0.0.1"), &headers));
        assert!(!r.forwarded_https(ip("203.0.113.9"), &headers));
    }
}
