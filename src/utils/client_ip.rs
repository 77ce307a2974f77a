use axum::extract::ConnectInfo;
use axum::http::{Extensions, HeaderMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Client address for rate limiting and request logs.
///
/// Forwarded headers are only honoured with `trust_forwarded` set, i.e. when every request
/// reaches the service through a reverse proxy that appends the peer it saw. Then:
/// 1. X-Forwarded-For, rightmost entry (the hop added by our proxy)
/// 2. X-Real-IP
///
/// Entries to the left of the rightmost one are supplied by the client and never used.
/// Otherwise, or when neither header parses, the socket peer address is used.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions, trust_forwarded: bool) -> IpAddr {
    if trust_forwarded {
        if let Some(ip) = forwarded_ip(headers) {
            return ip;
        }
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    // client, proxy1, proxy2
    let nearest_hop = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .last()
        .and_then(|value| value.rsplit(',').next())
        .and_then(|hop| hop.trim().parse().ok());
    if nearest_hop.is_some() {
        return nearest_hop;
    }

    headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer(extensions: &mut Extensions, addr: &str) {
        extensions.insert(ConnectInfo(addr.parse::<SocketAddr>().unwrap()));
    }

    #[test]
    fn test_forwarded_for_rightmost_hop() {
        let mut headers = HeaderMap::new();
        // The client forged the first entry; the proxy appended the real peer.
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1, 203.0.113.9"));
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.44"));

        let ip = client_ip(&headers, &Extensions::new(), true);
        assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_real_ip_without_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));

        let ip = client_ip(&headers, &Extensions::new(), true);
        assert_eq!(ip, "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_repeated_forwarded_for_uses_last_header() {
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        headers.append("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));

        let ip = client_ip(&headers, &Extensions::new(), true);
        assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_untrusted_headers_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        let mut extensions = Extensions::new();
        peer(&mut extensions, "192.0.2.10:51234");

        let ip = client_ip(&headers, &extensions, false);
        assert_eq!(ip, "192.0.2.10".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_garbage_header_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let mut extensions = Extensions::new();
        peer(&mut extensions, "[2001:db8::1]:443");

        let ip = client_ip(&headers, &extensions, true);
        assert_eq!(ip, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_unknown_peer() {
        let ip = client_ip(&HeaderMap::new(), &Extensions::new(), true);
        assert!(ip.is_unspecified());
    }
}
