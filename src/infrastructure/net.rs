//! Local address discovery and `auto` placeholder resolution

use std::net::{IpAddr, Ipv4Addr};
use tokio::net::UdpSocket;
use tracing::debug;

/// Address used when no outbound route can be found
pub const FALLBACK_IPV4: &str = "127.0.0.1";

/// IPv4 address of the interface that routes to the public internet.
///
/// A UDP "connect" sends nothing; it only asks the kernel to pick a source
/// address for the route.
pub async fn detect_local_ipv4() -> String {
    match probe_route("8.8.8.8:80").await {
        Some(IpAddr::V4(ip)) if !ip.is_unspecified() => ip.to_string(),
        other => {
            debug!("Local IPv4 probe gave {:?}, using {}", other, FALLBACK_IPV4);
            FALLBACK_IPV4.to_string()
        }
    }
}

async fn probe_route(target: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect(target).await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// `auto` (any case) becomes `auto_ip`; anything else is trimmed and kept.
pub fn resolve_auto_host(value: &str, auto_ip: &str) -> String {
    let value = value.trim();
    if value.eq_ignore_ascii_case("auto") {
        auto_ip.to_string()
    } else {
        value.to_string()
    }
}

/// Like [`resolve_auto_host`] but also maps `auto:<port>` to `<auto_ip>:<port>`.
pub fn resolve_auto_addr(value: &str, auto_ip: &str) -> String {
    let value = value.trim();
    match value.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("auto:") => {
            format!("{}{}", auto_ip, &value[4..])
        }
        _ => resolve_auto_host(value, auto_ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_auto_host() {
        assert_eq!(resolve_auto_host("auto", "10.0.0.7"), "10.0.0.7");
        assert_eq!(resolve_auto_host(" AUTO ", "10.0.0.7"), "10.0.0.7");
        assert_eq!(resolve_auto_host(" pbx.local ", "10.0.0.7"), "pbx.local");
    }

    #[test]
    fn test_resolve_auto_addr() {
        assert_eq!(resolve_auto_addr("auto:5060", "10.0.0.7"), "10.0.0.7:5060");
        assert_eq!(resolve_auto_addr("Auto:5070", "10.0.0.7"), "10.0.0.7:5070");
        assert_eq!(resolve_auto_addr("auto", "10.0.0.7"), "10.0.0.7");
        assert_eq!(resolve_auto_addr("sip.example.com:5060", "10.0.0.7"), "sip.example.com:5060");
    }

    #[tokio::test]
    async fn test_detect_local_ipv4_is_an_ipv4() {
        let ip = detect_local_ipv4().await;
        assert!(ip.parse::<Ipv4Addr>().is_ok());
    }
}
