use axum::http::HeaderMap;
use lib_markers::core::admission::AdmissionController;
use lib_markers::store::MarkerStore;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often lapsed admission entries are dropped.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Served at `/robots.txt` unless the static directory has its own.
pub const DEFAULT_ROBOTS: &str = "User-agent: *\nDisallow: /list\nDisallow: /analysis\nDisallow: /submit\n";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MarkerStore>,
    pub admission: Arc<AdmissionController>,
    pub excluded_levels: Arc<[i32]>,
    pub trust_proxy: bool,
    pub batch_rows: usize,
    pub robots: Arc<str>,
    // Cancelled on shutdown; every export holds a child token.
    pub shutdown: CancellationToken,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// The address a request is accounted to. Behind a trusted proxy that is the
/// right-most `X-Forwarded-For` hop, i.e. the one the proxy itself appended.
pub fn client_addr(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.rsplit(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_canonical();
        }
    }
    peer.ip().to_canonical()
}

/// Periodically drops admission entries that can no longer affect a decision.
pub fn spawn_reaper(admission: Arc<AdmissionController>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = admission.reap(now_ms());
                    if removed > 0 {
                        debug!(removed, tracked = admission.len(), "Reaped admission entries.");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 10], 40000))
    }

    #[test]
    fn test_peer_address_without_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(client_addr(&headers, peer(), false), peer().ip());
    }

    #[test]
    fn test_rightmost_forwarded_hop_behind_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("6.6.6.6, 10.0.0.1,  203.0.113.7"));
        assert_eq!(client_addr(&headers, peer(), true), IpAddr::from([203, 0, 113, 7]));
    }

    #[test]
    fn test_garbage_forwarded_header_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_addr(&headers, peer(), true), peer().ip());
    }

    #[test]
    fn test_mapped_ipv6_peer_is_canonicalised() {
        let peer: SocketAddr = "[::ffff:10.1.2.3]:80".parse().unwrap();
        assert_eq!(client_addr(&HeaderMap::new(), peer, false), IpAddr::from([10, 1, 2, 3]));
    }
}
