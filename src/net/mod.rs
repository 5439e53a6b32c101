//! Net module - Handles TCP communication between bus nodes
//!
//! Provides:
//! - Per-peer connections with handshake, framing, and reconnection
//! - The transport that owns the listener, the connection set, and routing

mod connection;
mod transport;

pub use connection::*;
pub use transport::*;

use std::net::SocketAddr;

/// Resolve a "host:port" endpoint to a socket address, so configured
/// outgoing endpoints may name peers by hostname as well as by IP.
///
/// When a host resolves to multiple addresses the first IPv4 one wins,
/// falling back to whatever came first.
pub async fn resolve_endpoint(endpoint: &str) -> std::io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(endpoint.trim()).await?.collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Could not resolve endpoint: {}", endpoint),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_hostname_endpoint() {
        let addr = resolve_endpoint("localhost:6440").await.unwrap();
        assert_eq!(addr.port(), 6440);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_resolve_literal_endpoint() {
        let addr = resolve_endpoint("127.0.0.1:9000").await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_garbage_endpoint_fails() {
        assert!(resolve_endpoint("not an endpoint").await.is_err());
    }
}
