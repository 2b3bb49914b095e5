//! DNS seed-based peer discovery.
//!
//! Seed hostnames are resolved off the async runtime with a bounded
//! timeout; each resolved batch is handed back so the client can start
//! dialing before the slower seeds finish.

use spv_chain::Network;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

/// Per-seed DNS resolution timeout.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve one seed hostname into socket addresses.
async fn resolve_seed(seed: String) -> Result<Vec<SocketAddr>, std::io::Error> {
    let result = timeout(
        DNS_TIMEOUT,
        tokio::task::spawn_blocking(move || {
            seed.to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
        }),
    )
    .await;

    match result {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(e)) => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("task join error: {}", e),
        )),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "DNS resolution timed out",
        )),
    }
}

/// Resolve every DNS seed of `network`, sending each batch through `tx`.
///
/// Spawned as one task per client run; aborting the task cancels all
/// outstanding lookups.
pub async fn resolve_seeds(network: Network, tx: mpsc::Sender<Vec<SocketAddr>>) {
    let port = network.default_port();
    for seed in network.dns_seeds() {
        let target = format!("{}:{}", seed, port);
        match resolve_seed(target).await {
            Ok(addrs) if !addrs.is_empty() => {
                info!(seed, count = addrs.len(), "resolved DNS seed");
                if tx.send(addrs).await.is_err() {
                    return;
                }
            }
            Ok(_) => warn!(seed, "DNS seed returned no addresses"),
            Err(e) => warn!(seed, error = %e, "failed to resolve DNS seed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addrs = resolve_seed("localhost:18333".to_string()).await.unwrap();
        assert!(!addrs.is_empty());
        for addr in addrs {
            assert_eq!(addr.port(), 18333);
        }
    }

    #[tokio::test]
    async fn test_regtest_has_no_seeds() {
        let (tx, mut rx) = mpsc::channel(8);
        resolve_seeds(Network::Regtest, tx).await;
        assert!(rx.recv().await.is_none());
    }
}
