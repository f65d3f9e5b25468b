//! Thin façade the connection layer actually talks to.
//!
//! `AddressManager` exposes the address book's own vocabulary
//! (`add_to_new_table`, `attempt`, `connect`, …); `ConnectionLayerAdapter`
//! renames those to the connection layer's vocabulary and is the single
//! place invalid endpoints get filtered out before they ever reach the
//! core.

use crate::endpoint::Endpoint;
use crate::manager::AddressManager;

/// Static sizing knobs the connection layer configures the adapter with.
#[derive(Debug, Clone, Copy)]
pub struct AddressManagerConfig {
    /// Desired total number of connected peers.
    pub target_peer_count: u32,
    /// Desired number of those peers that are outbound.
    pub target_outbound_peer_count: u32,
}

impl AddressManagerConfig {
    /// How many inbound slots remain once outbound peers are accounted
    /// for. Floored at zero rather than underflowing when outbound
    /// exceeds total.
    pub fn max_inbound_peers(&self) -> u32 {
        self.target_peer_count
            .saturating_sub(self.target_outbound_peer_count)
    }
}

fn is_valid(endpoint: &Endpoint) -> bool {
    endpoint.port != 0 && !endpoint.host.is_unspecified()
}

/// Wraps an [`AddressManager`] behind the names and filtering rules the
/// connection layer expects.
pub struct ConnectionLayerAdapter {
    manager: AddressManager,
    config: AddressManagerConfig,
}

impl ConnectionLayerAdapter {
    /// Wrap `manager` with the given sizing configuration.
    pub fn new(manager: AddressManager, config: AddressManagerConfig) -> Self {
        ConnectionLayerAdapter { manager, config }
    }

    /// The sizing configuration this adapter was built with.
    pub fn config(&self) -> AddressManagerConfig {
        self.config
    }

    /// The wrapped manager, for callers that need direct access (e.g.
    /// `serialize`/`unserialize`).
    pub fn manager(&self) -> &AddressManager {
        &self.manager
    }

    /// Learn about one endpoint, heard about via `source`. Silently
    /// dropped if invalid. Returns `true` iff a brand-new entry was
    /// created.
    pub async fn add_potential_peer(&self, endpoint: Endpoint, source: Option<Endpoint>) -> bool {
        self.add_potential_peers(vec![endpoint], source).await
    }

    /// Learn about several endpoints sharing a common `source`. Invalid
    /// endpoints are dropped individually rather than failing the whole
    /// batch. Returns `true` iff at least one brand-new entry was
    /// created.
    pub async fn add_potential_peers(
        &self,
        endpoints: Vec<Endpoint>,
        source: Option<Endpoint>,
    ) -> bool {
        let (valid, dropped): (Vec<Endpoint>, Vec<Endpoint>) =
            endpoints.into_iter().partition(is_valid);
        if !dropped.is_empty() {
            log::trace!("Dropped {} invalid potential peer(s)", dropped.len());
        }
        if valid.is_empty() {
            return false;
        }
        log::trace!("Adding {} potential peer(s)", valid.len());
        self.manager.add_to_new_table(valid, source, 0).await
    }

    /// Mark an endpoint as reachable.
    pub async fn mark_good(&self, endpoint: Endpoint) {
        if is_valid(&endpoint) {
            self.manager.mark_good(endpoint, true).await;
        }
    }

    /// Record a connection attempt.
    pub async fn mark_attempted(&self, endpoint: Endpoint, count_failures: bool) {
        if is_valid(&endpoint) {
            self.manager.attempt(endpoint, count_failures).await;
        }
    }

    /// Refresh an endpoint's liveness timestamp.
    pub async fn update_connection_time(&self, endpoint: Endpoint) {
        if is_valid(&endpoint) {
            self.manager.connect(endpoint).await;
        }
    }

    /// A sample of non-terrible known endpoints to gossip onward.
    pub async fn get_peers(&self) -> Vec<Endpoint> {
        let peers = self.manager.get_peers().await;
        log::debug!("Selected {} peer address(es) to share", peers.len());
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port, 0)
    }

    #[test]
    fn max_inbound_peers_floors_at_zero() {
        let config = AddressManagerConfig {
            target_peer_count: 8,
            target_outbound_peer_count: 8,
        };
        assert_eq!(config.max_inbound_peers(), 0);

        let config = AddressManagerConfig {
            target_peer_count: 20,
            target_outbound_peer_count: 8,
        };
        assert_eq!(config.max_inbound_peers(), 12);
    }

    #[tokio::test]
    async fn invalid_endpoints_are_dropped_silently() {
        let manager = AddressManager::new();
        let config = AddressManagerConfig {
            target_peer_count: 20,
            target_outbound_peer_count: 8,
        };
        let adapter = ConnectionLayerAdapter::new(manager, config);

        let zero_port = ep(0);
        let unspecified_host = Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000, 0);

        assert!(!adapter.add_potential_peer(zero_port, None).await);
        assert!(!adapter.add_potential_peer(unspecified_host, None).await);
        assert_eq!(adapter.manager().size().await, 0);

        assert!(adapter.add_potential_peer(ep(9000), None).await);
        assert_eq!(adapter.manager().size().await, 1);
    }
}
