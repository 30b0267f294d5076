//! OrcaNet Proxy
//!
//! Proxy-record advertisement, fan-out discovery, usage history, and the
//! HTTP-over-stream tunnel protocol.
//!
//! Advertisement does two things at once: a record `put` under the peer's
//! canonical directory key and a content-provider registration of the
//! generic proxy key. Discovery fans out over every candidate key it can
//! enumerate (peer store, provider lookup, own key) and merges the results.

pub mod discovery;
pub mod history;
pub mod tunnel;

use orcanet_core::Capability;

pub use discovery::{
    advertise_proxy, clear_all_proxies, collect_proxies, detect_local_ipv4,
    enumerate_candidate_keys, known_proxy_keys, ProxyDetails,
};
pub use history::ProxyHistoryLog;

/// Per-peer protocol-capability listing, answered by the transport layer.
///
/// Callers probe with a [`Capability`], never with raw protocol strings:
/// "does peer X support capability C" is the whole interface.
#[async_trait::async_trait]
pub trait CapabilityView: Send + Sync {
    /// Protocol ids the peer advertised (empty when unknown).
    async fn protocols(&self, peer_id: &str) -> Vec<String>;

    async fn supports(&self, peer_id: &str, capability: Capability) -> bool {
        capability.supported_by(&self.protocols(peer_id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orcanet_core::{REFRESH_REQUEST_PROTOCOL, REFRESH_RESPONSE_PROTOCOL};

    struct FixedView(Vec<String>);

    #[async_trait::async_trait]
    impl CapabilityView for FixedView {
        async fn protocols(&self, _peer_id: &str) -> Vec<String> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_capability_view_default_probe() {
        let view = FixedView(vec![
            REFRESH_REQUEST_PROTOCOL.to_string(),
            REFRESH_RESPONSE_PROTOCOL.to_string(),
        ]);
        assert!(view.supports("peer", Capability::ProxyRefresh).await);
        assert!(!view.supports("peer", Capability::HttpTunnel).await);
    }
}
