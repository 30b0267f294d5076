//! Proxy advertisement and fan-out discovery.
//!
//! A proxy key is canonical per peer; enumeration is the union of the
//! local peer store, a provider lookup on the generic key, and the local
//! node's own key. Aggregation fans out one concurrent directory `get`
//! per candidate key and returns only after all of them settle.

use std::collections::HashSet;
use std::sync::Arc;

use orcanet_core::{proxy_key, OrcanetError, ProxyRecord, Result, Wallet, PROXY_PROVIDER_KEY};
use orcanet_directory::{Directory, DirectoryError, KeyedLocks, RecordDefaults};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How many providers of the generic key to fold into enumeration.
const PROVIDER_LOOKUP_LIMIT: usize = 32;

/// Host-supplied metadata for an advertisement.
#[derive(Debug, Clone, Default)]
pub struct ProxyDetails {
    pub name: String,
    pub location: String,
    pub price: f64,
    pub bandwidth: String,
    pub is_enabled: bool,
    pub statistics: serde_json::Value,
}

/// Canonical keys for every peer currently known locally, plus our own.
pub fn known_proxy_keys(peer_ids: &[String], local_peer_id: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for peer in peer_ids.iter().map(String::as_str).chain([local_peer_id]) {
        if seen.insert(peer.to_string()) {
            keys.push(proxy_key(peer));
        }
    }
    keys
}

/// Full candidate-key enumeration: peer store ∪ provider lookup ∪ own key.
/// A failing provider lookup degrades to the peer-store keys alone.
pub async fn enumerate_candidate_keys(
    dir: &dyn Directory,
    peer_ids: &[String],
    local_peer_id: &str,
) -> Vec<String> {
    let mut keys = known_proxy_keys(peer_ids, local_peer_id);
    match dir.find_providers(PROXY_PROVIDER_KEY, PROVIDER_LOOKUP_LIMIT).await {
        Ok(providers) => {
            let known: HashSet<String> = keys.iter().cloned().collect();
            for provider in providers {
                let key = proxy_key(&provider);
                if !known.contains(&key) {
                    keys.push(key);
                }
            }
        }
        Err(e) => debug!("provider lookup failed, using peer-store keys only: {e}"),
    }
    keys
}

/// Become (or refresh being) a proxy host.
///
/// Builds the record via the read-modify-write merge path, filling the
/// detected non-loopback address and the wallet's receiving address, then
/// registers as a content provider of the generic proxy key so peers with
/// no prior knowledge can still discover us.
pub async fn advertise_proxy(
    dir: &dyn Directory,
    locks: &KeyedLocks,
    wallet: &dyn Wallet,
    local_peer_id: &str,
    details: ProxyDetails,
) -> Result<ProxyRecord> {
    let record = ProxyRecord {
        name: details.name,
        location: details.location,
        peer_id: local_peer_id.to_string(),
        price: details.price,
        bandwidth: details.bandwidth,
        is_enabled: details.is_enabled,
        is_host: true,
        statistics: details.statistics,
        ..ProxyRecord::default()
    };
    let defaults = RecordDefaults {
        is_host: true,
        address: detect_local_ipv4().unwrap_or_default(),
        wallet_address: wallet.address(),
    };

    let saved = orcanet_directory::save_proxy_record(dir, locks, record, &defaults)
        .await
        .map_err(|e| OrcanetError::Directory(e.to_string()))?;

    dir.advertise(PROXY_PROVIDER_KEY)
        .await
        .map_err(|e| OrcanetError::Directory(e.to_string()))?;

    info!(peer = local_peer_id, "proxy record advertised");
    Ok(saved)
}

/// Fetch every candidate key concurrently and aggregate the records,
/// deduplicated by peer id. Missing keys are skipped silently; the call
/// returns only after every fetch has completed (wait-for-all, no partial
/// results). The local node's own record is marked `isHost` for
/// presentation.
pub async fn collect_proxies(
    dir: Arc<dyn Directory>,
    keys: Vec<String>,
    local_peer_id: &str,
) -> Vec<ProxyRecord> {
    let results: Arc<Mutex<Vec<ProxyRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = JoinSet::new();
    for key in keys {
        let dir = dir.clone();
        let results = results.clone();
        let seen = seen.clone();
        let local_peer_id = local_peer_id.to_string();
        tasks.spawn(async move {
            let bytes = match dir.get(&key).await {
                Ok(bytes) => bytes,
                Err(DirectoryError::NotFound(_)) => return,
                Err(e) => {
                    debug!(%key, "proxy record fetch failed: {e}");
                    return;
                }
            };
            let mut record: ProxyRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    debug!(%key, "skipping undecodable proxy record: {e}");
                    return;
                }
            };
            if record.is_empty() {
                return;
            }
            if record.peer_id == local_peer_id {
                record.is_host = true;
            }
            // Lock only around the shared collection; fetches run unlocked.
            let mut seen = seen.lock().await;
            if seen.insert(record.peer_id.clone()) {
                results.lock().await.push(record);
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    let collected = std::mem::take(&mut *results.lock().await);
    debug!(count = collected.len(), "proxy aggregation complete");
    collected
}

/// Administrative reset: overwrite every known key with the empty
/// sentinel record. Soft delete — keys stay present.
pub async fn clear_all_proxies(dir: &dyn Directory, keys: &[String]) {
    let sentinel = serde_json::to_vec(&ProxyRecord::empty()).expect("sentinel serializes");
    for key in keys {
        if let Err(e) = dir.put(key, sentinel.clone()).await {
            warn!(%key, "failed to clear proxy record: {e}");
        }
    }
}

/// First non-loopback IPv4 address of this host, found by routing a UDP
/// socket (nothing is sent). None when the host has no route.
pub fn detect_local_ipv4() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    match addr.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_loopback() => Some(ip.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orcanet_directory::MemoryDirectory;

    struct TestWallet;

    #[async_trait::async_trait]
    impl Wallet for TestWallet {
        fn address(&self) -> String {
            "wallet-test".to_string()
        }
        async fn pay(&self, _amount: f64, _destination: &str) -> Result<String> {
            Ok("txid".to_string())
        }
    }

    fn record_for(peer: &str) -> Vec<u8> {
        let mut record = ProxyRecord::empty();
        record.peer_id = peer.to_string();
        record.name = format!("host-{peer}");
        record.is_enabled = true;
        serde_json::to_vec(&record).unwrap()
    }

    #[test]
    fn test_known_proxy_keys_includes_self_once() {
        let peers = vec!["a".to_string(), "b".to_string(), "me".to_string()];
        let keys = known_proxy_keys(&peers, "me");
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&proxy_key("me")));
        assert!(keys
            .iter()
            .all(|k| k.starts_with(orcanet_core::PROXY_KEY_PREFIX)));
    }

    #[tokio::test]
    async fn test_advertise_puts_record_and_registers_provider() {
        let dir = MemoryDirectory::new("me");
        let locks = KeyedLocks::new();
        let details = ProxyDetails {
            name: "my proxy".into(),
            location: "EU".into(),
            price: 0.25,
            is_enabled: true,
            ..ProxyDetails::default()
        };

        let saved = advertise_proxy(&dir, &locks, &TestWallet, "me", details)
            .await
            .unwrap();
        assert!(saved.is_host);
        assert_eq!(saved.wallet_address, "wallet-test");

        let providers = dir.find_providers(PROXY_PROVIDER_KEY, 8).await.unwrap();
        assert!(providers.contains(&"me".to_string()));

        let bytes = dir.get(&proxy_key("me")).await.unwrap();
        let read: ProxyRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(read.name, "my proxy");
    }

    #[tokio::test]
    async fn test_collect_dedupes_by_peer_id() {
        let dir = Arc::new(MemoryDirectory::new("me"));
        dir.put(&proxy_key("a"), record_for("a")).await.unwrap();
        dir.put(&proxy_key("b"), record_for("b")).await.unwrap();
        // Same peer reachable through a second candidate key.
        dir.put("/orcanet/proxy/alias-a", record_for("a")).await.unwrap();

        let keys = vec![
            proxy_key("a"),
            proxy_key("b"),
            "/orcanet/proxy/alias-a".to_string(),
            proxy_key("missing"),
        ];
        let records = collect_proxies(dir, keys, "me").await;
        assert_eq!(records.len(), 2);
        let peers: HashSet<_> = records.iter().map(|r| r.peer_id.clone()).collect();
        assert_eq!(peers, HashSet::from(["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn test_collect_marks_own_record_and_skips_sentinel() {
        let dir = Arc::new(MemoryDirectory::new("me"));
        dir.put(&proxy_key("me"), record_for("me")).await.unwrap();
        dir.put(
            &proxy_key("cleared"),
            serde_json::to_vec(&ProxyRecord::empty()).unwrap(),
        )
        .await
        .unwrap();

        let keys = vec![proxy_key("me"), proxy_key("cleared")];
        let records = collect_proxies(dir, keys, "me").await;
        assert_eq!(records.len(), 1);
        assert!(records[0].is_host);
    }

    #[tokio::test]
    async fn test_clear_writes_sentinel_not_removal() {
        let dir = MemoryDirectory::new("me");
        dir.put(&proxy_key("a"), record_for("a")).await.unwrap();

        clear_all_proxies(&dir, &[proxy_key("a")]).await;

        let bytes = dir.get(&proxy_key("a")).await.unwrap();
        let record: ProxyRecord = serde_json::from_slice(&bytes).unwrap();
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn test_enumerate_merges_provider_results() {
        let dir = MemoryDirectory::new("me");
        dir.add_provider(PROXY_PROVIDER_KEY, "provider-peer").await;

        let keys =
            enumerate_candidate_keys(&dir, &["known-peer".to_string()], "me").await;
        assert!(keys.contains(&proxy_key("known-peer")));
        assert!(keys.contains(&proxy_key("me")));
        assert!(keys.contains(&proxy_key("provider-peer")));
        assert_eq!(keys.len(), 3);
    }
}
