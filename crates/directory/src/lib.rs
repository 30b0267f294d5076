//! OrcaNet Directory
//!
//! Thin policy layer over the distributed key/value and content-provider
//! substrate. Defines the consumed contract (`Directory`), the proxy-record
//! merge rules, and per-key write serialization.
//!
//! Directory reads that miss are `DirectoryError::NotFound` — a signal that
//! no record exists yet, not a failure.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use orcanet_core::ProxyRecord;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub use memory::MemoryDirectory;

#[derive(Error, Debug)]
pub enum DirectoryError {
    /// No record under the key. Callers treat this as "no record yet".
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("directory error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// The substrate contract consumed by every component above the transport.
///
/// `put`/`get` are the key/value primitives; `advertise`/`find_providers`
/// are the content-provider primitives. Writes are eventually consistent,
/// last-writer-wins at the record level.
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Register the local node as a content provider for `key`.
    async fn advertise(&self, key: &str) -> Result<()>;

    /// Peers providing `key`, at most `limit`. Finite, not restartable.
    async fn find_providers(&self, key: &str, limit: usize) -> Result<Vec<String>>;
}

/// Per-key async locks serializing read-modify-write cycles on the same
/// directory key. Operations on distinct keys proceed concurrently.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Defaults filled into a proxy record created for the first time.
#[derive(Debug, Clone, Default)]
pub struct RecordDefaults {
    pub is_host: bool,
    pub address: String,
    pub wallet_address: String,
}

/// Read-modify-write a proxy record under its canonical key.
///
/// An existing record with matching `peerID` is updated field by field;
/// a missing record is created with `defaults` filled in. Blind overwrite
/// of a record belonging to a different peer is rejected. The cycle runs
/// under the key's lock so concurrent writers cannot lose updates.
pub async fn save_proxy_record(
    dir: &dyn Directory,
    locks: &KeyedLocks,
    mut record: ProxyRecord,
    defaults: &RecordDefaults,
) -> Result<ProxyRecord> {
    let key = orcanet_core::proxy_key(&record.peer_id);
    let lock = locks.lock_for(&key).await;
    let _guard = lock.lock().await;

    match dir.get(&key).await {
        Ok(existing_bytes) => {
            let mut existing: ProxyRecord = serde_json::from_slice(&existing_bytes)
                .map_err(|e| DirectoryError::Other(format!("corrupt record under {key}: {e}")))?;

            if !existing.is_empty() && existing.peer_id != record.peer_id {
                return Err(DirectoryError::Other(format!(
                    "record under {} belongs to {}",
                    key, existing.peer_id
                )));
            }

            existing.peer_id = record.peer_id.clone();
            existing.name = record.name;
            existing.location = record.location;
            existing.price = record.price;
            existing.bandwidth = record.bandwidth;
            existing.is_enabled = record.is_enabled;
            existing.statistics = record.statistics;
            existing.wallet_address = record.wallet_address;
            if !defaults.address.is_empty() {
                existing.address = defaults.address.clone();
            }
            debug!(%key, "updating existing proxy record");

            let bytes = serde_json::to_vec(&existing)
                .map_err(|e| DirectoryError::Other(e.to_string()))?;
            dir.put(&key, bytes).await?;
            Ok(existing)
        }
        Err(DirectoryError::NotFound(_)) => {
            record.is_host = defaults.is_host;
            record.address = defaults.address.clone();
            if record.wallet_address.is_empty() {
                record.wallet_address = defaults.wallet_address.clone();
            }
            debug!(%key, "creating new proxy record");

            let bytes =
                serde_json::to_vec(&record).map_err(|e| DirectoryError::Other(e.to_string()))?;
            dir.put(&key, bytes).await?;
            Ok(record)
        }
        Err(e) => Err(e),
    }
}

/// Add `client_peer_id` to a host's `connectedPeers`, read-modify-write
/// under the key lock. A missing host record is a NotFound for the caller.
pub async fn attach_connected_peer(
    dir: &dyn Directory,
    locks: &KeyedLocks,
    host_peer_id: &str,
    client_peer_id: &str,
) -> Result<ProxyRecord> {
    let key = orcanet_core::proxy_key(host_peer_id);
    let lock = locks.lock_for(&key).await;
    let _guard = lock.lock().await;

    let bytes = dir.get(&key).await?;
    let mut record: ProxyRecord = serde_json::from_slice(&bytes)
        .map_err(|e| DirectoryError::Other(format!("corrupt record under {key}: {e}")))?;

    if !record.connected_peers.iter().any(|p| p == client_peer_id) {
        record.connected_peers.push(client_peer_id.to_string());
        let bytes =
            serde_json::to_vec(&record).map_err(|e| DirectoryError::Other(e.to_string()))?;
        dir.put(&key, bytes).await?;
        debug!(host = host_peer_id, client = client_peer_id, "attached client to host record");
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_record(peer_id: &str) -> ProxyRecord {
        let mut record = ProxyRecord::empty();
        record.peer_id = peer_id.to_string();
        record.name = "host".into();
        record.location = "US".into();
        record.price = 0.5;
        record.is_enabled = true;
        record
    }

    #[tokio::test]
    async fn test_save_creates_with_defaults() {
        let dir = MemoryDirectory::new("self-peer");
        let locks = KeyedLocks::new();
        let defaults = RecordDefaults {
            is_host: true,
            address: "192.168.1.7".into(),
            wallet_address: "wallet-abc".into(),
        };

        let saved = save_proxy_record(&dir, &locks, host_record("peer-1"), &defaults)
            .await
            .unwrap();
        assert!(saved.is_host);
        assert_eq!(saved.address, "192.168.1.7");
        assert_eq!(saved.wallet_address, "wallet-abc");

        // Read-your-writes for the single-writer case.
        let bytes = dir.get(&orcanet_core::proxy_key("peer-1")).await.unwrap();
        let read: ProxyRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(read, saved);
    }

    #[tokio::test]
    async fn test_save_updates_fields_not_blind_overwrite() {
        let dir = MemoryDirectory::new("self-peer");
        let locks = KeyedLocks::new();
        let defaults = RecordDefaults {
            is_host: true,
            address: "10.0.0.2".into(),
            wallet_address: "w".into(),
        };

        let first = save_proxy_record(&dir, &locks, host_record("peer-1"), &defaults)
            .await
            .unwrap();

        // A later client attach must survive a metadata re-advertisement.
        attach_connected_peer(&dir, &locks, "peer-1", "client-9")
            .await
            .unwrap();

        let mut update = host_record("peer-1");
        update.price = 1.25;
        let saved = save_proxy_record(&dir, &locks, update, &defaults)
            .await
            .unwrap();

        assert_eq!(saved.price, 1.25);
        assert_eq!(saved.connected_peers, vec!["client-9".to_string()]);
        assert_eq!(saved.is_host, first.is_host);
    }

    #[tokio::test]
    async fn test_save_rejects_foreign_record() {
        let dir = MemoryDirectory::new("self-peer");
        let locks = KeyedLocks::new();

        // A record stored under peer-1's key but claiming peer-2.
        let mut foreign = host_record("peer-2");
        foreign.peer_id = "peer-2".into();
        dir.put(
            &orcanet_core::proxy_key("peer-1"),
            serde_json::to_vec(&foreign).unwrap(),
        )
        .await
        .unwrap();

        let result =
            save_proxy_record(&dir, &locks, host_record("peer-1"), &RecordDefaults::default())
                .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let dir = MemoryDirectory::new("self-peer");
        let locks = KeyedLocks::new();
        save_proxy_record(&dir, &locks, host_record("h"), &RecordDefaults::default())
            .await
            .unwrap();

        attach_connected_peer(&dir, &locks, "h", "c").await.unwrap();
        let record = attach_connected_peer(&dir, &locks, "h", "c").await.unwrap();
        assert_eq!(record.connected_peers, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_attach_missing_host_is_not_found() {
        let dir = MemoryDirectory::new("self-peer");
        let locks = KeyedLocks::new();
        let result = attach_connected_peer(&dir, &locks, "ghost", "c").await;
        assert!(matches!(result, Err(DirectoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_attaches_lose_nothing() {
        let dir = Arc::new(MemoryDirectory::new("self-peer"));
        let locks = KeyedLocks::new();
        save_proxy_record(
            dir.as_ref(),
            &locks,
            host_record("h"),
            &RecordDefaults::default(),
        )
        .await
        .unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let dir = dir.clone();
            let locks = locks.clone();
            tasks.spawn(async move {
                attach_connected_peer(dir.as_ref(), &locks, "h", &format!("client-{i}"))
                    .await
                    .unwrap();
            });
        }
        while tasks.join_next().await.is_some() {}

        let bytes = dir.get(&orcanet_core::proxy_key("h")).await.unwrap();
        let record: ProxyRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record.connected_peers.len(), 8);
    }
}
