//! In-process directory.
//!
//! Complete `Directory` implementation over local maps. Backs tests and
//! offline operation; the daemon substitutes the Kademlia-backed client.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{Directory, DirectoryError, Result};

#[derive(Default)]
struct Inner {
    records: HashMap<String, Vec<u8>>,
    providers: HashMap<String, BTreeSet<String>>,
}

/// In-memory key/value + provider store.
pub struct MemoryDirectory {
    local_peer_id: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDirectory {
    pub fn new(local_peer_id: &str) -> Self {
        Self {
            local_peer_id: local_peer_id.to_string(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Register another node as provider, for tests exercising discovery.
    pub async fn add_provider(&self, key: &str, peer_id: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .providers
            .entry(key.to_string())
            .or_default()
            .insert(peer_id.to_string());
    }
}

#[async_trait::async_trait]
impl Directory for MemoryDirectory {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.records.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(key.to_string()))
    }

    async fn advertise(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let local = self.local_peer_id.clone();
        inner
            .providers
            .entry(key.to_string())
            .or_default()
            .insert(local);
        Ok(())
    }

    async fn find_providers(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .providers
            .get(key)
            .map(|set| set.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_read_your_writes() {
        let dir = MemoryDirectory::new("me");
        dir.put("/orcanet/proxy/me", b"record".to_vec()).await.unwrap();
        assert_eq!(dir.get("/orcanet/proxy/me").await.unwrap(), b"record");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = MemoryDirectory::new("me");
        assert!(matches!(
            dir.get("/orcanet/proxy/nobody").await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_advertise_and_find_providers() {
        let dir = MemoryDirectory::new("me");
        dir.advertise("/orcanet/proxy").await.unwrap();
        dir.add_provider("/orcanet/proxy", "other").await;

        let providers = dir.find_providers("/orcanet/proxy", 16).await.unwrap();
        assert!(providers.contains(&"me".to_string()));
        assert!(providers.contains(&"other".to_string()));

        let capped = dir.find_providers("/orcanet/proxy", 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }
}
