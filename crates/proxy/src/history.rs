//! Proxy usage history.
//!
//! Append-only audit log written by a host when a client attaches.
//! Persisted as one JSON array on disk; ordering is append order and
//! entries are never removed.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use orcanet_core::{ProxyHistoryEntry, Result};
use tokio::sync::Mutex;
use tracing::debug;

pub struct ProxyHistoryLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ProxyHistoryLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    /// Append an entry stamped with the current time.
    pub async fn append(&self, client_peer_id: &str) -> Result<ProxyHistoryEntry> {
        let entry = ProxyHistoryEntry {
            client_peer_id: client_peer_id.to_string(),
            timestamp: unix_now(),
        };
        self.append_entry(entry.clone()).await?;
        Ok(entry)
    }

    /// Append a pre-built entry (e.g. one received from a client).
    pub async fn append_entry(&self, entry: ProxyHistoryEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_unlocked().await?;
        entries.push(entry);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(&entries)
            .map_err(|e| orcanet_core::OrcanetError::Storage(std::io::Error::other(e)))?;
        tokio::fs::write(&self.path, bytes).await?;
        debug!(entries = entries.len(), path = %self.path.display(), "history appended");
        Ok(())
    }

    /// All entries in append order; a missing file is an empty log.
    pub async fn entries(&self) -> Result<Vec<ProxyHistoryEntry>> {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    async fn read_unlocked(&self) -> Result<Vec<ProxyHistoryEntry>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| orcanet_core::OrcanetError::Storage(std::io::Error::other(e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
