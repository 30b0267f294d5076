//! OrcaNet Transfer
//!
//! File transfer protocol: request/accept/decline negotiation plus chunked
//! byte-stream transfer.
//!
//! Three stream channels, one logical exchange each:
//!   - `/sendRequest/p2p` — requester writes one `TransferRequest` (JSON),
//!     closes the stream (half-duplex request);
//!   - `/sendFile/p2p` — responder writes a newline-terminated metadata
//!     frame `{"file_name":...,"file_size":N}` followed by the raw bytes in
//!     4096-byte chunks; stream close ends the transfer;
//!   - `/requestResponse/p2p` — responder writes one newline-terminated
//!     decline frame `{"status":"declined","fileHash":...}`.
//!
//! The responder holds no per-request state; the requester tracks each
//! request in [`PendingRequests`], keyed by file hash.

pub mod wire;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use orcanet_core::{FileHash, OrcanetError, Result, TransferRequest, TransferStatus};
use tokio::sync::Mutex;
use tracing::debug;

/// Requester-side table of in-flight and settled download requests.
///
/// Keyed by file hash. The lock lives inside; callers never see the map.
/// Beginning a request that is already live for the same (hash, target)
/// pair is rejected until the prior one resolves.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, TransferRequest>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outgoing request. Fails if an identical request
    /// (same file hash and target) is still live.
    pub async fn begin(&self, request: TransferRequest) -> Result<()> {
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(&request.file_hash) {
            if existing.status.is_live() && existing.target_id == request.target_id {
                return Err(OrcanetError::Protocol(format!(
                    "request for {} to {} already in flight",
                    request.file_hash, request.target_id
                )));
            }
        }
        map.insert(request.file_hash.clone(), request);
        Ok(())
    }

    /// Apply a status change; returns the updated request if known.
    pub async fn set_status(
        &self,
        file_hash: &str,
        status: TransferStatus,
    ) -> Option<TransferRequest> {
        let mut map = self.inner.lock().await;
        let request = map.get_mut(file_hash)?;
        request.status = status;
        debug!(file_hash, ?status, "transfer status updated");
        Some(request.clone())
    }

    pub async fn get(&self, file_hash: &str) -> Option<TransferRequest> {
        self.inner.lock().await.get(file_hash).cloned()
    }

    pub async fn remove(&self, file_hash: &str) -> Option<TransferRequest> {
        self.inner.lock().await.remove(file_hash)
    }

    pub async fn snapshot(&self) -> Vec<TransferRequest> {
        self.inner.lock().await.values().cloned().collect()
    }
}

/// Hash → local path index of files this node has made shareable.
///
/// Owned store; the lock is internal. Removing an entry un-shares the file
/// without touching the file itself.
#[derive(Clone, Default)]
pub struct FileIndex {
    inner: Arc<Mutex<HashMap<String, PathBuf>>>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash the file at `path` and register it. Returns the content hash.
    pub async fn share(&self, path: &Path) -> Result<FileHash> {
        let bytes = tokio::fs::read(path).await?;
        let hash = FileHash::from_bytes(&bytes);
        self.inner
            .lock()
            .await
            .insert(hash.to_hex(), path.to_path_buf());
        debug!(%hash, path = %path.display(), "file shared");
        Ok(hash)
    }

    pub async fn unshare(&self, file_hash: &str) -> Option<PathBuf> {
        self.inner.lock().await.remove(file_hash)
    }

    pub async fn path_for(&self, file_hash: &str) -> Option<PathBuf> {
        self.inner.lock().await.get(file_hash).cloned()
    }

    pub async fn contains(&self, file_hash: &str) -> bool {
        self.inner.lock().await.contains_key(file_hash)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(hash: &str, target: &str) -> TransferRequest {
        TransferRequest::new(target, hash, "file.txt", "requester")
    }

    #[tokio::test]
    async fn test_begin_rejects_duplicate_in_flight() {
        let pending = PendingRequests::new();
        pending.begin(request("abc", "host")).await.unwrap();

        // Identical hash+target while live: rejected.
        assert!(pending.begin(request("abc", "host")).await.is_err());

        // Same hash, different target: a different request.
        pending.begin(request("abc", "other-host")).await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_allowed_after_resolution() {
        let pending = PendingRequests::new();
        pending.begin(request("abc", "host")).await.unwrap();
        pending.set_status("abc", TransferStatus::Declined).await.unwrap();
        pending.begin(request("abc", "host")).await.unwrap();

        pending.set_status("abc", TransferStatus::Complete).await.unwrap();
        pending.begin(request("abc", "host")).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_status_unknown_hash() {
        let pending = PendingRequests::new();
        assert!(pending
            .set_status("missing", TransferStatus::Failed)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_file_index_share_and_lookup() {
        let dir = std::env::temp_dir().join(format!("orcanet-index-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("shared.bin");
        tokio::fs::write(&path, b"shareable bytes").await.unwrap();

        let index = FileIndex::new();
        let hash = index.share(&path).await.unwrap();
        assert_eq!(hash, FileHash::from_bytes(b"shareable bytes"));
        assert!(index.contains(&hash.to_hex()).await);
        assert_eq!(index.path_for(&hash.to_hex()).await.unwrap(), path);

        index.unshare(&hash.to_hex()).await;
        assert!(!index.contains(&hash.to_hex()).await);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
