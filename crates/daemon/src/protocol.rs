//! Protocol engine.
//!
//! One method per protocol channel, each invoked on its own task per
//! accepted stream; outbound operations open fresh streams through the
//! `StreamOpener` seam. The engine owns the requester's pending-request
//! table, the shared-file index, the refresh aggregation set, and the
//! proxy usage history.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::prelude::*;
use orcanet_core::{
    DeclineFrame, FileHash, FileMetadata, OrcanetError, ProxyRecord, Result, TransferRequest,
    TransferStatus, Wallet, FILE_PROTOCOL, PEX_PROTOCOL, REFRESH_REQUEST_PROTOCOL,
    REFRESH_RESPONSE_PROTOCOL, REQUEST_PROTOCOL, RESPONSE_PROTOCOL,
};
use orcanet_directory::{Directory, KeyedLocks};
use orcanet_proxy::ProxyHistoryLog;
use orcanet_transfer::wire;
use orcanet_transfer::{FileIndex, PendingRequests};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info, warn};

use crate::events::{EventSender, NodeEvent};
use crate::pex::{PexManager, PexMessage};

/// A protocol stream: ordered bytes both ways, half-closable.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Opens a fresh stream to a peer for one protocol exchange. The daemon
/// implements this over libp2p; tests wire engines together in-process.
#[async_trait::async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open(&self, peer_id: &str, protocol: &'static str) -> Result<Box<dyn ByteStream>>;
}

/// Frame opening a refresh exchange: tells the responder who to answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    #[serde(rename = "requesterID")]
    pub requester_id: String,
}

pub struct ProtocolEngine {
    pub local_peer_id: String,
    pub pending: PendingRequests,
    pub index: FileIndex,
    download_dir: PathBuf,
    opener: Arc<dyn StreamOpener>,
    events: EventSender,
    history: Arc<ProxyHistoryLog>,
    pub pex: Arc<Mutex<PexManager>>,
    /// Records gathered from refresh responses, deduplicated by peer id.
    refreshed: Mutex<HashMap<String, ProxyRecord>>,
    /// Our own advertised record, served on the refresh channel.
    own_record: Mutex<Option<ProxyRecord>>,
    /// Tunnel clients already recorded in the history log.
    tunnel_clients: Mutex<HashSet<String>>,
}

impl ProtocolEngine {
    pub fn new(
        local_peer_id: String,
        download_dir: PathBuf,
        opener: Arc<dyn StreamOpener>,
        events: EventSender,
        history: Arc<ProxyHistoryLog>,
    ) -> Self {
        Self {
            local_peer_id,
            pending: PendingRequests::new(),
            index: FileIndex::new(),
            download_dir,
            opener,
            events,
            history,
            pex: Arc::new(Mutex::new(PexManager::new())),
            refreshed: Mutex::new(HashMap::new()),
            own_record: Mutex::new(None),
            tunnel_clients: Mutex::new(HashSet::new()),
        }
    }

    // ────────────────────────────────────────────────────────────────
    // File transfer — requester side
    // ────────────────────────────────────────────────────────────────

    /// Initiate a download: register the pending request, then write it on
    /// a fresh request-channel stream and close (half-duplex request).
    pub async fn send_download_request(
        &self,
        target_id: &str,
        file_hash: &str,
        file_name: &str,
    ) -> Result<()> {
        let request = TransferRequest::new(target_id, file_hash, file_name, &self.local_peer_id);
        self.pending.begin(request.clone()).await?;

        let result = async {
            let mut stream = self.opener.open(target_id, REQUEST_PROTOCOL).await?;
            wire::write_transfer_request(&mut stream, &request).await?;
            stream
                .close()
                .await
                .map_err(|e| OrcanetError::Transport(e.to_string()))?;
            Ok(())
        }
        .await;

        if result.is_err() {
            self.pending.set_status(file_hash, TransferStatus::Failed).await;
        }
        result
    }

    /// File-channel listener: receive into the download directory, then
    /// settle the matching pending request by the received content's hash.
    pub async fn handle_file_stream(&self, mut stream: Box<dyn ByteStream>) -> Result<()> {
        let received = wire::receive_file(&mut stream, &self.download_dir).await;
        let (metadata, path, bytes) = match received {
            Ok(ok) => ok,
            Err(e) => {
                // Partial file stays on disk; the transfer is not retried.
                warn!("file receive failed: {e}");
                return Err(e);
            }
        };

        let content = tokio::fs::read(&path).await?;
        let hash = FileHash::from_bytes(&content).to_hex();
        if self.pending.set_status(&hash, TransferStatus::Complete).await.is_some() {
            info!(file = %metadata.file_name, %hash, "transfer complete");
        }
        let _ = self.events.send(NodeEvent::FileReceived {
            file_name: metadata.file_name,
            bytes,
        });
        Ok(())
    }

    /// Decline-channel listener: validate the frame and surface the outcome
    /// to the local transaction table.
    pub async fn handle_decline_stream(&self, mut stream: Box<dyn ByteStream>) -> Result<()> {
        let frame = wire::read_decline(&mut stream).await?;
        if !frame.is_decline() {
            return Err(OrcanetError::Protocol(format!(
                "unexpected response status: {}",
                frame.status
            )));
        }
        self.pending
            .set_status(&frame.file_hash, TransferStatus::Declined)
            .await;
        info!(file_hash = %frame.file_hash, "download declined by peer");
        let _ = self.events.send(NodeEvent::TransferDeclined {
            file_hash: frame.file_hash,
        });
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────
    // File transfer — responder side
    // ────────────────────────────────────────────────────────────────

    /// Request-channel listener. Evaluated synchronously: a shared file
    /// starts the send immediately, anything else gets one decline frame.
    pub async fn handle_request_stream(&self, mut stream: Box<dyn ByteStream>) -> Result<()> {
        let request = wire::read_transfer_request(&mut stream).await?;
        debug!(
            file_hash = %request.file_hash,
            requester = %request.requester_id,
            "download request received"
        );
        let _ = self.events.send(NodeEvent::TransferRequested {
            file_hash: request.file_hash.clone(),
            requester_id: request.requester_id.clone(),
        });

        if self.index.contains(&request.file_hash).await {
            self.send_file_to(&request).await
        } else {
            self.send_decline_to(&request).await
        }
    }

    async fn send_file_to(&self, request: &TransferRequest) -> Result<()> {
        let path = self
            .index
            .path_for(&request.file_hash)
            .await
            .ok_or_else(|| OrcanetError::NotFound(request.file_hash.clone()))?;
        let file_size = tokio::fs::metadata(&path).await?.len();
        let metadata = FileMetadata {
            file_name: request.file_name.clone(),
            file_size,
        };

        let mut stream = self.opener.open(&request.requester_id, FILE_PROTOCOL).await?;
        let file = tokio::fs::File::open(&path).await?;
        let mut source = file.compat();
        let sent = wire::send_file(&mut stream, &metadata, &mut source).await?;
        stream
            .close()
            .await
            .map_err(|e| OrcanetError::Transport(e.to_string()))?;

        info!(file_hash = %request.file_hash, to = %request.requester_id, bytes = sent, "file sent");
        let _ = self.events.send(NodeEvent::FileSent {
            file_hash: request.file_hash.clone(),
            peer_id: request.requester_id.clone(),
            bytes: sent,
        });
        Ok(())
    }

    async fn send_decline_to(&self, request: &TransferRequest) -> Result<()> {
        let mut stream = self
            .opener
            .open(&request.requester_id, RESPONSE_PROTOCOL)
            .await?;
        wire::write_decline(&mut stream, &DeclineFrame::new(&request.file_hash)).await?;
        stream
            .close()
            .await
            .map_err(|e| OrcanetError::Transport(e.to_string()))?;
        debug!(file_hash = %request.file_hash, to = %request.requester_id, "declined");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────
    // Proxy refresh channels
    // ────────────────────────────────────────────────────────────────

    /// Publish the record the refresh channel should answer with.
    pub async fn set_own_record(&self, record: ProxyRecord) {
        *self.own_record.lock().await = Some(record);
    }

    /// Ask a peer for its current proxy record. The answer arrives on our
    /// refresh-response channel. Callers probe the peer's capabilities
    /// before calling.
    pub async fn request_refresh(&self, peer_id: &str) -> Result<()> {
        let mut stream = self.opener.open(peer_id, REFRESH_REQUEST_PROTOCOL).await?;
        let frame = RefreshRequest {
            requester_id: self.local_peer_id.clone(),
        };
        wire::write_json_line(&mut stream, &frame).await?;
        stream
            .close()
            .await
            .map_err(|e| OrcanetError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Refresh-request listener: answer by opening the response channel
    /// back to the requester with our current record.
    pub async fn handle_refresh_request_stream(
        &self,
        mut stream: Box<dyn ByteStream>,
    ) -> Result<()> {
        let frame: RefreshRequest = wire::read_json_line(&mut stream).await?;
        let record = match self.own_record.lock().await.clone() {
            Some(record) => record,
            None => {
                debug!(requester = %frame.requester_id, "refresh requested but not hosting");
                return Ok(());
            }
        };
        let mut response = self
            .opener
            .open(&frame.requester_id, REFRESH_RESPONSE_PROTOCOL)
            .await?;
        wire::write_json_line(&mut response, &record).await?;
        response
            .close()
            .await
            .map_err(|e| OrcanetError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Refresh-response listener: fold the record into the aggregation
    /// set, deduplicated by peer id.
    pub async fn handle_refresh_response_stream(
        &self,
        mut stream: Box<dyn ByteStream>,
    ) -> Result<()> {
        let record: ProxyRecord = wire::read_json_line(&mut stream).await?;
        if record.is_empty() {
            return Ok(());
        }
        debug!(peer = %record.peer_id, "refresh response received");
        self.refreshed
            .lock()
            .await
            .insert(record.peer_id.clone(), record);
        Ok(())
    }

    /// Snapshot of records gathered from refresh responses.
    pub async fn refreshed_proxies(&self) -> Vec<ProxyRecord> {
        self.refreshed.lock().await.values().cloned().collect()
    }

    /// Fan out refresh requests to every given peer that advertises both
    /// refresh channels; peers that cannot answer are never dialed.
    /// Waits for all requests to go out before returning.
    pub async fn refresh_from_peers(
        &self,
        peers: &[String],
        view: &dyn orcanet_proxy::CapabilityView,
    ) {
        let mut requests = Vec::new();
        for peer_id in peers {
            if *peer_id == self.local_peer_id {
                continue;
            }
            if !view
                .supports(peer_id, orcanet_core::Capability::ProxyRefresh)
                .await
            {
                debug!(peer = %peer_id, "skipping refresh: capability not advertised");
                continue;
            }
            requests.push(async move {
                if let Err(e) = self.request_refresh(peer_id).await {
                    warn!(peer = %peer_id, "refresh request failed: {e}");
                }
            });
        }
        futures::future::join_all(requests).await;
    }

    // ────────────────────────────────────────────────────────────────
    // HTTP tunnel — host side
    // ────────────────────────────────────────────────────────────────

    /// Tunnel listener: first stream from a client records the attachment
    /// in the usage history, then the request is replayed against the real
    /// network. Errors drop the stream without retry.
    pub async fn handle_tunnel_stream(
        &self,
        client_peer_id: &str,
        stream: Box<dyn ByteStream>,
    ) -> Result<()> {
        let first_contact = self
            .tunnel_clients
            .lock()
            .await
            .insert(client_peer_id.to_string());
        if first_contact {
            if let Err(e) = self.history.append(client_peer_id).await {
                warn!("failed to record proxy history entry: {e}");
            }
            let _ = self.events.send(NodeEvent::ClientAttached {
                client_peer_id: client_peer_id.to_string(),
            });
        }

        let request_line = orcanet_proxy::tunnel::host_serve(stream).await?;
        let _ = self.events.send(NodeEvent::TunnelServed { request_line });
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────
    // Proxy attach — client side
    // ────────────────────────────────────────────────────────────────

    /// Attach to a proxy host: pay its advertised price to its wallet
    /// address, then add ourselves to the host's `connectedPeers` via the
    /// read-modify-write directory path. Returns the txid.
    pub async fn attach_to_host(
        &self,
        dir: &dyn Directory,
        locks: &KeyedLocks,
        wallet: &dyn Wallet,
        host: &ProxyRecord,
    ) -> Result<String> {
        if host.peer_id == self.local_peer_id {
            return Err(OrcanetError::Protocol("cannot attach to self".into()));
        }
        let txid = wallet.pay(host.price, &host.wallet_address).await?;
        orcanet_directory::attach_connected_peer(dir, locks, &host.peer_id, &self.local_peer_id)
            .await
            .map_err(|e| OrcanetError::Directory(e.to_string()))?;
        info!(host = %host.peer_id, %txid, "attached to proxy host");
        Ok(txid)
    }

    // ────────────────────────────────────────────────────────────────
    // Peer exchange
    // ────────────────────────────────────────────────────────────────

    /// Inbound pex stream: merge the sender's list, reply with ours.
    pub async fn handle_pex_stream(
        &self,
        from_peer: &str,
        mut stream: Box<dyn ByteStream>,
    ) -> Result<()> {
        let message: PexMessage = wire::read_json_line(&mut stream).await?;
        let reply = {
            let mut manager = self.pex.lock().await;
            let new_peers = manager.receive_pex(from_peer, message.into_peers());
            if !new_peers.is_empty() {
                debug!(from = from_peer, count = new_peers.len(), "pex brought new peers");
            }
            PexMessage::from_peers(manager.peers_to_share(from_peer))
        };
        wire::write_json_line(&mut stream, &reply).await?;
        stream
            .close()
            .await
            .map_err(|e| OrcanetError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Outbound pex exchange with one peer. Returns peers we had never
    /// seen before so the caller can dial them.
    pub async fn pex_exchange_with(&self, peer_id: &str) -> Result<Vec<(String, Vec<String>)>> {
        let outgoing = {
            let manager = self.pex.lock().await;
            PexMessage::from_peers(manager.peers_to_share(peer_id))
        };
        let mut stream = self.opener.open(peer_id, PEX_PROTOCOL).await?;
        wire::write_json_line(&mut stream, &outgoing).await?;
        let response: PexMessage = wire::read_json_line(&mut stream).await?;
        let mut manager = self.pex.lock().await;
        manager.mark_sent(peer_id);
        Ok(manager.receive_pex(peer_id, response.into_peers()))
    }
}
