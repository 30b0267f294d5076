//! OrcaNet Core
//!
//! Shared types and protocol primitives for the OrcaNet overlay:
//! file-transfer negotiation, proxy records, and the directory key scheme.
//!
//! Peer identifiers cross every wire boundary in their canonical text
//! encoding, so they are plain `String`s here; only the daemon crate deals
//! in `libp2p::PeerId`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// File identifier — SHA-256 hash of the file bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHash(pub [u8; 32]);

impl FileHash {
    /// Compute the FileHash from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut id = [0u8; 32];
        id.copy_from_slice(&hash);
        Self(id)
    }

    /// Hex-encoded hash.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, OrcanetError> {
        let bytes = hex::decode(s).map_err(|e| OrcanetError::Protocol(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(OrcanetError::Protocol("expected 32 bytes".into()));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl std::fmt::Display for FileHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Lifecycle of a transfer request, tracked on the requester side only.
/// The responder evaluates each inbound request synchronously and keeps
/// no state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Declined,
    Transferring,
    Complete,
    Failed,
}

impl TransferStatus {
    /// A live request blocks a duplicate for the same (hash, target) pair.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            TransferStatus::Pending | TransferStatus::Accepted | TransferStatus::Transferring
        )
    }
}

/// A download request, serialized as-is onto the request channel.
///
/// The request id is the file hash: at most one live request per
/// (requester, file hash) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(rename = "targetID")]
    pub target_id: String,
    #[serde(rename = "fileHash")]
    pub file_hash: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "requesterID")]
    pub requester_id: String,
    pub status: TransferStatus,
}

impl TransferRequest {
    pub fn new(target_id: &str, file_hash: &str, file_name: &str, requester_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            file_hash: file_hash.to_string(),
            file_name: file_name.to_string(),
            requester_id: requester_id.to_string(),
            status: TransferStatus::Pending,
        }
    }
}

/// Decline frame, newline-terminated on the response channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclineFrame {
    pub status: String,
    #[serde(rename = "fileHash")]
    pub file_hash: String,
}

impl DeclineFrame {
    pub fn new(file_hash: &str) -> Self {
        Self {
            status: "declined".to_string(),
            file_hash: file_hash.to_string(),
        }
    }

    pub fn is_decline(&self) -> bool {
        self.status == "declined"
    }
}

/// Metadata line written before the raw bytes on the file channel.
///
/// `file_size` lets the receiver distinguish a truncated stream from a
/// completed one; the stream close itself carries no such signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
}

/// Directory entry describing a peer's HTTP-egress offering.
///
/// Keyed by `proxy_key(peerID)`; last-writer-wins at the record level.
/// Never hard-deleted — reset writes the empty sentinel instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(rename = "peerID", default)]
    pub peer_id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub bandwidth: String,
    #[serde(rename = "isEnabled", default)]
    pub is_enabled: bool,
    #[serde(rename = "isHost", default)]
    pub is_host: bool,
    #[serde(rename = "walletAddressToSend", default)]
    pub wallet_address: String,
    #[serde(rename = "connectedPeers", default)]
    pub connected_peers: Vec<String>,
    #[serde(default)]
    pub statistics: serde_json::Value,
}

impl ProxyRecord {
    /// The empty sentinel used by clear/reset: a soft delete, not a key removal.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.location.is_empty()
            && self.peer_id.is_empty()
            && self.address.is_empty()
    }
}

/// One line of the append-only proxy usage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyHistoryEntry {
    #[serde(rename = "clientPeerID")]
    pub client_peer_id: String,
    /// Unix seconds at append time.
    pub timestamp: u64,
}

// ========================================================================
// Protocol identifiers and directory keys
// ========================================================================

/// Download request channel (half-duplex: write request, close).
pub const REQUEST_PROTOCOL: &str = "/sendRequest/p2p";

/// File channel: metadata line + chunked bytes.
pub const FILE_PROTOCOL: &str = "/sendFile/p2p";

/// Response channel carrying decline frames.
pub const RESPONSE_PROTOCOL: &str = "/requestResponse/p2p";

/// HTTP tunnel channel: one serialized request/response exchange per stream.
pub const TUNNEL_PROTOCOL: &str = "/httpTunnel/p2p";

/// Proxy metadata refresh request channel.
pub const REFRESH_REQUEST_PROTOCOL: &str = "/sendRefreshRequest/p2p";

/// Proxy metadata refresh response channel.
pub const REFRESH_RESPONSE_PROTOCOL: &str = "/sendRefreshResponse/p2p";

/// Peer-exchange gossip channel.
pub const PEX_PROTOCOL: &str = "/peerExchange/p2p";

/// Directory key prefix for per-peer proxy records.
pub const PROXY_KEY_PREFIX: &str = "/orcanet/proxy/";

/// Generic content-provider key under which every proxy host registers.
pub const PROXY_PROVIDER_KEY: &str = "/orcanet/proxy";

/// Canonical directory key for a peer's proxy record. Pure; exactly one
/// key per peer.
pub fn proxy_key(peer_id: &str) -> String {
    format!("{}{}", PROXY_KEY_PREFIX, peer_id)
}

// ========================================================================
// Capabilities
// ========================================================================

/// Protocol capabilities a peer may advertise. Probing asks for a
/// capability, not for protocol strings, so the mapping lives here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Can answer download requests and stream files back.
    FileTransfer,
    /// Can answer proxy metadata refresh requests (both directions needed).
    ProxyRefresh,
    /// Accepts HTTP tunnel streams.
    HttpTunnel,
    /// Participates in peer-exchange gossip.
    PeerExchange,
}

impl Capability {
    /// Protocol ids that must all be present for the capability to hold.
    pub fn required_protocols(&self) -> &'static [&'static str] {
        match self {
            Capability::FileTransfer => &[REQUEST_PROTOCOL, FILE_PROTOCOL, RESPONSE_PROTOCOL],
            Capability::ProxyRefresh => &[REFRESH_REQUEST_PROTOCOL, REFRESH_RESPONSE_PROTOCOL],
            Capability::HttpTunnel => &[TUNNEL_PROTOCOL],
            Capability::PeerExchange => &[PEX_PROTOCOL],
        }
    }

    /// Whether `protocols` (a peer's advertised list) satisfies this capability.
    pub fn supported_by(&self, protocols: &[String]) -> bool {
        self.required_protocols()
            .iter()
            .all(|required| protocols.iter().any(|p| p == required))
    }
}

// ========================================================================
// Errors
// ========================================================================

#[derive(Error, Debug)]
pub enum OrcanetError {
    /// Malformed or unexpected message shape — aborts this exchange only.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Requested file or record absent — triggers the decline path.
    #[error("not found: {0}")]
    NotFound(String),
    /// Stream open/dial/connect failure — the operation fails, loops continue.
    #[error("transport error: {0}")]
    Transport(String),
    /// Disk read/write failure — aborts the current transfer.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    /// Directory put/get failure — transient, callers may retry next cycle.
    #[error("directory error: {0}")]
    Directory(String),
}

pub type Result<T> = std::result::Result<T, OrcanetError>;

// ========================================================================
// Wallet (payment collaborator, consumed as a black box)
// ========================================================================

/// Payment capability. The overlay only needs an address to advertise and
/// a way to broadcast a payment; everything else is the wallet's business.
#[async_trait::async_trait]
pub trait Wallet: Send + Sync {
    /// Receiving address to publish in the proxy record.
    fn address(&self) -> String;

    /// Broadcast a payment of `amount` to `destination`; returns the txid.
    async fn pay(&self, amount: f64, destination: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_hash_deterministic() {
        let a = FileHash::from_bytes(b"orcanet");
        let b = FileHash::from_bytes(b"orcanet");
        assert_eq!(a, b);
        assert_ne!(a, FileHash::from_bytes(b"other"));
    }

    #[test]
    fn test_file_hash_hex_roundtrip() {
        let hash = FileHash::from_bytes(b"roundtrip");
        let parsed = FileHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert!(FileHash::from_hex("zz").is_err());
        assert!(FileHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_transfer_request_wire_names() {
        let req = TransferRequest::new("targetpeer", "abc", "x.txt", "me");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["targetID"], "targetpeer");
        assert_eq!(json["fileHash"], "abc");
        assert_eq!(json["fileName"], "x.txt");
        assert_eq!(json["requesterID"], "me");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_transfer_status_live() {
        assert!(TransferStatus::Pending.is_live());
        assert!(TransferStatus::Transferring.is_live());
        assert!(!TransferStatus::Declined.is_live());
        assert!(!TransferStatus::Complete.is_live());
        assert!(!TransferStatus::Failed.is_live());
    }

    #[test]
    fn test_decline_frame_shape() {
        let frame = DeclineFrame::new("abc");
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"status":"declined","fileHash":"abc"}"#);
        let parsed: DeclineFrame = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_decline());
    }

    #[test]
    fn test_proxy_record_wire_names() {
        let mut record = ProxyRecord::empty();
        record.peer_id = "12D3KooWTest".into();
        record.wallet_address = "wallet123".into();
        record.connected_peers = vec!["peer-a".into()];
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["peerID"], "12D3KooWTest");
        assert_eq!(json["walletAddressToSend"], "wallet123");
        assert_eq!(json["connectedPeers"][0], "peer-a");
        assert!(json["isHost"].is_boolean());
    }

    #[test]
    fn test_proxy_record_empty_sentinel() {
        assert!(ProxyRecord::empty().is_empty());
        let mut record = ProxyRecord::empty();
        record.peer_id = "p".into();
        assert!(!record.is_empty());
    }

    #[test]
    fn test_proxy_record_tolerates_missing_fields() {
        // Old writers may omit fields; serde defaults must fill them.
        let record: ProxyRecord = serde_json::from_str(r#"{"peerID":"p1"}"#).unwrap();
        assert_eq!(record.peer_id, "p1");
        assert!(record.connected_peers.is_empty());
        assert!(!record.is_host);
    }

    #[test]
    fn test_proxy_key_formation() {
        assert_eq!(proxy_key("12D3KooWabc"), "/orcanet/proxy/12D3KooWabc");
    }

    #[test]
    fn test_capability_probe() {
        let protocols: Vec<String> = vec![
            REFRESH_REQUEST_PROTOCOL.into(),
            REFRESH_RESPONSE_PROTOCOL.into(),
            "/ipfs/ping/1.0.0".into(),
        ];
        assert!(Capability::ProxyRefresh.supported_by(&protocols));
        assert!(!Capability::FileTransfer.supported_by(&protocols));

        // One of the two refresh channels alone is not enough.
        let partial: Vec<String> = vec![REFRESH_REQUEST_PROTOCOL.into()];
        assert!(!Capability::ProxyRefresh.supported_by(&partial));
    }
}
