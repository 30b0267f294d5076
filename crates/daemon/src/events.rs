//! Node event broadcast.
//!
//! Typed events pushed to any attached front end (UI, logs, tests).

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum NodeEvent {
    // -- Network --
    ListeningOn { address: String },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    ReservationAccepted { relay: String },

    // -- File transfer --
    TransferRequested { file_hash: String, requester_id: String },
    FileSent { file_hash: String, peer_id: String, bytes: u64 },
    FileReceived { file_name: String, bytes: u64 },
    TransferDeclined { file_hash: String },

    // -- Proxy --
    ProxyAdvertised { peer_id: String },
    ProxyRecordsCleared { keys: usize },
    ClientAttached { client_peer_id: String },
    TunnelServed { request_line: String },
}

pub type EventSender = broadcast::Sender<NodeEvent>;
pub type EventReceiver = broadcast::Receiver<NodeEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
