//! Peer exchange.
//!
//! Nodes periodically share their known-peer lists with connected peers,
//! growing the local peer store beyond what bootstrap and the DHT supply.
//! One exchange is a single `/peerExchange/p2p` stream: the initiator
//! writes its list as one JSON line, the responder merges it and writes
//! its own list back.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Wire form of one exchange: peer ids with their multiaddrs, both in
/// text encoding so the frame carries no transport-specific types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PexMessage {
    pub peers: Vec<PexPeer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PexPeer {
    #[serde(rename = "peerID")]
    pub peer_id: String,
    pub addrs: Vec<String>,
}

impl PexMessage {
    pub fn from_peers(peers: Vec<(String, Vec<String>)>) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|(peer_id, addrs)| PexPeer { peer_id, addrs })
                .collect(),
        }
    }

    pub fn into_peers(self) -> Vec<(String, Vec<String>)> {
        self.peers
            .into_iter()
            .map(|peer| (peer.peer_id, peer.addrs))
            .collect()
    }
}

/// Tracks known peers and paces exchanges per remote peer.
pub struct PexManager {
    known_peers: HashMap<String, Vec<String>>,
    last_sent: HashMap<String, Instant>,
    interval: Duration,
    max_share: usize,
}

impl PexManager {
    pub fn new() -> Self {
        Self::with_config(Duration::from_secs(60), 20)
    }

    pub fn with_config(interval: Duration, max_share: usize) -> Self {
        Self {
            known_peers: HashMap::new(),
            last_sent: HashMap::new(),
            interval,
            max_share,
        }
    }

    /// Record a peer seen through any means (connection, identify, pex).
    pub fn add_peer(&mut self, peer_id: String, addrs: Vec<String>) {
        if addrs.is_empty() {
            return;
        }
        self.known_peers.insert(peer_id, addrs);
    }

    pub fn remove_peer(&mut self, peer_id: &str) {
        self.known_peers.remove(peer_id);
        self.last_sent.remove(peer_id);
    }

    /// Peers to share with `exclude`, excluding the peer itself.
    pub fn peers_to_share(&self, exclude: &str) -> Vec<(String, Vec<String>)> {
        self.known_peers
            .iter()
            .filter(|(peer_id, _)| peer_id.as_str() != exclude)
            .take(self.max_share)
            .map(|(peer_id, addrs)| (peer_id.clone(), addrs.clone()))
            .collect()
    }

    /// Merge a received list; returns only the genuinely new peers so the
    /// caller can attempt connections.
    pub fn receive_pex(
        &mut self,
        _from: &str,
        peers: Vec<(String, Vec<String>)>,
    ) -> Vec<(String, Vec<String>)> {
        let mut new_peers = Vec::new();
        for (peer_id, addrs) in peers {
            if addrs.is_empty() {
                continue;
            }
            if !self.known_peers.contains_key(&peer_id) {
                new_peers.push((peer_id.clone(), addrs.clone()));
            }
            self.add_peer(peer_id, addrs);
        }
        new_peers
    }

    pub fn should_send(&self, peer_id: &str) -> bool {
        match self.last_sent.get(peer_id) {
            Some(last) => last.elapsed() >= self.interval,
            None => true,
        }
    }

    pub fn mark_sent(&mut self, peer_id: &str) {
        self.last_sent.insert(peer_id.to_string(), Instant::now());
    }

    pub fn peer_count(&self) -> usize {
        self.known_peers.len()
    }

    pub fn known_peer_ids(&self) -> Vec<String> {
        self.known_peers.keys().cloned().collect()
    }
}

impl Default for PexManager {
    fn default() -> Self {
        Self::new()
    }
}
