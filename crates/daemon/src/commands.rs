//! Commands into the swarm task.
//!
//! Everything that must touch the swarm (directory queries, dials, relay
//! listens, peer-store reads) goes through this channel; the swarm task
//! owns the `Swarm` exclusively.

use libp2p::Multiaddr;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum Command {
    /// Store a record in the directory.
    PutRecord {
        key: String,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Fetch a record; `Ok(None)` means no record under the key.
    GetRecord {
        key: String,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, String>>,
    },
    /// Register the local node as content provider for the key.
    StartProviding {
        key: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Look up providers for the key, up to `limit`.
    GetProviders {
        key: String,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<String>, String>>,
    },
    /// Dial a multiaddr (bootstrap, relay, pex-discovered peers).
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Listen on an address; used with a circuit address to (re)make the
    /// relay reservation.
    ListenOn {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// Currently connected peer ids.
    ConnectedPeers { reply: oneshot::Sender<Vec<String>> },
    /// Every peer in the local peer store with its known addresses.
    KnownPeers {
        reply: oneshot::Sender<Vec<(String, Vec<String>)>>,
    },
    /// Advertised protocol list for one peer (empty when unknown).
    PeerProtocols {
        peer_id: String,
        reply: oneshot::Sender<Vec<String>>,
    },
}
