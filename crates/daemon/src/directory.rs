//! Kademlia-backed directory client.
//!
//! Implements the `Directory` contract and the capability listing over
//! the swarm command channel. One instance is shared by every component
//! that reads or writes the directory.

use libp2p::Multiaddr;
use orcanet_directory::{Directory, DirectoryError};
use orcanet_proxy::CapabilityView;
use tokio::sync::{mpsc, oneshot};

use crate::commands::Command;

#[derive(Clone)]
pub struct KadDirectory {
    commands: mpsc::Sender<Command>,
}

impl KadDirectory {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    async fn send<T>(
        &self,
        command: Command,
        reply_rx: oneshot::Receiver<T>,
    ) -> Result<T, DirectoryError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DirectoryError::Other("node service stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| DirectoryError::Other("node service dropped the query".into()))
    }

    /// Dial a multiaddr through the swarm (used for relay/bootstrap/pex).
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), DirectoryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Dial { addr, reply }, reply_rx)
            .await?
            .map_err(DirectoryError::Other)
    }

    /// Connected peer ids, in canonical text encoding.
    pub async fn connected_peers(&self) -> Result<Vec<String>, DirectoryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::ConnectedPeers { reply }, reply_rx).await
    }

    /// Local peer-store listing: every known peer with its addresses.
    pub async fn known_peers(&self) -> Result<Vec<(String, Vec<String>)>, DirectoryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::KnownPeers { reply }, reply_rx).await
    }
}

#[async_trait::async_trait]
impl Directory for KadDirectory {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), DirectoryError> {
        let (reply, reply_rx) = oneshot::channel();
        let command = Command::PutRecord { key: key.to_string(), value, reply };
        self.send(command, reply_rx)
            .await?
            .map_err(DirectoryError::Other)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, DirectoryError> {
        let (reply, reply_rx) = oneshot::channel();
        let command = Command::GetRecord { key: key.to_string(), reply };
        match self.send(command, reply_rx).await? {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(DirectoryError::NotFound(key.to_string())),
            Err(e) => Err(DirectoryError::Other(e)),
        }
    }

    async fn advertise(&self, key: &str) -> Result<(), DirectoryError> {
        let (reply, reply_rx) = oneshot::channel();
        let command = Command::StartProviding { key: key.to_string(), reply };
        self.send(command, reply_rx)
            .await?
            .map_err(DirectoryError::Other)
    }

    async fn find_providers(&self, key: &str, limit: usize) -> Result<Vec<String>, DirectoryError> {
        let (reply, reply_rx) = oneshot::channel();
        let command = Command::GetProviders { key: key.to_string(), limit, reply };
        self.send(command, reply_rx)
            .await?
            .map_err(DirectoryError::Other)
    }
}

#[async_trait::async_trait]
impl CapabilityView for KadDirectory {
    async fn protocols(&self, peer_id: &str) -> Vec<String> {
        let (reply, reply_rx) = oneshot::channel();
        let command = Command::PeerProtocols { peer_id: peer_id.to_string(), reply };
        self.send(command, reply_rx).await.unwrap_or_default()
    }
}
