//! OrcaNet swarm behaviour.
//!
//! Kademlia backs the directory (key/value records + provider records);
//! identify feeds peer addresses and protocol lists; the relay client
//! holds reservations so NAT-restricted nodes stay reachable; raw
//! protocol streams go through `libp2p_stream`.

use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, kad, noise, ping, relay, tcp, yamux, Multiaddr, PeerId, StreamProtocol};
use tracing::info;

/// Type alias for the OrcaNet swarm.
pub type OrcanetSwarm = libp2p::Swarm<OrcanetBehaviour>;

#[derive(NetworkBehaviour)]
pub struct OrcanetBehaviour {
    /// Kademlia DHT: the directory substrate.
    pub kademlia: kad::Behaviour<MemoryStore>,
    /// Peer info exchange; fills the peer registry and kad addresses.
    pub identify: identify::Behaviour,
    /// Connection keepalive.
    pub ping: ping::Behaviour,
    /// Circuit relay client for NAT'd reachability.
    pub relay: relay::client::Behaviour,
    /// Raw protocol streams (transfer, tunnel, refresh, pex channels).
    pub stream: libp2p_stream::Behaviour,
}

/// Build the swarm, start listening, and dial the bootstrap peers.
pub async fn build_swarm(
    keypair: Keypair,
    listen_port: u16,
    bootstrap_addrs: &[Multiaddr],
) -> Result<(OrcanetSwarm, PeerId), Box<dyn std::error::Error + Send + Sync>> {
    let local_peer_id = PeerId::from(keypair.public());
    info!("local peer id: {}", local_peer_id);

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key, relay_behaviour| {
            let peer_id = PeerId::from(key.public());

            let mut kad_config = kad::Config::new(StreamProtocol::new("/orcanet/kad/1.0.0"));
            kad_config.set_query_timeout(Duration::from_secs(60));
            let store = MemoryStore::new(peer_id);
            let kademlia = kad::Behaviour::with_config(peer_id, store, kad_config);

            let identify = identify::Behaviour::new(identify::Config::new(
                "/orcanet/id/1.0.0".to_string(),
                key.public(),
            ));

            let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30)));

            Ok(OrcanetBehaviour {
                kademlia,
                identify,
                ping,
                relay: relay_behaviour,
                stream: libp2p_stream::Behaviour::new(),
            })
        })?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(300)))
        .build();

    // Server mode so directory queries work on small/LAN deployments too.
    swarm.behaviour_mut().kademlia.set_mode(Some(kad::Mode::Server));

    let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{listen_port}").parse()?;
    swarm.listen_on(listen_addr)?;

    for addr in bootstrap_addrs {
        if let Err(e) = swarm.dial(addr.clone()) {
            tracing::warn!(%addr, "bootstrap dial failed: {e}");
        }
    }

    Ok((swarm, local_peer_id))
}
