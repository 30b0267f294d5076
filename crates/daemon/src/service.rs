//! Swarm service task.
//!
//! Owns the libp2p swarm; serves directory queries and peer-store reads
//! over the command channel and tracks peers (addresses + advertised
//! protocols) from identify results. Query results come back through
//! pending-query tables keyed by Kademlia query id.

use std::collections::{HashMap, HashSet};

use libp2p::kad::{
    self, AddProviderOk, GetProvidersOk, GetRecordOk, PeerRecord, QueryId, Quorum, Record,
    RecordKey,
};
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::behaviour::{OrcanetBehaviourEvent, OrcanetSwarm};
use crate::commands::Command;
use crate::events::{EventSender, NodeEvent};

/// What the service knows about one peer.
#[derive(Debug, Default, Clone)]
struct PeerInfo {
    addrs: Vec<Multiaddr>,
    protocols: Vec<String>,
    connected: bool,
}

struct ProviderQuery {
    found: HashSet<String>,
    limit: usize,
    reply: oneshot::Sender<Result<Vec<String>, String>>,
}

#[derive(Default)]
struct PendingQueries {
    get_record: HashMap<QueryId, oneshot::Sender<Result<Option<Vec<u8>>, String>>>,
    put_record: HashMap<QueryId, oneshot::Sender<Result<(), String>>>,
    start_providing: HashMap<QueryId, oneshot::Sender<Result<(), String>>>,
    providers: HashMap<QueryId, ProviderQuery>,
}

pub struct NodeService {
    swarm: OrcanetSwarm,
    command_rx: mpsc::Receiver<Command>,
    event_tx: EventSender,
    pending: PendingQueries,
    peers: HashMap<PeerId, PeerInfo>,
}

impl NodeService {
    pub fn new(
        swarm: OrcanetSwarm,
        event_tx: EventSender,
    ) -> (Self, mpsc::Sender<Command>) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let service = Self {
            swarm,
            command_rx,
            event_tx,
            pending: PendingQueries::default(),
            peers: HashMap::new(),
        };
        (service, command_tx)
    }

    /// Stream control handle for opening/accepting protocol streams.
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.swarm.behaviour().stream.new_control()
    }

    /// Drive the swarm until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        use futures::StreamExt;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("node service stopping");
                    return;
                }
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => return,
                },
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::PutRecord { key, value, reply } => {
                let record = Record::new(RecordKey::new(&key.as_bytes()), value);
                match self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .put_record(record, Quorum::One)
                {
                    Ok(query_id) => {
                        self.pending.put_record.insert(query_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }
            Command::GetRecord { key, reply } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_record(RecordKey::new(&key.as_bytes()));
                self.pending.get_record.insert(query_id, reply);
            }
            Command::StartProviding { key, reply } => {
                match self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(RecordKey::new(&key.as_bytes()))
                {
                    Ok(query_id) => {
                        self.pending.start_providing.insert(query_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }
            Command::GetProviders { key, limit, reply } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(RecordKey::new(&key.as_bytes()));
                self.pending.providers.insert(
                    query_id,
                    ProviderQuery { found: HashSet::new(), limit, reply },
                );
            }
            Command::Dial { addr, reply } => {
                let result = self.swarm.dial(addr).map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            Command::ListenOn { addr, reply } => {
                let result = self
                    .swarm
                    .listen_on(addr)
                    .map(|_| ())
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            Command::ConnectedPeers { reply } => {
                let peers = self
                    .peers
                    .iter()
                    .filter(|(_, info)| info.connected)
                    .map(|(peer, _)| peer.to_string())
                    .collect();
                let _ = reply.send(peers);
            }
            Command::KnownPeers { reply } => {
                let peers = self
                    .peers
                    .iter()
                    .map(|(peer, info)| {
                        (
                            peer.to_string(),
                            info.addrs.iter().map(|a| a.to_string()).collect(),
                        )
                    })
                    .collect();
                let _ = reply.send(peers);
            }
            Command::PeerProtocols { peer_id, reply } => {
                let protocols = peer_id
                    .parse::<PeerId>()
                    .ok()
                    .and_then(|peer| self.peers.get(&peer))
                    .map(|info| info.protocols.clone())
                    .unwrap_or_default();
                let _ = reply.send(protocols);
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<OrcanetBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("listening on {address}");
                let _ = self.event_tx.send(NodeEvent::ListeningOn {
                    address: address.to_string(),
                });
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                let info = self.peers.entry(peer_id).or_default();
                info.connected = true;
                let addr = endpoint.get_remote_address().clone();
                if !info.addrs.contains(&addr) {
                    info.addrs.push(addr);
                }
                debug!("connected to {peer_id}");
                let _ = self.event_tx.send(NodeEvent::PeerConnected {
                    peer_id: peer_id.to_string(),
                });
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    if let Some(info) = self.peers.get_mut(&peer_id) {
                        info.connected = false;
                    }
                    debug!("disconnected from {peer_id}");
                    let _ = self.event_tx.send(NodeEvent::PeerDisconnected {
                        peer_id: peer_id.to_string(),
                    });
                }
            }
            SwarmEvent::Behaviour(OrcanetBehaviourEvent::Identify(event)) => {
                self.handle_identify_event(event);
            }
            SwarmEvent::Behaviour(OrcanetBehaviourEvent::Kademlia(event)) => {
                self.handle_kad_event(event);
            }
            SwarmEvent::Behaviour(OrcanetBehaviourEvent::Relay(event)) => {
                if let libp2p::relay::client::Event::ReservationReqAccepted {
                    relay_peer_id, ..
                } = event
                {
                    info!("relay reservation accepted by {relay_peer_id}");
                    let _ = self.event_tx.send(NodeEvent::ReservationAccepted {
                        relay: relay_peer_id.to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        if let identify::Event::Received { peer_id, info, .. } = event {
            let entry = self.peers.entry(peer_id).or_default();
            entry.protocols = info.protocols.iter().map(|p| p.to_string()).collect();
            for addr in info.listen_addrs {
                if !entry.addrs.contains(&addr) {
                    entry.addrs.push(addr.clone());
                }
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr);
            }
            debug!(peer = %peer_id, protocols = entry.protocols.len(), "peer identified");
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        let kad::Event::OutboundQueryProgressed { id, result, .. } = event else {
            return;
        };
        match result {
            kad::QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(PeerRecord {
                record,
                ..
            }))) => {
                if let Some(reply) = self.pending.get_record.remove(&id) {
                    let _ = reply.send(Ok(Some(record.value)));
                    if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        query.finish();
                    }
                }
            }
            kad::QueryResult::GetRecord(Ok(
                GetRecordOk::FinishedWithNoAdditionalRecord { .. },
            )) => {
                if let Some(reply) = self.pending.get_record.remove(&id) {
                    let _ = reply.send(Ok(None));
                }
            }
            kad::QueryResult::GetRecord(Err(e)) => {
                if let Some(reply) = self.pending.get_record.remove(&id) {
                    let result = match e {
                        kad::GetRecordError::NotFound { .. } => Ok(None),
                        other => Err(other.to_string()),
                    };
                    let _ = reply.send(result);
                }
            }
            kad::QueryResult::PutRecord(result) => {
                if let Some(reply) = self.pending.put_record.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| e.to_string()));
                }
            }
            kad::QueryResult::StartProviding(result) => {
                if let Some(reply) = self.pending.start_providing.remove(&id) {
                    let _ = reply.send(
                        result.map(|AddProviderOk { .. }| ()).map_err(|e| e.to_string()),
                    );
                }
            }
            kad::QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                let mut done = false;
                if let Some(query) = self.pending.providers.get_mut(&id) {
                    for provider in providers {
                        query.found.insert(provider.to_string());
                    }
                    done = query.found.len() >= query.limit;
                }
                if done {
                    if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        query.finish();
                    }
                    if let Some(query) = self.pending.providers.remove(&id) {
                        reply_providers(query);
                    }
                }
            }
            kad::QueryResult::GetProviders(Ok(
                GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => {
                if let Some(query) = self.pending.providers.remove(&id) {
                    reply_providers(query);
                }
            }
            kad::QueryResult::GetProviders(Err(e)) => {
                if let Some(query) = self.pending.providers.remove(&id) {
                    warn!("provider lookup failed: {e}");
                    let _ = query.reply.send(Err(e.to_string()));
                }
            }
            _ => {}
        }
    }
}

fn reply_providers(query: ProviderQuery) {
    let mut found: Vec<String> = query.found.into_iter().collect();
    found.sort();
    found.truncate(query.limit);
    let _ = query.reply.send(Ok(found));
}
