//! Glue between the protocol engine and libp2p streams.
//!
//! Registers one acceptor per protocol channel (each accepted stream gets
//! its own task) and implements the outbound stream/dial seams over
//! `libp2p_stream::Control`.

use std::sync::Arc;

use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use orcanet_core::{
    OrcanetError, Result, FILE_PROTOCOL, PEX_PROTOCOL, REFRESH_REQUEST_PROTOCOL,
    REFRESH_RESPONSE_PROTOCOL, REQUEST_PROTOCOL, RESPONSE_PROTOCOL, TUNNEL_PROTOCOL,
};
use orcanet_proxy::tunnel::{TunnelDialer, TunnelStream};
use tracing::{debug, warn};

use crate::directory::KadDirectory;
use crate::protocol::{ByteStream, ProtocolEngine, StreamOpener};

#[derive(Debug, Clone, Copy)]
enum Channel {
    Request,
    File,
    Response,
    Tunnel,
    RefreshRequest,
    RefreshResponse,
    Pex,
}

impl Channel {
    const ALL: [Channel; 7] = [
        Channel::Request,
        Channel::File,
        Channel::Response,
        Channel::Tunnel,
        Channel::RefreshRequest,
        Channel::RefreshResponse,
        Channel::Pex,
    ];

    fn protocol(&self) -> &'static str {
        match self {
            Channel::Request => REQUEST_PROTOCOL,
            Channel::File => FILE_PROTOCOL,
            Channel::Response => RESPONSE_PROTOCOL,
            Channel::Tunnel => TUNNEL_PROTOCOL,
            Channel::RefreshRequest => REFRESH_REQUEST_PROTOCOL,
            Channel::RefreshResponse => REFRESH_RESPONSE_PROTOCOL,
            Channel::Pex => PEX_PROTOCOL,
        }
    }
}

/// Register acceptors for every protocol channel on the stream control.
pub fn register_stream_handlers(
    control: &mut libp2p_stream::Control,
    engine: Arc<ProtocolEngine>,
) -> Result<()> {
    for channel in Channel::ALL {
        let incoming = control
            .accept(StreamProtocol::new(channel.protocol()))
            .map_err(|e| OrcanetError::Transport(format!("{}: {e}", channel.protocol())))?;
        tokio::spawn(accept_loop(incoming, engine.clone(), channel));
    }
    Ok(())
}

async fn accept_loop(
    mut incoming: libp2p_stream::IncomingStreams,
    engine: Arc<ProtocolEngine>,
    channel: Channel,
) {
    while let Some((peer, stream)) = incoming.next().await {
        let engine = engine.clone();
        // One task per inbound stream; a failure is local to its exchange.
        tokio::spawn(async move {
            let peer_id = peer.to_string();
            let stream: Box<dyn ByteStream> = Box::new(stream);
            let result = match channel {
                Channel::Request => engine.handle_request_stream(stream).await,
                Channel::File => engine.handle_file_stream(stream).await,
                Channel::Response => engine.handle_decline_stream(stream).await,
                Channel::Tunnel => engine.handle_tunnel_stream(&peer_id, stream).await,
                Channel::RefreshRequest => engine.handle_refresh_request_stream(stream).await,
                Channel::RefreshResponse => engine.handle_refresh_response_stream(stream).await,
                Channel::Pex => engine.handle_pex_stream(&peer_id, stream).await,
            };
            if let Err(e) = result {
                warn!(protocol = channel.protocol(), peer = %peer_id, "stream handler failed: {e}");
            }
        });
    }
}

/// `StreamOpener` over libp2p: parse the peer id and open a fresh stream
/// scoped to the protocol.
pub struct ControlOpener {
    control: libp2p_stream::Control,
}

impl ControlOpener {
    pub fn new(control: libp2p_stream::Control) -> Self {
        Self { control }
    }
}

#[async_trait::async_trait]
impl StreamOpener for ControlOpener {
    async fn open(&self, peer_id: &str, protocol: &'static str) -> Result<Box<dyn ByteStream>> {
        let peer: PeerId = peer_id
            .parse()
            .map_err(|_| OrcanetError::Protocol(format!("invalid peer id: {peer_id}")))?;
        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, StreamProtocol::new(protocol))
            .await
            .map_err(|e| OrcanetError::Transport(format!("open {protocol} to {peer_id}: {e}")))?;
        Ok(Box::new(stream))
    }
}

/// Relay-encapsulated multi-hop address for reaching `target` through
/// `relay`: base relay address + circuit segment + target peer id.
pub fn relay_circuit_addr(relay: &Multiaddr, target: &PeerId) -> Multiaddr {
    relay
        .clone()
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(*target))
}

/// Tunnel dialer for the client role: dial the host through the relay
/// circuit, then open a fresh tunnel stream. One stream per request.
pub struct RelayTunnelDialer {
    directory: KadDirectory,
    control: libp2p_stream::Control,
    relay_addr: Multiaddr,
    host_peer: PeerId,
}

impl RelayTunnelDialer {
    pub fn new(
        directory: KadDirectory,
        control: libp2p_stream::Control,
        relay_addr: Multiaddr,
        host_peer: PeerId,
    ) -> Self {
        Self { directory, control, relay_addr, host_peer }
    }
}

#[async_trait::async_trait]
impl TunnelDialer for RelayTunnelDialer {
    async fn open_tunnel(&self) -> Result<Box<dyn TunnelStream>> {
        let addr = relay_circuit_addr(&self.relay_addr, &self.host_peer);
        // Dialing an already-reached peer fails harmlessly; the stream
        // open below rides the existing connection.
        if let Err(e) = self.directory.dial(addr.clone()).await {
            debug!(%addr, "circuit dial not started: {e}");
        }
        let mut control = self.control.clone();
        let stream = control
            .open_stream(self.host_peer, StreamProtocol::new(TUNNEL_PROTOCOL))
            .await
            .map_err(|e| OrcanetError::Transport(format!("open tunnel: {e}")))?;
        Ok(Box::new(stream))
    }
}
