//! Connectivity maintenance loops.
//!
//! Both loops run for the life of the node, observe their cancellation
//! token every cycle, and swallow-and-log errors — a failed renewal or
//! exchange is retried on the next tick, never escalated.

use std::sync::Arc;
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use orcanet_core::Capability;
use orcanet_proxy::CapabilityView;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::Command;
use crate::directory::KadDirectory;
use crate::protocol::ProtocolEngine;

/// Renew the relay reservation on a fixed period, independent of traffic,
/// by re-issuing the circuit listen. Runs until cancelled.
pub async fn reservation_refresh_loop(
    commands: mpsc::Sender<Command>,
    relay_addr: Multiaddr,
    period: Duration,
    cancel: CancellationToken,
) {
    let circuit_addr = relay_addr.with(Protocol::P2pCircuit);
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("reservation refresh loop stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        let (reply, reply_rx) = oneshot::channel();
        let command = Command::ListenOn { addr: circuit_addr.clone(), reply };
        if commands.send(command).await.is_err() {
            return;
        }
        match reply_rx.await {
            Ok(Ok(())) => debug!(%circuit_addr, "relay reservation renewed"),
            Ok(Err(e)) => warn!("relay reservation renewal failed: {e}"),
            Err(_) => return,
        }
    }
}

/// Peer-exchange gossip loop: each cycle, refresh the pex table from the
/// local peer store, exchange lists with connected peers that support the
/// protocol, and dial genuinely new peers.
pub async fn pex_loop(
    directory: KadDirectory,
    engine: Arc<ProtocolEngine>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("peer exchange loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        // Feed the pex table from the peer store.
        if let Ok(known) = directory.known_peers().await {
            let mut manager = engine.pex.lock().await;
            for (peer_id, addrs) in known {
                manager.add_peer(peer_id, addrs);
            }
        }

        let connected = match directory.connected_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("pex cycle skipped: {e}");
                continue;
            }
        };

        for peer_id in connected {
            if peer_id == engine.local_peer_id {
                continue;
            }
            if !directory.supports(&peer_id, Capability::PeerExchange).await {
                continue;
            }
            if !engine.pex.lock().await.should_send(&peer_id) {
                continue;
            }
            match engine.pex_exchange_with(&peer_id).await {
                Ok(new_peers) => {
                    for (new_peer, addrs) in new_peers {
                        debug!(peer = %new_peer, "dialing pex-discovered peer");
                        for addr in addrs {
                            if let Ok(multiaddr) = addr.parse::<Multiaddr>() {
                                let _ = directory.dial(multiaddr).await;
                            }
                        }
                    }
                }
                Err(e) => warn!(peer = %peer_id, "pex exchange failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Once cancelled, the refresh loop must issue no further renewals.
    #[tokio::test]
    async fn test_reservation_loop_stops_on_cancel() {
        let (command_tx, mut command_rx) = mpsc::channel(16);
        let relay: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let cancel = CancellationToken::new();

        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counting = counter.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                if let Command::ListenOn { reply, .. } = command {
                    counting.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    let _ = reply.send(Ok(()));
                }
            }
        });

        let loop_task = tokio::spawn(reservation_refresh_loop(
            command_tx,
            relay,
            Duration::from_millis(20),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();
        loop_task.await.unwrap();

        let at_cancel = counter.load(std::sync::atomic::Ordering::SeqCst);
        assert!(at_cancel >= 2, "expected several renewals, got {at_cancel}");

        tokio::time::sleep(Duration::from_millis(80)).await;
        let after_wait = counter.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(at_cancel, after_wait, "renewals continued after cancel");
    }

    /// Renewal failures are logged and the loop keeps ticking.
    #[tokio::test]
    async fn test_reservation_loop_survives_failures() {
        let (command_tx, mut command_rx) = mpsc::channel(16);
        let relay: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let cancel = CancellationToken::new();

        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counting = counter.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                if let Command::ListenOn { reply, .. } = command {
                    counting.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    let _ = reply.send(Err("relay unreachable".to_string()));
                }
            }
        });

        let loop_task = tokio::spawn(reservation_refresh_loop(
            command_tx,
            relay,
            Duration::from_millis(15),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel();
        loop_task.await.unwrap();

        assert!(counter.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }
}
