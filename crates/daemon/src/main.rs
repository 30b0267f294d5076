//! OrcaNet daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use libp2p::{Multiaddr, PeerId};
use orcanet_core::proxy_key;
use orcanet_daemon::behaviour::build_swarm;
use orcanet_daemon::config::NodeConfig;
use orcanet_daemon::directory::KadDirectory;
use orcanet_daemon::events::{self, NodeEvent};
use orcanet_daemon::net::{register_stream_handlers, ControlOpener, RelayTunnelDialer};
use orcanet_daemon::protocol::ProtocolEngine;
use orcanet_daemon::service::NodeService;
use orcanet_daemon::wallet::StaticWallet;
use orcanet_daemon::maintenance;
use orcanet_directory::{Directory, KeyedLocks};
use orcanet_proxy::{ProxyDetails, ProxyHistoryLog};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orcanetd", about = "OrcaNet node daemon")]
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "orcanetData/config.json")]
    config: PathBuf,

    /// Override the libp2p listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Additional bootstrap multiaddrs
    #[arg(long)]
    bootstrap: Vec<String>,

    /// Override the relay multiaddr
    #[arg(long)]
    relay: Option<String>,

    /// Files to share on startup
    #[arg(long)]
    share: Vec<PathBuf>,

    /// Advertise this node as a proxy host
    #[arg(long)]
    host_proxy: bool,

    /// Peer id of a proxy host to tunnel HTTP traffic through
    #[arg(long)]
    connect_proxy: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = NodeConfig::load_from(&cli.config);
    if !cli.config.exists() {
        if let Err(e) = config.save_to(&cli.config) {
            warn!("failed to write default config: {e}");
        }
    }
    if let Some(port) = cli.listen_port {
        config.listen_port = port;
    }
    if let Some(relay) = cli.relay {
        config.relay_addr = relay;
    }
    config.bootstrap_addrs.extend(cli.bootstrap);

    let mut bootstrap: Vec<Multiaddr> = Vec::new();
    for addr in &config.bootstrap_addrs {
        match addr.parse() {
            Ok(multiaddr) => bootstrap.push(multiaddr),
            Err(e) => warn!(%addr, "skipping bad bootstrap addr: {e}"),
        }
    }

    // Node identity is fatal-on-failure; everything after start is not.
    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let (swarm, local_peer_id) = build_swarm(keypair, config.listen_port, &bootstrap).await?;
    info!("orcanet node started: {local_peer_id}");

    let (event_tx, mut event_rx) = events::event_channel(256);
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                tracing::debug!(event = %json, "node event");
            }
        }
    });

    let (service, command_tx) = NodeService::new(swarm, event_tx.clone());
    let mut control = service.stream_control();

    let cancel = CancellationToken::new();
    let service_task = tokio::spawn(service.run(cancel.child_token()));

    let directory = KadDirectory::new(command_tx.clone());
    let locks = KeyedLocks::new();
    let history = Arc::new(ProxyHistoryLog::new(config.history_path.clone()));
    let wallet = Arc::new(StaticWallet::new(if config.wallet_address.is_empty() {
        format!("orca-{local_peer_id}")
    } else {
        config.wallet_address.clone()
    }));

    let engine = Arc::new(ProtocolEngine::new(
        local_peer_id.to_string(),
        config.download_dir.clone(),
        Arc::new(ControlOpener::new(control.clone())),
        event_tx.clone(),
        history,
    ));
    register_stream_handlers(&mut control, engine.clone())?;

    // Share files given on the command line and advertise their hashes.
    for path in &cli.share {
        match engine.index.share(path).await {
            Ok(hash) => {
                if let Err(e) = directory.advertise(&hash.to_hex()).await {
                    warn!(%hash, "could not advertise shared file: {e}");
                }
                info!(path = %path.display(), %hash, "sharing file");
            }
            Err(e) => warn!(path = %path.display(), "could not share file: {e}"),
        }
    }

    // Relay reservation + renewal.
    let relay_addr: Option<Multiaddr> = if config.relay_addr.is_empty() {
        None
    } else {
        match config.relay_addr.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("bad relay addr {}: {e}", config.relay_addr);
                None
            }
        }
    };
    if let Some(ref relay) = relay_addr {
        if let Err(e) = directory.dial(relay.clone()).await {
            warn!("relay dial failed: {e}");
        }
        tokio::spawn(maintenance::reservation_refresh_loop(
            command_tx.clone(),
            relay.clone(),
            std::time::Duration::from_secs(config.reservation_refresh_secs),
            cancel.child_token(),
        ));
    }

    // Peer exchange gossip.
    tokio::spawn(maintenance::pex_loop(
        directory.clone(),
        engine.clone(),
        std::time::Duration::from_secs(config.pex_interval_secs),
        cancel.child_token(),
    ));

    // Proxy hosting.
    if cli.host_proxy {
        let details = ProxyDetails {
            name: config.proxy_name.clone(),
            location: config.proxy_location.clone(),
            price: config.proxy_price,
            bandwidth: config.proxy_bandwidth.clone(),
            is_enabled: true,
            statistics: serde_json::Value::Null,
        };
        match orcanet_proxy::advertise_proxy(
            &directory,
            &locks,
            wallet.as_ref(),
            &local_peer_id.to_string(),
            details,
        )
        .await
        {
            Ok(record) => {
                engine.set_own_record(record).await;
                let _ = event_tx.send(NodeEvent::ProxyAdvertised {
                    peer_id: local_peer_id.to_string(),
                });
            }
            Err(e) => error!("proxy advertisement failed: {e}"),
        }
    }

    // Proxy client: attach to the chosen host and run the local tunnel.
    if let Some(host) = cli.connect_proxy {
        match start_tunnel_client(
            &host,
            &config,
            &directory,
            &locks,
            wallet.as_ref(),
            &engine,
            control.clone(),
            relay_addr.clone(),
            cancel.child_token(),
        )
        .await
        {
            Ok(()) => info!(host, "tunnel client running on port {}", config.tunnel_port),
            Err(e) => error!("tunnel client failed to start: {e}"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    let _ = service_task.await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn start_tunnel_client(
    host: &str,
    config: &NodeConfig,
    directory: &KadDirectory,
    locks: &KeyedLocks,
    wallet: &StaticWallet,
    engine: &Arc<ProtocolEngine>,
    control: libp2p_stream::Control,
    relay_addr: Option<Multiaddr>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let host_peer: PeerId = host.parse()?;
    let relay = relay_addr.ok_or("tunnel client needs a relay addr configured")?;

    // Fetch the host's record for price and wallet address, then attach.
    let bytes = directory.get(&proxy_key(host)).await?;
    let record: orcanet_core::ProxyRecord = serde_json::from_slice(&bytes)?;
    engine.attach_to_host(directory, locks, wallet, &record).await?;

    let listener =
        tokio::net::TcpListener::bind(("127.0.0.1", config.tunnel_port)).await?;
    let dialer = Arc::new(RelayTunnelDialer::new(
        directory.clone(),
        control,
        relay,
        host_peer,
    ));
    tokio::spawn(orcanet_proxy::tunnel::run_client_listener(listener, dialer, cancel));
    Ok(())
}
