//! OrcaNet Daemon
//!
//! Background service that runs an OrcaNet node:
//! - libp2p swarm event loop (Kademlia directory, identify, relay client)
//! - stream handlers for the transfer, proxy and tunnel channels
//! - connectivity maintenance (relay reservation refresh, peer exchange)

pub mod behaviour;
pub mod commands;
pub mod config;
pub mod directory;
pub mod events;
pub mod maintenance;
pub mod net;
pub mod pex;
pub mod protocol;
pub mod service;
pub mod wallet;
