//! Swarm construction for managed peers

use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::{noise, tcp, yamux, Swarm, SwarmBuilder};

use webpeer_core::{BridgeError, Result};

use crate::behaviour::BridgeBehaviour;

/// Build a swarm with the full transport stack: TCP + noise + yamux plus a
/// relay client transport for NAT'd peers. Loopback and private addresses
/// stay dialable so several managed peers on one host can reach each other.
pub fn build_swarm(keypair: &Keypair) -> Result<Swarm<BridgeBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| BridgeError::Network(format!("failed to build transport: {e}")))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| BridgeError::Network(format!("failed to build relay transport: {e}")))?
        .with_behaviour(|key, relay_client| {
            BridgeBehaviour::new(key, relay_client)
                .map_err(|e| Box::<dyn std::error::Error + Send + Sync>::from(e))
        })
        .map_err(|e| BridgeError::Network(format!("failed to create host: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}
