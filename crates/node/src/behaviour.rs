//! Network behaviour for managed peers
//!
//! Every managed peer runs its own swarm with the full discovery stack:
//! Kademlia (public IPFS DHT protocol, server mode), mDNS for the local
//! link, identify, gossipsub, relay client + DCUtR + AutoNAT for NAT
//! traversal, and a stream behaviour for application protocols.

use std::time::Duration;

use libp2p::swarm::NetworkBehaviour;
use libp2p::{autonat, dcutr, gossipsub, identify, kad, mdns, relay, Multiaddr, PeerId, StreamProtocol};

/// Reserved stream protocol for file-list and file-fetch exchanges
pub const BRIDGE_PROTOCOL: StreamProtocol = StreamProtocol::new("/p2p-webapp/1.0.0");

/// identify agent/protocol string
pub const IDENTIFY_PROTOCOL: &str = "/p2p-webapp/1.0.0";

/// How long a topic advertisement is considered live on the DHT.
/// Re-advertisement happens at half this interval.
pub const TOPIC_ADVERTISE_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Gossipsub heartbeat interval; mesh settle waits one cycle plus slack
pub const GOSSIPSUB_HEARTBEAT: Duration = Duration::from_millis(500);

/// DHT key under which a topic's participants advertise themselves
pub fn topic_advertise_key(topic: &str) -> Vec<u8> {
    format!("/p2p-webapp/topic/{topic}").into_bytes()
}

#[derive(NetworkBehaviour)]
pub struct BridgeBehaviour {
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub gossipsub: gossipsub::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub autonat: autonat::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

impl BridgeBehaviour {
    pub fn new(
        keypair: &libp2p::identity::Keypair,
        relay_client: relay::client::Behaviour,
    ) -> Result<Self, String> {
        let peer_id = PeerId::from(keypair.public());

        // Default Kademlia config speaks /ipfs/kad/1.0.0, which is what the
        // public bootstrap set expects. Server mode so local peers populate
        // each other's routing tables.
        let mut kademlia = kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        ));

        let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
            .map_err(|e| format!("failed to start mDNS: {e}"))?;

        // Fast heartbeats for quick mesh formation on local networks;
        // flood publish for reliability in small meshes.
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_initial_delay(Duration::from_millis(50))
            .heartbeat_interval(GOSSIPSUB_HEARTBEAT)
            .flood_publish(true)
            .validation_mode(gossipsub::ValidationMode::Strict)
            .build()
            .map_err(|e| format!("invalid gossipsub config: {e}"))?;

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )
        .map_err(|e| format!("failed to create gossipsub: {e}"))?;

        let autonat = autonat::Behaviour::new(peer_id, autonat::Config::default());

        Ok(Self {
            kademlia,
            identify,
            mdns,
            gossipsub,
            relay_client,
            dcutr: dcutr::Behaviour::new(peer_id),
            autonat,
            stream: libp2p_stream::Behaviour::new(),
        })
    }

    /// Add a known address for a peer to the routing table
    pub fn add_address(&mut self, peer: &PeerId, addr: Multiaddr) {
        self.kademlia.add_address(peer, addr);
    }

    /// Handle for opening/accepting application streams outside the swarm task
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.stream.new_control()
    }

    /// Number of peers currently in the Kademlia routing table
    pub fn routing_table_size(&mut self) -> usize {
        self.kademlia.kbuckets().map(|b| b.num_entries()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_protocol() {
        assert_eq!(BRIDGE_PROTOCOL.as_ref(), "/p2p-webapp/1.0.0");
    }

    #[test]
    fn test_topic_advertise_key() {
        assert_eq!(
            topic_advertise_key("room"),
            b"/p2p-webapp/topic/room".to_vec()
        );
    }
}
