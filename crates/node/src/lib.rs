//! Webpeer Node
//!
//! Managed libp2p peers for the webpeer bridge.
//!
//! ## Features
//!
//! - Per-peer hosts with Kademlia DHT, mDNS, gossipsub and NAT traversal
//!   (relay client, DCUtR, AutoNAT)
//! - A DHT bootstrap gate that defers discovery work until the routing
//!   table is usable
//! - Reliable unicast through per-(peer, protocol) virtual connections
//!   with ACKs, retry and an unreachable circuit breaker
//! - Sharded per-peer file trees with cross-peer fallback fetch over the
//!   `/p2p-webapp/1.0.0` stream protocol

mod behaviour;
mod commands;
mod connect;
mod dispatch;
mod fetch;
mod files;
mod gate;
mod identity;
mod manager;
mod peer;
mod swarm;
mod topic;
mod vcm;
mod wire;

pub use behaviour::{
    topic_advertise_key, BridgeBehaviour, BridgeBehaviourEvent, BRIDGE_PROTOCOL,
    TOPIC_ADVERTISE_TTL,
};
pub use connect::{FIND_PEER_TIMEOUT, PROTECTED_RETRY_INTERVAL};
pub use gate::{parse_bootstrap_addr, DhtGate, BOOTSTRAP_TIMEOUT};
pub use identity::{decode_keypair, encode_keypair, generate_keypair, parse_peer_id};
pub use manager::Manager;
pub use peer::Peer;
pub use swarm::build_swarm;
pub use topic::MESH_WAIT_TIMEOUT;
pub use vcm::{VirtualConnectionManager, ACK_TIMEOUT, IDLE_STREAM_TIMEOUT, MAX_SEND_ATTEMPTS};
pub use wire::{
    read_frame, write_frame, FetchKind, FileContentMessage, FileListMessage, GetFileMessage,
    StreamMessage, MAX_FRAME_SIZE,
};

// Re-export commonly used libp2p types
pub use libp2p::{Multiaddr, PeerId};
