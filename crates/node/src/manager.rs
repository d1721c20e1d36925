//! Peer manager
//!
//! Registry of managed peers plus the consumer-facing surface: create and
//! remove peers, route operations to them by id, fan events out through
//! one channel, and shut everything down in order. Peers never reference
//! the manager back; the shared [`Dispatcher`] carries the event sink and
//! alias table instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webpeer_core::{BridgeConfig, BridgeError, BridgeEvent, Result};
use webpeer_store::BlockStore;

use crate::connect::{dial_with_backoff, MUTUAL_DIAL_BUDGET};
use crate::dispatch::Dispatcher;
use crate::identity::{decode_keypair, encode_keypair, generate_keypair};
use crate::peer::Peer;

pub struct Manager {
    config: BridgeConfig,
    store: Arc<BlockStore>,
    shared: Arc<Dispatcher>,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl Manager {
    /// Create a manager around a shared block store. The returned receiver
    /// carries every event from every managed peer; the consumer routes by
    /// the event's receiver id.
    pub fn new(
        config: BridgeConfig,
        store: Arc<BlockStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Dispatcher::new(config.verbosity, events_tx));
        (
            Arc::new(Self {
                config,
                store,
                shared,
                peers: RwLock::new(HashMap::new()),
            }),
            events_rx,
        )
    }

    /// Create (or restore) a managed peer. Returns `(peer id, key blob)`.
    ///
    /// Registration is in three phases like every mutation here: validate
    /// under the lock, do all network and store I/O without it, then take
    /// the lock again to commit.
    pub async fn create_peer(
        &self,
        requested_key: Option<&str>,
        root_directory: Option<&str>,
    ) -> Result<(String, String)> {
        let keypair = match requested_key {
            Some(key) if !key.is_empty() => decode_keypair(key)?,
            _ => generate_keypair(),
        };
        let encoded_key = encode_keypair(&keypair)?;
        let peer_id = libp2p::PeerId::from(keypair.public()).to_string();

        let existing: Vec<Arc<Peer>> = {
            let peers = self.peers.read().expect("peer registry lock poisoned");
            if peers.contains_key(&peer_id) {
                return Err(BridgeError::DuplicatePeer);
            }
            peers.values().cloned().collect()
        };

        let peer = Peer::new(
            keypair,
            encoded_key.clone(),
            self.config.clone(),
            self.store.clone(),
            self.shared.clone(),
            root_directory,
        )
        .await?;

        // Dial in both directions so sibling peers find each other without
        // waiting on mDNS or the DHT: new → existing here, existing → new
        // in the background.
        for other in &existing {
            let addrs = other.listen_addrs();
            if addrs.is_empty() {
                continue;
            }
            let connected = dial_with_backoff(
                peer.commands.clone(),
                other.peer_id,
                addrs,
                MUTUAL_DIAL_BUDGET,
            )
            .await;
            if !connected {
                warn!(
                    new = %peer.alias(),
                    existing = %other.alias(),
                    "dial-in to sibling peer failed"
                );
            }
        }

        let new_addrs = peer.listen_addrs();
        if !new_addrs.is_empty() {
            let new_peer_id = peer.peer_id;
            for other in existing {
                let addrs = new_addrs.clone();
                let commands = other.commands.clone();
                tokio::spawn(async move {
                    dial_with_backoff(commands, new_peer_id, addrs, MUTUAL_DIAL_BUDGET).await;
                });
            }
        }

        {
            let mut peers = self.peers.write().expect("peer registry lock poisoned");
            if peers.contains_key(&peer_id) {
                drop(peers);
                peer.close();
                return Err(BridgeError::DuplicatePeer);
            }
            peers.insert(peer_id.clone(), peer.clone());
        }
        self.shared.register_local(peer.peer_id, peer.listen_addrs());

        Ok((peer_id, encoded_key))
    }

    pub fn get_peer(&self, peer_id: &str) -> Result<Arc<Peer>> {
        let peers = self.peers.read().expect("peer registry lock poisoned");
        peers
            .get(peer_id)
            .cloned()
            .ok_or_else(|| BridgeError::PeerNotFound(peer_id.to_string()))
    }

    /// Remove one peer and release its resources
    pub fn remove_peer(&self, peer_id: &str) -> Result<()> {
        let peer = {
            let mut peers = self.peers.write().expect("peer registry lock poisoned");
            peers
                .remove(peer_id)
                .ok_or_else(|| BridgeError::PeerNotFound(peer_id.to_string()))?
        };
        self.shared.unregister_local(&peer.peer_id);
        peer.close();
        Ok(())
    }

    /// Close every peer. The registry empties under the lock; the closes
    /// happen outside it.
    pub fn shutdown(&self) {
        let peers: Vec<Arc<Peer>> = {
            let mut registry = self.peers.write().expect("peer registry lock poisoned");
            let peers = registry.values().cloned().collect();
            registry.clear();
            peers
        };
        debug!(count = peers.len(), "shutting down peers");
        for peer in peers {
            self.shared.unregister_local(&peer.peer_id);
            peer.close();
        }
        // The block store is owned by the caller
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peer registry lock poisoned").len()
    }

    /// Dial a specific peer from a managed peer (bootstrap helper)
    pub async fn connect(&self, peer_id: &str, addr: &str) -> Result<()> {
        self.get_peer(peer_id)?.connect_to(addr).await
    }

    // Operation routing; every method takes the managed peer's id first

    pub fn listen(&self, peer_id: &str, protocol: &str) -> Result<()> {
        self.get_peer(peer_id)?.listen(protocol)
    }

    pub fn stop_listen(&self, peer_id: &str, protocol: &str) -> Result<()> {
        self.get_peer(peer_id)?.stop_listen(protocol)
    }

    pub fn send(&self, peer_id: &str, target: &str, protocol: &str, data: &Value) -> Result<()> {
        self.get_peer(peer_id)?.send(target, protocol, data)
    }

    pub async fn subscribe(&self, peer_id: &str, topic: &str) -> Result<()> {
        self.get_peer(peer_id)?.subscribe(topic).await
    }

    pub async fn publish(&self, peer_id: &str, topic: &str, data: &Value) -> Result<()> {
        self.get_peer(peer_id)?.publish(topic, data).await
    }

    pub async fn unsubscribe(&self, peer_id: &str, topic: &str) -> Result<()> {
        self.get_peer(peer_id)?.unsubscribe(topic).await
    }

    pub async fn list_topic_peers(&self, peer_id: &str, topic: &str) -> Result<Vec<String>> {
        self.get_peer(peer_id)?.list_topic_peers(topic).await
    }

    pub fn add_protected(&self, peer_id: &str, ids: &[String]) -> Result<()> {
        self.get_peer(peer_id)?.add_protected(ids);
        Ok(())
    }

    pub fn remove_protected(&self, peer_id: &str, ids: &[String]) -> Result<()> {
        self.get_peer(peer_id)?.remove_protected(ids);
        Ok(())
    }

    pub async fn list_files(&self, peer_id: &str, target: &str) -> Result<()> {
        self.get_peer(peer_id)?.list_files(target).await
    }

    pub fn get_file(&self, peer_id: &str, cid: &str, fallback: Option<&str>) -> Result<()> {
        self.get_peer(peer_id)?.get_file(cid, fallback)
    }

    pub async fn store_file(
        &self,
        peer_id: &str,
        path: &str,
        content: Option<Vec<u8>>,
        directory: bool,
    ) -> Result<(String, String)> {
        self.get_peer(peer_id)?
            .store_file(path, content, directory)
            .await
    }

    pub async fn remove_file(&self, peer_id: &str, path: &str) -> Result<String> {
        self.get_peer(peer_id)?.remove_file(path).await
    }
}
