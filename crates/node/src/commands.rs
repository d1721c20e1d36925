//! Swarm event loop and its command channel
//!
//! A `Swarm` is not shareable, so each managed peer runs one event-loop
//! task that owns it. Everything else (the virtual connection manager,
//! topic loops, the DHT gate, the manager) talks to the swarm through
//! [`PeerCommand`]s and gets answers on oneshot/mpsc channels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use libp2p::futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, TopicHash};
use libp2p::kad::{self, QueryId, RecordKey};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, mdns, Multiaddr, PeerId, Swarm};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::behaviour::{BridgeBehaviour, BridgeBehaviourEvent};
use crate::dispatch::Dispatcher;

/// Commands accepted by a peer's event loop
pub(crate) enum PeerCommand {
    /// Dial a peer, optionally seeding addresses first. The reply resolves
    /// when a connection is established or the dial fails.
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: Option<oneshot::Sender<Result<(), String>>>,
    },

    /// Seed known addresses for a peer without dialing
    AddAddresses { peer: PeerId, addrs: Vec<Multiaddr> },

    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },

    IsConnected {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },

    Subscribe {
        topic: String,
        route: mpsc::UnboundedSender<(Option<PeerId>, Vec<u8>)>,
        reply: oneshot::Sender<Result<(), String>>,
    },

    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<bool>,
    },

    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },

    /// Peers in the gossipsub mesh for a topic
    MeshPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },

    /// Every peer known to be subscribed to a topic
    TopicPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },

    BootstrapDht {
        reply: oneshot::Sender<Result<(), String>>,
    },

    RoutingTableSize {
        reply: oneshot::Sender<usize>,
    },

    /// Publish a provider record; the reply resolves when the query finishes
    StartProviding {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },

    StopProviding { key: Vec<u8> },

    /// Query providers of a key; each hit is sent on `found`, which closes
    /// when the query finishes
    GetProviders {
        key: Vec<u8>,
        found: mpsc::UnboundedSender<PeerId>,
    },

    /// Locate a peer via the DHT; replies with any addresses learned
    FindPeer {
        peer: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

pub(crate) struct EventLoop {
    swarm: Swarm<BridgeBehaviour>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    shared: Arc<Dispatcher>,
    cancel: watch::Receiver<bool>,

    topic_routes: HashMap<TopicHash, mpsc::UnboundedSender<(Option<PeerId>, Vec<u8>)>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
    pending_advertise: HashMap<QueryId, oneshot::Sender<Result<(), String>>>,
    pending_providers: HashMap<QueryId, (HashSet<PeerId>, mpsc::UnboundedSender<PeerId>)>,
    pending_find_peer: HashMap<QueryId, (PeerId, oneshot::Sender<Vec<Multiaddr>>)>,
}

impl EventLoop {
    pub(crate) fn new(
        swarm: Swarm<BridgeBehaviour>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
        shared: Arc<Dispatcher>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            swarm,
            commands,
            shared,
            cancel,
            topic_routes: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_advertise: HashMap::new(),
            pending_providers: HashMap::new(),
            pending_find_peer: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }
        debug!(peer = %self.swarm.local_peer_id(), "event loop stopped");
    }

    fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Dial { peer, addrs, reply } => self.dial(peer, addrs, reply),

            PeerCommand::AddAddresses { peer, addrs } => {
                for addr in addrs {
                    self.swarm.behaviour_mut().add_address(&peer, addr.clone());
                    self.swarm.add_peer_address(peer, addr);
                }
            }

            PeerCommand::ListenAddrs { reply } => {
                let addrs = self.swarm.listeners().cloned().collect();
                let _ = reply.send(addrs);
            }

            PeerCommand::IsConnected { peer, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer));
            }

            PeerCommand::Subscribe { topic, route, reply } => {
                let ident = IdentTopic::new(&topic);
                match self.swarm.behaviour_mut().gossipsub.subscribe(&ident) {
                    Ok(_) => {
                        self.topic_routes.insert(ident.hash(), route);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }

            PeerCommand::Unsubscribe { topic, reply } => {
                let ident = IdentTopic::new(&topic);
                let was_routed = self.topic_routes.remove(&ident.hash()).is_some();
                let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&ident);
                let _ = reply.send(was_routed);
            }

            PeerCommand::Publish { topic, data, reply } => {
                let ident = IdentTopic::new(&topic);
                let result = match self.swarm.behaviour_mut().gossipsub.publish(ident, data) {
                    Ok(_) => Ok(()),
                    // Nobody listening yet is not a failure; flood publish
                    // will reach late joiners through the mesh.
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        trace!(topic, "published with no peers in mesh");
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                };
                let _ = reply.send(result);
            }

            PeerCommand::MeshPeers { topic, reply } => {
                let hash = IdentTopic::new(&topic).hash();
                let peers = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .mesh_peers(&hash)
                    .cloned()
                    .collect();
                let _ = reply.send(peers);
            }

            PeerCommand::TopicPeers { topic, reply } => {
                let hash = IdentTopic::new(&topic).hash();
                let peers = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .all_peers()
                    .filter(|(_, topics)| topics.contains(&&hash))
                    .map(|(peer, _)| *peer)
                    .collect();
                let _ = reply.send(peers);
            }

            PeerCommand::BootstrapDht { reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .bootstrap()
                    .map(|_| ())
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }

            PeerCommand::RoutingTableSize { reply } => {
                let _ = reply.send(self.swarm.behaviour_mut().routing_table_size());
            }

            PeerCommand::StartProviding { key, reply } => {
                match self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(RecordKey::new(&key))
                {
                    Ok(query_id) => {
                        self.pending_advertise.insert(query_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }

            PeerCommand::StopProviding { key } => {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .stop_providing(&RecordKey::new(&key));
            }

            PeerCommand::GetProviders { key, found } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(RecordKey::new(&key));
                self.pending_providers
                    .insert(query_id, (HashSet::new(), found));
            }

            PeerCommand::FindPeer { peer, reply } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                self.pending_find_peer.insert(query_id, (peer, reply));
            }
        }
    }

    fn dial(
        &mut self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: Option<oneshot::Sender<Result<(), String>>>,
    ) {
        for addr in &addrs {
            self.swarm.behaviour_mut().add_address(&peer, addr.clone());
            self.swarm.add_peer_address(peer, addr.clone());
        }

        if self.swarm.is_connected(&peer) {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }

        let opts = if addrs.is_empty() {
            DialOpts::peer_id(peer).build()
        } else {
            DialOpts::peer_id(peer).addresses(addrs).build()
        };

        match self.swarm.dial(opts) {
            Ok(()) => {
                if let Some(reply) = reply {
                    self.pending_dials.entry(peer).or_default().push(reply);
                }
            }
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.to_string()));
                }
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<BridgeBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(BridgeBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                if let Some(route) = self.topic_routes.get(&message.topic) {
                    let sender = message.source.or(Some(propagation_source));
                    if route.send((sender, message.data)).is_err() {
                        self.topic_routes.remove(&message.topic);
                    }
                }
            }

            SwarmEvent::Behaviour(BridgeBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer, addr) in peers {
                    trace!(%peer, %addr, "mDNS discovered");
                    self.swarm.behaviour_mut().add_address(&peer, addr);
                    let _ = self.swarm.dial(DialOpts::peer_id(peer).build());
                }
            }

            SwarmEvent::Behaviour(BridgeBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().add_address(&peer_id, addr);
                }
            }

            SwarmEvent::Behaviour(BridgeBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed {
                    id, result, step, ..
                },
            )) => self.handle_query_result(id, result, step.last),

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                let alias = self.shared.alias(&peer_id.to_string());
                debug!(peer = %alias, "connection established");
                if let Some(replies) = self.pending_dials.remove(&peer_id) {
                    for reply in replies {
                        let _ = reply.send(Ok(()));
                    }
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    debug!(peer = %peer_id, %error, "outgoing connection failed");
                    if let Some(replies) = self.pending_dials.remove(&peer_id) {
                        for reply in replies {
                            let _ = reply.send(Err(error.to_string()));
                        }
                    }
                }
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                debug!(peer = %self.swarm.local_peer_id(), %address, "listening");
            }

            other => {
                trace!(?other, "swarm event");
            }
        }
    }

    fn handle_query_result(&mut self, id: QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::StartProviding(result) => {
                if let Some(reply) = self.pending_advertise.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| e.to_string()));
                }
            }

            kad::QueryResult::GetProviders(result) => {
                match result {
                    Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                        if let Some((seen, found)) = self.pending_providers.get_mut(&id) {
                            for provider in providers {
                                if seen.insert(provider) {
                                    let _ = found.send(provider);
                                }
                            }
                        }
                    }
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                    Err(e) => {
                        debug!(%e, "provider query failed");
                    }
                }
                if last {
                    self.pending_providers.remove(&id);
                }
            }

            kad::QueryResult::GetClosestPeers(result) => {
                if let Some((target, reply)) = self.pending_find_peer.remove(&id) {
                    let mut addrs = Vec::new();
                    if let Ok(ok) = result {
                        for info in ok.peers {
                            if info.peer_id == target {
                                for addr in &info.addrs {
                                    self.swarm
                                        .behaviour_mut()
                                        .add_address(&target, addr.clone());
                                }
                                addrs = info.addrs;
                                break;
                            }
                        }
                    }
                    let _ = reply.send(addrs);
                }
            }

            kad::QueryResult::Bootstrap(result) => {
                if let Err(e) = result {
                    warn!(%e, "DHT bootstrap query failed");
                }
            }

            other => {
                trace!(?other, "kademlia query result");
            }
        }
    }
}
