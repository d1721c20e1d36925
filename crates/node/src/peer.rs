//! A managed peer
//!
//! Each peer owns a full libp2p swarm driven by its own event-loop task,
//! a virtual connection manager for reliable unicast, a DHT gate for
//! deferred discovery work, and a file tree in the shared block store.
//! State lives behind one read-write lock held only for map and pointer
//! operations, never across dials, stream I/O or store access.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt as _;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use libp2p_stream::Control;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use webpeer_core::{BridgeConfig, BridgeError, BridgeEvent, Result};
use webpeer_store::{BlockStore, Cid, Directory};

use crate::behaviour::BRIDGE_PROTOCOL;
use crate::commands::{EventLoop, PeerCommand};
use crate::dispatch::Dispatcher;
use crate::gate::DhtGate;
use crate::identity::parse_peer_id;
use crate::swarm::build_swarm;
use crate::topic::{self, MonitorHandle, TopicHandle};
use crate::vcm::VirtualConnectionManager;

/// How long peer construction waits for the first listen address
const LISTEN_ADDR_WAIT: Duration = Duration::from_secs(2);

pub(crate) struct PeerState {
    pub protocols: HashMap<String, JoinHandle<()>>,
    pub topics: HashMap<String, TopicHandle>,
    pub monitors: HashMap<String, MonitorHandle>,
    pub directory: Directory,
    pub directory_cid: Cid,
    pub file_list_pending: bool,
}

pub struct Peer {
    pub(crate) peer_id: PeerId,
    pub(crate) alias: String,
    pub(crate) encoded_key: String,
    pub(crate) config: BridgeConfig,
    pub(crate) commands: mpsc::UnboundedSender<PeerCommand>,
    pub(crate) control: Control,
    pub(crate) shared: Arc<Dispatcher>,
    pub(crate) store: Arc<BlockStore>,
    pub(crate) state: RwLock<PeerState>,
    pub(crate) protected: Mutex<HashSet<PeerId>>,
    pub(crate) gate: Arc<DhtGate>,
    pub(crate) vcm: Arc<VirtualConnectionManager>,
    cancel: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listen_addrs: Vec<Multiaddr>,
}

impl Peer {
    /// Create a peer: start its host listening on an ephemeral port, wire
    /// the reliability and discovery machinery, and kick off DHT bootstrap.
    pub(crate) async fn new(
        keypair: Keypair,
        encoded_key: String,
        config: BridgeConfig,
        store: Arc<BlockStore>,
        shared: Arc<Dispatcher>,
        root_directory: Option<&str>,
    ) -> Result<Arc<Self>> {
        let peer_id = PeerId::from(keypair.public());
        let alias = shared.alias(&peer_id.to_string());

        let mut swarm = build_swarm(&keypair)?;
        swarm
            .listen_on(
                "/ip4/0.0.0.0/tcp/0"
                    .parse()
                    .expect("static multiaddr parses"),
            )
            .map_err(|e| BridgeError::Network(format!("failed to listen: {e}")))?;

        let control = swarm.behaviour().stream_control();
        let mut fetch_control = swarm.behaviour().stream_control();
        let incoming = fetch_control
            .accept(BRIDGE_PROTOCOL)
            .map_err(|_| BridgeError::AlreadyListening(BRIDGE_PROTOCOL.to_string()))?;

        let (cancel, cancel_rx) = watch::channel(false);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop::new(swarm, command_rx, shared.clone(), cancel_rx.clone());
        let loop_task = tokio::spawn(event_loop.run());

        let listen_addrs = wait_for_listen_addrs(&commands).await;
        debug!(peer = %alias, addrs = listen_addrs.len(), "created peer");
        for addr in &listen_addrs {
            debug!(peer = %alias, %addr, "listen address");
        }

        // Restore the file tree from a prior root, or start empty
        let (directory, directory_cid) = match root_directory {
            Some(root) => {
                let cid: Cid = root
                    .parse()
                    .map_err(|e| BridgeError::InvalidCid(format!("{root}: {e}")))?;
                let directory = Directory::load(&store, &cid)
                    .map_err(|e| BridgeError::Store(e.to_string()))?;
                (directory, cid)
            }
            None => {
                let directory = Directory::empty();
                let cid = directory
                    .persist(&store)
                    .map_err(|e| BridgeError::Store(e.to_string()))?;
                (directory, cid)
            }
        };

        let vcm = VirtualConnectionManager::new(
            peer_id,
            control.clone(),
            commands.clone(),
            shared.clone(),
            config.stream_open_timeout,
            cancel_rx.clone(),
        );

        let gate = DhtGate::new();
        let gate_task = tokio::spawn(Arc::clone(&gate).run_bootstrap(
            commands.clone(),
            config.bootstrap_nodes.clone(),
            cancel_rx.clone(),
        ));

        let peer = Arc::new(Self {
            peer_id,
            alias,
            encoded_key,
            config,
            commands,
            control,
            shared,
            store,
            state: RwLock::new(PeerState {
                protocols: HashMap::new(),
                topics: HashMap::new(),
                monitors: HashMap::new(),
                directory,
                directory_cid,
                file_list_pending: false,
            }),
            protected: Mutex::new(HashSet::new()),
            gate,
            vcm,
            cancel,
            tasks: Mutex::new(Vec::new()),
            listen_addrs,
        });

        let serve_task = tokio::spawn(Arc::clone(&peer).serve_bridge_protocol(incoming));
        let retry_task = tokio::spawn(Arc::clone(&peer).protected_retry_loop(cancel_rx));

        peer.tasks
            .lock()
            .expect("task list lock poisoned")
            .extend([loop_task, gate_task, serve_task, retry_task]);

        Ok(peer)
    }

    pub fn peer_id(&self) -> String {
        self.peer_id.to_string()
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn encoded_key(&self) -> &str {
        &self.encoded_key
    }

    /// Addresses this peer's host listens on
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.clone()
    }

    /// Dial a peer given a full multiaddr carrying its `/p2p/` component
    pub async fn connect_to(&self, addr: &str) -> Result<()> {
        let (peer, dial_addr) = crate::gate::parse_bootstrap_addr(addr)
            .ok_or_else(|| BridgeError::InvalidPeerId(addr.to_string()))?;
        crate::connect::dial(&self.commands, peer, vec![dial_addr])
            .await
            .map_err(BridgeError::Network)
    }

    /// Messages still queued for (target, protocol); diagnostics and tests
    pub fn pending_messages(&self, target: &str, protocol: &str) -> Result<usize> {
        let target = parse_peer_id(target)?;
        Ok(self.vcm.queue_depth(&target, protocol))
    }

    /// Whether the queue for (target, protocol) has latched unreachable
    pub fn is_unreachable(&self, target: &str, protocol: &str) -> Result<bool> {
        let target = parse_peer_id(target)?;
        Ok(self.vcm.is_unreachable(&target, protocol))
    }

    /// Start accepting streams on `protocol`; inbound streams route to the
    /// virtual connection manager
    pub fn listen(self: &Arc<Self>, protocol: &str) -> Result<()> {
        let stream_protocol = libp2p::StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|e| BridgeError::Network(e.to_string()))?;

        let mut state = self.state.write().expect("peer state lock poisoned");
        if state.protocols.contains_key(protocol) {
            return Err(BridgeError::AlreadyListening(protocol.to_string()));
        }

        let mut control = self.control.clone();
        let mut incoming = control
            .accept(stream_protocol)
            .map_err(|_| BridgeError::AlreadyListening(protocol.to_string()))?;

        let vcm = Arc::clone(&self.vcm);
        let protocol_name = protocol.to_string();
        let acceptor = tokio::spawn(async move {
            while let Some((remote, stream)) = incoming.next().await {
                vcm.handle_incoming_stream(remote, &protocol_name, stream);
            }
        });

        state.protocols.insert(protocol.to_string(), acceptor);
        Ok(())
    }

    /// Stop accepting streams on `protocol`; streams already open drain
    /// through their reader tasks
    pub fn stop_listen(&self, protocol: &str) -> Result<()> {
        let mut state = self.state.write().expect("peer state lock poisoned");
        match state.protocols.remove(protocol) {
            Some(acceptor) => {
                // Dropping the acceptor releases the protocol registration
                acceptor.abort();
                Ok(())
            }
            None => Err(BridgeError::NotListening(protocol.to_string())),
        }
    }

    /// Queue `data` for `target` on `protocol` through the VCM
    pub fn send(&self, target: &str, protocol: &str, data: &Value) -> Result<()> {
        let target = parse_peer_id(target)?;
        self.vcm.send(target, protocol, data)
    }

    /// Join a topic, start its monitor and discovery loops, and wait for
    /// the mesh to form. Idempotent.
    pub async fn subscribe(self: &Arc<Self>, topic: &str) -> Result<()> {
        let (route_tx, mut route_rx) = mpsc::unbounded_channel::<(Option<PeerId>, Vec<u8>)>();
        let (topic_cancel, _) = watch::channel(false);

        // Reader: decode and deliver in arrival order, one task per topic
        let shared = self.shared.clone();
        let receiver = self.peer_id.to_string();
        let topic_name = topic.to_string();
        let reader = tokio::spawn(async move {
            while let Some((source, data)) = route_rx.recv().await {
                let decoded: Value = match serde_json::from_slice(&data) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(topic = %topic_name, error = %e, "dropping unparseable topic message");
                        continue;
                    }
                };
                shared.emit(BridgeEvent::TopicData {
                    receiver: receiver.clone(),
                    topic: topic_name.clone(),
                    sender: source.map(|p| p.to_string()).unwrap_or_default(),
                    data: decoded,
                });
            }
        });

        // Register first so a concurrent subscribe sees this one and stays
        // idempotent; roll back if the join fails
        {
            let mut state = self.state.write().expect("peer state lock poisoned");
            if state.topics.contains_key(topic) {
                reader.abort();
                return Ok(());
            }
            state.topics.insert(
                topic.to_string(),
                TopicHandle {
                    cancel: topic_cancel.clone(),
                    reader,
                },
            );
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .commands
            .send(PeerCommand::Subscribe {
                topic: topic.to_string(),
                route: route_tx,
                reply: reply_tx,
            })
            .is_ok();
        let joined = if sent {
            match reply_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err("peer is shutting down".to_string()),
            }
        } else {
            Err("peer is shutting down".to_string())
        };
        if let Err(e) = joined {
            let handle = {
                let mut state = self.state.write().expect("peer state lock poisoned");
                state.topics.remove(topic)
            };
            if let Some(handle) = handle {
                handle.stop();
            }
            return Err(BridgeError::TopicJoinFailed(topic.to_string(), e));
        }

        self.start_monitor(topic);

        // DHT work goes through the gate: it runs once the routing table is
        // usable, or gets a chance to fail loudly after the gate times out.
        self.gate.enqueue(topic::advertise_loop(
            self.commands.clone(),
            topic.to_string(),
            topic_cancel.subscribe(),
        ));
        self.gate.enqueue(topic::discover_peers(
            self.commands.clone(),
            self.peer_id,
            topic.to_string(),
            topic_cancel.subscribe(),
        ));

        topic::wait_for_mesh(&self.commands, topic).await;
        Ok(())
    }

    /// Publish one message to a topic; joining is not required
    pub async fn publish(&self, topic: &str, data: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PeerCommand::Publish {
                topic: topic.to_string(),
                data: bytes,
                reply: reply_tx,
            })
            .map_err(|_| BridgeError::Network("peer is shutting down".to_string()))?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::PublishFailed(topic.to_string(), e)),
            Err(_) => Err(BridgeError::PublishFailed(
                topic.to_string(),
                "peer is shutting down".to_string(),
            )),
        }
    }

    /// Leave a topic and cancel its monitor and discovery loops. Idempotent.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let handle = {
            let mut state = self.state.write().expect("peer state lock poisoned");
            state.topics.remove(topic)
        };
        let Some(handle) = handle else {
            return Ok(());
        };
        handle.stop();

        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.commands.send(PeerCommand::Unsubscribe {
            topic: topic.to_string(),
            reply: reply_tx,
        });
        let _ = reply_rx.await;

        self.stop_monitor(topic);
        Ok(())
    }

    /// Peers seen on a topic: the monitor's view when monitored, otherwise
    /// the pub/sub layer's current view
    pub async fn list_topic_peers(&self, topic: &str) -> Result<Vec<String>> {
        {
            let state = self.state.read().expect("peer state lock poisoned");
            if let Some(monitor) = state.monitors.get(topic) {
                let known = monitor.known.lock().expect("monitor set lock poisoned");
                return Ok(known.iter().cloned().collect());
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PeerCommand::TopicPeers {
                topic: topic.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| BridgeError::Network("peer is shutting down".to_string()))?;
        let peers = reply_rx
            .await
            .map_err(|_| BridgeError::Network("peer is shutting down".to_string()))?;
        Ok(peers.iter().map(|p| p.to_string()).collect())
    }

    /// Start emitting join/leave events for a topic. Idempotent.
    pub fn start_monitor(&self, topic: &str) {
        let mut state = self.state.write().expect("peer state lock poisoned");
        if state.monitors.contains_key(topic) {
            return;
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let known = Arc::new(Mutex::new(HashSet::new()));
        let task = tokio::spawn(topic::monitor_loop(
            self.commands.clone(),
            self.shared.clone(),
            self.peer_id.to_string(),
            topic.to_string(),
            known.clone(),
            cancel_rx,
        ));
        state.monitors.insert(
            topic.to_string(),
            MonitorHandle {
                cancel,
                known,
                task,
            },
        );
    }

    /// Stop a topic monitor. Idempotent.
    pub fn stop_monitor(&self, topic: &str) {
        let handle = {
            let mut state = self.state.write().expect("peer state lock poisoned");
            state.monitors.remove(topic)
        };
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    /// Tear the peer down: VCM, topics, monitors, then the host (the
    /// event-loop task owns the swarm; cancelling it closes mDNS, the DHT
    /// and every connection)
    pub fn close(&self) {
        self.vcm.close();

        let (topics, monitors, protocols) = {
            let mut state = self.state.write().expect("peer state lock poisoned");
            (
                std::mem::take(&mut state.topics),
                std::mem::take(&mut state.monitors),
                std::mem::take(&mut state.protocols),
            )
        };
        for (_, handle) in topics {
            handle.stop();
        }
        for (_, handle) in monitors {
            handle.stop();
        }
        for (_, acceptor) in protocols {
            acceptor.abort();
        }

        let _ = self.cancel.send(true);
        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }
        debug!(peer = %self.alias, "peer closed");
    }
}

async fn wait_for_listen_addrs(commands: &mpsc::UnboundedSender<PeerCommand>) -> Vec<Multiaddr> {
    let deadline = tokio::time::Instant::now() + LISTEN_ADDR_WAIT;
    loop {
        let (tx, rx) = oneshot::channel();
        if commands.send(PeerCommand::ListenAddrs { reply: tx }).is_err() {
            return Vec::new();
        }
        match rx.await {
            Ok(addrs) if !addrs.is_empty() => return addrs,
            Ok(_) => {}
            Err(_) => return Vec::new(),
        }
        if tokio::time::Instant::now() >= deadline {
            return Vec::new();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
