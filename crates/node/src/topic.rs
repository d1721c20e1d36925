//! Topic subscription plumbing
//!
//! Subscribing starts a reader task plus two DHT-gated loops: an advertise
//! loop that keeps a provider record alive under the topic key, and a
//! one-shot discovery query that dials every advertised participant.
//! Subscribe does not return until the gossip mesh has formed (or a 5 s
//! cap passes), so a publish right after subscribe reaches the room.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use webpeer_core::BridgeEvent;

use crate::behaviour::{topic_advertise_key, TOPIC_ADVERTISE_TTL};
use crate::commands::PeerCommand;
use crate::dispatch::Dispatcher;

/// Give up waiting for the mesh after this long
pub const MESH_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Mesh poll cadence while waiting
const MESH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One heartbeat cycle plus slack, letting a fresh mesh stabilize
const MESH_SETTLE: Duration = Duration::from_millis(600);

/// Topic monitor diff cadence
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Advertise attempts per cycle; backoff 2 s then 4 s between them
const ADVERTISE_RETRIES: u32 = 3;

/// A live subscription: the reader task and the cancel signal its
/// advertise/discovery loops watch
pub(crate) struct TopicHandle {
    pub cancel: watch::Sender<bool>,
    pub reader: JoinHandle<()>,
}

impl TopicHandle {
    pub fn stop(self) {
        let _ = self.cancel.send(true);
        self.reader.abort();
    }
}

/// A topic monitor: tracks the peer set and emits join/leave events
pub(crate) struct MonitorHandle {
    pub cancel: watch::Sender<bool>,
    pub known: Arc<Mutex<HashSet<String>>>,
    pub task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        let _ = self.cancel.send(true);
        self.task.abort();
    }
}

fn is_cancelled(cancel: &mut watch::Receiver<bool>) -> impl std::future::Future<Output = ()> + '_ {
    async move {
        loop {
            if *cancel.borrow() {
                return;
            }
            if cancel.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Keep a provider record alive for `topic`, re-advertising at half TTL
pub(crate) async fn advertise_loop(
    commands: mpsc::UnboundedSender<PeerCommand>,
    topic: String,
    mut cancel: watch::Receiver<bool>,
) {
    let key = topic_advertise_key(&topic);
    loop {
        let mut advertised = false;
        for attempt in 1..=ADVERTISE_RETRIES {
            let (tx, rx) = oneshot::channel();
            if commands
                .send(PeerCommand::StartProviding {
                    key: key.clone(),
                    reply: tx,
                })
                .is_err()
            {
                return;
            }
            match rx.await {
                Ok(Ok(())) => {
                    trace!(topic, "advertised on DHT");
                    advertised = true;
                    break;
                }
                Ok(Err(e)) => debug!(topic, attempt, error = %e, "advertise failed"),
                Err(_) => return,
            }
            if attempt < ADVERTISE_RETRIES {
                tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
            }
        }
        if !advertised {
            debug!(topic, "giving up on this advertise cycle");
        }

        tokio::select! {
            _ = tokio::time::sleep(TOPIC_ADVERTISE_TTL / 2) => {}
            _ = is_cancelled(&mut cancel) => return,
        }
    }
}

/// One provider query for `topic`; dial every advertised peer but ourselves
pub(crate) async fn discover_peers(
    commands: mpsc::UnboundedSender<PeerCommand>,
    local: PeerId,
    topic: String,
    mut cancel: watch::Receiver<bool>,
) {
    let (tx, mut found) = mpsc::unbounded_channel();
    if commands
        .send(PeerCommand::GetProviders {
            key: topic_advertise_key(&topic),
            found: tx,
        })
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            provider = found.recv() => match provider {
                Some(peer) if peer != local => {
                    trace!(topic, %peer, "discovered topic peer");
                    let _ = commands.send(PeerCommand::Dial {
                        peer,
                        addrs: Vec::new(),
                        reply: None,
                    });
                }
                Some(_) => {}
                None => return,
            },
            _ = is_cancelled(&mut cancel) => return,
        }
    }
}

/// Poll the mesh until it has at least one peer, then wait one heartbeat
/// cycle. Returns regardless once the cap passes; there may simply be no
/// other subscriber yet.
pub(crate) async fn wait_for_mesh(commands: &mpsc::UnboundedSender<PeerCommand>, topic: &str) {
    let deadline = tokio::time::Instant::now() + MESH_WAIT_TIMEOUT;
    let mut ticker = tokio::time::interval(MESH_POLL_INTERVAL);

    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        let (tx, rx) = oneshot::channel();
        if commands
            .send(PeerCommand::MeshPeers {
                topic: topic.to_string(),
                reply: tx,
            })
            .is_err()
        {
            return;
        }
        match rx.await {
            Ok(peers) if !peers.is_empty() => {
                tokio::time::sleep(MESH_SETTLE).await;
                return;
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

/// Diff the topic's peer view every second, emitting join/leave events
pub(crate) async fn monitor_loop(
    commands: mpsc::UnboundedSender<PeerCommand>,
    shared: Arc<Dispatcher>,
    receiver: String,
    topic: String,
    known: Arc<Mutex<HashSet<String>>>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        tokio::select! {
            _ = is_cancelled(&mut cancel) => return,
            _ = ticker.tick() => {}
        }

        let (tx, rx) = oneshot::channel();
        if commands
            .send(PeerCommand::TopicPeers {
                topic: topic.clone(),
                reply: tx,
            })
            .is_err()
        {
            return;
        }
        let Ok(peers) = rx.await else { return };
        let current: HashSet<String> = peers.iter().map(|p| p.to_string()).collect();

        let (joined, left) = {
            let mut known = known.lock().expect("monitor set lock poisoned");
            let joined: Vec<String> = current.difference(&known).cloned().collect();
            let left: Vec<String> = known.difference(&current).cloned().collect();
            *known = current;
            (joined, left)
        };

        for peer in joined {
            shared.emit(BridgeEvent::PeerChange {
                receiver: receiver.clone(),
                topic: topic.clone(),
                peer,
                joined: true,
            });
        }
        for peer in left {
            shared.emit(BridgeEvent::PeerChange {
                receiver: receiver.clone(),
                topic: topic.clone(),
                peer,
                joined: false,
            });
        }
    }
}
