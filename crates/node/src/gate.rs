//! DHT bootstrap gate
//!
//! DHT operations issued right after peer creation (advertising a topic the
//! browser subscribes to, finding its peers) would fail against an empty
//! routing table and vanish. The gate defers them: each operation either
//! runs immediately (latch already fired) or waits in a queue that drains
//! once the routing table has at least one entry, or once the 30 s budget
//! expires, so deferred work can fail loudly instead of leaking.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::commands::PeerCommand;

/// Give up waiting for the routing table after this long
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Routing-table poll cadence while waiting
const ROUTING_TABLE_POLL: Duration = Duration::from_millis(500);

/// Stop dialing bootstrap peers after this many successes
const BOOTSTRAP_DIAL_TARGET: usize = 3;

/// Per-bootstrap-peer dial timeout
const BOOTSTRAP_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

type DeferredOp = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct DhtGate {
    ready: watch::Sender<bool>,
    // Separate from the peer lock; Some = still queueing, None = drained
    deferred: Mutex<Option<Vec<DeferredOp>>>,
}

impl DhtGate {
    pub fn new() -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        Arc::new(Self {
            ready,
            deferred: Mutex::new(Some(Vec::new())),
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Run `op` once the DHT is usable: immediately if the latch has fired,
    /// otherwise after the drain. Each deferred action gets its own task so
    /// a slow one cannot head-of-line-block the rest.
    pub fn enqueue(&self, op: impl Future<Output = ()> + Send + 'static) {
        let mut deferred = self.deferred.lock().expect("gate lock poisoned");
        match deferred.as_mut() {
            Some(queue) => queue.push(Box::pin(op)),
            None => {
                tokio::spawn(op);
            }
        }
    }

    /// Fire the latch (at most once) and drain the queue
    fn fire_and_drain(&self) {
        if self.ready.send_replace(true) {
            return;
        }
        let drained = self
            .deferred
            .lock()
            .expect("gate lock poisoned")
            .take()
            .unwrap_or_default();
        debug!(operations = drained.len(), "DHT gate fired, draining deferred queue");
        for op in drained {
            tokio::spawn(op);
        }
    }

    /// Wait until the latch fires
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drive the bootstrap sequence for one peer: dial the bootstrap set,
    /// kick a DHT bootstrap, then poll the routing table until populated.
    pub async fn run_bootstrap(
        self: Arc<Self>,
        commands: mpsc::UnboundedSender<PeerCommand>,
        bootstrap_nodes: Vec<String>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let dial_and_wait = async {
            let mut connected = 0usize;
            for node in &bootstrap_nodes {
                let Some((peer, addr)) = parse_bootstrap_addr(node) else {
                    warn!(addr = %node, "skipping unparseable bootstrap address");
                    continue;
                };
                let (tx, rx) = oneshot::channel();
                if commands
                    .send(PeerCommand::Dial {
                        peer,
                        addrs: vec![addr],
                        reply: Some(tx),
                    })
                    .is_err()
                {
                    return;
                }
                match tokio::time::timeout(BOOTSTRAP_DIAL_TIMEOUT, rx).await {
                    Ok(Ok(Ok(()))) => connected += 1,
                    _ => debug!(addr = %node, "bootstrap dial failed"),
                }
                if connected >= BOOTSTRAP_DIAL_TARGET {
                    break;
                }
            }

            let (tx, rx) = oneshot::channel();
            let _ = commands.send(PeerCommand::BootstrapDht { reply: tx });
            if let Ok(Err(e)) = rx.await {
                debug!(%e, "DHT bootstrap warning");
            }

            // Poll until the routing table has at least one entry
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(ROUTING_TABLE_POLL);
            loop {
                ticker.tick().await;
                let (tx, rx) = oneshot::channel();
                if commands.send(PeerCommand::RoutingTableSize { reply: tx }).is_err() {
                    return;
                }
                match rx.await {
                    Ok(size) if size > 0 => return,
                    Ok(_) => {}
                    Err(_) => return,
                }
                if started.elapsed() >= BOOTSTRAP_TIMEOUT {
                    warn!("routing table still empty after bootstrap timeout");
                    return;
                }
            }
        };

        tokio::select! {
            _ = dial_and_wait => {}
            _ = cancel.changed() => {}
        }

        // Whatever path got us here, deferred operations run at most once
        self.fire_and_drain();
    }
}

/// Split a bootstrap multiaddr into its peer id and dialable address
pub fn parse_bootstrap_addr(addr: &str) -> Option<(PeerId, Multiaddr)> {
    let full: Multiaddr = addr.parse().ok()?;
    let mut dial = Multiaddr::empty();
    let mut peer = None;
    for protocol in full.iter() {
        match protocol {
            Protocol::P2p(peer_id) => peer = Some(peer_id),
            other => dial.push(other),
        }
    }
    Some((peer?, dial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_bootstrap_addr() {
        let (peer, addr) = parse_bootstrap_addr(
            "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
        )
        .unwrap();
        assert_eq!(addr.to_string(), "/ip4/104.131.131.82/tcp/4001");
        assert_eq!(
            peer.to_string(),
            "QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ"
        );
    }

    #[test]
    fn test_parse_bootstrap_addr_requires_peer() {
        assert!(parse_bootstrap_addr("/ip4/1.2.3.4/tcp/4001").is_none());
        assert!(parse_bootstrap_addr("garbage").is_none());
    }

    #[tokio::test]
    async fn test_gate_defers_until_fired() {
        let gate = DhtGate::new();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let ran = ran.clone();
            gate.enqueue(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0, "must not run before latch");

        gate.fire_and_drain();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gate_drains_exactly_once() {
        let gate = DhtGate::new();
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = ran.clone();
            gate.enqueue(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        gate.fire_and_drain();
        gate.fire_and_drain();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_fire_runs_immediately() {
        let gate = DhtGate::new();
        gate.fire_and_drain();
        assert!(gate.is_ready());

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            gate.enqueue(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        gate.wait_ready().await;
    }
}
