//! Protected peers and connection upkeep
//!
//! A consumer can mark peers as protected ("keep"): the bridge dials them
//! immediately, falling back to a DHT lookup when no addresses are known,
//! and a retry loop redials any protected peer found disconnected, for the
//! lifetime of the managed peer. Removing protection stops the upkeep but
//! does not disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::commands::PeerCommand;
use crate::identity::parse_peer_id;
use crate::peer::Peer;

/// DHT lookup budget when a protected peer has no known addresses
pub const FIND_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry-loop cadence
pub const PROTECTED_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Per-attempt dial budget inside the retry loop
const RETRY_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Bidirectional dial-in budget when peers join the same manager
pub(crate) const MUTUAL_DIAL_BUDGET: Duration = Duration::from_secs(15);

/// Dial a peer and wait for the outcome
pub(crate) async fn dial(
    commands: &mpsc::UnboundedSender<PeerCommand>,
    peer: PeerId,
    addrs: Vec<Multiaddr>,
) -> Result<(), String> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(PeerCommand::Dial {
            peer,
            addrs,
            reply: Some(tx),
        })
        .map_err(|_| "peer is shutting down".to_string())?;
    match tokio::time::timeout(RETRY_DIAL_TIMEOUT, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("peer is shutting down".to_string()),
        Err(_) => Err("dial timed out".to_string()),
    }
}

/// Dial with exponential backoff (100 ms doubling, capped at 10 s) until
/// success or the budget runs out. Used for dial-in between existing and
/// new peers when one joins the manager.
pub(crate) async fn dial_with_backoff(
    commands: mpsc::UnboundedSender<PeerCommand>,
    peer: PeerId,
    addrs: Vec<Multiaddr>,
    budget: Duration,
) -> bool {
    let started = Instant::now();
    let mut backoff = Duration::from_millis(100);
    let mut attempt = 0u32;

    while started.elapsed() < budget {
        attempt += 1;
        if attempt > 1 {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
        match dial(&commands, peer, addrs.clone()).await {
            Ok(()) => {
                trace!(%peer, attempt, "dial-in connected");
                return true;
            }
            Err(e) => {
                trace!(%peer, attempt, error = %e, "dial-in attempt failed");
            }
        }
    }
    debug!(%peer, elapsed = ?started.elapsed(), "dial-in gave up");
    false
}

impl Peer {
    /// Mark peers as protected and connect to each. Unparseable ids are
    /// silently skipped.
    pub fn add_protected(self: &Arc<Self>, ids: &[String]) {
        for id in ids {
            let Ok(peer) = parse_peer_id(id) else {
                continue;
            };
            self.protected
                .lock()
                .expect("protected set lock poisoned")
                .insert(peer);

            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.connect_protected(peer).await;
            });
        }
    }

    /// Drop protection for peers; existing connections are left alone
    pub fn remove_protected(&self, ids: &[String]) {
        let mut protected = self.protected.lock().expect("protected set lock poisoned");
        for id in ids {
            if let Ok(peer) = parse_peer_id(id) {
                protected.remove(&peer);
            }
        }
    }

    /// Connect to a protected peer: known addresses first, DHT lookup as
    /// the fallback
    async fn connect_protected(&self, peer: PeerId) {
        let addrs = self.shared.local_addrs(&peer).unwrap_or_default();
        if dial(&self.commands, peer, addrs).await.is_ok() {
            return;
        }

        let found = self.find_peer(peer).await;
        if found.is_empty() {
            debug!(
                peer = %self.shared.alias(&peer.to_string()),
                "protected peer not found on DHT"
            );
            return;
        }
        if let Err(e) = dial(&self.commands, peer, found).await {
            debug!(
                peer = %self.shared.alias(&peer.to_string()),
                error = %e,
                "protected peer dial failed"
            );
        }
    }

    /// DHT lookup for a peer's addresses, bounded by [`FIND_PEER_TIMEOUT`]
    pub(crate) async fn find_peer(&self, peer: PeerId) -> Vec<Multiaddr> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(PeerCommand::FindPeer { peer, reply: tx })
            .is_err()
        {
            return Vec::new();
        }
        match tokio::time::timeout(FIND_PEER_TIMEOUT, rx).await {
            Ok(Ok(addrs)) => addrs,
            _ => Vec::new(),
        }
    }

    /// Redial any protected peer found disconnected, every 5 s for the
    /// peer's lifetime
    pub(crate) async fn protected_retry_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(PROTECTED_RETRY_INTERVAL);
        loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {}
            }

            let snapshot: Vec<PeerId> = {
                let protected = self.protected.lock().expect("protected set lock poisoned");
                protected.iter().copied().collect()
            };

            for peer in snapshot {
                let (tx, rx) = oneshot::channel();
                if self
                    .commands
                    .send(PeerCommand::IsConnected { peer, reply: tx })
                    .is_err()
                {
                    return;
                }
                match rx.await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(_) => return,
                }

                trace!(
                    peer = %self.shared.alias(&peer.to_string()),
                    "retrying protected peer"
                );
                self.connect_protected(peer).await;
            }
        }
    }
}
