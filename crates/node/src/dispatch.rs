//! Shared dispatcher for managed peers
//!
//! Peers never hold a reference back to the `Manager`; everything they need
//! from it (the event sink, alias lookup for log legibility, verbosity and
//! the addresses of sibling peers on this host) travels in this small
//! shared object instead.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;

use webpeer_core::BridgeEvent;

#[derive(Debug)]
pub struct Dispatcher {
    verbosity: u8,
    events: mpsc::UnboundedSender<BridgeEvent>,
    aliases: Mutex<AliasTable>,
    local_addrs: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
}

#[derive(Debug, Default)]
struct AliasTable {
    map: HashMap<String, String>,
    counter: usize,
}

fn alias_name(counter: usize) -> String {
    // peer-a .. peer-z, then peer-aa, peer-ab, ...
    let mut n = counter;
    let mut letters = Vec::new();
    loop {
        letters.push(b'a' + (n % 26) as u8);
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    letters.reverse();
    format!("peer-{}", String::from_utf8(letters).expect("ascii letters"))
}

impl Dispatcher {
    pub fn new(verbosity: u8, events: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        Self {
            verbosity,
            events,
            aliases: Mutex::new(AliasTable::default()),
            local_addrs: RwLock::new(HashMap::new()),
        }
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    /// Deliver an event to the consumer; best-effort once the receiver is gone
    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    /// Short name for a peer id, assigned on first sight
    pub fn alias(&self, peer_id: &str) -> String {
        let mut table = self.aliases.lock().expect("alias table lock poisoned");
        if let Some(alias) = table.map.get(peer_id) {
            return alias.clone();
        }
        let alias = alias_name(table.counter);
        table.counter += 1;
        table.map.insert(peer_id.to_string(), alias.clone());
        alias
    }

    /// Record the listen addresses of a manager-local peer
    pub fn register_local(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        self.local_addrs
            .write()
            .expect("local addr lock poisoned")
            .insert(peer, addrs);
    }

    pub fn unregister_local(&self, peer: &PeerId) {
        self.local_addrs
            .write()
            .expect("local addr lock poisoned")
            .remove(peer);
    }

    /// Addresses of a sibling peer on this host, if it is one
    pub fn local_addrs(&self, peer: &PeerId) -> Option<Vec<Multiaddr>> {
        self.local_addrs
            .read()
            .expect("local addr lock poisoned")
            .get(peer)
            .cloned()
    }

    /// Snapshot of every manager-local peer and its addresses
    pub fn all_local(&self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        self.local_addrs
            .read()
            .expect("local addr lock poisoned")
            .iter()
            .map(|(peer, addrs)| (*peer, addrs.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_sequence() {
        assert_eq!(alias_name(0), "peer-a");
        assert_eq!(alias_name(1), "peer-b");
        assert_eq!(alias_name(25), "peer-z");
        assert_eq!(alias_name(26), "peer-aa");
        assert_eq!(alias_name(27), "peer-ab");
    }

    #[test]
    fn test_alias_is_sticky() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(0, tx);

        let a = dispatcher.alias("12D3KooWOne");
        let b = dispatcher.alias("12D3KooWTwo");
        assert_eq!(a, "peer-a");
        assert_eq!(b, "peer-b");
        assert_eq!(dispatcher.alias("12D3KooWOne"), "peer-a");
    }

    #[test]
    fn test_local_addr_registry() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(0, tx);
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();

        assert!(dispatcher.local_addrs(&peer).is_none());
        dispatcher.register_local(peer, vec![addr.clone()]);
        assert_eq!(dispatcher.local_addrs(&peer), Some(vec![addr]));
        dispatcher.unregister_local(&peer);
        assert!(dispatcher.local_addrs(&peer).is_none());
    }
}
