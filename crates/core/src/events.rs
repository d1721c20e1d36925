//! Events delivered from the bridge to its consumer
//!
//! Every event names the receiving managed peer first so a consumer
//! driving several browser sessions can route it to the right one.

use serde_json::Value;

use crate::types::FileListing;

/// An asynchronous notification from a managed peer
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Unicast data arrived on a protocol
    PeerData {
        receiver: String,
        sender: String,
        protocol: String,
        data: Value,
    },

    /// A pub/sub message arrived on a subscribed topic
    TopicData {
        receiver: String,
        topic: String,
        sender: String,
        data: Value,
    },

    /// A peer joined or left a monitored topic
    PeerChange {
        receiver: String,
        topic: String,
        peer: String,
        joined: bool,
    },

    /// A file listing (own or remote) is ready
    PeerFiles {
        receiver: String,
        target: String,
        cid: String,
        entries: FileListing,
    },

    /// A file fetch finished; `content` carries the payload or an error report
    GotFile {
        receiver: String,
        cid: String,
        success: bool,
        content: Value,
    },
}

impl BridgeEvent {
    /// The managed peer this event belongs to
    pub fn receiver(&self) -> &str {
        match self {
            BridgeEvent::PeerData { receiver, .. }
            | BridgeEvent::TopicData { receiver, .. }
            | BridgeEvent::PeerChange { receiver, .. }
            | BridgeEvent::PeerFiles { receiver, .. }
            | BridgeEvent::GotFile { receiver, .. } => receiver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_accessor() {
        let ev = BridgeEvent::PeerChange {
            receiver: "12D3KooWRecv".to_string(),
            topic: "room".to_string(),
            peer: "12D3KooWOther".to_string(),
            joined: true,
        };
        assert_eq!(ev.receiver(), "12D3KooWRecv");

        let ev = BridgeEvent::GotFile {
            receiver: "12D3KooWRecv2".to_string(),
            cid: "bafy".to_string(),
            success: false,
            content: serde_json::json!({"error": "not found"}),
        };
        assert_eq!(ev.receiver(), "12D3KooWRecv2");
    }
}
