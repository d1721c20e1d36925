//! Message envelope for all bridge communications
//!
//! Everything crossing the consumer boundary is one JSON envelope shape,
//! for requests, responses and server-originated notifications alike.
//! Opaque binary content is base64; CIDs and peer ids are their canonical
//! printable strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use webpeer_core::{BridgeEvent, FileListing};

/// The envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "requestid")]
    pub request_id: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,

    #[serde(rename = "isresponse", default)]
    pub is_response: bool,
}

/// Standardized error shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: i32,
    pub message: String,
}

impl Envelope {
    pub fn response(request_id: i64, result: Value) -> Self {
        Self {
            request_id,
            method: String::new(),
            params: None,
            result: Some(result),
            error: None,
            is_response: true,
        }
    }

    /// "null or error" acknowledgment for async operations
    pub fn empty_response(request_id: i64) -> Self {
        Self {
            request_id,
            method: String::new(),
            params: None,
            result: Some(Value::Null),
            error: None,
            is_response: true,
        }
    }

    pub fn error(request_id: i64, code: i32, message: impl Into<String>) -> Self {
        Self {
            request_id,
            method: String::new(),
            params: None,
            result: None,
            error: Some(ErrorResponse {
                code,
                message: message.into(),
            }),
            is_response: true,
        }
    }

    pub fn notification(request_id: i64, method: &str, params: Value) -> Self {
        Self {
            request_id,
            method: method.to_string(),
            params: Some(params),
            result: None,
            error: None,
            is_response: false,
        }
    }
}

// Client request parameter shapes

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerRequest {
    #[serde(default)]
    pub peerkey: Option<String>,
    #[serde(default)]
    pub rootdirectory: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolRequest {
    pub protocol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    pub peer: String,
    pub protocol: String,
    pub data: Value,
    /// Client-side delivery cookie: when >= 0 the bridge emits an `ack`
    /// notification once the message is queued; -1 requests none
    #[serde(default = "no_ack")]
    pub ack: i64,
}

fn no_ack() -> i64 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicRequest {
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListFilesRequest {
    #[serde(default)]
    pub peer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetFileRequest {
    pub cid: String,
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreFileRequest {
    pub path: String,
    /// base64; absent for directories
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub directory: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveFileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerListRequest {
    pub peers: Vec<String>,
}

// Response payload builders

pub fn peer_response(peer_id: &str, peer_key: &str) -> Value {
    serde_json::json!({"peerid": peer_id, "peerkey": peer_key})
}

pub fn list_peers_response(peers: &[String]) -> Value {
    serde_json::json!({"peers": peers})
}

pub fn store_file_response(cid: &str, root: &str) -> Value {
    serde_json::json!({"cid": cid, "root": root})
}

pub fn remove_file_response(root: &str) -> Value {
    serde_json::json!({"root": root})
}

fn file_listing_value(entries: &FileListing) -> Value {
    serde_json::to_value(entries).unwrap_or(Value::Null)
}

/// Map a bridge event onto its notification envelope
pub fn event_notification(request_id: i64, event: &BridgeEvent) -> Envelope {
    match event {
        BridgeEvent::PeerData {
            sender,
            protocol,
            data,
            ..
        } => Envelope::notification(
            request_id,
            "peerData",
            serde_json::json!({"peer": sender, "protocol": protocol, "data": data}),
        ),

        BridgeEvent::TopicData {
            topic,
            sender,
            data,
            ..
        } => Envelope::notification(
            request_id,
            "topicData",
            serde_json::json!({"topic": topic, "peerid": sender, "data": data}),
        ),

        BridgeEvent::PeerChange {
            topic,
            peer,
            joined,
            ..
        } => Envelope::notification(
            request_id,
            "peerChange",
            serde_json::json!({"topic": topic, "peerid": peer, "joined": joined}),
        ),

        BridgeEvent::PeerFiles {
            target,
            cid,
            entries,
            ..
        } => Envelope::notification(
            request_id,
            "peerFiles",
            serde_json::json!({"peer": target, "cid": cid, "entries": file_listing_value(entries)}),
        ),

        BridgeEvent::GotFile {
            cid,
            success,
            content,
            ..
        } => Envelope::notification(
            request_id,
            "gotFile",
            serde_json::json!({"cid": cid, "success": success, "content": content}),
        ),
    }
}

/// The `ack` notification for a send that asked for one
pub fn ack_notification(request_id: i64, ack: i64) -> Envelope {
    Envelope::notification(request_id, "ack", serde_json::json!({"ack": ack}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_request_parse() {
        let json = r#"{"requestid": 7, "method": "subscribe", "params": {"topic": "room"}, "isresponse": false}"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.request_id, 7);
        assert_eq!(envelope.method, "subscribe");
        assert!(!envelope.is_response);

        let params: TopicRequest =
            serde_json::from_value(envelope.params.unwrap()).unwrap();
        assert_eq!(params.topic, "room");
    }

    #[test]
    fn test_empty_response_serializes_null_result() {
        let envelope = Envelope::empty_response(3);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["requestid"], 3);
        assert_eq!(json["isresponse"], true);
        assert!(json["result"].is_null());
        assert!(json.get("method").is_none());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_response_shape() {
        let envelope = Envelope::error(9, 404, "peer not found: x");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["code"], 404);
        assert_eq!(json["error"]["message"], "peer not found: x");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_send_request_ack_default() {
        let request: SendRequest = serde_json::from_str(
            r#"{"peer": "12D3KooW", "protocol": "/chat", "data": {"hi": 1}}"#,
        )
        .unwrap();
        assert_eq!(request.ack, -1);
    }

    #[test]
    fn test_peer_data_notification() {
        let event = BridgeEvent::PeerData {
            receiver: "12D3KooWRecv".to_string(),
            sender: "12D3KooWSend".to_string(),
            protocol: "/echo".to_string(),
            data: serde_json::json!({"hi": 1}),
        };
        let envelope = event_notification(42, &event);
        assert_eq!(envelope.method, "peerData");
        assert!(!envelope.is_response);
        let params = envelope.params.unwrap();
        assert_eq!(params["peer"], "12D3KooWSend");
        assert_eq!(params["protocol"], "/echo");
        assert_eq!(params["data"]["hi"], 1);
    }

    #[test]
    fn test_got_file_notification() {
        let event = BridgeEvent::GotFile {
            receiver: "12D3KooWRecv".to_string(),
            cid: "bafyx".to_string(),
            success: false,
            content: serde_json::json!({"error": "not found"}),
        };
        let envelope = event_notification(1, &event);
        assert_eq!(envelope.method, "gotFile");
        let params = envelope.params.unwrap();
        assert_eq!(params["success"], false);
        assert_eq!(params["content"]["error"], "not found");
    }
}
