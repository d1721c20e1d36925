//! Method dispatch for one consumer session
//!
//! A session drives exactly one managed peer: the first `peer` request
//! creates (or restores) it, and every later method routes through it.
//! Asynchronous operations answer `null` immediately; their real results
//! arrive as notifications delivered by the session's event filter.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tracing::debug;

use webpeer_core::{BridgeError, BridgeEvent};
use webpeer_node::Manager;

use crate::messages::{
    ack_notification, event_notification, list_peers_response, peer_response,
    remove_file_response, store_file_response, Envelope, GetFileRequest, ListFilesRequest,
    PeerListRequest, PeerRequest, ProtocolRequest, PublishRequest, RemoveFileRequest,
    SendRequest, StoreFileRequest, TopicRequest,
};

fn error_code(error: &BridgeError) -> i32 {
    match error {
        BridgeError::PeerNotFound(_) | BridgeError::PathNotFound(_) => 404,
        BridgeError::InvalidPeerId(_)
        | BridgeError::InvalidCid(_)
        | BridgeError::InvalidPeerKey(_)
        | BridgeError::InvalidPath
        | BridgeError::DirectoryHasContent
        | BridgeError::FileMissingContent => 400,
        _ => 500,
    }
}

/// One consumer session bound to one managed peer
pub struct Session {
    manager: Arc<Manager>,
    peer_id: Mutex<Option<String>>,
    /// Outbound server-originated messages (acks and event notifications)
    notify: tokio::sync::mpsc::UnboundedSender<Envelope>,
    next_notification_id: AtomicI64,
}

impl Session {
    pub fn new(
        manager: Arc<Manager>,
        notify: tokio::sync::mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            manager,
            peer_id: Mutex::new(None),
            notify,
            next_notification_id: AtomicI64::new(1),
        }
    }

    /// The managed peer this session drives, once `peer` has succeeded
    pub fn peer_id(&self) -> Option<String> {
        self.peer_id.lock().expect("session lock poisoned").clone()
    }

    fn next_id(&self) -> i64 {
        self.next_notification_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Forward an event to this session if it belongs to its peer
    pub fn deliver(&self, event: &BridgeEvent) {
        let owns = self
            .peer_id()
            .map(|id| id == event.receiver())
            .unwrap_or(false);
        if owns {
            let _ = self.notify.send(event_notification(self.next_id(), event));
        }
    }

    /// Handle one client request, producing its response envelope
    pub async fn handle(&self, request: Envelope) -> Envelope {
        let id = request.request_id;
        match request.method.as_str() {
            "peer" => self.handle_peer(id, request.params).await,
            "start" => self.handle_start(id, request.params),
            "stop" => self.handle_stop(id, request.params),
            "send" => self.handle_send(id, request.params),
            "subscribe" => self.handle_subscribe(id, request.params).await,
            "publish" => self.handle_publish(id, request.params).await,
            "unsubscribe" => self.handle_unsubscribe(id, request.params).await,
            "listpeers" => self.handle_list_peers(id, request.params).await,
            "listfiles" => self.handle_list_files(id, request.params).await,
            "getfile" => self.handle_get_file(id, request.params),
            "storefile" => self.handle_store_file(id, request.params).await,
            "removefile" => self.handle_remove_file(id, request.params).await,
            "addPeers" => self.handle_add_peers(id, request.params),
            "removePeers" => self.handle_remove_peers(id, request.params),
            other => Envelope::error(id, 400, format!("unknown method: {other}")),
        }
    }

    fn parse_params<T: serde::de::DeserializeOwned>(
        id: i64,
        params: Option<Value>,
    ) -> Result<T, Box<Envelope>> {
        let params = params.unwrap_or(Value::Null);
        serde_json::from_value(params).map_err(|_| Box::new(Envelope::error(id, 400, "invalid params")))
    }

    fn session_peer(&self, id: i64) -> Result<String, Box<Envelope>> {
        self.peer_id()
            .ok_or_else(|| Box::new(Envelope::error(id, 400, "no peer created for this session")))
    }

    async fn handle_peer(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: PeerRequest = match params {
            Some(value) => match serde_json::from_value(value) {
                Ok(request) => request,
                Err(_) => return Envelope::error(id, 400, "invalid params"),
            },
            None => PeerRequest::default(),
        };

        match self
            .manager
            .create_peer(
                request.peerkey.as_deref(),
                request.rootdirectory.as_deref(),
            )
            .await
        {
            Ok((peer_id, peer_key)) => {
                debug!(peer = %peer_id, "session peer created");
                *self.peer_id.lock().expect("session lock poisoned") = Some(peer_id.clone());
                Envelope::response(id, peer_response(&peer_id, &peer_key))
            }
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    fn handle_start(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: ProtocolRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self.manager.listen(&peer, &request.protocol) {
            Ok(()) => Envelope::empty_response(id),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    fn handle_stop(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: ProtocolRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self.manager.stop_listen(&peer, &request.protocol) {
            Ok(()) => Envelope::empty_response(id),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    fn handle_send(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: SendRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self
            .manager
            .send(&peer, &request.peer, &request.protocol, &request.data)
        {
            Ok(()) => {
                if request.ack >= 0 {
                    let _ = self.notify.send(ack_notification(self.next_id(), request.ack));
                }
                Envelope::empty_response(id)
            }
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    async fn handle_subscribe(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: TopicRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self.manager.subscribe(&peer, &request.topic).await {
            Ok(()) => Envelope::empty_response(id),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    async fn handle_publish(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: PublishRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self.manager.publish(&peer, &request.topic, &request.data).await {
            Ok(()) => Envelope::empty_response(id),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    async fn handle_unsubscribe(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: TopicRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self.manager.unsubscribe(&peer, &request.topic).await {
            Ok(()) => Envelope::empty_response(id),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    async fn handle_list_peers(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: TopicRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self.manager.list_topic_peers(&peer, &request.topic).await {
            Ok(peers) => Envelope::response(id, list_peers_response(&peers)),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    async fn handle_list_files(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: ListFilesRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        let target = request.peer.unwrap_or_else(|| peer.clone());
        match self.manager.list_files(&peer, &target).await {
            Ok(()) => Envelope::empty_response(id),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    fn handle_get_file(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: GetFileRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self
            .manager
            .get_file(&peer, &request.cid, request.fallback.as_deref())
        {
            Ok(()) => Envelope::empty_response(id),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    async fn handle_store_file(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: StoreFileRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };

        let content = match request.content {
            Some(encoded) => match BASE64.decode(&encoded) {
                Ok(bytes) => Some(bytes),
                Err(_) => return Envelope::error(id, 400, "invalid content encoding"),
            },
            None => None,
        };

        match self
            .manager
            .store_file(&peer, &request.path, content, request.directory)
            .await
        {
            Ok((cid, root)) => Envelope::response(id, store_file_response(&cid, &root)),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    async fn handle_remove_file(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: RemoveFileRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self.manager.remove_file(&peer, &request.path).await {
            Ok(root) => Envelope::response(id, remove_file_response(&root)),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    fn handle_add_peers(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: PeerListRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self.manager.add_protected(&peer, &request.peers) {
            Ok(()) => Envelope::empty_response(id),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }

    fn handle_remove_peers(&self, id: i64, params: Option<Value>) -> Envelope {
        let request: PeerListRequest = match Self::parse_params(id, params) {
            Ok(request) => request,
            Err(error) => return *error,
        };
        let peer = match self.session_peer(id) {
            Ok(peer) => peer,
            Err(error) => return *error,
        };
        match self.manager.remove_protected(&peer, &request.peers) {
            Ok(()) => Envelope::empty_response(id),
            Err(e) => Envelope::error(id, error_code(&e), e.to_string()),
        }
    }
}
