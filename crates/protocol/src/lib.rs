//! Webpeer Protocol
//!
//! The consumer boundary of the bridge: one JSON envelope shape for
//! requests, responses and notifications, plus per-session method dispatch
//! onto the peer manager. Transports (the daemon socket, a WebSocket
//! front-end) frame these envelopes however they like.

mod handler;
mod messages;

pub use handler::Session;
pub use messages::{
    ack_notification, event_notification, list_peers_response, peer_response,
    remove_file_response, store_file_response, Envelope, ErrorResponse, GetFileRequest,
    ListFilesRequest, PeerListRequest, PeerRequest, ProtocolRequest, PublishRequest,
    RemoveFileRequest, SendRequest, StoreFileRequest, TopicRequest,
};
