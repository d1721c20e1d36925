use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("peer ID already in use (possible duplicate browser tab)")]
    DuplicatePeer,

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("invalid peer ID: {0}")]
    InvalidPeerId(String),

    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("invalid peer key: {0}")]
    InvalidPeerKey(String),

    #[error("invalid path: must include file/directory name")]
    InvalidPath,

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("directory cannot have content")]
    DirectoryHasContent,

    #[error("file must have content")]
    FileMissingContent,

    #[error("already started protocol: {0}")]
    AlreadyListening(String),

    #[error("protocol not started: {0}")]
    NotListening(String),

    #[error("failed to join topic {0}: {1}")]
    TopicJoinFailed(String, String),

    #[error("failed to publish to {0}: {1}")]
    PublishFailed(String, String),

    #[error("block store not initialized")]
    StoreNotInitialized,

    #[error("timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_duplicate_peer() {
        let err = BridgeError::DuplicatePeer;
        assert_eq!(
            err.to_string(),
            "peer ID already in use (possible duplicate browser tab)"
        );
    }

    #[test]
    fn test_error_display_peer_not_found() {
        let err = BridgeError::PeerNotFound("12D3KooWTest".to_string());
        assert_eq!(err.to_string(), "peer not found: 12D3KooWTest");
    }

    #[test]
    fn test_error_display_already_listening() {
        let err = BridgeError::AlreadyListening("/echo".to_string());
        assert_eq!(err.to_string(), "already started protocol: /echo");
    }

    #[test]
    fn test_error_display_invalid_path() {
        let err = BridgeError::InvalidPath;
        assert_eq!(
            err.to_string(),
            "invalid path: must include file/directory name"
        );
    }

    #[test]
    fn test_result_type_err() {
        let result: Result<()> = Err(BridgeError::Timeout);
        assert!(result.is_err());
    }
}
