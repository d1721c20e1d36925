//! Peer identity handling
//!
//! Browsers own their peer keys as opaque blobs; the bridge decodes and
//! re-encodes them (protobuf key encoding, base64) and derives the stable
//! peer ID.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use libp2p::identity::Keypair;
use libp2p::PeerId;

use webpeer_core::{BridgeError, Result};

/// Generate a fresh Ed25519 identity
pub fn generate_keypair() -> Keypair {
    Keypair::generate_ed25519()
}

/// Encode a keypair as the opaque blob handed to the consumer
pub fn encode_keypair(keypair: &Keypair) -> Result<String> {
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| BridgeError::InvalidPeerKey(e.to_string()))?;
    Ok(BASE64.encode(bytes))
}

/// Decode a consumer-supplied key blob back into a keypair
pub fn decode_keypair(encoded: &str) -> Result<Keypair> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| BridgeError::InvalidPeerKey(format!("failed to decode peer key: {e}")))?;
    Keypair::from_protobuf_encoding(&bytes)
        .map_err(|e| BridgeError::InvalidPeerKey(format!("failed to unmarshal peer key: {e}")))
}

/// Parse a printable peer ID
pub fn parse_peer_id(s: &str) -> Result<PeerId> {
    s.parse::<PeerId>()
        .map_err(|e| BridgeError::InvalidPeerId(format!("{s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_roundtrip() {
        let keypair = generate_keypair();
        let encoded = encode_keypair(&keypair).unwrap();
        let decoded = decode_keypair(&encoded).unwrap();

        assert_eq!(
            PeerId::from(keypair.public()),
            PeerId::from(decoded.public())
        );
    }

    #[test]
    fn test_derived_id_is_stable() {
        let keypair = generate_keypair();
        let encoded = encode_keypair(&keypair).unwrap();

        let a = PeerId::from(decode_keypair(&encoded).unwrap().public());
        let b = PeerId::from(decode_keypair(&encoded).unwrap().public());
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_keypair("not base64 !!!").is_err());
        assert!(decode_keypair("aGVsbG8=").is_err()); // valid base64, not a key
    }

    #[test]
    fn test_parse_peer_id() {
        let keypair = generate_keypair();
        let id = PeerId::from(keypair.public());
        assert_eq!(parse_peer_id(&id.to_string()).unwrap(), id);
        assert!(parse_peer_id("bogus").is_err());
    }
}
