//! DAG node encoding
//!
//! Blocks are either raw chunk bytes (`raw` codec) or dag-cbor nodes.
//! Child links are carried as canonical CID strings so node bytes are
//! deterministic: struct fields serialize in order and maps are BTreeMaps.

use std::collections::BTreeMap;

use cid::Cid;
use multihash::Multihash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{StoreError, StoreResult};

/// Multicodec for raw chunk blocks
pub const RAW_CODEC: u64 = 0x55;

/// Multicodec for dag-cbor nodes
pub const DAG_CBOR_CODEC: u64 = 0x71;

/// Multihash code for sha2-256
pub const SHA2_256: u64 = 0x12;

/// Kind of a directory link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    File,
    Directory,
}

/// A named child inside a directory node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirLink {
    pub kind: LinkKind,
    pub cid: String,
}

/// A dag-cbor node in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DagNode {
    /// File root: total size plus the chunk blocks in order
    File { size: u64, chunks: Vec<String> },

    /// Plain directory: name → link
    Directory { entries: BTreeMap<String, DirLink> },

    /// HAMT shard: bucket index → child node CID. Children are either
    /// leaf `Directory` nodes or deeper `Shard` nodes.
    Shard { depth: u8, buckets: BTreeMap<u8, String> },
}

impl DagNode {
    pub fn empty_directory() -> Self {
        DagNode::Directory {
            entries: BTreeMap::new(),
        }
    }

    /// Encode to canonical dag-cbor bytes
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from dag-cbor bytes
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        ciborium::from_reader(bytes).map_err(|e: ciborium::de::Error<std::io::Error>| {
            StoreError::Codec(e.to_string())
        })
    }
}

/// Compute the CIDv1 for a block under the given codec
pub fn cid_for(codec: u64, bytes: &[u8]) -> Cid {
    let digest = Sha256::digest(bytes);
    let mh = Multihash::<64>::wrap(SHA2_256, &digest).expect("sha256 digest fits multihash");
    Cid::new_v1(codec, mh)
}

/// Parse a CID string, mapping failures to a store error
pub fn parse_cid(s: &str) -> StoreResult<Cid> {
    s.parse::<Cid>()
        .map_err(|e| StoreError::InvalidCid(format!("{s}: {e}")))
}

/// Verify that `bytes` hash to the digest carried by `cid`
pub fn verify_block(cid: &Cid, bytes: &[u8]) -> StoreResult<()> {
    if cid.hash().code() != SHA2_256 {
        return Err(StoreError::Codec(format!(
            "unsupported multihash code {:#x}",
            cid.hash().code()
        )));
    }
    let digest = Sha256::digest(bytes);
    if cid.hash().digest() != digest.as_slice() {
        return Err(StoreError::DigestMismatch(cid.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_is_stable() {
        let a = cid_for(RAW_CODEC, b"webpeer");
        let b = cid_for(RAW_CODEC, b"webpeer");
        assert_eq!(a, b);
        assert_ne!(a, cid_for(RAW_CODEC, b"webpeer!"));
    }

    #[test]
    fn test_codec_changes_cid() {
        let raw = cid_for(RAW_CODEC, b"data");
        let cbor = cid_for(DAG_CBOR_CODEC, b"data");
        assert_ne!(raw, cbor);
        assert_eq!(raw.hash(), cbor.hash());
    }

    #[test]
    fn test_node_roundtrip() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "notes.md".to_string(),
            DirLink {
                kind: LinkKind::File,
                cid: cid_for(RAW_CODEC, b"x").to_string(),
            },
        );
        let node = DagNode::Directory { entries };

        let bytes = node.encode().unwrap();
        let decoded = DagNode::decode(&bytes).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), DirLink { kind: LinkKind::File, cid: "bafyb".into() });
        a.insert("a".to_string(), DirLink { kind: LinkKind::File, cid: "bafya".into() });

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), DirLink { kind: LinkKind::File, cid: "bafya".into() });
        b.insert("b".to_string(), DirLink { kind: LinkKind::File, cid: "bafyb".into() });

        let na = DagNode::Directory { entries: a }.encode().unwrap();
        let nb = DagNode::Directory { entries: b }.encode().unwrap();
        assert_eq!(na, nb);
    }

    #[test]
    fn test_verify_block() {
        let bytes = b"payload".to_vec();
        let cid = cid_for(RAW_CODEC, &bytes);
        verify_block(&cid, &bytes).unwrap();
        assert!(verify_block(&cid, b"tampered").is_err());
    }

    #[test]
    fn test_parse_cid_rejects_garbage() {
        assert!(parse_cid("not-a-cid").is_err());
        let good = cid_for(RAW_CODEC, b"ok").to_string();
        assert!(parse_cid(&good).is_ok());
    }
}
