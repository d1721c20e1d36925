//! In-process content-addressed block store
//!
//! The store is shared by every managed peer; `get`/`put` are safe to call
//! concurrently from any task. Files are split into fixed-size raw chunks
//! with a dag-cbor `File` root listing them, so re-adding identical content
//! always reproduces the same root CID.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cid::Cid;

use crate::dag::{cid_for, verify_block, DagNode, DAG_CBOR_CODEC, RAW_CODEC};
use crate::{StoreError, StoreResult};

/// Chunk size for file blocks (256 KiB)
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Thread-safe CID → bytes map
#[derive(Debug, Default)]
pub struct BlockStore {
    blocks: RwLock<HashMap<Cid, Arc<Vec<u8>>>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `bytes` under `codec` and insert the block, returning its CID
    pub fn put_block(&self, codec: u64, bytes: Vec<u8>) -> Cid {
        let cid = cid_for(codec, &bytes);
        self.blocks
            .write()
            .expect("block store lock poisoned")
            .insert(cid, Arc::new(bytes));
        cid
    }

    /// Insert a block under a caller-supplied CID after digest verification.
    ///
    /// Used when caching blocks fetched from another peer: the block must be
    /// stored under its original CID so onward requests resolve.
    pub fn put_block_with_cid(&self, cid: &Cid, bytes: Vec<u8>) -> StoreResult<()> {
        verify_block(cid, &bytes)?;
        self.blocks
            .write()
            .expect("block store lock poisoned")
            .insert(*cid, Arc::new(bytes));
        Ok(())
    }

    pub fn get(&self, cid: &Cid) -> Option<Arc<Vec<u8>>> {
        self.blocks
            .read()
            .expect("block store lock poisoned")
            .get(cid)
            .cloned()
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks
            .read()
            .expect("block store lock poisoned")
            .contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.blocks.read().expect("block store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load and decode a dag-cbor node
    pub fn get_node(&self, cid: &Cid) -> StoreResult<DagNode> {
        let bytes = self
            .get(cid)
            .ok_or_else(|| StoreError::BlockNotFound(cid.to_string()))?;
        DagNode::decode(&bytes)
    }

    /// Encode and insert a dag-cbor node, returning its CID
    pub fn put_node(&self, node: &DagNode) -> StoreResult<Cid> {
        let bytes = node.encode()?;
        Ok(self.put_block(DAG_CBOR_CODEC, bytes))
    }

    /// Chunk `content` and insert it as a file, returning the root CID
    pub fn add_file(&self, content: &[u8]) -> StoreResult<Cid> {
        let mut chunks = Vec::new();
        for chunk in content.chunks(CHUNK_SIZE) {
            let cid = self.put_block(RAW_CODEC, chunk.to_vec());
            chunks.push(cid.to_string());
        }

        let root = DagNode::File {
            size: content.len() as u64,
            chunks,
        };
        self.put_node(&root)
    }

    /// Read a full file back from its root CID
    pub fn read_file(&self, root: &Cid) -> StoreResult<Vec<u8>> {
        let node = self.get_node(root)?;
        let (size, chunks) = match node {
            DagNode::File { size, chunks } => (size, chunks),
            _ => return Err(StoreError::NotAFile(root.to_string())),
        };

        let mut content = Vec::with_capacity(size as usize);
        for chunk in &chunks {
            let cid = crate::dag::parse_cid(chunk)?;
            let bytes = self
                .get(&cid)
                .ok_or_else(|| StoreError::BlockNotFound(cid.to_string()))?;
            content.extend_from_slice(&bytes);
        }
        Ok(content)
    }

    /// Read at most `limit` leading bytes of a file (for content sniffing)
    pub fn read_file_head(&self, root: &Cid, limit: usize) -> StoreResult<Vec<u8>> {
        let node = self.get_node(root)?;
        let chunks = match node {
            DagNode::File { chunks, .. } => chunks,
            _ => return Err(StoreError::NotAFile(root.to_string())),
        };

        let mut head = Vec::new();
        for chunk in &chunks {
            if head.len() >= limit {
                break;
            }
            let cid = crate::dag::parse_cid(chunk)?;
            let bytes = self
                .get(&cid)
                .ok_or_else(|| StoreError::BlockNotFound(cid.to_string()))?;
            let take = (limit - head.len()).min(bytes.len());
            head.extend_from_slice(&bytes[..take]);
        }
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let store = BlockStore::new();
        let cid = store.put_block(RAW_CODEC, b"hello".to_vec());
        assert!(store.contains(&cid));
        assert_eq!(store.get(&cid).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn test_add_file_is_deterministic() {
        let store = BlockStore::new();
        let content = vec![7u8; CHUNK_SIZE + 100];
        let a = store.add_file(&content).unwrap();
        let b = store.add_file(&content).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_file_roundtrip_multi_chunk() {
        let store = BlockStore::new();
        let mut content = vec![0u8; CHUNK_SIZE * 2 + 55];
        for (i, byte) in content.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        let root = store.add_file(&content).unwrap();
        let read = store.read_file(&root).unwrap();
        assert_eq!(read, content);
    }

    #[test]
    fn test_empty_file() {
        let store = BlockStore::new();
        let root = store.add_file(b"").unwrap();
        assert_eq!(store.read_file(&root).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_read_file_head() {
        let store = BlockStore::new();
        let content = vec![9u8; CHUNK_SIZE * 2];
        let root = store.add_file(&content).unwrap();

        let head = store.read_file_head(&root, 512).unwrap();
        assert_eq!(head.len(), 512);
        assert_eq!(head, vec![9u8; 512]);
    }

    #[test]
    fn test_put_block_with_cid_verifies() {
        let store = BlockStore::new();
        let bytes = b"remote block".to_vec();
        let cid = cid_for(RAW_CODEC, &bytes);

        store.put_block_with_cid(&cid, bytes.clone()).unwrap();
        assert!(store.contains(&cid));

        let err = store.put_block_with_cid(&cid, b"forged".to_vec());
        assert!(matches!(err, Err(StoreError::DigestMismatch(_))));
    }

    #[test]
    fn test_missing_block() {
        let store = BlockStore::new();
        let cid = cid_for(RAW_CODEC, b"never stored");
        assert!(store.get(&cid).is_none());
        assert!(matches!(
            store.get_node(&cid),
            Err(StoreError::BlockNotFound(_))
        ));
    }
}
