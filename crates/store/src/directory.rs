//! Sharded (HAMT-style) directories
//!
//! A directory is a dag-cbor node: a plain `Directory` while small, a
//! `Shard` tree once it outgrows [`LEAF_LIMIT`]. Buckets are chosen by the
//! nibble of sha256(name) at the shard's depth, so lookup cost stays flat
//! for large directories and renames touch a single spine.
//!
//! All mutation is copy-on-write: `insert`/`remove` build new nodes bottom
//! up and return a new `Directory` value; nothing already in the store is
//! ever rewritten. Callers persist the returned root and swap their root
//! CID atomically.

use cid::Cid;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::block_store::BlockStore;
use crate::dag::{parse_cid, DagNode, DirLink};
use crate::{StoreError, StoreResult};

/// Entries a plain directory node may hold before it shards
pub const LEAF_LIMIT: usize = 128;

/// Shard fanout: one bucket per nibble
const FANOUT: usize = 16;

/// A directory (or shard) node held in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    node: DagNode,
}

fn bucket_index(name: &str, depth: u8) -> u8 {
    let hash = Sha256::digest(name.as_bytes());
    let byte = hash[(depth / 2) as usize];
    if depth % 2 == 0 {
        byte >> 4
    } else {
        byte & 0x0F
    }
}

impl Directory {
    /// A fresh empty directory
    pub fn empty() -> Self {
        Self {
            node: DagNode::empty_directory(),
        }
    }

    /// Load a directory node from the store
    pub fn load(store: &BlockStore, cid: &Cid) -> StoreResult<Self> {
        match store.get_node(cid)? {
            node @ (DagNode::Directory { .. } | DagNode::Shard { .. }) => Ok(Self { node }),
            _ => Err(StoreError::NotADirectory(cid.to_string())),
        }
    }

    pub fn from_node(node: DagNode) -> StoreResult<Self> {
        match node {
            node @ (DagNode::Directory { .. } | DagNode::Shard { .. }) => Ok(Self { node }),
            _ => Err(StoreError::NotADirectory("inline node".to_string())),
        }
    }

    pub fn node(&self) -> &DagNode {
        &self.node
    }

    pub fn is_empty(&self) -> bool {
        match &self.node {
            DagNode::Directory { entries } => entries.is_empty(),
            DagNode::Shard { buckets, .. } => buckets.is_empty(),
            _ => unreachable!("directory holds a directory node"),
        }
    }

    /// Encode and store this node, returning its CID
    pub fn persist(&self, store: &BlockStore) -> StoreResult<Cid> {
        store.put_node(&self.node)
    }

    /// Look up a single child by name
    pub fn get(&self, store: &BlockStore, name: &str) -> StoreResult<Option<DirLink>> {
        get_at(store, &self.node, name, 0)
    }

    /// Add or replace a child, returning the new directory
    pub fn insert(&self, store: &BlockStore, name: &str, link: DirLink) -> StoreResult<Self> {
        let node = insert_at(store, &self.node, name, link, 0)?;
        Ok(Self { node })
    }

    /// Remove a child, returning the new directory; `Ok(None)` if absent
    pub fn remove(&self, store: &BlockStore, name: &str) -> StoreResult<Option<Self>> {
        Ok(remove_at(store, &self.node, name)?.map(|node| Self { node }))
    }

    /// All immediate children, recursing through shard levels
    pub fn list(&self, store: &BlockStore) -> StoreResult<Vec<(String, DirLink)>> {
        let mut out = Vec::new();
        collect(store, &self.node, &mut out)?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

fn get_at(store: &BlockStore, node: &DagNode, name: &str, depth: u8) -> StoreResult<Option<DirLink>> {
    match node {
        DagNode::Directory { entries } => Ok(entries.get(name).cloned()),
        DagNode::Shard { depth: d, buckets } => {
            let idx = bucket_index(name, *d);
            match buckets.get(&idx) {
                None => Ok(None),
                Some(child_cid) => {
                    let child = store.get_node(&parse_cid(child_cid)?)?;
                    get_at(store, &child, name, depth + 1)
                }
            }
        }
        _ => Err(StoreError::NotADirectory(format!("at depth {depth}"))),
    }
}

/// Build a node for `entries` at `depth`, sharding when over the leaf limit
fn make_node(store: &BlockStore, entries: BTreeMap<String, DirLink>, depth: u8) -> StoreResult<DagNode> {
    if entries.len() <= LEAF_LIMIT || depth as usize >= Sha256::output_size() * 2 {
        return Ok(DagNode::Directory { entries });
    }

    let mut grouped: Vec<BTreeMap<String, DirLink>> = (0..FANOUT).map(|_| BTreeMap::new()).collect();
    for (name, link) in entries {
        let idx = bucket_index(&name, depth) as usize;
        grouped[idx].insert(name, link);
    }

    let mut buckets = BTreeMap::new();
    for (idx, group) in grouped.into_iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        let child = make_node(store, group, depth + 1)?;
        let cid = store.put_node(&child)?;
        buckets.insert(idx as u8, cid.to_string());
    }

    Ok(DagNode::Shard { depth, buckets })
}

fn insert_at(
    store: &BlockStore,
    node: &DagNode,
    name: &str,
    link: DirLink,
    depth: u8,
) -> StoreResult<DagNode> {
    match node {
        DagNode::Directory { entries } => {
            let mut entries = entries.clone();
            entries.insert(name.to_string(), link);
            make_node(store, entries, depth)
        }
        DagNode::Shard { depth: d, buckets } => {
            let idx = bucket_index(name, *d);
            let child = match buckets.get(&idx) {
                Some(child_cid) => store.get_node(&parse_cid(child_cid)?)?,
                None => DagNode::empty_directory(),
            };
            let new_child = insert_at(store, &child, name, link, *d + 1)?;
            let child_cid = store.put_node(&new_child)?;

            let mut buckets = buckets.clone();
            buckets.insert(idx, child_cid.to_string());
            Ok(DagNode::Shard {
                depth: *d,
                buckets,
            })
        }
        _ => Err(StoreError::NotADirectory(format!("at depth {depth}"))),
    }
}

fn remove_at(store: &BlockStore, node: &DagNode, name: &str) -> StoreResult<Option<DagNode>> {
    match node {
        DagNode::Directory { entries } => {
            if !entries.contains_key(name) {
                return Ok(None);
            }
            let mut entries = entries.clone();
            entries.remove(name);
            Ok(Some(DagNode::Directory { entries }))
        }
        DagNode::Shard { depth, buckets } => {
            let idx = bucket_index(name, *depth);
            let Some(child_cid) = buckets.get(&idx) else {
                return Ok(None);
            };
            let child = store.get_node(&parse_cid(child_cid)?)?;
            let Some(new_child) = remove_at(store, &child, name)? else {
                return Ok(None);
            };

            let mut buckets = buckets.clone();
            let child_empty = matches!(&new_child, DagNode::Directory { entries } if entries.is_empty());
            if child_empty {
                buckets.remove(&idx);
            } else {
                let cid = store.put_node(&new_child)?;
                buckets.insert(idx, cid.to_string());
            }

            if buckets.is_empty() {
                Ok(Some(DagNode::empty_directory()))
            } else {
                Ok(Some(DagNode::Shard {
                    depth: *depth,
                    buckets,
                }))
            }
        }
        _ => Err(StoreError::NotADirectory(name.to_string())),
    }
}

fn collect(store: &BlockStore, node: &DagNode, out: &mut Vec<(String, DirLink)>) -> StoreResult<()> {
    match node {
        DagNode::Directory { entries } => {
            for (name, link) in entries {
                out.push((name.clone(), link.clone()));
            }
            Ok(())
        }
        DagNode::Shard { buckets, .. } => {
            for child_cid in buckets.values() {
                let child = store.get_node(&parse_cid(child_cid)?)?;
                collect(store, &child, out)?;
            }
            Ok(())
        }
        _ => Err(StoreError::NotADirectory("shard child".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::LinkKind;

    fn file_link(store: &BlockStore, content: &[u8]) -> DirLink {
        let cid = store.add_file(content).unwrap();
        DirLink {
            kind: LinkKind::File,
            cid: cid.to_string(),
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let store = BlockStore::new();
        let dir = Directory::empty();

        let link = file_link(&store, b"hello");
        let dir = dir.insert(&store, "hello.txt", link.clone()).unwrap();

        assert_eq!(dir.get(&store, "hello.txt").unwrap(), Some(link));
        assert_eq!(dir.get(&store, "missing.txt").unwrap(), None);

        let dir = dir.remove(&store, "hello.txt").unwrap().unwrap();
        assert_eq!(dir.get(&store, "hello.txt").unwrap(), None);
        assert!(dir.is_empty());
    }

    #[test]
    fn test_remove_absent_is_none() {
        let store = BlockStore::new();
        let dir = Directory::empty();
        assert!(dir.remove(&store, "ghost").unwrap().is_none());
    }

    #[test]
    fn test_insert_replaces_existing() {
        let store = BlockStore::new();
        let dir = Directory::empty();

        let first = file_link(&store, b"v1");
        let second = file_link(&store, b"v2");
        let dir = dir.insert(&store, "doc", first).unwrap();
        let dir = dir.insert(&store, "doc", second.clone()).unwrap();

        assert_eq!(dir.get(&store, "doc").unwrap(), Some(second));
        assert_eq!(dir.list(&store).unwrap().len(), 1);
    }

    #[test]
    fn test_copy_on_write_roots() {
        let store = BlockStore::new();
        let dir = Directory::empty();
        let root0 = dir.persist(&store).unwrap();

        let dir1 = dir.insert(&store, "a", file_link(&store, b"a")).unwrap();
        let root1 = dir1.persist(&store).unwrap();
        assert_ne!(root0, root1);

        // Old root still loads with its old contents
        let old = Directory::load(&store, &root0).unwrap();
        assert!(old.is_empty());
    }

    #[test]
    fn test_shards_over_leaf_limit() {
        let store = BlockStore::new();
        let mut dir = Directory::empty();

        let n = LEAF_LIMIT + 40;
        for i in 0..n {
            let name = format!("file-{i:04}");
            dir = dir.insert(&store, &name, file_link(&store, name.as_bytes())).unwrap();
        }

        assert!(matches!(dir.node(), DagNode::Shard { .. }));

        // Every entry still resolves through the shard tree
        for i in 0..n {
            let name = format!("file-{i:04}");
            assert!(dir.get(&store, &name).unwrap().is_some(), "{name} lost");
        }
        assert_eq!(dir.list(&store).unwrap().len(), n);
    }

    #[test]
    fn test_shard_roundtrips_through_store() {
        let store = BlockStore::new();
        let mut dir = Directory::empty();
        for i in 0..(LEAF_LIMIT + 10) {
            dir = dir
                .insert(&store, &format!("n{i}"), file_link(&store, &[i as u8]))
                .unwrap();
        }

        let root = dir.persist(&store).unwrap();
        let loaded = Directory::load(&store, &root).unwrap();
        assert_eq!(loaded.list(&store).unwrap(), dir.list(&store).unwrap());
    }

    #[test]
    fn test_sharded_removal() {
        let store = BlockStore::new();
        let mut dir = Directory::empty();
        let n = LEAF_LIMIT + 20;
        for i in 0..n {
            dir = dir
                .insert(&store, &format!("f{i}"), file_link(&store, &[1, i as u8]))
                .unwrap();
        }

        for i in 0..n {
            dir = dir.remove(&store, &format!("f{i}")).unwrap().unwrap();
        }
        assert!(dir.is_empty());
        assert!(matches!(dir.node(), DagNode::Directory { .. }));
    }

    #[test]
    fn test_listing_is_order_independent() {
        let store = BlockStore::new();

        let mut forward = Directory::empty();
        let mut backward = Directory::empty();
        let names: Vec<String> = (0..50).map(|i| format!("item-{i}")).collect();

        for name in &names {
            forward = forward
                .insert(&store, name, file_link(&store, name.as_bytes()))
                .unwrap();
        }
        for name in names.iter().rev() {
            backward = backward
                .insert(&store, name, file_link(&store, name.as_bytes()))
                .unwrap();
        }

        assert_eq!(
            forward.persist(&store).unwrap(),
            backward.persist(&store).unwrap()
        );
    }
}
