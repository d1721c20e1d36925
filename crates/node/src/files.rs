//! File tree operations for a managed peer
//!
//! Each peer owns a sharded directory in the shared block store. Mutations
//! snapshot the root under a read lock, do every store operation lock-free,
//! rebuild the spine from leaf to root copy-on-write, and only then swap
//! the root pointer under the write lock. Holding the write lock across
//! store I/O would deadlock any concurrent callback that reads the tree.

use webpeer_core::{BridgeError, EntryKind, FileEntry, FileListing, Result};
use webpeer_store::{parse_cid, sniff_mime, BlockStore, Cid, DirLink, Directory, LinkKind, SNIFF_LEN};

use crate::peer::Peer;

fn store_err(e: webpeer_store::StoreError) -> BridgeError {
    BridgeError::Store(e.to_string())
}

/// Split a slash path into parent segments and the final name
pub(crate) fn split_path(path: &str) -> Result<(Vec<String>, String)> {
    if path.is_empty() || path.ends_with('/') {
        return Err(BridgeError::InvalidPath);
    }
    let mut parts: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let name = parts.pop().ok_or(BridgeError::InvalidPath)?;
    Ok((parts, name))
}

impl Peer {
    /// Current root without holding the lock across any I/O
    pub(crate) fn snapshot_directory(&self) -> (Directory, Cid) {
        let state = self.state.read().expect("peer state lock poisoned");
        (state.directory.clone(), state.directory_cid)
    }

    /// The current root CID of this peer's file tree
    pub fn directory_cid(&self) -> String {
        self.state
            .read()
            .expect("peer state lock poisoned")
            .directory_cid
            .to_string()
    }

    /// Walk the whole tree into a path-keyed listing. Children whose blocks
    /// are unreadable are skipped rather than failing the listing.
    pub(crate) fn build_file_entries(&self) -> Result<(String, FileListing)> {
        let (directory, root_cid) = self.snapshot_directory();
        let mut entries = FileListing::new();
        walk_directory(&self.store, &directory, "", &mut entries)?;
        Ok((root_cid.to_string(), entries))
    }

    /// Store a file or empty directory at `path`, rebuilding the tree from
    /// leaf to root. Returns `(node CID, new root CID)`.
    pub async fn store_file(
        &self,
        path: &str,
        content: Option<Vec<u8>>,
        directory: bool,
    ) -> Result<(String, String)> {
        if directory && content.is_some() {
            return Err(BridgeError::DirectoryHasContent);
        }
        if !directory && content.is_none() {
            return Err(BridgeError::FileMissingContent);
        }
        let (parents, name) = split_path(path)?;

        let (root_dir, _) = self.snapshot_directory();

        // Build the new leaf node first; store I/O with no lock held
        let new_link = if directory {
            let cid = Directory::empty().persist(&self.store).map_err(store_err)?;
            DirLink {
                kind: LinkKind::Directory,
                cid: cid.to_string(),
            }
        } else {
            let cid = self
                .store
                .add_file(&content.expect("checked above"))
                .map_err(store_err)?;
            DirLink {
                kind: LinkKind::File,
                cid: cid.to_string(),
            }
        };

        let stack = self.descend(root_dir, &parents, true)?;
        let new_root = self.rebuild(stack, &name, Some(new_link.clone()))?;
        let new_root_cid = self.commit_root(new_root)?;

        tracing::trace!(
            peer = %self.alias,
            path,
            cid = %new_link.cid,
            kind = if directory { "directory" } else { "file" },
            "stored"
        );

        self.publish_file_update_notification().await;
        Ok((new_link.cid, new_root_cid.to_string()))
    }

    /// Remove the file or directory at `path`. Returns the new root CID.
    pub async fn remove_file(&self, path: &str) -> Result<String> {
        let (parents, name) = split_path(path)?;
        let (root_dir, _) = self.snapshot_directory();

        let stack = self.descend(root_dir, &parents, false)?;
        let new_root = self
            .rebuild(stack, &name, None)?
            .ok_or_else(|| BridgeError::PathNotFound(path.to_string()))?;
        let new_root_cid = self.commit_root(Some(new_root))?;

        tracing::trace!(peer = %self.alias, path, "removed");

        self.publish_file_update_notification().await;
        Ok(new_root_cid.to_string())
    }

    /// Walk `parents` down from the root, loading existing directories and,
    /// when `create_missing`, materializing absent ones. The returned
    /// stack pairs each directory with its name in its parent.
    fn descend(
        &self,
        root: Directory,
        parents: &[String],
        create_missing: bool,
    ) -> Result<Vec<(Directory, String)>> {
        let mut stack = vec![(root, String::new())];
        for part in parents {
            let current = &stack.last().expect("stack nonempty").0;
            let next = match current.get(&self.store, part).map_err(store_err)? {
                Some(link) if link.kind == LinkKind::Directory => {
                    let cid = parse_cid(&link.cid).map_err(store_err)?;
                    Directory::load(&self.store, &cid).map_err(store_err)?
                }
                Some(_) => {
                    return Err(BridgeError::Store(format!("not a directory: {part}")));
                }
                None if create_missing => Directory::empty(),
                None => {
                    return Err(BridgeError::PathNotFound(format!(
                        "parent directory not found: {part}"
                    )));
                }
            };
            stack.push((next, part.clone()));
        }
        Ok(stack)
    }

    /// Apply the leaf mutation (`Some` = insert/replace, `None` = remove)
    /// and fold the stack back up into a new root. Returns `None` when a
    /// removal found nothing to remove.
    fn rebuild(
        &self,
        mut stack: Vec<(Directory, String)>,
        name: &str,
        new_link: Option<DirLink>,
    ) -> Result<Option<Directory>> {
        let (leaf, leaf_name) = stack.pop().expect("stack nonempty");

        let mut current = match new_link {
            Some(link) => leaf.insert(&self.store, name, link).map_err(store_err)?,
            None => match leaf.remove(&self.store, name).map_err(store_err)? {
                Some(updated) => updated,
                None => return Ok(None),
            },
        };

        let mut current_name = leaf_name;
        while let Some((parent, parent_name)) = stack.pop() {
            let child_cid = current.persist(&self.store).map_err(store_err)?;
            current = parent
                .insert(
                    &self.store,
                    &current_name,
                    DirLink {
                        kind: LinkKind::Directory,
                        cid: child_cid.to_string(),
                    },
                )
                .map_err(store_err)?;
            current_name = parent_name;
        }

        Ok(Some(current))
    }

    /// Persist the new root and swap the pointer under the write lock
    fn commit_root(&self, new_root: Option<Directory>) -> Result<Cid> {
        let new_root = new_root.expect("store path always yields a root");
        let new_root_cid = new_root.persist(&self.store).map_err(store_err)?;

        let mut state = self.state.write().expect("peer state lock poisoned");
        state.directory = new_root;
        state.directory_cid = new_root_cid;
        Ok(new_root_cid)
    }

    /// Best-effort announcement that this peer's file tree changed, sent
    /// only when a notify topic is configured and this peer subscribes to it
    pub(crate) async fn publish_file_update_notification(&self) {
        let Some(topic) = self.config.file_update_notify_topic.clone() else {
            return;
        };
        let subscribed = self
            .state
            .read()
            .expect("peer state lock poisoned")
            .topics
            .contains_key(&topic);
        if !subscribed {
            return;
        }

        let message = serde_json::json!({
            "type": "p2p-webapp-file-update",
            "peer": self.peer_id.to_string(),
        });
        if let Err(e) = self.publish(&topic, &message).await {
            tracing::debug!(error = %e, "file update notification failed");
        }
    }
}

fn walk_directory(
    store: &BlockStore,
    directory: &Directory,
    base: &str,
    entries: &mut FileListing,
) -> Result<()> {
    for (name, link) in directory.list(store).map_err(store_err)? {
        let path = if base.is_empty() {
            name.clone()
        } else {
            format!("{base}/{name}")
        };
        let Ok(cid) = parse_cid(&link.cid) else {
            continue;
        };

        match link.kind {
            LinkKind::Directory => {
                entries.insert(
                    path.clone(),
                    FileEntry {
                        kind: EntryKind::Directory,
                        cid: link.cid.clone(),
                        mime_type: None,
                    },
                );
                if let Ok(sub) = Directory::load(store, &cid) {
                    let _ = walk_directory(store, &sub, &path, entries);
                }
            }
            LinkKind::File => {
                if !store.contains(&cid) {
                    continue;
                }
                let mime_type = store
                    .read_file_head(&cid, SNIFF_LEN)
                    .map(|head| sniff_mime(&head))
                    .unwrap_or_else(|_| "application/octet-stream".to_string());
                entries.insert(
                    path,
                    FileEntry {
                        kind: EntryKind::File,
                        cid: link.cid.clone(),
                        mime_type: Some(mime_type),
                    },
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        let (parents, name) = split_path("a/b/c.txt").unwrap();
        assert_eq!(parents, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(name, "c.txt");

        let (parents, name) = split_path("top.txt").unwrap();
        assert!(parents.is_empty());
        assert_eq!(name, "top.txt");

        let (parents, name) = split_path("/lead/slash").unwrap();
        assert_eq!(parents, vec!["lead".to_string()]);
        assert_eq!(name, "slash");
    }

    #[test]
    fn test_split_path_invalid() {
        assert!(matches!(split_path(""), Err(BridgeError::InvalidPath)));
        assert!(matches!(split_path("a/b/"), Err(BridgeError::InvalidPath)));
        assert!(matches!(split_path("/"), Err(BridgeError::InvalidPath)));
    }
}
