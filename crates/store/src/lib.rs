//! Webpeer Store
//!
//! The content-addressed substrate the bridge drives: a thread-safe block
//! store keyed by CID, chunked file DAGs, sharded (HAMT-style) directories
//! with copy-on-write mutation, and MIME sniffing for listings.
//!
//! CIDs are CIDv1 with sha2-256 multihashes; file chunks use the `raw`
//! codec and every structured node is dag-cbor.

mod block_store;
mod dag;
mod directory;
mod mime;

use thiserror::Error;

pub use block_store::{BlockStore, CHUNK_SIZE};
pub use dag::{cid_for, parse_cid, verify_block, DagNode, DirLink, LinkKind, DAG_CBOR_CODEC, RAW_CODEC};
pub use directory::{Directory, LEAF_LIMIT};
pub use mime::{sniff_mime, SNIFF_LEN};

// Re-export the CID type the whole workspace uses
pub use cid::Cid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("digest mismatch for {0}")]
    DigestMismatch(String),

    #[error("not a file node: {0}")]
    NotAFile(String),

    #[error("not a directory node: {0}")]
    NotADirectory(String),

    #[error("codec error: {0}")]
    Codec(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
