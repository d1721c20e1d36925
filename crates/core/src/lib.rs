//! Webpeer Core
//!
//! Shared types for the webpeer bridge: configuration, error kinds, file
//! entries and the consumer-facing event enum. Everything here is plain
//! data; the p2p machinery lives in `webpeer-node`.

mod config;
mod error;
mod events;
mod types;

pub use config::{BridgeConfig, DEFAULT_BOOTSTRAP_NODES};
pub use error::{BridgeError, Result};
pub use events::BridgeEvent;
pub use types::{EntryKind, FileEntry, FileListing};
