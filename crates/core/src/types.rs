//! Shared bridge types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A file or directory entry with metadata, as reported by file listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub cid: String,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Full-pathname file tree of a peer, keyed by path
pub type FileListing = BTreeMap<String, FileEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_entry_serialization() {
        let entry = FileEntry {
            kind: EntryKind::File,
            cid: "bafytest".to_string(),
            mime_type: Some("text/plain; charset=utf-8".to_string()),
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["cid"], "bafytest");
        assert_eq!(json["mimeType"], "text/plain; charset=utf-8");
    }

    #[test]
    fn test_directory_entry_omits_mime() {
        let entry = FileEntry {
            kind: EntryKind::Directory,
            cid: "bafydir".to_string(),
            mime_type: None,
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("mimeType"));
        assert!(json.contains("\"type\":\"directory\""));
    }

    #[test]
    fn test_file_entry_roundtrip() {
        let entry = FileEntry {
            kind: EntryKind::File,
            cid: "bafyfile".to_string(),
            mime_type: Some("application/octet-stream".to_string()),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: FileEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }
}
