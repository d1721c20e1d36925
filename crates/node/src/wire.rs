//! Wire formats for application streams
//!
//! Two framings share the 4-byte big-endian length prefix:
//!
//! - Virtual-connection streams carry [`StreamMessage`] JSON frames
//!   (`data` with a payload, `ack` without).
//! - Bridge-protocol streams (`/p2p-webapp/1.0.0`) carry a single kind
//!   byte, then (where the kind has a body) one length-prefixed JSON
//!   frame. The responder closes the stream after its response.

use std::collections::BTreeMap;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{Deserialize, Serialize};

use webpeer_core::FileListing;

/// Upper bound for a single frame
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write a length-prefixed frame
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Read a length-prefixed frame
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// A message on a virtual-connection stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    /// Payload bytes (base64 in JSON), present on `data` messages
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

impl StreamMessage {
    pub fn data(id: &str, payload: Vec<u8>) -> Self {
        Self {
            kind: "data".to_string(),
            id: id.to_string(),
            data: payload,
        }
    }

    pub fn ack(id: &str) -> Self {
        Self {
            kind: "ack".to_string(),
            id: id.to_string(),
            data: Vec::new(),
        }
    }
}

/// Message kinds on the bridge protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FetchKind {
    GetList = 0,
    List = 1,
    GetFile = 2,
    FileContent = 3,
}

impl FetchKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::GetList),
            1 => Some(Self::List),
            2 => Some(Self::GetFile),
            3 => Some(Self::FileContent),
            _ => None,
        }
    }
}

/// `LIST` response: the responder's full file tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListMessage {
    pub cid: String,
    pub entries: FileListing,
}

/// `GET_FILE` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFileMessage {
    pub cid: String,
}

/// `FILE_CONTENT` response body.
///
/// On success `raw_node` carries the DAG block bytes verbatim so the
/// requester can insert them under the original CID; file content and
/// directory entries ride alongside so one round-trip answers the fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileContentMessage {
    pub cid: String,

    #[serde(rename = "isDirectory", default)]
    pub is_directory: bool,

    #[serde(rename = "rawNode", default, skip_serializing_if = "Option::is_none")]
    pub raw_node: Option<String>,

    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello frame").await.unwrap();

        // 4-byte big-endian prefix
        assert_eq!(&buf[..4], &11u32.to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, b"hello frame");
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"").await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_errors() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"full frame").await.unwrap();
        buf.truncate(buf.len() - 3);
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn test_stream_message_data_roundtrip() {
        let msg = StreamMessage::data("123-0", br#"{"hi":1}"#.to_vec());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"data\""));

        let parsed: StreamMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_stream_message_ack_omits_data() {
        let msg = StreamMessage::ack("123-0");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"data\""));

        let parsed: StreamMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, "ack");
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_fetch_kind_bytes() {
        assert_eq!(FetchKind::from_byte(0), Some(FetchKind::GetList));
        assert_eq!(FetchKind::from_byte(1), Some(FetchKind::List));
        assert_eq!(FetchKind::from_byte(2), Some(FetchKind::GetFile));
        assert_eq!(FetchKind::from_byte(3), Some(FetchKind::FileContent));
        assert_eq!(FetchKind::from_byte(4), None);
    }

    #[test]
    fn test_file_content_error_shape() {
        let msg = FileContentMessage {
            cid: "bafymissing".to_string(),
            error: Some("not found".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["cid"], "bafymissing");
        assert_eq!(json["error"], "not found");
        assert!(json.get("rawNode").is_none());
        assert!(json.get("content").is_none());
    }
}
