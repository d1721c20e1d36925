//! Bridge protocol: file lists and cross-peer file fetch
//!
//! `/p2p-webapp/1.0.0` carries four message kinds: `GET_LIST`/`LIST` for
//! full file trees and `GET_FILE`/`FILE_CONTENT` for single blocks. The
//! responder closes the stream after its response. `FILE_CONTENT` carries
//! the raw DAG block so the requester can insert it into its own store
//! under the original CID: a successful fallback fetch warms the local
//! cache and lets this peer serve the block onward.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::io::{AsyncReadExt as _, AsyncWriteExt as _};
use futures::StreamExt as _;
use libp2p::{PeerId, Stream};
use libp2p_stream::IncomingStreams;
use serde_json::Value;
use tracing::{debug, trace};

use webpeer_core::{BridgeError, BridgeEvent, Result};
use webpeer_store::{sniff_mime, Cid, DagNode, Directory};

use crate::behaviour::BRIDGE_PROTOCOL;
use crate::identity::parse_peer_id;
use crate::peer::Peer;
use crate::wire::{
    read_frame, write_frame, FetchKind, FileContentMessage, FileListMessage, GetFileMessage,
};

impl Peer {
    /// Request a file list. For the peer itself the tree is built locally
    /// and delivered via `PeerFiles`; for a remote target a `GET_LIST` goes
    /// out and the response arrives the same way. At most one remote
    /// request may be outstanding; a second call while one is in flight is
    /// a no-op.
    pub async fn list_files(self: &Arc<Self>, target: &str) -> Result<()> {
        if target == self.peer_id.to_string() {
            let (cid, entries) = self.build_file_entries()?;
            self.shared.emit(BridgeEvent::PeerFiles {
                receiver: self.peer_id.to_string(),
                target: target.to_string(),
                cid,
                entries,
            });
            return Ok(());
        }

        let target_peer = parse_peer_id(target)?;

        {
            let mut state = self.state.write().expect("peer state lock poisoned");
            if state.file_list_pending {
                trace!(peer = %self.alias, target, "file list request already pending");
                return Ok(());
            }
            state.file_list_pending = true;
        }

        let opened = self.open_bridge_stream(target_peer).await;
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.clear_file_list_pending();
                return Err(e);
            }
        };

        if let Err(e) = stream.write_all(&[FetchKind::GetList as u8]).await {
            self.clear_file_list_pending();
            return Err(BridgeError::Network(format!("failed to send request: {e}")));
        }

        let this = Arc::clone(self);
        let target = target.to_string();
        tokio::spawn(async move {
            this.read_file_list_response(&target, stream).await;
            this.clear_file_list_pending();
        });

        Ok(())
    }

    async fn read_file_list_response(&self, target: &str, mut stream: Stream) {
        let mut kind = [0u8; 1];
        if stream.read_exact(&mut kind).await.is_err() {
            debug!(peer = %self.alias, target, "file list response truncated");
            return;
        }
        if FetchKind::from_byte(kind[0]) != Some(FetchKind::List) {
            debug!(peer = %self.alias, target, kind = kind[0], "unexpected response kind");
            return;
        }

        let Ok(bytes) = read_frame(&mut stream).await else {
            debug!(peer = %self.alias, target, "failed to read file list frame");
            return;
        };
        let message: FileListMessage = match serde_json::from_slice(&bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %self.alias, target, error = %e, "bad file list response");
                return;
            }
        };

        trace!(
            peer = %self.alias,
            target,
            entries = message.entries.len(),
            "received file list"
        );

        self.shared.emit(BridgeEvent::PeerFiles {
            receiver: self.peer_id.to_string(),
            target: target.to_string(),
            cid: message.cid,
            entries: message.entries,
        });
    }

    fn clear_file_list_pending(&self) {
        self.state
            .write()
            .expect("peer state lock poisoned")
            .file_list_pending = false;
    }

    /// Fetch a block by CID: locally first (bounded by the configured get
    /// timeout), then on a miss with a fallback peer over the bridge
    /// protocol, caching whatever comes back. The outcome arrives as a
    /// `GotFile` event.
    pub fn get_file(self: &Arc<Self>, cid_str: &str, fallback: Option<&str>) -> Result<()> {
        let cid: Cid = cid_str
            .parse()
            .map_err(|e| BridgeError::InvalidCid(format!("{cid_str}: {e}")))?;
        let fallback_peer = fallback.map(parse_peer_id).transpose()?;

        let this = Arc::clone(self);
        let cid_str = cid_str.to_string();
        tokio::spawn(async move {
            let local = tokio::time::timeout(this.config.ipfs_get_timeout, async {
                this.load_local_content(&cid)
            })
            .await
            .ok()
            .flatten();

            if let Some(content) = local {
                this.emit_got_file(&cid_str, true, content);
                return;
            }

            let Some(peer) = fallback_peer else {
                this.emit_got_file(
                    &cid_str,
                    false,
                    serde_json::json!({"error": format!("block not found: {cid_str}")}),
                );
                return;
            };

            match this.fetch_remote_file(peer, &cid).await {
                Ok(content) => this.emit_got_file(&cid_str, true, content),
                Err(e) => {
                    this.emit_got_file(&cid_str, false, serde_json::json!({"error": e.to_string()}))
                }
            }
        });

        Ok(())
    }

    fn emit_got_file(&self, cid: &str, success: bool, content: Value) {
        self.shared.emit(BridgeEvent::GotFile {
            receiver: self.peer_id.to_string(),
            cid: cid.to_string(),
            success,
            content,
        });
    }

    /// Resolve a CID from the local store into consumer-facing content
    fn load_local_content(&self, cid: &Cid) -> Option<Value> {
        let raw = self.store.get(cid)?;
        match DagNode::decode(&raw) {
            Ok(DagNode::File { .. }) => {
                let content = self.store.read_file(cid).ok()?;
                Some(serde_json::json!({
                    "type": "file",
                    "mimeType": sniff_mime(&content[..content.len().min(webpeer_store::SNIFF_LEN)]),
                    "content": BASE64.encode(&content),
                }))
            }
            Ok(node @ (DagNode::Directory { .. } | DagNode::Shard { .. })) => {
                let directory = Directory::from_node(node).ok()?;
                let entries: BTreeMap<String, String> = directory
                    .list(&self.store)
                    .ok()?
                    .into_iter()
                    .map(|(name, link)| (name, link.cid))
                    .collect();
                Some(serde_json::json!({"type": "directory", "entries": entries}))
            }
            // A raw chunk block: serve the bytes as an opaque file
            Err(_) => Some(serde_json::json!({
                "type": "file",
                "mimeType": sniff_mime(&raw[..raw.len().min(webpeer_store::SNIFF_LEN)]),
                "content": BASE64.encode(raw.as_slice()),
            })),
        }
    }

    /// `GET_FILE` round-trip against `peer`, inserting returned blocks into
    /// the local store before reporting the content
    async fn fetch_remote_file(&self, peer: PeerId, cid: &Cid) -> Result<Value> {
        let mut stream = self.open_bridge_stream(peer).await?;

        stream
            .write_all(&[FetchKind::GetFile as u8])
            .await
            .map_err(|e| BridgeError::Network(format!("failed to send request: {e}")))?;
        let request = serde_json::to_vec(&GetFileMessage {
            cid: cid.to_string(),
        })?;
        write_frame(&mut stream, &request)
            .await
            .map_err(|e| BridgeError::Network(format!("failed to send request: {e}")))?;

        let mut kind = [0u8; 1];
        stream
            .read_exact(&mut kind)
            .await
            .map_err(|e| BridgeError::Network(format!("failed to read response: {e}")))?;
        if FetchKind::from_byte(kind[0]) != Some(FetchKind::FileContent) {
            return Err(BridgeError::Network(format!(
                "unexpected response kind: {}",
                kind[0]
            )));
        }
        let bytes = read_frame(&mut stream)
            .await
            .map_err(|e| BridgeError::Network(format!("failed to read response: {e}")))?;
        let message: FileContentMessage = serde_json::from_slice(&bytes)?;

        if let Some(error) = message.error {
            return Err(BridgeError::Store(error));
        }

        // Cache the raw DAG block under its original CID, then warm the
        // chunk blocks so the next local get succeeds without a stream.
        if let Some(raw_b64) = &message.raw_node {
            let raw = BASE64
                .decode(raw_b64)
                .map_err(|e| BridgeError::Store(format!("bad rawNode encoding: {e}")))?;
            self.store
                .put_block_with_cid(cid, raw)
                .map_err(|e| BridgeError::Store(e.to_string()))?;
        }
        if let Some(content_b64) = &message.content {
            let content = BASE64
                .decode(content_b64)
                .map_err(|e| BridgeError::Store(format!("bad content encoding: {e}")))?;
            self.store
                .add_file(&content)
                .map_err(|e| BridgeError::Store(e.to_string()))?;
        }

        if message.is_directory {
            Ok(serde_json::json!({
                "type": "directory",
                "entries": message.entries.unwrap_or_default(),
            }))
        } else {
            Ok(serde_json::json!({
                "type": "file",
                "mimeType": message.mime_type,
                "content": message.content,
            }))
        }
    }

    async fn open_bridge_stream(&self, peer: PeerId) -> Result<Stream> {
        if let Some(addrs) = self.shared.local_addrs(&peer) {
            let _ = self
                .commands
                .send(crate::commands::PeerCommand::AddAddresses { peer, addrs });
        }
        let mut control = self.control.clone();
        tokio::time::timeout(
            self.config.stream_open_timeout,
            control.open_stream(peer, BRIDGE_PROTOCOL),
        )
        .await
        .map_err(|_| BridgeError::Timeout)?
        .map_err(|e| BridgeError::Network(format!("failed to open stream: {e}")))
    }

    /// Accept loop for the bridge protocol; one task per inbound stream
    pub(crate) async fn serve_bridge_protocol(self: Arc<Self>, mut incoming: IncomingStreams) {
        while let Some((remote, stream)) = incoming.next().await {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle_bridge_stream(remote, stream).await;
            });
        }
    }

    async fn handle_bridge_stream(self: Arc<Self>, remote: PeerId, mut stream: Stream) {
        let mut kind = [0u8; 1];
        if stream.read_exact(&mut kind).await.is_err() {
            return;
        }

        match FetchKind::from_byte(kind[0]) {
            Some(FetchKind::GetList) => {
                trace!(
                    peer = %self.alias,
                    from = %self.shared.alias(&remote.to_string()),
                    "file list requested"
                );
                let Ok((cid, entries)) = self.build_file_entries() else {
                    return;
                };
                let Ok(body) = serde_json::to_vec(&FileListMessage { cid, entries }) else {
                    return;
                };
                if stream.write_all(&[FetchKind::List as u8]).await.is_ok() {
                    let _ = write_frame(&mut stream, &body).await;
                }
            }

            Some(FetchKind::GetFile) => {
                let Ok(bytes) = read_frame(&mut stream).await else {
                    return;
                };
                let Ok(request) = serde_json::from_slice::<GetFileMessage>(&bytes) else {
                    return;
                };
                let response = self.build_file_content(&request.cid);
                let Ok(body) = serde_json::to_vec(&response) else {
                    return;
                };
                if stream
                    .write_all(&[FetchKind::FileContent as u8])
                    .await
                    .is_ok()
                {
                    let _ = write_frame(&mut stream, &body).await;
                }
            }

            other => {
                debug!(?other, "unsupported bridge request");
            }
        }

        let _ = stream.close().await;
    }

    /// Build the `FILE_CONTENT` response for a requested CID
    fn build_file_content(&self, cid_str: &str) -> FileContentMessage {
        let failure = |error: String| FileContentMessage {
            cid: cid_str.to_string(),
            error: Some(error),
            ..Default::default()
        };

        let Ok(cid) = cid_str.parse::<Cid>() else {
            return failure(format!("invalid CID: {cid_str}"));
        };
        let Some(raw) = self.store.get(&cid) else {
            return failure(format!("block not found: {cid_str}"));
        };
        let raw_node = Some(BASE64.encode(raw.as_slice()));

        match DagNode::decode(&raw) {
            Ok(DagNode::File { .. }) => match self.store.read_file(&cid) {
                Ok(content) => FileContentMessage {
                    cid: cid_str.to_string(),
                    is_directory: false,
                    raw_node,
                    mime_type: Some(sniff_mime(
                        &content[..content.len().min(webpeer_store::SNIFF_LEN)],
                    )),
                    content: Some(BASE64.encode(&content)),
                    ..Default::default()
                },
                Err(e) => failure(e.to_string()),
            },
            Ok(node @ (DagNode::Directory { .. } | DagNode::Shard { .. })) => {
                let entries = Directory::from_node(node)
                    .and_then(|directory| directory.list(&self.store))
                    .map(|listing| {
                        listing
                            .into_iter()
                            .map(|(name, link)| (name, link.cid))
                            .collect::<BTreeMap<String, String>>()
                    });
                match entries {
                    Ok(entries) => FileContentMessage {
                        cid: cid_str.to_string(),
                        is_directory: true,
                        raw_node,
                        entries: Some(entries),
                        ..Default::default()
                    },
                    Err(e) => failure(e.to_string()),
                }
            }
            // Raw chunk block
            Err(_) => FileContentMessage {
                cid: cid_str.to_string(),
                is_directory: false,
                raw_node,
                mime_type: Some(sniff_mime(&raw[..raw.len().min(webpeer_store::SNIFF_LEN)])),
                content: Some(BASE64.encode(raw.as_slice())),
                ..Default::default()
            },
        }
    }
}
