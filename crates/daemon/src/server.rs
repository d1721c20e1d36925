//! Socket server for bridge sessions
//!
//! Speaks newline-delimited envelope JSON over a Unix socket. Each
//! connection is one session driving one managed peer; a request task and
//! a notification task share the write half behind a mutex. The static
//! web server and WebSocket upgrade endpoint that would sit in front of
//! this in a browser deployment are a separate concern.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use webpeer_core::{BridgeConfig, BridgeEvent};
use webpeer_node::Manager;
use webpeer_protocol::{Envelope, Session};
use webpeer_store::BlockStore;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket path
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let path = if let Ok(path) = std::env::var("WEBPEER_SOCKET") {
            PathBuf::from(path)
        } else if cfg!(target_os = "linux") {
            let runtime_dir =
                std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(format!("{runtime_dir}/webpeer.sock"))
        } else {
            PathBuf::from("/tmp/webpeer.sock")
        };
        Self { socket_path: path }
    }
}

pub struct BridgeServer {
    config: ServerConfig,
    manager: Arc<Manager>,
    events: broadcast::Sender<BridgeEvent>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl BridgeServer {
    /// Build the server around a fresh manager and block store
    pub fn new(config: ServerConfig, bridge_config: BridgeConfig) -> Self {
        let store = Arc::new(BlockStore::new());
        let (manager, mut events_rx) = Manager::new(bridge_config, store);

        // Fan events out to every connection; each session filters its own
        let (events, _) = broadcast::channel(1024);
        let events_out = events.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let _ = events_out.send(event);
            }
        });

        Self {
            config,
            manager,
            events,
            shutdown_tx: None,
        }
    }

    pub fn manager(&self) -> Arc<Manager> {
        self.manager.clone()
    }

    /// Accept connections until `stop` is called
    pub async fn start(&mut self) -> std::io::Result<()> {
        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }
        let listener = UnixListener::bind(&self.config.socket_path)?;
        info!("bridge listening on {:?}", self.config.socket_path);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let manager = self.manager.clone();
                            let events = self.events.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, manager, events).await {
                                    warn!("connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("bridge server shutting down");
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.config.socket_path);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(tx) = &self.shutdown_tx {
            let _ = tx.send(()).await;
        }
        self.manager.shutdown();
    }
}

async fn write_envelope(
    writer: &Arc<tokio::sync::Mutex<tokio::net::unix::OwnedWriteHalf>>,
    envelope: &Envelope,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(envelope).map_err(std::io::Error::other)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn handle_connection(
    stream: UnixStream,
    manager: Arc<Manager>,
    mut events: broadcast::Receiver<BridgeEvent>,
) -> std::io::Result<()> {
    let (reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Envelope>();
    let session = Arc::new(Session::new(manager.clone(), notify_tx));

    // Notifications: session-filtered events plus send acks
    let notify_writer = writer.clone();
    let notify_task = tokio::spawn(async move {
        while let Some(envelope) = notify_rx.recv().await {
            if write_envelope(&notify_writer, &envelope).await.is_err() {
                break;
            }
        }
    });

    let event_session = session.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => event_session.deliver(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "session fell behind on events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Requests
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        debug!("received: {trimmed}");

        let response = match serde_json::from_str::<Envelope>(trimmed) {
            Ok(request) => session.handle(request).await,
            Err(e) => Envelope::error(0, 400, format!("invalid message: {e}")),
        };
        write_envelope(&writer, &response).await?;
    }

    notify_task.abort();
    event_task.abort();

    // The session's peer dies with its connection
    if let Some(peer_id) = session.peer_id() {
        if let Err(e) = manager.remove_peer(&peer_id) {
            debug!(peer = %peer_id, error = %e, "session peer already removed");
        }
    }
    Ok(())
}
