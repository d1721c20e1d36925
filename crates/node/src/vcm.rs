//! Virtual connection manager
//!
//! Reliable unicast over raw libp2p streams. Each (target peer, protocol)
//! pair owns a queue with at most one in-flight message and at most one
//! live stream. A processor task drains the queue in order: open or reuse
//! the stream, write a `data` frame, wait for the matching `ack`, pop.
//! Failures retry with exponential backoff until the attempt budget is
//! spent, at which point the queue latches `unreachable` and only inbound
//! traffic from that peer on that protocol revives it. An idle reaper
//! closes streams that have seen no activity; pending messages survive and
//! the next processor pass rebuilds the stream.
//!
//! ACKs are correlated to in-flight sends through a per-queue map of
//! message id → oneshot, armed before the write so the reader task can
//! resolve the wait from any interleaving.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::io::{AsyncReadExt as _, AsyncWriteExt as _, ReadHalf, WriteHalf};
use libp2p::{PeerId, Stream, StreamProtocol};
use libp2p_stream::Control;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use webpeer_core::{BridgeError, BridgeEvent, Result};

use crate::commands::PeerCommand;
use crate::dispatch::Dispatcher;
use crate::wire::{read_frame, write_frame, StreamMessage};

/// How long a sent message may wait for its ACK
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Send attempts before a queue latches unreachable
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Streams idle past this are reaped
pub const IDLE_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle reaper cadence
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

type QueueKey = (PeerId, String);

pub struct VirtualConnectionManager {
    local_peer: PeerId,
    control: Control,
    commands: mpsc::UnboundedSender<PeerCommand>,
    shared: Arc<Dispatcher>,
    stream_open_timeout: Duration,
    queues: Mutex<HashMap<QueueKey, Arc<MessageQueue>>>,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: String,
    data: Vec<u8>,
    attempts: u32,
    max_attempts: u32,
}

struct StreamHandle {
    id: u64,
    writer: Arc<tokio::sync::Mutex<WriteHalf<Stream>>>,
    reader: tokio::task::AbortHandle,
}

impl StreamHandle {
    fn close(self) {
        self.reader.abort();
        let writer = self.writer;
        tokio::spawn(async move {
            let _ = writer.lock().await.close().await;
        });
    }
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    stream: Option<StreamHandle>,
    retry_count: u32,
    unreachable: bool,
    last_activity: Option<Instant>,
    processing: bool,
    next_seq: u64,
    stream_seq: u64,
}

pub struct MessageQueue {
    target: PeerId,
    protocol: String,
    local_peer: PeerId,
    control: Control,
    commands: mpsc::UnboundedSender<PeerCommand>,
    shared: Arc<Dispatcher>,
    stream_open_timeout: Duration,
    state: Mutex<QueueState>,
    acks: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

enum FailureAction {
    Retry(Duration),
    Stale,
    Halt,
}

fn message_id(seq: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos}-{seq}")
}

impl VirtualConnectionManager {
    pub fn new(
        local_peer: PeerId,
        control: Control,
        commands: mpsc::UnboundedSender<PeerCommand>,
        shared: Arc<Dispatcher>,
        stream_open_timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let vcm = Arc::new(Self {
            local_peer,
            control,
            commands,
            shared,
            stream_open_timeout,
            queues: Mutex::new(HashMap::new()),
        });

        tokio::spawn(Arc::clone(&vcm).idle_stream_monitor(cancel));
        vcm
    }

    /// Queue `data` for delivery to `target` on `protocol`
    pub fn send(&self, target: PeerId, protocol: &str, data: &Value) -> Result<()> {
        let payload = serde_json::to_vec(data)?;
        let queue = self.queue(target, protocol);
        queue.push_and_process(payload);
        Ok(())
    }

    /// Route a stream the host accepted on `protocol` to its queue. Any
    /// existing stream for that queue is closed first, so a queue holds at
    /// most one live stream even under simultaneous dial.
    pub fn handle_incoming_stream(&self, remote: PeerId, protocol: &str, stream: Stream) {
        let queue = self.queue(remote, protocol);
        queue.install_stream(stream);
        debug!(
            peer = %self.shared.alias(&remote.to_string()),
            protocol,
            "accepted connection"
        );
    }

    fn queue(&self, target: PeerId, protocol: &str) -> Arc<MessageQueue> {
        let mut queues = self.queues.lock().expect("queue map lock poisoned");
        queues
            .entry((target, protocol.to_string()))
            .or_insert_with(|| {
                Arc::new(MessageQueue {
                    target,
                    protocol: protocol.to_string(),
                    local_peer: self.local_peer,
                    control: self.control.clone(),
                    commands: self.commands.clone(),
                    shared: self.shared.clone(),
                    stream_open_timeout: self.stream_open_timeout,
                    state: Mutex::new(QueueState::default()),
                    acks: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// Messages still queued for (target, protocol)
    pub fn queue_depth(&self, target: &PeerId, protocol: &str) -> usize {
        let queues = self.queues.lock().expect("queue map lock poisoned");
        queues
            .get(&(*target, protocol.to_string()))
            .map(|q| q.state.lock().expect("queue lock poisoned").messages.len())
            .unwrap_or(0)
    }

    /// Whether the queue for (target, protocol) has latched unreachable
    pub fn is_unreachable(&self, target: &PeerId, protocol: &str) -> bool {
        let queues = self.queues.lock().expect("queue map lock poisoned");
        queues
            .get(&(*target, protocol.to_string()))
            .map(|q| q.state.lock().expect("queue lock poisoned").unreachable)
            .unwrap_or(false)
    }

    async fn idle_stream_monitor(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.changed() => return,
                _ = ticker.tick() => self.check_idle_streams(),
            }
        }
    }

    fn check_idle_streams(&self) {
        let queues: Vec<Arc<MessageQueue>> = {
            let map = self.queues.lock().expect("queue map lock poisoned");
            map.values().cloned().collect()
        };

        for queue in queues {
            let mut state = queue.state.lock().expect("queue lock poisoned");
            let idle = state
                .last_activity
                .map(|at| at.elapsed() > IDLE_STREAM_TIMEOUT)
                .unwrap_or(false);
            if idle {
                if let Some(handle) = state.stream.take() {
                    trace!(
                        peer = %self.shared.alias(&queue.target.to_string()),
                        protocol = %queue.protocol,
                        "closing idle stream"
                    );
                    handle.close();
                }
            }
        }
    }

    /// Close every stream and drop all queues
    pub fn close(&self) {
        let mut queues = self.queues.lock().expect("queue map lock poisoned");
        for queue in queues.values() {
            let mut state = queue.state.lock().expect("queue lock poisoned");
            if let Some(handle) = state.stream.take() {
                handle.close();
            }
            state.messages.clear();
        }
        queues.clear();
    }
}

impl MessageQueue {
    fn push_and_process(self: &Arc<Self>, payload: Vec<u8>) {
        let should_spawn = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let id = message_id(state.next_seq);
            state.next_seq += 1;
            state.messages.push_back(QueuedMessage {
                id,
                data: payload,
                attempts: 0,
                max_attempts: MAX_SEND_ATTEMPTS,
            });
            if state.processing {
                false
            } else {
                state.processing = true;
                true
            }
        };

        if should_spawn {
            tokio::spawn(Arc::clone(self).process());
        }
    }

    /// Processor loop: at most one runs per queue at any time
    async fn process(self: Arc<Self>) {
        loop {
            let message = {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if state.messages.is_empty() || state.unreachable {
                    state.processing = false;
                    return;
                }
                state.messages.front().cloned().expect("nonempty queue")
            };

            let writer = match self.ensure_stream().await {
                Ok(writer) => writer,
                Err(e) => {
                    debug!(
                        peer = %self.shared.alias(&self.target.to_string()),
                        protocol = %self.protocol,
                        error = %e,
                        "failed to open stream"
                    );
                    if self.handle_send_failure(&message.id).await {
                        return;
                    }
                    continue;
                }
            };

            let ack_rx = self.register_ack(&message.id);
            let frame = StreamMessage::data(&message.id, message.data.clone());
            if let Err(e) = self.write_message(&writer, &frame).await {
                debug!(
                    peer = %self.shared.alias(&self.target.to_string()),
                    protocol = %self.protocol,
                    error = %e,
                    "write failed"
                );
                self.discard_ack(&message.id);
                self.close_stream();
                if self.handle_send_failure(&message.id).await {
                    return;
                }
                continue;
            }

            trace!(
                peer = %self.shared.alias(&self.target.to_string()),
                protocol = %self.protocol,
                "sent message"
            );

            match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
                Ok(Ok(())) => {
                    let mut state = self.state.lock().expect("queue lock poisoned");
                    if state
                        .messages
                        .front()
                        .map(|m| m.id == message.id)
                        .unwrap_or(false)
                    {
                        state.messages.pop_front();
                    }
                    state.retry_count = 0;
                    state.last_activity = Some(Instant::now());
                }
                _ => {
                    self.discard_ack(&message.id);
                    if self.handle_send_failure(&message.id).await {
                        return;
                    }
                    continue;
                }
            }
        }
    }

    /// Record a failed attempt for the front message. Returns `true` when
    /// the processor must stop (unreachable latched or message gone stale).
    async fn handle_send_failure(self: &Arc<Self>, id: &str) -> bool {
        let action = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let front_matches = state.messages.front().map(|m| m.id == id).unwrap_or(false);
            if !front_matches {
                FailureAction::Stale
            } else {
                let (attempts, max_attempts) = {
                    let front = state.messages.front_mut().expect("checked above");
                    front.attempts += 1;
                    (front.attempts, front.max_attempts)
                };
                state.retry_count += 1;

                if attempts >= max_attempts {
                    state.unreachable = true;
                    state.processing = false;
                    warn!(
                        peer = %self.shared.alias(&self.target.to_string()),
                        protocol = %self.protocol,
                        attempts,
                        "peer marked unreachable"
                    );
                    FailureAction::Halt
                } else {
                    FailureAction::Retry(Duration::from_secs(1u64 << attempts))
                }
            }
        };

        match action {
            FailureAction::Halt => true,
            FailureAction::Stale => false,
            FailureAction::Retry(backoff) => {
                tokio::time::sleep(backoff).await;
                false
            }
        }
    }

    fn register_ack(&self, id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.acks
            .lock()
            .expect("ack map lock poisoned")
            .insert(id.to_string(), tx);
        rx
    }

    fn discard_ack(&self, id: &str) {
        self.acks.lock().expect("ack map lock poisoned").remove(id);
    }

    async fn write_message(
        &self,
        writer: &Arc<tokio::sync::Mutex<WriteHalf<Stream>>>,
        message: &StreamMessage,
    ) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(message).map_err(std::io::Error::other)?;
        let mut writer = writer.lock().await;
        write_frame(&mut *writer, &bytes).await
    }

    /// Reuse the live stream or open a fresh one
    async fn ensure_stream(self: &Arc<Self>) -> Result<Arc<tokio::sync::Mutex<WriteHalf<Stream>>>> {
        if let Some(handle) = self
            .state
            .lock()
            .expect("queue lock poisoned")
            .stream
            .as_ref()
        {
            return Ok(handle.writer.clone());
        }

        // Manager-local target: seed its listen addresses so the dial is
        // direct instead of waiting on mDNS or the DHT.
        if let Some(addrs) = self.shared.local_addrs(&self.target) {
            let _ = self.commands.send(PeerCommand::AddAddresses {
                peer: self.target,
                addrs,
            });
        }

        let protocol = StreamProtocol::try_from_owned(self.protocol.clone())
            .map_err(|e| BridgeError::Network(e.to_string()))?;
        let mut control = self.control.clone();
        let stream = tokio::time::timeout(
            self.stream_open_timeout,
            control.open_stream(self.target, protocol),
        )
        .await
        .map_err(|_| BridgeError::Timeout)?
        .map_err(|e| BridgeError::Network(format!("failed to open stream: {e}")))?;

        let writer = self.install_stream(stream);
        debug!(
            peer = %self.shared.alias(&self.target.to_string()),
            protocol = %self.protocol,
            "connected"
        );
        Ok(writer)
    }

    /// Attach a stream to this queue, closing any previous one, and start
    /// its reader task
    fn install_stream(self: &Arc<Self>, stream: Stream) -> Arc<tokio::sync::Mutex<WriteHalf<Stream>>> {
        let (read_half, write_half) = stream.split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));

        let mut state = self.state.lock().expect("queue lock poisoned");
        if let Some(old) = state.stream.take() {
            old.close();
        }
        state.stream_seq += 1;
        let stream_id = state.stream_seq;

        let reader = tokio::spawn(Arc::clone(self).read_from_stream(
            stream_id,
            read_half,
            writer.clone(),
        ));
        state.stream = Some(StreamHandle {
            id: stream_id,
            writer: writer.clone(),
            reader: reader.abort_handle(),
        });
        state.last_activity = Some(Instant::now());
        writer
    }

    fn close_stream(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if let Some(handle) = state.stream.take() {
            handle.close();
        }
    }

    fn close_stream_if(&self, stream_id: u64) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.stream.as_ref().map(|h| h.id) == Some(stream_id) {
            if let Some(handle) = state.stream.take() {
                handle.close();
            }
        }
    }

    async fn read_from_stream(
        self: Arc<Self>,
        stream_id: u64,
        mut reader: ReadHalf<Stream>,
        writer: Arc<tokio::sync::Mutex<WriteHalf<Stream>>>,
    ) {
        loop {
            let bytes = match read_frame(&mut reader).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        debug!(
                            protocol = %self.protocol,
                            error = %e,
                            "stream read error"
                        );
                    }
                    break;
                }
            };

            let message: StreamMessage = match serde_json::from_slice(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "dropping unparseable stream message");
                    continue;
                }
            };

            match message.kind.as_str() {
                "ack" => {
                    if let Some(waiter) = self
                        .acks
                        .lock()
                        .expect("ack map lock poisoned")
                        .remove(&message.id)
                    {
                        let _ = waiter.send(());
                    }
                    let mut state = self.state.lock().expect("queue lock poisoned");
                    state.last_activity = Some(Instant::now());
                }
                "data" => {
                    self.handle_incoming_data(&message.id, &message.data, &writer)
                        .await;
                }
                other => {
                    debug!(kind = %other, "unknown stream message kind");
                }
            }
        }

        self.close_stream_if(stream_id);
    }

    async fn handle_incoming_data(
        self: &Arc<Self>,
        id: &str,
        data: &[u8],
        writer: &Arc<tokio::sync::Mutex<WriteHalf<Stream>>>,
    ) {
        let decoded: Value = match serde_json::from_slice(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "dropping unparseable payload");
                return;
            }
        };

        // Inbound traffic proves the peer reachable again
        let resume = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let was_unreachable = state.unreachable;
            state.unreachable = false;
            state.last_activity = Some(Instant::now());

            if was_unreachable {
                debug!(
                    peer = %self.shared.alias(&self.target.to_string()),
                    protocol = %self.protocol,
                    "peer is reachable again"
                );
            }
            let resume = was_unreachable && !state.processing && !state.messages.is_empty();
            if resume {
                state.processing = true;
            }
            resume
        };
        if resume {
            tokio::spawn(Arc::clone(self).process());
        }

        let ack = StreamMessage::ack(id);
        if let Err(e) = self.write_message(writer, &ack).await {
            debug!(error = %e, "failed to send ack");
        }

        trace!(
            peer = %self.shared.alias(&self.target.to_string()),
            protocol = %self.protocol,
            "received message"
        );

        self.shared.emit(BridgeEvent::PeerData {
            receiver: self.local_peer.to_string(),
            sender: self.target.to_string(),
            protocol: self.protocol.clone(),
            data: decoded,
        });
    }
}
