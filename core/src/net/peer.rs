//! Per-peer connection: one sender task draining a bounded queue, one
//! receiver task feeding the frame decoder, request/response correlation by
//! request id, and heartbeat-based liveness.
//!
//! All handler callbacks run on the receiver task; handlers must not block.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::net::transport::codec::{
    encode_chunk, encode_message, ChunkHeader, Frame, FrameDecoder, MessageType, WireMessage,
};
use crate::net::transport::{self, SecureReader, SecureStream, SecureWriter};
use crate::types::now_ts;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const IDLE_DEATH_SECS: i64 = 90;
pub const SEND_AND_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const OUTBOUND_QUEUE: usize = 64;
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);
const LIVENESS_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Receives decoded frames and lifecycle notifications for one peer.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn on_frame(&self, peer: &PeerHandle, frame: Frame);

    /// Fired exactly once when the connection leaves `Connected`.
    async fn on_disconnected(&self, device_id: &str, reason: Option<String>);
}

/// Cheap clonable sending surface of a peer connection.
#[derive(Clone)]
pub struct PeerHandle {
    pub device_id: String,
    pub remote_addr: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<WireMessage>>>>,
    state: Arc<RwLock<PeerState>>,
    last_rx: Arc<AtomicI64>,
    last_tx: Arc<AtomicI64>,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        *self.state.read().unwrap()
    }

    /// Queue a message. Waits briefly under back-pressure, then fails `Busy`.
    pub async fn send_message(&self, message: &WireMessage) -> Result<()> {
        self.enqueue(encode_message(message)?).await
    }

    /// Queue a file-chunk frame.
    pub async fn send_chunk(&self, header: &ChunkHeader, data: &[u8]) -> Result<()> {
        self.enqueue(encode_chunk(header, data)?).await
    }

    async fn enqueue(&self, bytes: Vec<u8>) -> Result<()> {
        if self.state() != PeerState::Connected {
            return Err(Error::Network(format!(
                "peer {} is not connected",
                self.device_id
            )));
        }
        self.outbound
            .send_timeout(bytes, ENQUEUE_TIMEOUT)
            .await
            .map_err(|_| Error::Busy(format!("outbound queue full for {}", self.device_id)))?;
        self.last_tx.store(now_ts(), Ordering::SeqCst);
        Ok(())
    }

    /// Send and wait for the first message carrying the same request id.
    pub async fn send_and_wait(
        &self,
        message: &WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .insert(message.request_id.clone(), tx);

        if let Err(e) = self.send_message(message).await {
            self.waiters.lock().unwrap().remove(&message.request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Network("connection closed while waiting".into())),
            Err(_) => {
                self.waiters.lock().unwrap().remove(&message.request_id);
                Err(Error::Network(format!(
                    "request {} timed out",
                    message.request_id
                )))
            }
        }
    }

    fn take_waiter(&self, request_id: &str) -> Option<oneshot::Sender<WireMessage>> {
        self.waiters.lock().unwrap().remove(request_id)
    }
}

/// A live peer connection and its background tasks.
pub struct PeerConnection {
    pub handle: PeerHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Dial a peer and run the secure handshake.
    pub async fn connect(
        addr: SocketAddr,
        identity: &DeviceIdentity,
        psk: &[u8; 32],
        handler: Arc<dyn PeerHandler>,
    ) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Network(format!("connect {addr} timed out")))?
            .map_err(|e| Error::Network(format!("connect {addr}: {e}")))?;
        let secure = tokio::time::timeout(CONNECT_TIMEOUT, transport::connect(stream, identity, psk))
            .await
            .map_err(|_| Error::Network("handshake timed out".into()))??;
        Ok(Self::spawn(secure, addr, handler))
    }

    /// Wrap an accepted, already-handshaken stream.
    pub fn accept(secure: SecureStream, addr: SocketAddr, handler: Arc<dyn PeerHandler>) -> Arc<Self> {
        Self::spawn(secure, addr, handler)
    }

    fn spawn(secure: SecureStream, addr: SocketAddr, handler: Arc<dyn PeerHandler>) -> Arc<Self> {
        let SecureStream {
            reader,
            writer,
            peer,
        } = secure;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = PeerHandle {
            device_id: peer.device_id.clone(),
            remote_addr: addr,
            outbound: outbound_tx,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(RwLock::new(PeerState::Connected)),
            last_rx: Arc::new(AtomicI64::new(now_ts())),
            last_tx: Arc::new(AtomicI64::new(now_ts())),
        };
        let notified = Arc::new(AtomicBool::new(false));

        let connection = Arc::new(Self {
            handle: handle.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = connection.tasks.lock().unwrap();
        tasks.push(tokio::spawn(sender_loop(writer, outbound_rx)));
        tasks.push(tokio::spawn(receiver_loop(
            reader,
            handle.clone(),
            handler.clone(),
            notified.clone(),
        )));
        tasks.push(tokio::spawn(liveness_loop(
            handle.clone(),
            handler,
            notified,
        )));
        drop(tasks);

        info!(peer = %handle.device_id, %addr, "peer connected");
        connection
    }

    pub fn state(&self) -> PeerState {
        self.handle.state()
    }

    /// Graceful shutdown: announce, give the queue a moment to drain, close.
    pub async fn disconnect(&self) {
        {
            let mut state = self.handle.state.write().unwrap();
            if *state != PeerState::Connected {
                return;
            }
            *state = PeerState::Disconnecting;
        }
        let goodbye = WireMessage::new(
            MessageType::Disconnect,
            uuid::Uuid::new_v4().to_string(),
            Vec::new(),
        );
        if let Ok(bytes) = encode_message(&goodbye) {
            let _ = self.handle.outbound.send(bytes).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.shutdown(PeerState::Disconnected);
    }

    /// Abrupt teardown without the goodbye.
    pub fn abort(&self) {
        self.shutdown(PeerState::Disconnected);
    }

    fn shutdown(&self, state: PeerState) {
        *self.handle.state.write().unwrap() = state;
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        // Wake any request waiters so they fail fast instead of timing out.
        self.handle.waiters.lock().unwrap().clear();
        debug!(peer = %self.handle.device_id, "peer connection closed");
    }
}

async fn sender_loop(mut writer: SecureWriter, mut outbound: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = writer.send(&bytes).await {
            warn!(error = %e, "peer send failed");
            break;
        }
    }
    writer.shutdown().await;
}

async fn receiver_loop(
    mut reader: SecureReader,
    handle: PeerHandle,
    handler: Arc<dyn PeerHandler>,
    notified: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new();
    let reason = loop {
        let record = match reader.recv().await {
            Ok(record) => record,
            Err(e) => break Some(e.to_string()),
        };
        handle.last_rx.store(now_ts(), Ordering::SeqCst);
        decoder.feed(&record);

        loop {
            match decoder.next_frame() {
                Ok(Some(Frame::Message(message))) => {
                    match message.kind() {
                        Some(MessageType::Heartbeat) => {
                            let ack = WireMessage::new(
                                MessageType::HeartbeatAck,
                                message.request_id.clone(),
                                Vec::new(),
                            );
                            let _ = handle.send_message(&ack).await;
                        }
                        Some(MessageType::HeartbeatAck) => {}
                        Some(MessageType::Disconnect) => {
                            debug!(peer = %handle.device_id, "peer said goodbye");
                            notify_once(&handle, &handler, &notified, None).await;
                            return;
                        }
                        _ => {
                            if let Some(waiter) = handle.take_waiter(&message.request_id) {
                                let _ = waiter.send(message);
                            } else {
                                handler.on_frame(&handle, Frame::Message(message)).await;
                            }
                        }
                    }
                }
                Ok(Some(frame)) => handler.on_frame(&handle, frame).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %handle.device_id, error = %e, "frame decode failed");
                    notify_once(&handle, &handler, &notified, Some(e.to_string())).await;
                    return;
                }
            }
        }
    };

    let deliberate = matches!(
        handle.state(),
        PeerState::Disconnecting | PeerState::Disconnected
    );
    if deliberate {
        notify_once(&handle, &handler, &notified, None).await;
    } else {
        notify_once(&handle, &handler, &notified, reason).await;
    }
}

async fn liveness_loop(
    handle: PeerHandle,
    handler: Arc<dyn PeerHandler>,
    notified: Arc<AtomicBool>,
) {
    let mut tick = tokio::time::interval(LIVENESS_TICK);
    loop {
        tick.tick().await;
        if handle.state() != PeerState::Connected {
            return;
        }
        let now = now_ts();
        if now - handle.last_rx.load(Ordering::SeqCst) > IDLE_DEATH_SECS {
            warn!(peer = %handle.device_id, "peer silent too long, declaring dead");
            notify_once(&handle, &handler, &notified, Some("idle timeout".into())).await;
            return;
        }
        // Heartbeat only when the link is otherwise idle.
        if now - handle.last_tx.load(Ordering::SeqCst) >= HEARTBEAT_INTERVAL.as_secs() as i64 {
            let beat = WireMessage::new(
                MessageType::Heartbeat,
                uuid::Uuid::new_v4().to_string(),
                Vec::new(),
            );
            let _ = handle.send_message(&beat).await;
        }
    }
}

async fn notify_once(
    handle: &PeerHandle,
    handler: &Arc<dyn PeerHandler>,
    notified: &Arc<AtomicBool>,
    reason: Option<String>,
) {
    if notified.swap(true, Ordering::SeqCst) {
        return;
    }
    {
        let mut state = handle.state.write().unwrap();
        if !matches!(*state, PeerState::Disconnecting | PeerState::Disconnected) {
            *state = if reason.is_some() {
                PeerState::Error
            } else {
                PeerState::Disconnected
            };
        } else {
            *state = PeerState::Disconnected;
        }
    }
    handle.waiters.lock().unwrap().clear();
    handler.on_disconnected(&handle.device_id, reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedSender;

    fn identity(id: &str) -> DeviceIdentity {
        DeviceIdentity {
            device_id: id.to_string(),
            device_name: id.to_string(),
            device_type: DeviceType::Desktop,
        }
    }

    struct Echo;

    #[async_trait]
    impl PeerHandler for Echo {
        async fn on_frame(&self, peer: &PeerHandle, frame: Frame) {
            if let Frame::Message(message) = frame {
                let reply = WireMessage::new(
                    MessageType::DeviceInfoAck,
                    message.request_id.clone(),
                    message.payload,
                );
                let _ = peer.send_message(&reply).await;
            }
        }
        async fn on_disconnected(&self, _device_id: &str, _reason: Option<String>) {}
    }

    struct Silent(UnboundedSender<Option<String>>);

    #[async_trait]
    impl PeerHandler for Silent {
        async fn on_frame(&self, _peer: &PeerHandle, _frame: Frame) {}
        async fn on_disconnected(&self, _device_id: &str, reason: Option<String>) {
            let _ = self.0.send(reason);
        }
    }

    async fn pair() -> (Arc<PeerConnection>, Arc<PeerConnection>, tokio::sync::mpsc::UnboundedReceiver<Option<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let psk = [9u8; 32];

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let server = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            let secure = transport::accept(stream, &identity("server"), &psk)
                .await
                .unwrap();
            PeerConnection::accept(secure, peer_addr, Arc::new(Echo))
        });

        let client = PeerConnection::connect(addr, &identity("client"), &psk, Arc::new(Silent(tx)))
            .await
            .unwrap();
        (client, server.await.unwrap(), rx)
    }

    #[tokio::test]
    async fn request_response_correlation() {
        let (client, _server, _rx) = pair().await;
        let request = WireMessage::json(MessageType::DeviceInfo, &serde_json::json!({"n": 1}))
            .unwrap();
        let reply = client
            .handle
            .send_and_wait(&request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.request_id, request.request_id);
        assert_eq!(reply.kind(), Some(MessageType::DeviceInfoAck));
    }

    #[tokio::test]
    async fn peer_disconnect_notifies_exactly_once() {
        let (client, server, mut rx) = pair().await;
        server.disconnect().await;
        let reason = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reason.is_none(), "graceful goodbye carries no error");
        assert!(rx.try_recv().is_err());
        client.abort();
    }

    #[tokio::test]
    async fn send_and_wait_times_out() {
        let (client, server, _rx) = pair().await;
        // Kill the server abruptly so no reply ever comes.
        server.abort();
        let request = WireMessage::json(MessageType::DeviceInfo, &serde_json::json!({})).unwrap();
        let result = client
            .handle
            .send_and_wait(&request, Duration::from_millis(300))
            .await;
        assert!(result.is_err());
        client.abort();
    }
}
