//! Remote file access.
//!
//! Chunked, flow-controlled file transfer with a content-addressed on-disk
//! cache. The serving side resolves files through an injected callback and
//! refuses anything not Family-visible with the same `FileNotFound` answer an
//! unknown id gets, before any bytes are read. The receiving side writes a
//! temp file and renames it into the cache only after the checksum verifies.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::duplicates::hash_file;
use crate::error::{Error, Result};
use crate::net::peer::{PeerHandle, SEND_AND_WAIT_TIMEOUT};
use crate::net::transport::codec::{ChunkFrame, ChunkHeader, MessageType, WireMessage};
use crate::types::Visibility;

pub const CHUNK_SIZE: u32 = 64 * 1024;
pub const FULL_WINDOW: u64 = 10;
pub const REDUCED_WINDOW: u64 = 5;
pub const ACK_EVERY: u64 = 4;
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_STALLS: u32 = 3;

/// The canonical refusal string; identical for missing and Private files.
pub const REASON_NOT_FOUND: &str = "FileNotFound";

// ---- wire payloads --------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequestPayload {
    pub file_id: i64,
    pub expected_size: Option<i64>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadataPayload {
    pub file_id: i64,
    pub size: u64,
    pub checksum: Option<String>,
    pub chunk_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkAckPayload {
    pub acked_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCompletePayload {
    pub file_id: i64,
    pub total_bytes: u64,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileErrorPayload {
    pub file_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailRequestPayload {
    pub file_id: i64,
    pub max_dim: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailResponsePayload {
    pub file_id: i64,
    /// Base64 image bytes; absent when no thumbnail could be produced.
    pub data: Option<String>,
}

// ---- collaborator traits --------------------------------------------------

/// What the serving side knows about a requested file.
#[derive(Debug, Clone)]
pub struct ServedFile {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: Option<String>,
    pub visibility: Visibility,
}

/// Looks up a local file by id for serving. Injected by the owner of the
/// index so this module has no schema knowledge.
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn resolve(&self, file_id: i64) -> Option<ServedFile>;
}

/// Optional thumbnail source; rendering lives outside the core.
#[async_trait]
pub trait ThumbnailProvider: Send + Sync {
    async fn thumbnail(&self, file_id: i64, max_dim: u32) -> Option<Vec<u8>>;
}

// ---- progress -------------------------------------------------------------

/// Full transfer-progress record handed to every callback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub request_id: String,
    pub device_id: String,
    pub file_id: i64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub is_complete: bool,
    pub local_path: Option<PathBuf>,
    pub error: Option<String>,
}

pub type TransferEventFn = Arc<dyn Fn(TransferProgress) + Send + Sync>;

#[derive(Debug)]
pub enum RequestOutcome {
    /// A verified cached copy already exists.
    Cached(PathBuf),
    /// The transfer was enqueued; progress arrives via callbacks.
    Pending(String),
}

// ---- state ----------------------------------------------------------------

struct OutgoingState {
    acked_seq: AtomicU64,
    has_ack: AtomicBool,
    cancelled: AtomicBool,
    notify: Notify,
    peer_device: String,
}

struct IncomingTransfer {
    request_id: String,
    device_id: String,
    file_id: i64,
    expected_checksum: Option<String>,
    total_bytes: u64,
    received_bytes: u64,
    next_offset: u64,
    last_contiguous_seq: u64,
    chunks_since_ack: u64,
    temp_path: PathBuf,
    file: tokio::fs::File,
    /// Small out-of-order stash, bounded by the send window.
    pending: BTreeMap<u64, ChunkFrame>,
}

pub struct RemoteFileAccess {
    cache_dir: PathBuf,
    resolver: Arc<dyn FileResolver>,
    thumbnails: Mutex<Option<Arc<dyn ThumbnailProvider>>>,
    incoming: tokio::sync::Mutex<HashMap<String, IncomingTransfer>>,
    /// `(device_id, file_id)` → request id, for routing chunk frames.
    incoming_index: Mutex<HashMap<(String, i64), String>>,
    outgoing: Mutex<HashMap<String, Arc<OutgoingState>>>,
    on_progress: Mutex<Option<TransferEventFn>>,
    on_complete: Mutex<Option<TransferEventFn>>,
    on_error: Mutex<Option<TransferEventFn>>,
}

impl RemoteFileAccess {
    pub fn new(cache_dir: PathBuf, resolver: Arc<dyn FileResolver>) -> Self {
        Self {
            cache_dir,
            resolver,
            thumbnails: Mutex::new(None),
            incoming: tokio::sync::Mutex::new(HashMap::new()),
            incoming_index: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            on_progress: Mutex::new(None),
            on_complete: Mutex::new(None),
            on_error: Mutex::new(None),
        }
    }

    pub fn set_thumbnail_provider(&self, provider: Arc<dyn ThumbnailProvider>) {
        *self.thumbnails.lock().unwrap() = Some(provider);
    }

    pub fn set_progress_callback(&self, cb: TransferEventFn) {
        *self.on_progress.lock().unwrap() = Some(cb);
    }

    pub fn set_complete_callback(&self, cb: TransferEventFn) {
        *self.on_complete.lock().unwrap() = Some(cb);
    }

    pub fn set_error_callback(&self, cb: TransferEventFn) {
        *self.on_error.lock().unwrap() = Some(cb);
    }

    // ---- cache -----------------------------------------------------------

    fn device_cache_dir(&self, device_id: &str) -> PathBuf {
        self.cache_dir.join("remote-files").join(device_id)
    }

    fn cache_path(&self, device_id: &str, file_id: i64, checksum: Option<&str>) -> PathBuf {
        let name = match checksum {
            Some(checksum) => format!("{file_id}.{checksum}"),
            None => file_id.to_string(),
        };
        self.device_cache_dir(device_id).join(name)
    }

    /// Find (and, when a checksum is expected, verify) a cached copy.
    async fn cached_copy(
        &self,
        device_id: &str,
        file_id: i64,
        checksum: Option<&str>,
    ) -> Option<PathBuf> {
        let dir = self.device_cache_dir(device_id);
        let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
        let prefix = file_id.to_string();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != prefix && !name.starts_with(&format!("{prefix}.")) {
                continue;
            }
            let path = entry.path();
            match checksum {
                None => return Some(path),
                Some(expected) => match hash_file(path.clone()).await {
                    Ok(actual) if actual == expected => return Some(path),
                    _ => {
                        debug!(path = %path.display(), "cached copy fails checksum, ignoring");
                        continue;
                    }
                },
            }
        }
        None
    }

    /// Cache usage in bytes per device.
    pub async fn cache_stats(&self) -> Result<HashMap<String, u64>> {
        let mut stats = HashMap::new();
        let root = self.cache_dir.join("remote-files");
        let mut devices = match tokio::fs::read_dir(&root).await {
            Ok(devices) => devices,
            Err(_) => return Ok(stats),
        };
        while let Ok(Some(device)) = devices.next_entry().await {
            let mut total = 0u64;
            let mut files = tokio::fs::read_dir(device.path()).await?;
            while let Ok(Some(file)) = files.next_entry().await {
                if let Ok(meta) = file.metadata().await {
                    total += meta.len();
                }
            }
            stats.insert(device.file_name().to_string_lossy().into_owned(), total);
        }
        Ok(stats)
    }

    pub async fn clear_cache(&self) -> Result<()> {
        let root = self.cache_dir.join("remote-files");
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_device_cache(&self, device_id: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.device_cache_dir(device_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ---- requester side --------------------------------------------------

    /// Ask `peer` for a file, or return the cached copy.
    pub async fn request_file(
        &self,
        peer: &PeerHandle,
        file_id: i64,
        expected_size: Option<i64>,
        checksum: Option<String>,
    ) -> Result<RequestOutcome> {
        if let Some(path) = self
            .cached_copy(&peer.device_id, file_id, checksum.as_deref())
            .await
        {
            return Ok(RequestOutcome::Cached(path));
        }

        let request = WireMessage::json(
            MessageType::FileRequest,
            &FileRequestPayload {
                file_id,
                expected_size,
                checksum: checksum.clone(),
            },
        )?;
        let request_id = request.request_id.clone();

        let dir = self.device_cache_dir(&peer.device_id);
        tokio::fs::create_dir_all(&dir).await?;
        let temp_path = dir.join(format!(".part-{request_id}"));
        let file = tokio::fs::File::create(&temp_path).await?;

        {
            let mut incoming = self.incoming.lock().await;
            incoming.insert(
                request_id.clone(),
                IncomingTransfer {
                    request_id: request_id.clone(),
                    device_id: peer.device_id.clone(),
                    file_id,
                    expected_checksum: checksum,
                    total_bytes: expected_size.unwrap_or(0).max(0) as u64,
                    received_bytes: 0,
                    next_offset: 0,
                    last_contiguous_seq: 0,
                    chunks_since_ack: 0,
                    temp_path,
                    file,
                    pending: BTreeMap::new(),
                },
            );
            self.incoming_index
                .lock()
                .unwrap()
                .insert((peer.device_id.clone(), file_id), request_id.clone());
        }

        peer.send_message(&request).await?;
        info!(peer = %peer.device_id, file_id, request_id = %request_id, "file requested");
        Ok(RequestOutcome::Pending(request_id))
    }

    /// Cancel one in-flight download. The temp file is removed and no
    /// further acks are sent for it.
    pub async fn cancel_request(&self, request_id: &str) {
        let removed = self.incoming.lock().await.remove(request_id);
        if let Some(transfer) = removed {
            self.incoming_index
                .lock()
                .unwrap()
                .remove(&(transfer.device_id.clone(), transfer.file_id));
            let _ = tokio::fs::remove_file(&transfer.temp_path).await;
            debug!(request_id, "transfer cancelled");
        }
    }

    /// Drop every transfer involving a peer; called on disconnect. Each
    /// cancelled download surfaces one error callback.
    pub async fn cancel_all_requests(&self, device_id: &str) {
        let cancelled: Vec<IncomingTransfer> = {
            let mut incoming = self.incoming.lock().await;
            let ids: Vec<String> = incoming
                .values()
                .filter(|t| t.device_id == device_id)
                .map(|t| t.request_id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| incoming.remove(&id))
                .collect()
        };
        for transfer in &cancelled {
            self.incoming_index
                .lock()
                .unwrap()
                .remove(&(transfer.device_id.clone(), transfer.file_id));
            let _ = tokio::fs::remove_file(&transfer.temp_path).await;
            self.fire_error(progress_of(transfer, Some("peer disconnected".into())));
        }
        // Stop feeding uploads to the vanished peer as well.
        for state in self.outgoing.lock().unwrap().values() {
            if state.peer_device == device_id {
                state.cancelled.store(true, Ordering::SeqCst);
                state.notify.notify_waiters();
            }
        }
        if !cancelled.is_empty() {
            info!(device_id, count = cancelled.len(), "transfers cancelled on disconnect");
        }
    }

    /// Fetch a thumbnail synchronously (small payloads, single message).
    pub async fn request_thumbnail(
        &self,
        peer: &PeerHandle,
        file_id: i64,
        max_dim: u32,
    ) -> Result<Option<Vec<u8>>> {
        let request = WireMessage::json(
            MessageType::ThumbnailRequest,
            &ThumbnailRequestPayload { file_id, max_dim },
        )?;
        let reply = peer.send_and_wait(&request, SEND_AND_WAIT_TIMEOUT).await?;
        let payload: ThumbnailResponsePayload = reply.parse()?;
        match payload.data {
            Some(data) => Ok(Some(
                BASE64
                    .decode(data)
                    .map_err(|_| Error::Network("bad thumbnail encoding".into()))?,
            )),
            None => Ok(None),
        }
    }

    // ---- dispatcher entry points ------------------------------------------

    pub async fn handle_message(self: Arc<Self>, peer: &PeerHandle, message: &WireMessage) {
        let result = match message.kind() {
            Some(MessageType::FileRequest) => Self::serve_file(&self, peer, message).await,
            Some(MessageType::FileChunkAck) => self.handle_ack(message),
            Some(MessageType::FileMetadata) => self.handle_metadata(message).await,
            Some(MessageType::FileComplete) => self.handle_complete(message).await,
            Some(MessageType::FileError) => self.handle_file_error(message).await,
            Some(MessageType::ThumbnailRequest) => self.serve_thumbnail(peer, message).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(peer = %peer.device_id, error = %e, "file message handling failed");
        }
    }

    pub async fn handle_chunk(&self, peer: &PeerHandle, chunk: ChunkFrame) {
        if let Err(e) = self.receive_chunk(peer, chunk).await {
            warn!(peer = %peer.device_id, error = %e, "chunk handling failed");
        }
    }

    // ---- serving side ----------------------------------------------------

    async fn serve_file(this: &Arc<Self>, peer: &PeerHandle, message: &WireMessage) -> Result<()> {
        let request: FileRequestPayload = message.parse()?;

        // Security gate: Private files answer exactly like missing ones, and
        // no bytes are touched before this check passes.
        let served = match this.resolver.resolve(request.file_id).await {
            Some(served) if served.visibility == Visibility::Family => served,
            _ => {
                let refusal = WireMessage::json_reply(
                    MessageType::FileError,
                    message.request_id.clone(),
                    &FileErrorPayload {
                        file_id: request.file_id,
                        reason: REASON_NOT_FOUND.to_string(),
                    },
                )?;
                debug!(file_id = request.file_id, "refusing file request");
                return peer.send_message(&refusal).await;
            }
        };

        let state = Arc::new(OutgoingState {
            acked_seq: AtomicU64::new(0),
            has_ack: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
            peer_device: peer.device_id.clone(),
        });
        this.outgoing
            .lock()
            .unwrap()
            .insert(message.request_id.clone(), state.clone());

        let this = this.clone();
        let peer = peer.clone();
        let request_id = message.request_id.clone();
        tokio::spawn(async move {
            if let Err(e) = send_file(&peer, &request_id, request.file_id, &served, &state).await {
                warn!(request_id = %request_id, error = %e, "file send failed");
                let refusal = WireMessage::json_reply(
                    MessageType::FileError,
                    request_id.clone(),
                    &FileErrorPayload {
                        file_id: request.file_id,
                        reason: e.to_string(),
                    },
                );
                if let Ok(refusal) = refusal {
                    let _ = peer.send_message(&refusal).await;
                }
            }
            this.outgoing.lock().unwrap().remove(&request_id);
        });
        Ok(())
    }

    fn handle_ack(&self, message: &WireMessage) -> Result<()> {
        let ack: FileChunkAckPayload = message.parse()?;
        if let Some(state) = self.outgoing.lock().unwrap().get(&message.request_id) {
            state.acked_seq.store(ack.acked_seq, Ordering::SeqCst);
            state.has_ack.store(true, Ordering::SeqCst);
            state.notify.notify_waiters();
        }
        Ok(())
    }

    async fn serve_thumbnail(&self, peer: &PeerHandle, message: &WireMessage) -> Result<()> {
        let request: ThumbnailRequestPayload = message.parse()?;
        let provider = self.thumbnails.lock().unwrap().clone();
        let data = match provider {
            Some(provider) => provider
                .thumbnail(request.file_id, request.max_dim)
                .await
                .map(|bytes| BASE64.encode(bytes)),
            None => None,
        };
        let reply = WireMessage::json_reply(
            MessageType::ThumbnailResponse,
            message.request_id.clone(),
            &ThumbnailResponsePayload {
                file_id: request.file_id,
                data,
            },
        )?;
        peer.send_message(&reply).await
    }

    // ---- receiving side --------------------------------------------------

    async fn handle_metadata(&self, message: &WireMessage) -> Result<()> {
        let metadata: FileMetadataPayload = message.parse()?;
        let mut incoming = self.incoming.lock().await;
        if let Some(transfer) = incoming.get_mut(&message.request_id) {
            transfer.total_bytes = metadata.size;
            if transfer.expected_checksum.is_none() {
                transfer.expected_checksum = metadata.checksum;
            }
        }
        Ok(())
    }

    async fn receive_chunk(&self, peer: &PeerHandle, chunk: ChunkFrame) -> Result<()> {
        let request_id = {
            let index = self.incoming_index.lock().unwrap();
            index
                .get(&(peer.device_id.clone(), chunk.header.file_id))
                .cloned()
        };
        // Cancelled or unknown transfers get no acks at all.
        let Some(request_id) = request_id else {
            return Ok(());
        };

        let mut incoming = self.incoming.lock().await;
        let Some(transfer) = incoming.get_mut(&request_id) else {
            return Ok(());
        };

        if chunk.header.offset < transfer.next_offset {
            // Duplicate of something already written.
            return Ok(());
        }
        if chunk.header.offset > transfer.next_offset {
            transfer.pending.insert(chunk.header.offset, chunk);
            if transfer.pending.len() as u64 > FULL_WINDOW {
                // Too far ahead; re-ack the last contiguous chunk so the
                // sender falls back.
                let seq = transfer.last_contiguous_seq;
                let nack = WireMessage::json_reply(
                    MessageType::FileChunkAck,
                    request_id.clone(),
                    &FileChunkAckPayload { acked_seq: seq },
                )?;
                transfer.pending.clear();
                drop(incoming);
                return peer.send_message(&nack).await;
            }
            return Ok(());
        }

        // In-order chunk: write it and drain whatever is now contiguous.
        let mut to_write = vec![chunk];
        loop {
            let transfer_ref = &mut *transfer;
            let frame = match to_write.pop() {
                Some(frame) => frame,
                None => match transfer_ref.pending.remove(&transfer_ref.next_offset) {
                    Some(frame) => frame,
                    None => break,
                },
            };
            transfer_ref.file.write_all(&frame.data).await?;
            transfer_ref.next_offset += frame.data.len() as u64;
            transfer_ref.received_bytes += frame.data.len() as u64;
            transfer_ref.last_contiguous_seq = frame.header.seq;
            transfer_ref.chunks_since_ack += 1;

            let should_ack = transfer_ref.chunks_since_ack >= ACK_EVERY || frame.header.is_last;
            if should_ack {
                transfer_ref.chunks_since_ack = 0;
                let ack = WireMessage::json_reply(
                    MessageType::FileChunkAck,
                    request_id.clone(),
                    &FileChunkAckPayload {
                        acked_seq: frame.header.seq,
                    },
                )?;
                peer.send_message(&ack).await?;
            }
        }

        let progress = progress_of(transfer, None);
        drop(incoming);
        self.fire_progress(progress);
        Ok(())
    }

    async fn handle_complete(&self, message: &WireMessage) -> Result<()> {
        let completion: FileCompletePayload = message.parse()?;
        let transfer = self.incoming.lock().await.remove(&message.request_id);
        let Some(mut transfer) = transfer else {
            return Ok(());
        };
        self.incoming_index
            .lock()
            .unwrap()
            .remove(&(transfer.device_id.clone(), transfer.file_id));

        transfer.file.flush().await?;
        drop(transfer.file);

        let expected = transfer
            .expected_checksum
            .clone()
            .or(completion.checksum.clone());
        let actual = hash_file(transfer.temp_path.clone()).await?;
        if let Some(expected) = &expected {
            if &actual != expected {
                let _ = tokio::fs::remove_file(&transfer.temp_path).await;
                let progress = TransferProgress {
                    request_id: transfer.request_id.clone(),
                    device_id: transfer.device_id.clone(),
                    file_id: transfer.file_id,
                    total_bytes: transfer.total_bytes,
                    transferred_bytes: transfer.received_bytes,
                    is_complete: false,
                    local_path: None,
                    error: Some("checksum mismatch".into()),
                };
                self.fire_error(progress);
                return Err(Error::Io("received file fails checksum".into()));
            }
        }

        let final_path =
            self.cache_path(&transfer.device_id, transfer.file_id, Some(actual.as_str()));
        tokio::fs::rename(&transfer.temp_path, &final_path).await?;
        info!(
            request_id = %transfer.request_id,
            path = %final_path.display(),
            bytes = transfer.received_bytes,
            "file transfer complete"
        );

        self.fire_complete(TransferProgress {
            request_id: transfer.request_id.clone(),
            device_id: transfer.device_id.clone(),
            file_id: transfer.file_id,
            total_bytes: completion.total_bytes,
            transferred_bytes: transfer.received_bytes,
            is_complete: true,
            local_path: Some(final_path),
            error: None,
        });
        Ok(())
    }

    async fn handle_file_error(&self, message: &WireMessage) -> Result<()> {
        let payload: FileErrorPayload = message.parse()?;
        let transfer = self.incoming.lock().await.remove(&message.request_id);
        if let Some(transfer) = transfer {
            self.incoming_index
                .lock()
                .unwrap()
                .remove(&(transfer.device_id.clone(), transfer.file_id));
            let _ = tokio::fs::remove_file(&transfer.temp_path).await;
            self.fire_error(progress_of(&transfer, Some(payload.reason.clone())));
        }
        Ok(())
    }

    fn fire_progress(&self, progress: TransferProgress) {
        if let Some(cb) = self.on_progress.lock().unwrap().as_ref() {
            cb(progress);
        }
    }

    fn fire_complete(&self, progress: TransferProgress) {
        if let Some(cb) = self.on_complete.lock().unwrap().as_ref() {
            cb(progress);
        }
    }

    fn fire_error(&self, progress: TransferProgress) {
        if let Some(cb) = self.on_error.lock().unwrap().as_ref() {
            cb(progress);
        }
    }
}

fn progress_of(transfer: &IncomingTransfer, error: Option<String>) -> TransferProgress {
    TransferProgress {
        request_id: transfer.request_id.clone(),
        device_id: transfer.device_id.clone(),
        file_id: transfer.file_id,
        total_bytes: transfer.total_bytes,
        transferred_bytes: transfer.received_bytes,
        is_complete: false,
        local_path: None,
        error,
    }
}

/// Sender loop: metadata, then chunks under a sliding window, then the
/// completion message. A stalled window halves once and aborts after three
/// consecutive timeouts.
async fn send_file(
    peer: &PeerHandle,
    request_id: &str,
    file_id: i64,
    served: &ServedFile,
    state: &Arc<OutgoingState>,
) -> Result<()> {
    let chunk_count = served.size.div_ceil(CHUNK_SIZE as u64).max(1);
    let metadata = WireMessage::json_reply(
        MessageType::FileMetadata,
        request_id.to_string(),
        &FileMetadataPayload {
            file_id,
            size: served.size,
            checksum: served.checksum.clone(),
            chunk_count,
        },
    )?;
    peer.send_message(&metadata).await?;

    let mut file = tokio::fs::File::open(&served.path).await?;
    let mut window = FULL_WINDOW;
    let mut stalls = 0u32;
    let mut offset = 0u64;
    let mut seq = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE as usize];

    while offset < served.size || (served.size == 0 && seq == 0) {
        // Flow control: at most `window` unacked chunks in flight.
        loop {
            if state.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Network("transfer cancelled".into()));
            }
            let acked = if state.has_ack.load(Ordering::SeqCst) {
                state.acked_seq.load(Ordering::SeqCst) + 1
            } else {
                0
            };
            if seq - acked < window {
                break;
            }
            match tokio::time::timeout(ACK_TIMEOUT, state.notify.notified()).await {
                Ok(()) => {
                    stalls = 0;
                }
                Err(_) => {
                    stalls += 1;
                    window = REDUCED_WINDOW;
                    warn!(request_id, stalls, "ack window stalled");
                    if stalls >= MAX_STALLS {
                        return Err(Error::Network("transfer stalled, aborting".into()));
                    }
                }
            }
        }

        let remaining = (served.size - offset).min(CHUNK_SIZE as u64) as usize;
        file.read_exact(&mut buf[..remaining]).await?;
        let header = ChunkHeader {
            file_id,
            offset,
            chunk_size: remaining as u32,
            is_last: offset + remaining as u64 >= served.size,
            seq,
        };
        peer.send_chunk(&header, &buf[..remaining]).await?;
        offset += remaining as u64;
        seq += 1;
        if served.size == 0 {
            break;
        }
    }

    // Wait for the receiver to ack the tail before declaring completion.
    let last_seq = seq.saturating_sub(1);
    let mut stalls = 0u32;
    while served.size > 0 {
        if state.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Network("transfer cancelled".into()));
        }
        if state.has_ack.load(Ordering::SeqCst)
            && state.acked_seq.load(Ordering::SeqCst) >= last_seq
        {
            break;
        }
        if tokio::time::timeout(ACK_TIMEOUT, state.notify.notified())
            .await
            .is_err()
        {
            stalls += 1;
            if stalls >= MAX_STALLS {
                return Err(Error::Network("final ack never arrived".into()));
            }
        }
    }

    let complete = WireMessage::json_reply(
        MessageType::FileComplete,
        request_id.to_string(),
        &FileCompletePayload {
            file_id,
            total_bytes: served.size,
            checksum: served.checksum.clone(),
        },
    )?;
    peer.send_message(&complete).await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoFiles;

    #[async_trait]
    impl FileResolver for NoFiles {
        async fn resolve(&self, _file_id: i64) -> Option<ServedFile> {
            None
        }
    }

    fn access(dir: &Path) -> RemoteFileAccess {
        RemoteFileAccess::new(dir.to_path_buf(), Arc::new(NoFiles))
    }

    #[tokio::test]
    async fn cache_paths_are_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let access = access(dir.path());
        let path = access.cache_path("device-1", 42, Some("abc"));
        assert!(path.ends_with("remote-files/device-1/42.abc"));
        let bare = access.cache_path("device-1", 42, None);
        assert!(bare.ends_with("remote-files/device-1/42"));
    }

    #[tokio::test]
    async fn cached_copy_validates_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let access = access(dir.path());
        let device_dir = access.device_cache_dir("d");
        tokio::fs::create_dir_all(&device_dir).await.unwrap();
        tokio::fs::write(device_dir.join("7.deadbeef"), b"payload")
            .await
            .unwrap();

        // No expectation: any copy counts.
        assert!(access.cached_copy("d", 7, None).await.is_some());

        // Wrong expectation: the stale copy is not offered.
        assert!(access.cached_copy("d", 7, Some("deadbeef")).await.is_none());

        // Right expectation: matches the real hash of the bytes.
        let real = hash_file(device_dir.join("7.deadbeef")).await.unwrap();
        assert!(access.cached_copy("d", 7, Some(&real)).await.is_some());
    }

    #[tokio::test]
    async fn cache_stats_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let access = access(dir.path());
        let device_dir = access.device_cache_dir("d");
        tokio::fs::create_dir_all(&device_dir).await.unwrap();
        tokio::fs::write(device_dir.join("1"), vec![0u8; 100])
            .await
            .unwrap();

        let stats = access.cache_stats().await.unwrap();
        assert_eq!(stats.get("d"), Some(&100));

        access.clear_cache().await.unwrap();
        assert!(access.cache_stats().await.unwrap().is_empty());
    }
}
