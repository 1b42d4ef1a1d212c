//! Wire framing.
//!
//! Two frame families share the stream:
//!
//! * `FVLT` carries control/data messages: magic, u32 BE length, u8 type,
//!   u8 request-id length, request id (UUID text), payload (JSON).
//! * `FVCH` carries file chunks: magic, u32 BE length, JSON header, zero
//!   padding to an 8-byte boundary (relative to the header start), raw bytes.
//!
//! The decoder is purely incremental: it either yields a complete frame,
//! reports that it needs more bytes, or fails on malformed input. It never
//! panics on arbitrary bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAGIC_MESSAGE: &[u8; 4] = b"FVLT";
pub const MAGIC_CHUNK: &[u8; 4] = b"FVCH";

/// Maximum frame body size (16 MiB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_BYTES: usize = 8;

/// Closed message-type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 1,
    HeartbeatAck = 2,
    Disconnect = 3,
    Error = 4,
    DeviceInfo = 5,
    DeviceInfoAck = 6,
    IndexSyncRequest = 10,
    IndexSyncResponse = 11,
    IndexDelta = 12,
    IndexDeltaAck = 13,
    FileRequest = 20,
    FileMetadata = 21,
    FileChunkAck = 22,
    FileComplete = 23,
    FileError = 24,
    ThumbnailRequest = 25,
    ThumbnailResponse = 26,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Heartbeat,
            2 => Self::HeartbeatAck,
            3 => Self::Disconnect,
            4 => Self::Error,
            5 => Self::DeviceInfo,
            6 => Self::DeviceInfoAck,
            10 => Self::IndexSyncRequest,
            11 => Self::IndexSyncResponse,
            12 => Self::IndexDelta,
            13 => Self::IndexDeltaAck,
            20 => Self::FileRequest,
            21 => Self::FileMetadata,
            22 => Self::FileChunkAck,
            23 => Self::FileComplete,
            24 => Self::FileError,
            25 => Self::ThumbnailRequest,
            26 => Self::ThumbnailResponse,
            _ => return None,
        })
    }
}

/// A decoded `FVLT` frame. The type byte is kept raw so unknown types travel
/// up to the dispatcher, which logs and drops them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub msg_type: u8,
    pub request_id: String,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn new(msg_type: MessageType, request_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type as u8,
            request_id: request_id.into(),
            payload,
        }
    }

    /// Build a message with a JSON payload and a fresh request id.
    pub fn json<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self> {
        Ok(Self::new(
            msg_type,
            uuid::Uuid::new_v4().to_string(),
            serde_json::to_vec(payload)?,
        ))
    }

    /// Build a JSON reply correlated to `request_id`.
    pub fn json_reply<T: Serialize>(
        msg_type: MessageType,
        request_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self::new(
            msg_type,
            request_id,
            serde_json::to_vec(payload)?,
        ))
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::Network(format!("malformed payload: {e}")))
    }
}

/// Header of an `FVCH` chunk frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub file_id: i64,
    pub offset: u64,
    pub chunk_size: u32,
    pub is_last: bool,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFrame {
    pub header: ChunkHeader,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(WireMessage),
    Chunk(ChunkFrame),
}

/// Encode an `FVLT` frame.
pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>> {
    let request_id = message.request_id.as_bytes();
    if request_id.len() > u8::MAX as usize {
        return Err(Error::InvalidArgument("request id too long".into()));
    }
    let body_len = 2 + request_id.len() + message.payload.len();
    if body_len > MAX_FRAME_BYTES {
        return Err(Error::InvalidArgument("frame exceeds 16 MiB".into()));
    }
    let mut out = Vec::with_capacity(HEADER_BYTES + body_len);
    out.extend_from_slice(MAGIC_MESSAGE);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.push(message.msg_type);
    out.push(request_id.len() as u8);
    out.extend_from_slice(request_id);
    out.extend_from_slice(&message.payload);
    Ok(out)
}

/// Encode an `FVCH` frame.
pub fn encode_chunk(header: &ChunkHeader, data: &[u8]) -> Result<Vec<u8>> {
    debug_assert_eq!(header.chunk_size as usize, data.len());
    let header_json = serde_json::to_vec(header)?;
    let pad = (8 - header_json.len() % 8) % 8;
    let body_len = header_json.len() + pad + data.len();
    if body_len > MAX_FRAME_BYTES {
        return Err(Error::InvalidArgument("chunk frame exceeds 16 MiB".into()));
    }
    let mut out = Vec::with_capacity(HEADER_BYTES + body_len);
    out.extend_from_slice(MAGIC_CHUNK);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.extend_from_slice(&header_json);
    out.extend(std::iter::repeat(0u8).take(pad));
    out.extend_from_slice(data);
    Ok(out)
}

/// Incremental frame decoder over a growing byte buffer.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame; `Ok(None)` means "need more bytes".
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_BYTES {
            return Ok(None);
        }
        let magic: [u8; 4] = self.buf[..4].try_into().unwrap();
        let body_len =
            u32::from_be_bytes(self.buf[4..8].try_into().unwrap()) as usize;
        if body_len > MAX_FRAME_BYTES {
            return Err(Error::Network(format!("oversized frame ({body_len} bytes)")));
        }
        if self.buf.len() < HEADER_BYTES + body_len {
            return Ok(None);
        }

        let body: Vec<u8> = self.buf[HEADER_BYTES..HEADER_BYTES + body_len].to_vec();
        self.buf.drain(..HEADER_BYTES + body_len);

        match &magic {
            MAGIC_MESSAGE => decode_message_body(&body).map(|m| Some(Frame::Message(m))),
            MAGIC_CHUNK => decode_chunk_body(&body).map(|c| Some(Frame::Chunk(c))),
            _ => Err(Error::Network("bad frame magic".into())),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn decode_message_body(body: &[u8]) -> Result<WireMessage> {
    if body.len() < 2 {
        return Err(Error::Network("truncated message frame".into()));
    }
    let msg_type = body[0];
    let id_len = body[1] as usize;
    if body.len() < 2 + id_len {
        return Err(Error::Network("truncated request id".into()));
    }
    let request_id = std::str::from_utf8(&body[2..2 + id_len])
        .map_err(|_| Error::Network("request id is not UTF-8".into()))?
        .to_string();
    Ok(WireMessage {
        msg_type,
        request_id,
        payload: body[2 + id_len..].to_vec(),
    })
}

fn decode_chunk_body(body: &[u8]) -> Result<ChunkFrame> {
    let mut stream = serde_json::Deserializer::from_slice(body).into_iter::<ChunkHeader>();
    let header = match stream.next() {
        Some(Ok(header)) => header,
        _ => return Err(Error::Network("malformed chunk header".into())),
    };
    let header_len = stream.byte_offset();
    let pad = (8 - header_len % 8) % 8;
    let data_start = header_len + pad;
    let data_end = data_start + header.chunk_size as usize;
    if data_end != body.len() {
        return Err(Error::Network("chunk length mismatch".into()));
    }
    Ok(ChunkFrame {
        header,
        data: body[data_start..].to_vec(),
    })
}
