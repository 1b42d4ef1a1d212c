//! Secure transport: PSK-authenticated, AEAD-framed TCP.
//!
//! Handshake: both sides exchange a cleartext [`Hello`] (protocol versions,
//! device id as PSK identity, session nonce), derive directional keys from
//! the PSK, and exchange HMAC confirmations. Only then do encrypted records
//! flow, each `u32 BE length | ciphertext`. Frame bytes from
//! [`codec`] travel inside records.

pub mod codec;
pub mod session;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use session::{Hello, RecvCrypto, SendCrypto, SessionCrypto};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MIN_PROTOCOL_VERSION: u32 = 1;

const HANDSHAKE_FRAME_MAX: usize = 4096;
const RECORD_MAX: usize = codec::MAX_FRAME_BYTES + 1024;

/// Established secure stream halves plus the peer's hello.
pub struct SecureStream {
    pub reader: SecureReader,
    pub writer: SecureWriter,
    pub peer: Hello,
}

/// Client side of the handshake.
pub async fn connect(
    stream: TcpStream,
    identity: &DeviceIdentity,
    psk: &[u8; 32],
) -> Result<SecureStream> {
    handshake(stream, identity, psk, true).await
}

/// Server side of the handshake.
pub async fn accept(
    stream: TcpStream,
    identity: &DeviceIdentity,
    psk: &[u8; 32],
) -> Result<SecureStream> {
    handshake(stream, identity, psk, false).await
}

async fn handshake(
    mut stream: TcpStream,
    identity: &DeviceIdentity,
    psk: &[u8; 32],
    is_client: bool,
) -> Result<SecureStream> {
    let local = Hello::new(PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, &identity.device_id);

    // Hellos cross in the clear; nothing secret is in them.
    let peer = if is_client {
        write_handshake_frame(&mut stream, &serde_json::to_vec(&local)?).await?;
        let raw = read_handshake_frame(&mut stream).await?;
        serde_json::from_slice::<Hello>(&raw)
            .map_err(|e| Error::Network(format!("malformed hello: {e}")))?
    } else {
        let raw = read_handshake_frame(&mut stream).await?;
        let peer = serde_json::from_slice::<Hello>(&raw)
            .map_err(|e| Error::Network(format!("malformed hello: {e}")))?;
        write_handshake_frame(&mut stream, &serde_json::to_vec(&local)?).await?;
        peer
    };

    negotiate_version(&local, &peer)?;

    let (client_nonce, server_nonce) = if is_client {
        (local.nonce_bytes()?, peer.nonce_bytes()?)
    } else {
        (peer.nonce_bytes()?, local.nonce_bytes()?)
    };
    let crypto = SessionCrypto::derive(psk, &client_nonce, &server_nonce, is_client)?;

    // Both confirmations cross before any record is accepted; a PSK mismatch
    // dies here.
    write_handshake_frame(&mut stream, &crypto.local_confirm()).await?;
    let peer_confirm = read_handshake_frame(&mut stream).await?;
    crypto.verify_peer_confirm(&peer_confirm)?;

    debug!(peer = %peer.device_id, "secure channel established");

    let (read_half, write_half) = stream.into_split();
    let (send, recv) = crypto.split();
    Ok(SecureStream {
        reader: SecureReader {
            inner: read_half,
            crypto: recv,
        },
        writer: SecureWriter {
            inner: write_half,
            crypto: send,
        },
        peer,
    })
}

/// Two peers speak `min(version_a, version_b)`; if that is below either
/// side's floor the connection is refused.
pub fn negotiate_version(local: &Hello, peer: &Hello) -> Result<u32> {
    let negotiated = local.protocol_version.min(peer.protocol_version);
    if negotiated < local.min_protocol_version || negotiated < peer.min_protocol_version {
        return Err(Error::Network(format!(
            "incompatible protocol version {negotiated}"
        )));
    }
    Ok(negotiated)
}

async fn write_handshake_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    if payload.len() > HANDSHAKE_FRAME_MAX {
        return Err(Error::Network("oversized handshake frame".into()));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_handshake_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > HANDSHAKE_FRAME_MAX {
        return Err(Error::Network("oversized handshake frame".into()));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writing half: encrypts one record per call.
pub struct SecureWriter {
    inner: OwnedWriteHalf,
    crypto: SendCrypto,
}

impl SecureWriter {
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<()> {
        let record = self.crypto.encrypt(plaintext)?;
        if record.len() > RECORD_MAX {
            return Err(Error::Network("record too large".into()));
        }
        self.inner
            .write_all(&(record.len() as u32).to_be_bytes())
            .await?;
        self.inner.write_all(&record).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Reading half: yields one decrypted record per call.
pub struct SecureReader {
    inner: OwnedReadHalf,
    crypto: RecvCrypto,
}

impl SecureReader {
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > RECORD_MAX {
            return Err(Error::Network("oversized record".into()));
        }
        let mut record = vec![0u8; len];
        self.inner.read_exact(&mut record).await?;
        self.crypto.decrypt(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;
    use tokio::net::TcpListener;

    fn identity(id: &str) -> DeviceIdentity {
        DeviceIdentity {
            device_id: id.to_string(),
            device_name: id.to_string(),
            device_type: DeviceType::Desktop,
        }
    }

    #[tokio::test]
    async fn full_duplex_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let psk = [3u8; 32];

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = accept(stream, &identity("server"), &psk).await.unwrap();
            let got = channel.reader.recv().await.unwrap();
            channel.writer.send(&got).await.unwrap();
            channel.peer.device_id
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = connect(stream, &identity("client"), &psk).await.unwrap();
        assert_eq!(channel.peer.device_id, "server");

        channel.writer.send(b"ping me back").await.unwrap();
        assert_eq!(channel.reader.recv().await.unwrap(), b"ping me back");
        assert_eq!(server.await.unwrap(), "client");
    }

    #[tokio::test]
    async fn psk_mismatch_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, &identity("server"), &[1u8; 32]).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = connect(stream, &identity("client"), &[2u8; 32]).await;
        assert!(client.is_err());
        assert!(server.await.unwrap().is_err());
    }

    #[test]
    fn version_negotiation_rejects_old_peers() {
        let mut local = Hello::new(3, 2, "a");
        let peer = Hello::new(1, 1, "b");
        assert!(negotiate_version(&local, &peer).is_err());
        local.min_protocol_version = 1;
        assert_eq!(negotiate_version(&local, &peer).unwrap(), 1);
    }
}
