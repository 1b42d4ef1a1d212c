//! Pairing wire protocol.
//!
//! SPAKE2 (Ed25519 group) with the six-digit PIN as the low-entropy password.
//! The joiner must prove possession of the PIN before the initiator reveals
//! anything: the family secret is only sent after the joiner's confirmation
//! tag verifies, wrapped with AES-256-GCM under the SPAKE2 session key. An
//! attacker who completes the exchange with a wrong PIN learns only that the
//! attempt failed.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const ID_JOINER: &[u8] = b"familyvault-joiner";
const ID_INITIATOR: &[u8] = b"familyvault-initiator";
const KDF_SALT: &[u8] = b"familyvault-pairing-v1";
const INFO_WRAP: &[u8] = b"secret wrap";
const INFO_CONFIRM: &[u8] = b"confirm";
const LABEL_JOINER: &[u8] = b"joiner confirm";
const LABEL_INITIATOR: &[u8] = b"initiator confirm";

const FRAME_MAX: usize = 4096;

/// Why the initiator refused; carried verbatim on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidPin,
    Expired,
    RateLimited,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PairingMessage {
    /// Joiner → initiator: SPAKE2 message A (base64).
    Start { spake_msg: String },
    /// Initiator → joiner: SPAKE2 message B (base64).
    Challenge { spake_msg: String },
    /// Joiner → initiator: proof of the PIN.
    Confirm { tag: String },
    /// Initiator → joiner: proof plus the wrapped family secret.
    Secret {
        tag: String,
        nonce: String,
        ciphertext: String,
    },
    /// Joiner → initiator: the secret was unwrapped and stored.
    Done,
    Reject { reason: RejectReason },
}

/// Keys derived from the SPAKE2 shared secret.
pub struct PairingKeys {
    wrap_key: [u8; 32],
    confirm_key: [u8; 32],
}

impl PairingKeys {
    pub fn derive(shared: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared);
        let mut wrap_key = [0u8; 32];
        let mut confirm_key = [0u8; 32];
        hk.expand(INFO_WRAP, &mut wrap_key)
            .map_err(|_| Error::Internal("hkdf expand failed".into()))?;
        hk.expand(INFO_CONFIRM, &mut confirm_key)
            .map_err(|_| Error::Internal("hkdf expand failed".into()))?;
        Ok(Self {
            wrap_key,
            confirm_key,
        })
    }

    pub fn joiner_tag(&self) -> String {
        self.tag(LABEL_JOINER)
    }

    pub fn initiator_tag(&self) -> String {
        self.tag(LABEL_INITIATOR)
    }

    fn tag(&self, label: &[u8]) -> String {
        let mut mac =
            <Hmac<Sha256> as Mac>::new_from_slice(&self.confirm_key).expect("hmac accepts any key length");
        mac.update(label);
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify_tag(&self, label_is_joiner: bool, tag: &str) -> bool {
        let Ok(raw) = hex::decode(tag) else {
            return false;
        };
        let mut mac =
            <Hmac<Sha256> as Mac>::new_from_slice(&self.confirm_key).expect("hmac accepts any key length");
        mac.update(if label_is_joiner {
            LABEL_JOINER
        } else {
            LABEL_INITIATOR
        });
        mac.verify_slice(&raw).is_ok()
    }

    /// AES-256-GCM wrap of the family secret with a fresh 12-byte nonce.
    pub fn wrap_secret(&self, secret: &[u8]) -> Result<(String, String)> {
        let cipher = Aes256Gcm::new((&self.wrap_key).into());
        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), secret)
            .map_err(|_| Error::Internal("secret wrap failed".into()))?;
        Ok((hex::encode(nonce), BASE64.encode(ciphertext)))
    }

    pub fn unwrap_secret(&self, nonce: &str, ciphertext: &str) -> Result<Vec<u8>> {
        let nonce = hex::decode(nonce)
            .map_err(|_| Error::AuthFailed("bad secret nonce".into()))?;
        if nonce.len() != 12 {
            return Err(Error::AuthFailed("bad secret nonce".into()));
        }
        let ciphertext = BASE64
            .decode(ciphertext)
            .map_err(|_| Error::AuthFailed("bad secret ciphertext".into()))?;
        let cipher = Aes256Gcm::new((&self.wrap_key).into());
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| Error::AuthFailed("secret unwrap failed".into()))
    }
}

/// Joiner half of the SPAKE2 exchange.
pub struct JoinerExchange {
    state: Spake2<Ed25519Group>,
}

impl JoinerExchange {
    pub fn start(pin: &str) -> (Self, String) {
        let (state, msg) = Spake2::<Ed25519Group>::start_a(
            &Password::new(pin.as_bytes()),
            &Identity::new(ID_JOINER),
            &Identity::new(ID_INITIATOR),
        );
        (Self { state }, BASE64.encode(msg))
    }

    pub fn finish(self, inbound: &str) -> Result<PairingKeys> {
        let raw = BASE64
            .decode(inbound)
            .map_err(|_| Error::AuthFailed("bad pairing message".into()))?;
        let shared = self
            .state
            .finish(&raw)
            .map_err(|_| Error::AuthFailed("key exchange failed".into()))?;
        PairingKeys::derive(&shared)
    }
}

/// Initiator half of the SPAKE2 exchange.
pub struct InitiatorExchange {
    state: Spake2<Ed25519Group>,
}

impl InitiatorExchange {
    pub fn start(pin: &str) -> (Self, String) {
        let (state, msg) = Spake2::<Ed25519Group>::start_b(
            &Password::new(pin.as_bytes()),
            &Identity::new(ID_JOINER),
            &Identity::new(ID_INITIATOR),
        );
        (Self { state }, BASE64.encode(msg))
    }

    pub fn finish(self, inbound: &str) -> Result<PairingKeys> {
        let raw = BASE64
            .decode(inbound)
            .map_err(|_| Error::AuthFailed("bad pairing message".into()))?;
        let shared = self
            .state
            .finish(&raw)
            .map_err(|_| Error::AuthFailed("key exchange failed".into()))?;
        PairingKeys::derive(&shared)
    }
}

pub async fn write_message(stream: &mut TcpStream, message: &PairingMessage) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > FRAME_MAX {
        return Err(Error::Network("oversized pairing frame".into()));
    }
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_message(stream: &mut TcpStream) -> Result<PairingMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > FRAME_MAX {
        return Err(Error::Network("oversized pairing frame".into()));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| Error::Network(format!("malformed pairing frame: {e}")))
}
