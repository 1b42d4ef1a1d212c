//! PSK-authenticated session crypto.
//!
//! Both peers hold the 32-byte PSK derived from the family secret. A
//! cleartext hello exchange carries each side's device id (the PSK identity)
//! and a fresh 16-byte nonce; the nonces salt an HKDF-SHA256 expansion of the
//! PSK into one ChaCha20-Poly1305 key per direction plus a confirmation key.
//! Explicit HMAC confirmations prove possession of the PSK before any record
//! flows; a wrong PSK fails the handshake. Record nonces are direction-local
//! counters, so replayed or reordered ciphertext fails authentication.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};

pub const SESSION_NONCE_BYTES: usize = 16;

const SALT_PREFIX: &[u8] = b"familyvault-session-v1";
const INFO_CLIENT_KEY: &[u8] = b"fv client write";
const INFO_SERVER_KEY: &[u8] = b"fv server write";
const INFO_CONFIRM_KEY: &[u8] = b"fv confirm";
const CLIENT_CONFIRM_LABEL: &[u8] = b"fv client finished";
const SERVER_CONFIRM_LABEL: &[u8] = b"fv server finished";

/// Cleartext hello carrying the PSK identity and version negotiation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    /// PSK identity: the sender's device id.
    pub device_id: String,
    /// Hex-encoded 16-byte session nonce.
    pub nonce: String,
}

impl Hello {
    pub fn new(protocol_version: u32, min_protocol_version: u32, device_id: &str) -> Self {
        let mut nonce = [0u8; SESSION_NONCE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        Self {
            protocol_version,
            min_protocol_version,
            device_id: device_id.to_string(),
            nonce: hex::encode(nonce),
        }
    }

    pub fn nonce_bytes(&self) -> Result<[u8; SESSION_NONCE_BYTES]> {
        let bytes = hex::decode(&self.nonce)
            .map_err(|_| Error::Network("hello nonce is not hex".into()))?;
        bytes
            .try_into()
            .map_err(|_| Error::Network("hello nonce has wrong length".into()))
    }
}

struct DirectionState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl DirectionState {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        // 4 zero bytes + 64-bit counter; unique per direction for the whole
        // session lifetime.
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        *Nonce::from_slice(&nonce)
    }
}

/// Keys and counters of an established session.
pub struct SessionCrypto {
    send: DirectionState,
    recv: DirectionState,
    confirm_key: [u8; 32],
    is_client: bool,
}

impl SessionCrypto {
    /// Derive the session from the PSK and both hello nonces. `is_client`
    /// selects which directional key this side writes with.
    pub fn derive(
        psk: &[u8; 32],
        client_nonce: &[u8; SESSION_NONCE_BYTES],
        server_nonce: &[u8; SESSION_NONCE_BYTES],
        is_client: bool,
    ) -> Result<Self> {
        let mut salt = Vec::with_capacity(SALT_PREFIX.len() + 2 * SESSION_NONCE_BYTES);
        salt.extend_from_slice(SALT_PREFIX);
        salt.extend_from_slice(client_nonce);
        salt.extend_from_slice(server_nonce);

        let hk = Hkdf::<Sha256>::new(Some(&salt), psk);
        let mut client_key = [0u8; 32];
        let mut server_key = [0u8; 32];
        let mut confirm_key = [0u8; 32];
        hk.expand(INFO_CLIENT_KEY, &mut client_key)
            .map_err(|_| Error::Internal("hkdf expand failed".into()))?;
        hk.expand(INFO_SERVER_KEY, &mut server_key)
            .map_err(|_| Error::Internal("hkdf expand failed".into()))?;
        hk.expand(INFO_CONFIRM_KEY, &mut confirm_key)
            .map_err(|_| Error::Internal("hkdf expand failed".into()))?;

        let (send_key, recv_key) = if is_client {
            (client_key, server_key)
        } else {
            (server_key, client_key)
        };

        Ok(Self {
            send: DirectionState::new(&send_key),
            recv: DirectionState::new(&recv_key),
            confirm_key,
            is_client,
        })
    }

    /// Confirmation tag this side sends.
    pub fn local_confirm(&self) -> [u8; 32] {
        self.confirm(if self.is_client {
            CLIENT_CONFIRM_LABEL
        } else {
            SERVER_CONFIRM_LABEL
        })
    }

    /// Verify the peer's confirmation tag; failure means PSK mismatch.
    pub fn verify_peer_confirm(&self, tag: &[u8]) -> Result<()> {
        let label = if self.is_client {
            SERVER_CONFIRM_LABEL
        } else {
            CLIENT_CONFIRM_LABEL
        };
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.confirm_key)
            .map_err(|_| Error::Internal("hmac init failed".into()))?;
        mac.update(label);
        mac.verify_slice(tag)
            .map_err(|_| Error::AuthFailed("peer key confirmation failed".into()))
    }

    fn confirm(&self, label: &[u8]) -> [u8; 32] {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.confirm_key)
            .expect("hmac accepts any key length");
        mac.update(label);
        mac.finalize().into_bytes().into()
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.send.next_nonce();
        self.send
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Network("record encryption failed".into()))
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.recv.next_nonce();
        self.recv
            .cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| Error::AuthFailed("record authentication failed".into()))
    }

    /// Split into independent halves for the reader and writer tasks.
    pub fn split(self) -> (SendCrypto, RecvCrypto) {
        (
            SendCrypto { state: self.send },
            RecvCrypto { state: self.recv },
        )
    }
}

pub struct SendCrypto {
    state: DirectionState,
}

impl SendCrypto {
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.state.next_nonce();
        self.state
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Network("record encryption failed".into()))
    }
}

pub struct RecvCrypto {
    state: DirectionState,
}

impl RecvCrypto {
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.state.next_nonce();
        self.state
            .cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| Error::AuthFailed("record authentication failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonces() -> ([u8; 16], [u8; 16]) {
        ([7u8; 16], [9u8; 16])
    }

    #[test]
    fn both_sides_agree() {
        let psk = [42u8; 32];
        let (cn, sn) = nonces();
        let mut client = SessionCrypto::derive(&psk, &cn, &sn, true).unwrap();
        let mut server = SessionCrypto::derive(&psk, &cn, &sn, false).unwrap();

        server.verify_peer_confirm(&client.local_confirm()).unwrap();
        client.verify_peer_confirm(&server.local_confirm()).unwrap();

        let wire = client.encrypt(b"hello there").unwrap();
        assert_ne!(wire, b"hello there");
        assert_eq!(server.decrypt(&wire).unwrap(), b"hello there");

        let back = server.encrypt(b"and back").unwrap();
        assert_eq!(client.decrypt(&back).unwrap(), b"and back");
    }

    #[test]
    fn psk_mismatch_fails_confirmation() {
        let (cn, sn) = nonces();
        let client = SessionCrypto::derive(&[1u8; 32], &cn, &sn, true).unwrap();
        let server = SessionCrypto::derive(&[2u8; 32], &cn, &sn, false).unwrap();
        assert!(server.verify_peer_confirm(&client.local_confirm()).is_err());
    }

    #[test]
    fn tampered_record_fails_auth() {
        let psk = [5u8; 32];
        let (cn, sn) = nonces();
        let mut client = SessionCrypto::derive(&psk, &cn, &sn, true).unwrap();
        let mut server = SessionCrypto::derive(&psk, &cn, &sn, false).unwrap();

        let mut wire = client.encrypt(b"payload").unwrap();
        wire[0] ^= 0xFF;
        assert!(server.decrypt(&wire).is_err());
    }

    #[test]
    fn replay_fails_because_counters_advance() {
        let psk = [5u8; 32];
        let (cn, sn) = nonces();
        let mut client = SessionCrypto::derive(&psk, &cn, &sn, true).unwrap();
        let mut server = SessionCrypto::derive(&psk, &cn, &sn, false).unwrap();

        let wire = client.encrypt(b"first").unwrap();
        assert!(server.decrypt(&wire).is_ok());
        assert!(server.decrypt(&wire).is_err());
    }

    #[test]
    fn fresh_nonces_give_fresh_keys() {
        let psk = [8u8; 32];
        let mut one = SessionCrypto::derive(&psk, &[1; 16], &[2; 16], true).unwrap();
        let mut two = SessionCrypto::derive(&psk, &[3; 16], &[4; 16], false).unwrap();
        let wire = one.encrypt(b"cross-session").unwrap();
        assert!(two.decrypt(&wire).is_err());
    }
}
