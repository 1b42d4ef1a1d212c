//! Family pairing.
//!
//! The initiator opens a short-lived plaintext TCP listener, shows a PIN (and
//! a QR payload), and hands the family secret to any joiner that proves
//! knowledge of the PIN through SPAKE2. Brute force is bounded by attempt
//! counting, per-IP rate limiting and the five-minute session TTL.

pub mod pin;
pub mod protocol;

pub use pin::PairingSession;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::now_ts;
use crate::vault::{SecretVault, KEY_FAMILY_SECRET};
use pin::MAX_TOTAL_FAILURES;
use protocol::{
    InitiatorExchange, JoinerExchange, PairingMessage, RejectReason,
};

/// Whole-handshake deadline on either side.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

const PSK_SALT: &[u8] = b"familyvault-psk-v1";
const PSK_INFO: &[u8] = b"tls13-psk";

/// Closed outcome enum for a join attempt. Discriminants cross the FFI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinOutcome {
    Success,
    InvalidPin,
    Expired,
    RateLimited,
    NetworkError,
    AlreadyConfigured,
    InternalError,
}

impl JoinOutcome {
    pub fn as_i32(self) -> i32 {
        match self {
            JoinOutcome::Success => 0,
            JoinOutcome::InvalidPin => 1,
            JoinOutcome::Expired => 2,
            JoinOutcome::RateLimited => 3,
            JoinOutcome::NetworkError => 4,
            JoinOutcome::AlreadyConfigured => 5,
            JoinOutcome::InternalError => 6,
        }
    }
}

/// What the UI shows the user after `create_family`.
#[derive(Debug, Clone)]
pub struct PairingInvite {
    pub pin: String,
    pub qr_payload: String,
    pub expires_at: i64,
    /// Actual listener port (relevant when the caller asked for port 0).
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct QrPayload {
    host: String,
    port: u16,
    nonce: String,
    expires: i64,
}

pub struct FamilyPairing {
    vault: Arc<SecretVault>,
    session: Arc<Mutex<Option<PairingSession>>>,
    total_failures: Arc<AtomicU32>,
    listener: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FamilyPairing {
    pub fn new(vault: Arc<SecretVault>) -> Self {
        Self {
            vault,
            session: Arc::new(Mutex::new(None)),
            total_failures: Arc::new(AtomicU32::new(0)),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    /// Whether this device already belongs to a family.
    pub async fn is_configured(&self) -> Result<bool> {
        self.vault.exists(KEY_FAMILY_SECRET).await
    }

    /// The 32-byte TLS-style PSK for the secure transport.
    pub async fn psk(&self) -> Result<[u8; 32]> {
        let secret = self
            .vault
            .retrieve(KEY_FAMILY_SECRET)
            .await?
            .ok_or_else(|| Error::AuthFailed("device is not paired".into()))?;
        derive_psk(&secret)
    }

    /// Create (or reuse) the family secret and open a pairing window on
    /// `port`. Returns the PIN and QR payload to show the user.
    pub async fn create_family(&self, host: &str, port: u16) -> Result<PairingInvite> {
        if !self.vault.is_ready() {
            return Err(Error::Internal("secret vault not initialized".into()));
        }
        if self.vault.retrieve(KEY_FAMILY_SECRET).await?.is_none() {
            let mut secret = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut secret);
            self.vault.store(KEY_FAMILY_SECRET, &secret).await?;
            info!("family secret created");
        }

        self.cancel_pairing().await;
        let session = PairingSession::new();
        let invite_pin = session.pin.clone();
        let expires_at = session.expires_at;
        let nonce = hex::encode(session.nonce);
        *self.session.lock().unwrap() = Some(session);

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|e| Error::Network(format!("pairing bind: {e}")))?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?
            .port();

        let qr = QrPayload {
            host: host.to_string(),
            port: bound_port,
            nonce,
            expires: expires_at,
        };
        let qr_payload = BASE64.encode(serde_json::to_vec(&qr)?);

        let vault = self.vault.clone();
        let session = self.session.clone();
        let total_failures = self.total_failures.clone();
        let task = tokio::spawn(async move {
            initiator_loop(listener, vault, session, total_failures).await;
        });
        *self.listener.lock().await = Some(task);

        info!(port = bound_port, "pairing window open");
        Ok(PairingInvite {
            pin: invite_pin,
            qr_payload,
            expires_at,
            port: bound_port,
        })
    }

    /// Tear down the pairing window, if any.
    pub async fn cancel_pairing(&self) {
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
        }
        *self.session.lock().unwrap() = None;
    }

    pub fn pairing_active(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }

    /// Join an existing family using the PIN shown on the initiator.
    pub async fn join_family(&self, host: &str, port: u16, pin: &str) -> JoinOutcome {
        match self.join_family_inner(host, port, pin).await {
            Ok(outcome) => outcome,
            Err(Error::AuthFailed(_)) => JoinOutcome::InvalidPin,
            Err(Error::Network(e)) => {
                warn!(error = %e, "pairing network failure");
                JoinOutcome::NetworkError
            }
            Err(Error::Io(e)) => {
                warn!(error = %e, "pairing io failure");
                JoinOutcome::NetworkError
            }
            Err(e) => {
                warn!(error = %e, "pairing internal failure");
                JoinOutcome::InternalError
            }
        }
    }

    async fn join_family_inner(&self, host: &str, port: u16, pin: &str) -> Result<JoinOutcome> {
        if !self.vault.is_ready() {
            return Err(Error::Internal("secret vault not initialized".into()));
        }
        if self.is_configured().await? {
            return Ok(JoinOutcome::AlreadyConfigured);
        }

        let exchange = tokio::time::timeout(
            PAIRING_TIMEOUT,
            join_exchange(host, port, pin),
        )
        .await
        .map_err(|_| Error::Network("pairing timed out".into()))?;

        match exchange? {
            JoinExchangeResult::Secret(secret) => {
                self.vault.store(KEY_FAMILY_SECRET, &secret).await?;
                info!("joined family");
                Ok(JoinOutcome::Success)
            }
            JoinExchangeResult::Rejected(RejectReason::InvalidPin) => Ok(JoinOutcome::InvalidPin),
            JoinExchangeResult::Rejected(RejectReason::Expired) => Ok(JoinOutcome::Expired),
            JoinExchangeResult::Rejected(RejectReason::RateLimited) => Ok(JoinOutcome::RateLimited),
            JoinExchangeResult::Rejected(RejectReason::Internal) => Ok(JoinOutcome::InternalError),
        }
    }

    /// Leave the family: discard the shared secret.
    pub async fn reset(&self) -> Result<()> {
        self.cancel_pairing().await;
        self.vault.remove(KEY_FAMILY_SECRET).await
    }
}

/// `PSK = HKDF-SHA256(ikm = family_secret, salt = "familyvault-psk-v1",
/// info = "tls13-psk", L = 32)`.
pub fn derive_psk(family_secret: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(PSK_SALT), family_secret);
    let mut psk = [0u8; 32];
    hk.expand(PSK_INFO, &mut psk)
        .map_err(|_| Error::Internal("hkdf expand failed".into()))?;
    Ok(psk)
}

enum JoinExchangeResult {
    Secret(Vec<u8>),
    Rejected(RejectReason),
}

async fn join_exchange(host: &str, port: u16, pin: &str) -> Result<JoinExchangeResult> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::Network(format!("connect {host}:{port}: {e}")))?;

    let (exchange, msg_a) = JoinerExchange::start(pin);
    protocol::write_message(&mut stream, &PairingMessage::Start { spake_msg: msg_a }).await?;

    let challenge = match protocol::read_message(&mut stream).await? {
        PairingMessage::Challenge { spake_msg } => spake_msg,
        PairingMessage::Reject { reason } => return Ok(JoinExchangeResult::Rejected(reason)),
        _ => return Err(Error::Network("unexpected pairing message".into())),
    };
    let keys = exchange.finish(&challenge)?;

    protocol::write_message(
        &mut stream,
        &PairingMessage::Confirm {
            tag: keys.joiner_tag(),
        },
    )
    .await?;

    match protocol::read_message(&mut stream).await? {
        PairingMessage::Secret {
            tag,
            nonce,
            ciphertext,
        } => {
            if !keys.verify_tag(false, &tag) {
                return Err(Error::AuthFailed("initiator confirmation failed".into()));
            }
            let secret = keys.unwrap_secret(&nonce, &ciphertext)?;
            let _ = protocol::write_message(&mut stream, &PairingMessage::Done).await;
            Ok(JoinExchangeResult::Secret(secret))
        }
        PairingMessage::Reject { reason } => Ok(JoinExchangeResult::Rejected(reason)),
        _ => Err(Error::Network("unexpected pairing message".into())),
    }
}

/// Accept loop on the initiator. Ends when pairing succeeds, the PIN burns
/// out, or the task is aborted by `cancel_pairing`.
async fn initiator_loop(
    listener: TcpListener,
    vault: Arc<SecretVault>,
    session: Arc<Mutex<Option<PairingSession>>>,
    total_failures: Arc<AtomicU32>,
) {
    let mut last_attempt: HashMap<IpAddr, i64> = HashMap::new();

    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "pairing accept failed");
                break;
            }
        };

        // One attempt per second per remote address.
        let now = now_ts();
        let limited = last_attempt.get(&addr.ip()).is_some_and(|&t| t >= now);
        last_attempt.insert(addr.ip(), now);
        if limited {
            let _ = protocol::write_message(
                &mut stream,
                &PairingMessage::Reject {
                    reason: RejectReason::RateLimited,
                },
            )
            .await;
            continue;
        }

        let outcome = tokio::time::timeout(
            PAIRING_TIMEOUT,
            handle_attempt(&mut stream, &vault, &session, &total_failures),
        )
        .await;

        match outcome {
            Ok(Ok(true)) => {
                *session.lock().unwrap() = None;
                info!(peer = %addr, "pairing complete, window closed");
                break;
            }
            Ok(Ok(false)) => {
                if session.lock().unwrap().is_none() {
                    warn!("pairing window burned out");
                    break;
                }
            }
            Ok(Err(e)) => warn!(peer = %addr, error = %e, "pairing attempt failed"),
            Err(_) => warn!(peer = %addr, "pairing attempt timed out"),
        }
    }
}

/// One joiner attempt. `Ok(true)` means the secret was handed over.
async fn handle_attempt(
    stream: &mut TcpStream,
    vault: &Arc<SecretVault>,
    session: &Arc<Mutex<Option<PairingSession>>>,
    total_failures: &Arc<AtomicU32>,
) -> Result<bool> {
    // Snapshot the gate state under the lock, then run the exchange without it.
    let gate = {
        let guard = session.lock().unwrap();
        match guard.as_ref() {
            None => Some(RejectReason::Expired),
            Some(s) if s.is_expired() => Some(RejectReason::Expired),
            Some(s) if s.in_cooldown() => Some(RejectReason::RateLimited),
            Some(_) => None,
        }
    };
    if let Some(reason) = gate {
        protocol::write_message(stream, &PairingMessage::Reject { reason }).await?;
        if reason == RejectReason::Expired {
            *session.lock().unwrap() = None;
        }
        return Ok(false);
    }
    let pin = session
        .lock()
        .unwrap()
        .as_ref()
        .map(|s| s.pin.clone())
        .ok_or_else(|| Error::Internal("pairing session vanished".into()))?;

    let msg_a = match protocol::read_message(stream).await? {
        PairingMessage::Start { spake_msg } => spake_msg,
        _ => return Err(Error::Network("expected pairing start".into())),
    };

    let (exchange, msg_b) = InitiatorExchange::start(&pin);
    protocol::write_message(stream, &PairingMessage::Challenge { spake_msg: msg_b }).await?;

    let joiner_tag = match protocol::read_message(stream).await? {
        PairingMessage::Confirm { tag } => tag,
        _ => return Err(Error::Network("expected pairing confirm".into())),
    };

    let keys = exchange.finish(&msg_a)?;
    if !keys.verify_tag(true, &joiner_tag) {
        // Wrong PIN: count it, cool down, maybe burn the window.
        let burned = {
            let mut guard = session.lock().unwrap();
            match guard.as_mut() {
                Some(s) => {
                    let burned = s.record_failure();
                    if burned {
                        *guard = None;
                    }
                    burned
                }
                None => true,
            }
        };
        let totals = total_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if totals >= MAX_TOTAL_FAILURES {
            *session.lock().unwrap() = None;
        }
        warn!(burned, totals, "pairing attempt with wrong pin");
        protocol::write_message(
            stream,
            &PairingMessage::Reject {
                reason: RejectReason::InvalidPin,
            },
        )
        .await?;
        return Ok(false);
    }

    let secret = vault
        .retrieve(KEY_FAMILY_SECRET)
        .await?
        .ok_or_else(|| Error::Internal("family secret missing".into()))?;
    let (nonce, ciphertext) = keys.wrap_secret(&secret)?;
    protocol::write_message(
        stream,
        &PairingMessage::Secret {
            tag: keys.initiator_tag(),
            nonce,
            ciphertext,
        },
    )
    .await?;

    // Best-effort final ack; the secret is already out.
    let _ = protocol::read_message(stream).await;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ready_vault() -> Arc<SecretVault> {
        let vault = Arc::new(SecretVault::in_memory());
        vault.init().await.unwrap();
        vault
    }

    #[tokio::test]
    async fn psk_is_deterministic() {
        let secret = [7u8; 32];
        let a = derive_psk(&secret).unwrap();
        let b = derive_psk(&secret).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, derive_psk(&[8u8; 32]).unwrap());
    }

    #[tokio::test]
    async fn full_pairing_hands_over_the_secret() {
        let initiator = FamilyPairing::new(ready_vault().await);
        let invite = initiator.create_family("127.0.0.1", 0).await.unwrap();

        let joiner = FamilyPairing::new(ready_vault().await);
        let outcome = joiner
            .join_family("127.0.0.1", invite.port, &invite.pin)
            .await;
        assert_eq!(outcome, JoinOutcome::Success);

        assert_eq!(
            initiator.psk().await.unwrap(),
            joiner.psk().await.unwrap()
        );
    }

    #[tokio::test]
    async fn wrong_pin_is_rejected() {
        let initiator = FamilyPairing::new(ready_vault().await);
        let invite = initiator.create_family("127.0.0.1", 0).await.unwrap();

        let wrong_pin = if invite.pin == "000000" { "000001" } else { "000000" };
        let joiner = FamilyPairing::new(ready_vault().await);
        let outcome = joiner
            .join_family("127.0.0.1", invite.port, wrong_pin)
            .await;
        assert_eq!(outcome, JoinOutcome::InvalidPin);
        assert!(!joiner.is_configured().await.unwrap());
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let initiator = FamilyPairing::new(ready_vault().await);
        let invite = initiator.create_family("127.0.0.1", 0).await.unwrap();

        // Age the session past its TTL.
        if let Some(session) = initiator.session.lock().unwrap().as_mut() {
            session.expires_at = now_ts() - pin::SESSION_TTL_SECS;
        }

        let joiner = FamilyPairing::new(ready_vault().await);
        let outcome = joiner
            .join_family("127.0.0.1", invite.port, &invite.pin)
            .await;
        assert_eq!(outcome, JoinOutcome::Expired);
    }

    #[tokio::test]
    async fn joining_twice_reports_already_configured() {
        let initiator = FamilyPairing::new(ready_vault().await);
        let invite = initiator.create_family("127.0.0.1", 0).await.unwrap();

        let joiner = FamilyPairing::new(ready_vault().await);
        assert_eq!(
            joiner
                .join_family("127.0.0.1", invite.port, &invite.pin)
                .await,
            JoinOutcome::Success
        );
        // The window is closed and we are configured; a second join is
        // answered locally.
        assert_eq!(
            joiner.join_family("127.0.0.1", invite.port, &invite.pin).await,
            JoinOutcome::AlreadyConfigured
        );
    }

    #[tokio::test]
    async fn qr_payload_decodes() {
        let initiator = FamilyPairing::new(ready_vault().await);
        let invite = initiator.create_family("192.168.1.5", 0).await.unwrap();
        let raw = BASE64.decode(invite.qr_payload).unwrap();
        let qr: QrPayload = serde_json::from_slice(&raw).unwrap();
        assert_eq!(qr.host, "192.168.1.5");
        assert_eq!(qr.port, invite.port);
        assert_eq!(qr.expires, invite.expires_at);
        assert_eq!(qr.nonce.len(), 32);
        initiator.cancel_pairing().await;
    }
}
