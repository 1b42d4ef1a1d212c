//! Pairing PIN and session state.

use rand::RngCore;

use crate::types::now_ts;

/// Pairing sessions live for five minutes.
pub const SESSION_TTL_SECS: i64 = 5 * 60;

/// Failed attempts allowed against one PIN.
pub const MAX_PIN_ATTEMPTS: u32 = 3;

/// Cooldown after a failed attempt.
pub const FAILURE_COOLDOWN_SECS: i64 = 30;

/// Total failures before pairing is cancelled outright.
pub const MAX_TOTAL_FAILURES: u32 = 10;

/// Six decimal digits from the OS RNG. Rejection sampling keeps the
/// distribution uniform over 000000..=999999.
pub fn generate_pin() -> String {
    // Largest multiple of 10^6 representable in u32.
    const LIMIT: u32 = 4_294_000_000;
    loop {
        let mut bytes = [0u8; 4];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let value = u32::from_be_bytes(bytes);
        if value < LIMIT {
            return format!("{:06}", value % 1_000_000);
        }
    }
}

/// 16-byte session nonce.
pub fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// In-memory state of one pairing window on the initiator.
#[derive(Debug, Clone)]
pub struct PairingSession {
    pub pin: String,
    pub nonce: [u8; 16],
    pub expires_at: i64,
    pub attempts: u32,
    pub cooldown_until: i64,
}

impl PairingSession {
    pub fn new() -> Self {
        Self {
            pin: generate_pin(),
            nonce: generate_nonce(),
            expires_at: now_ts() + SESSION_TTL_SECS,
            attempts: 0,
            cooldown_until: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        now_ts() > self.expires_at
    }

    pub fn in_cooldown(&self) -> bool {
        now_ts() < self.cooldown_until
    }

    /// Record a failed attempt; returns true when the PIN is burned.
    pub fn record_failure(&mut self) -> bool {
        self.attempts += 1;
        self.cooldown_until = now_ts() + FAILURE_COOLDOWN_SECS;
        self.attempts >= MAX_PIN_ATTEMPTS
    }
}

impl Default for PairingSession {
    fn default() -> Self {
        Self::new()
    }
}
