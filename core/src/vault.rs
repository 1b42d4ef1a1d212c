//! Process-wide secret vault backed by the OS credential facility.
//!
//! The vault stores opaque byte blobs under string keys. The backing store is
//! abstract so tests run against an in-memory map; production uses the OS
//! keyring with hex-encoded values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use keyring::Entry;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

const KEYRING_SERVICE: &str = "FamilyVault";

/// Well-known vault keys.
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_DEVICE_NAME: &str = "device_name";
pub const KEY_FAMILY_SECRET: &str = "family_secret";

/// Vault key for a cloud-provider account token.
pub fn cloud_account_key(account_id: &str) -> String {
    format!("cloud_account_{account_id}")
}

/// Abstract keyed blob store.
pub trait SecretStore: Send + Sync {
    fn store(&self, key: &str, value: &[u8]) -> Result<()>;
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn remove(&self, key: &str) -> Result<()>;
    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.retrieve(key)?.is_some())
    }
}

/// OS keyring backend. Values are hex-encoded because some platform stores
/// reject non-UTF-8 passwords.
pub struct KeyringStore;

impl KeyringStore {
    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(KEYRING_SERVICE, key).map_err(|e| Error::Io(format!("keyring: {e}")))
    }
}

impl SecretStore for KeyringStore {
    fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entry(key)?
            .set_password(&hex::encode(value))
            .map_err(|e| Error::Io(format!("keyring store: {e}")))
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entry(key)?.get_password() {
            Ok(encoded) => hex::decode(&encoded)
                .map(Some)
                .map_err(|_| Error::Internal(format!("vault entry '{key}' is not hex"))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Io(format!("keyring retrieve: {e}"))),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::Io(format!("keyring remove: {e}"))),
        }
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: std::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl SecretStore for MemoryStore {
    fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Serialized facade over a [`SecretStore`] with a one-time readiness gate.
pub struct SecretVault {
    store: Box<dyn SecretStore>,
    lock: Mutex<()>,
    ready: AtomicBool,
}

impl SecretVault {
    pub fn new(store: Box<dyn SecretStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
            ready: AtomicBool::new(false),
        }
    }

    /// Vault over the OS keyring.
    pub fn system() -> Self {
        Self::new(Box::new(KeyringStore))
    }

    /// Vault over an in-memory map; used by tests.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::default()))
    }

    /// Probe the backing store once. Readiness stays false until this ran.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        // A read of any key proves the backend is reachable.
        self.store.retrieve(KEY_DEVICE_ID)?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn check_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::Internal("secret vault not initialized".into()))
        }
    }

    pub async fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_ready()?;
        let _guard = self.lock.lock().await;
        self.store.store(key, value)
    }

    pub async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_ready()?;
        let _guard = self.lock.lock().await;
        self.store.retrieve(key)
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.check_ready()?;
        let _guard = self.lock.lock().await;
        self.store.remove(key)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.check_ready()?;
        let _guard = self.lock.lock().await;
        self.store.exists(key)
    }

    /// String convenience shim over [`store`](Self::store).
    pub async fn store_string(&self, key: &str, value: &str) -> Result<()> {
        self.store(key, value.as_bytes()).await
    }

    /// String convenience shim over [`retrieve`](Self::retrieve).
    pub async fn retrieve_string(&self, key: &str) -> Result<Option<String>> {
        match self.retrieve(key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| Error::Internal(format!("vault entry '{key}' is not UTF-8"))),
            None => Ok(None),
        }
    }
}
