//! Local device identity.
//!
//! The device id is a UUID minted on first use and persisted in the secret
//! vault so it survives reinstalls of the database.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::types::DeviceType;
use crate::vault::{SecretVault, KEY_DEVICE_ID, KEY_DEVICE_NAME};

/// Identity shared by discovery, pairing and the secure transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
}

impl DeviceIdentity {
    /// Load the identity from the vault, minting and persisting a fresh UUID
    /// (and the configured name) on first use.
    pub async fn load_or_create(vault: &Arc<SecretVault>, default_name: &str) -> Result<Self> {
        let device_id = match vault.retrieve_string(KEY_DEVICE_ID).await? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                vault.store_string(KEY_DEVICE_ID, &id).await?;
                id
            }
        };
        let device_name = match vault.retrieve_string(KEY_DEVICE_NAME).await? {
            Some(name) => name,
            None => {
                vault.store_string(KEY_DEVICE_NAME, default_name).await?;
                default_name.to_string()
            }
        };
        Ok(Self {
            device_id,
            device_name,
            device_type: detect_device_type(),
        })
    }

    /// Rename this device, persisting the new name.
    pub async fn rename(&mut self, vault: &Arc<SecretVault>, name: &str) -> Result<()> {
        vault.store_string(KEY_DEVICE_NAME, name).await?;
        self.device_name = name.to_string();
        Ok(())
    }
}

fn detect_device_type() -> DeviceType {
    if cfg!(any(target_os = "android", target_os = "ios")) {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_is_stable_across_loads() {
        let vault = Arc::new(SecretVault::in_memory());
        vault.init().await.unwrap();

        let first = DeviceIdentity::load_or_create(&vault, "Kitchen PC")
            .await
            .unwrap();
        let second = DeviceIdentity::load_or_create(&vault, "ignored")
            .await
            .unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(second.device_name, "Kitchen PC");
        Uuid::parse_str(&first.device_id).unwrap();
    }
}
