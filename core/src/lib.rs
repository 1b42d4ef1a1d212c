//! FamilyVault core.
//!
//! A per-device daemon core that indexes a household's local files for
//! full-text search and shares file *metadata* with trusted peer devices on
//! the LAN, streaming file *bytes* on demand. The UI layer sits on top of
//! [`Core`] and the event bus; everything else lives here.

pub mod config;
pub mod content;
pub mod db;
pub mod device;
pub mod duplicates;
pub mod error;
pub mod events;
pub mod extract;
pub mod ffi;
pub mod index;
pub mod mime;
pub mod net;
pub mod scanner;
pub mod search;
pub mod tags;
pub mod types;
pub mod vault;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use events::{EventBus, NetworkEvent};
pub use types::{ContentType, DeviceType, NetworkState, SortBy, TagSource, Visibility};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use content::ContentIndexer;
use db::Database;
use device::DeviceIdentity;
use duplicates::DuplicateFinder;
use extract::{ExtractorRegistry, OfficeExtractor, PdfExtractor, PlainTextExtractor};
use index::IndexManager;
use net::pairing::FamilyPairing;
use net::transfer::{FileResolver, ServedFile};
use net::NetworkManager;
use search::SearchEngine;
use tags::TagManager;
use vault::SecretVault;

/// Serves local files to peers by looking them up in the index. The
/// visibility carried in [`ServedFile`] is the *effective* one, so the
/// transfer layer can enforce the Family-only gate.
pub struct IndexFileResolver {
    index: IndexManager,
}

impl IndexFileResolver {
    pub fn new(index: IndexManager) -> Self {
        Self { index }
    }
}

#[async_trait]
impl FileResolver for IndexFileResolver {
    async fn resolve(&self, file_id: i64) -> Option<ServedFile> {
        let record = self.index.get_file(file_id).await.ok()?;
        if record.is_remote {
            return None;
        }
        let folder = self.index.get_folder(record.folder_id).await.ok()?;
        let visibility = self.index.effective_visibility_of(file_id).await.ok()?;
        Some(ServedFile {
            path: folder.path.join(&record.relative_path),
            size: record.size.max(0) as u64,
            checksum: record.checksum,
            visibility,
        })
    }
}

/// The assembled core: one database, one vault, one of each manager.
pub struct Core {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub vault: Arc<SecretVault>,
    pub identity: DeviceIdentity,
    pub index: IndexManager,
    pub content: Arc<ContentIndexer>,
    pub search: SearchEngine,
    pub tags: TagManager,
    pub duplicates: DuplicateFinder,
    pub pairing: Arc<FamilyPairing>,
    pub events: Arc<EventBus>,
    pub network: Arc<NetworkManager>,
}

impl Core {
    /// Open the core against the OS keyring.
    pub async fn open(config: AppConfig) -> Result<Core> {
        Self::open_with_vault(config, Arc::new(SecretVault::system())).await
    }

    /// Open the core with an explicit vault backend (tests use the in-memory
    /// one).
    pub async fn open_with_vault(config: AppConfig, vault: Arc<SecretVault>) -> Result<Core> {
        config.ensure_directories()?;
        vault.init().await?;

        let identity = DeviceIdentity::load_or_create(&vault, &config.device_name).await?;
        info!(device_id = %identity.device_id, name = %identity.device_name, "core starting");

        let db = Database::open(&config.database_path()).await?;

        let mut registry = ExtractorRegistry::new();
        registry.register(Box::new(PlainTextExtractor::new(
            config.index.max_extract_bytes,
        )));
        registry.register(Box::new(PdfExtractor::new(config.index.max_pdf_pages)));
        registry.register(Box::new(OfficeExtractor));
        let registry = Arc::new(registry);

        let index = IndexManager::new(db.clone(), identity.clone());
        let content = Arc::new(ContentIndexer::new(db.clone(), registry));
        let search = SearchEngine::new(db.clone());
        let tags = TagManager::new(db.clone());
        let duplicates = DuplicateFinder::new(db.clone());
        let pairing = Arc::new(FamilyPairing::new(vault.clone()));
        let events = Arc::new(EventBus::default());

        let network = Arc::new(NetworkManager::new(
            identity.clone(),
            config.ports.clone(),
            pairing.clone(),
            events.clone(),
        ));
        network.bind_database(db.clone());
        network.bind_cache(
            config.cache_dir(),
            Arc::new(IndexFileResolver::new(index.clone())),
        );

        Ok(Core {
            config,
            db,
            vault,
            identity,
            index,
            content,
            search,
            tags,
            duplicates,
            pairing,
            events,
            network,
        })
    }

    /// Stop workers and release the database. Fails with `Busy` if some
    /// externally held handle still references it.
    pub async fn shutdown(self) -> Result<()> {
        self.network.stop().await;
        self.content.stop(true).await;
        self.pairing.cancel_pairing().await;

        let Core {
            db,
            index,
            content,
            search,
            tags,
            duplicates,
            network,
            pairing,
            events,
            ..
        } = self;
        drop(index);
        drop(content);
        drop(search);
        drop(tags);
        drop(duplicates);
        drop(network);
        drop(pairing);
        drop(events);

        // Aborted background tasks release their references asynchronously;
        // give them a few scheduling rounds before declaring Busy.
        for _ in 0..20 {
            match Database::close(&db).await {
                Ok(()) => {
                    info!("core shut down");
                    return Ok(());
                }
                Err(Error::Busy(_)) => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Database::close(&db).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn core_opens_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default_with_dir(dir.path().to_path_buf());
        let vault = Arc::new(SecretVault::in_memory());
        let core = Core::open_with_vault(config, vault).await.unwrap();

        assert!(!core.identity.device_id.is_empty());
        assert!(core.network.sync_manager().is_some());
        assert!(core.network.file_access().is_some());

        core.shutdown().await.unwrap();
    }
}
