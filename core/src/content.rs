//! Background content indexer.
//!
//! A single worker drains a queue of files that have no extracted text yet,
//! runs the extractor registry on each and writes the result together with
//! the FTS content column in one transaction. Individual failures are
//! counted and skipped; they never abort the worker.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sqlx::Row;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{statement, Database};
use crate::error::{Error, Result};
use crate::extract::ExtractorRegistry;
use crate::index::{ScanProgress, ScanProgressFn};
use crate::types::now_ts;

#[derive(Debug, Clone)]
struct WorkItem {
    file_id: i64,
    absolute_path: PathBuf,
    relative_path: String,
    mime_type: String,
}

/// Point-in-time snapshot of the worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentStatus {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
    pub running: bool,
    pub current_file: Option<String>,
}

struct Inner {
    queue: Mutex<VecDeque<WorkItem>>,
    running: AtomicBool,
    stop: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    total: AtomicU64,
    current: Mutex<Option<String>>,
}

pub struct ContentIndexer {
    db: Arc<Database>,
    registry: Arc<ExtractorRegistry>,
    inner: Arc<Inner>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ContentIndexer {
    pub fn new(db: Arc<Database>, registry: Arc<ExtractorRegistry>) -> Self {
        Self {
            db,
            registry,
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                total: AtomicU64::new(0),
                current: Mutex::new(None),
            }),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// Queue every un-extracted file the registry can handle and start the
    /// worker. Starting an already-running indexer is a no-op.
    pub async fn start(&self, progress: Option<ScanProgressFn>) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop.store(false, Ordering::SeqCst);
        self.inner.processed.store(0, Ordering::SeqCst);
        self.inner.failed.store(0, Ordering::SeqCst);

        let items = self.pending_items().await?;
        info!(pending = items.len(), "content indexer starting");
        self.inner.total.store(items.len() as u64, Ordering::SeqCst);
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.clear();
            queue.extend(items);
        }

        let db = self.db.clone();
        let registry = self.registry.clone();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            worker_loop(db, registry, inner, progress).await;
        });
        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    /// Signal the worker to stop; with `wait` the call joins it.
    pub async fn stop(&self, wait: bool) {
        self.inner.stop.store(true, Ordering::SeqCst);
        if wait {
            if let Some(handle) = self.worker.lock().await.take() {
                let _ = handle.await;
            }
        }
    }

    /// Block until the queue drains (test and CLI convenience).
    pub async fn wait_until_idle(&self) {
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ContentStatus {
        ContentStatus {
            pending: self.inner.queue.lock().unwrap().len() as u64,
            processed: self.inner.processed.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
            running: self.is_running(),
            current_file: self.inner.current.lock().unwrap().clone(),
        }
    }

    /// Extract one file immediately on the caller's task.
    pub async fn process_file(&self, file_id: i64) -> Result<bool> {
        let row = self
            .db
            .query_optional(
                "SELECT f.id, f.relative_path, f.mime_type, fo.path AS folder_path
                 FROM files f JOIN folders fo ON fo.id = f.folder_id
                 WHERE f.id = ? AND f.is_remote = 0",
                &[file_id.into()],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;

        let item = WorkItem {
            file_id,
            relative_path: row.try_get("relative_path")?,
            mime_type: row.try_get("mime_type")?,
            absolute_path: PathBuf::from(row.try_get::<String, _>("folder_path")?)
                .join(row.try_get::<String, _>("relative_path")?),
        };
        process_item(&self.db, &self.registry, &item).await
    }

    /// Wipe all extracted content and queue everything again.
    pub async fn reindex_all(&self, progress: Option<ScanProgressFn>) -> Result<()> {
        self.stop(true).await;
        self.inner.running.store(false, Ordering::SeqCst);

        let mut tx = self.db.transaction().await?;
        statement("DELETE FROM file_contents", &[])
            .execute(&mut *tx)
            .await?;
        statement("UPDATE files_fts SET content = ''", &[])
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.start(progress).await
    }

    async fn pending_items(&self) -> Result<Vec<WorkItem>> {
        let rows = self
            .db
            .query_all(
                "SELECT f.id, f.relative_path, f.mime_type, fo.path AS folder_path
                 FROM files f
                 JOIN folders fo ON fo.id = f.folder_id
                 LEFT JOIN file_contents c ON c.file_id = f.id
                 WHERE c.file_id IS NULL AND f.is_remote = 0
                 ORDER BY f.id",
                &[],
            )
            .await?;

        let mut items = Vec::new();
        for row in rows {
            let mime_type: String = row.try_get("mime_type")?;
            if !self.registry.handles(&mime_type) {
                continue;
            }
            let relative_path: String = row.try_get("relative_path")?;
            items.push(WorkItem {
                file_id: row.try_get("id")?,
                absolute_path: PathBuf::from(row.try_get::<String, _>("folder_path")?)
                    .join(&relative_path),
                relative_path,
                mime_type,
            });
        }
        Ok(items)
    }
}

async fn worker_loop(
    db: Arc<Database>,
    registry: Arc<ExtractorRegistry>,
    inner: Arc<Inner>,
    progress: Option<ScanProgressFn>,
) {
    loop {
        if inner.stop.load(Ordering::SeqCst) {
            break;
        }
        let item = inner.queue.lock().unwrap().pop_front();
        let Some(item) = item else { break };

        *inner.current.lock().unwrap() = Some(item.relative_path.clone());

        match process_item(&db, &registry, &item).await {
            Ok(true) => {
                inner.processed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(false) => {
                inner.failed.fetch_add(1, Ordering::SeqCst);
                debug!(path = %item.relative_path, "no text extracted");
            }
            Err(e) => {
                inner.failed.fetch_add(1, Ordering::SeqCst);
                warn!(path = %item.relative_path, error = %e, "content indexing failed");
            }
        }

        if let Some(cb) = &progress {
            cb(ScanProgress {
                processed: inner.processed.load(Ordering::SeqCst)
                    + inner.failed.load(Ordering::SeqCst),
                total: inner.total.load(Ordering::SeqCst),
                current_path: item.relative_path.clone(),
            });
        }
    }

    *inner.current.lock().unwrap() = None;
    inner.running.store(false, Ordering::SeqCst);
    info!(
        processed = inner.processed.load(Ordering::SeqCst),
        failed = inner.failed.load(Ordering::SeqCst),
        "content indexer idle"
    );
}

/// Extract one file and persist text plus FTS column atomically.
async fn process_item(
    db: &Arc<Database>,
    registry: &Arc<ExtractorRegistry>,
    item: &WorkItem,
) -> Result<bool> {
    let registry = registry.clone();
    let path = item.absolute_path.clone();
    let mime_type = item.mime_type.clone();
    let extracted = tokio::task::spawn_blocking(move || registry.extract(&path, &mime_type))
        .await
        .map_err(|e| Error::Internal(format!("extractor task panicked: {e}")))?;

    let Some(result) = extracted else {
        return Ok(false);
    };

    let mut tx = db.transaction().await?;
    statement(
        "INSERT INTO file_contents (file_id, content, method, language, extracted_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (file_id) DO UPDATE SET
            content = excluded.content, method = excluded.method,
            language = excluded.language, extracted_at = excluded.extracted_at",
        &[
            item.file_id.into(),
            (&result.text).into(),
            (&result.method).into(),
            (&result.language).into(),
            now_ts().into(),
        ],
    )
    .execute(&mut *tx)
    .await?;
    statement(
        "UPDATE files_fts SET content = ? WHERE rowid = ?",
        &[(&result.text).into(), item.file_id.into()],
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;
    use crate::index::IndexManager;
    use crate::types::{DeviceType, Visibility};
    use std::fs;

    async fn indexed_dir(files: &[(&str, &str)]) -> (Arc<Database>, tempfile::TempDir) {
        let db = Database::open_in_memory().await.unwrap();
        let manager = IndexManager::new(
            db.clone(),
            DeviceIdentity {
                device_id: "d".into(),
                device_name: "t".into(),
                device_type: DeviceType::Desktop,
            },
        );
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            fs::write(dir.path().join(name), body).unwrap();
        }
        let folder_id = manager
            .add_folder(dir.path(), "docs", Visibility::Family)
            .await
            .unwrap();
        manager.scan_folder(folder_id, None).await.unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn start_extracts_all_pending_text() {
        let (db, _dir) =
            indexed_dir(&[("a.txt", "alpha words"), ("b.txt", "beta words")]).await;
        let indexer = ContentIndexer::new(db.clone(), Arc::new(ExtractorRegistry::with_defaults()));
        indexer.start(None).await.unwrap();
        indexer.wait_until_idle().await;

        let status = indexer.status();
        assert!(!status.running);
        assert_eq!(status.processed, 2);
        assert_eq!(status.failed, 0);

        let row = db
            .query_one(
                "SELECT COUNT(*) FROM files_fts WHERE files_fts MATCH ?",
                &["alpha".into()],
            )
            .await
            .unwrap();
        let hits: i64 = row.try_get(0).unwrap();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn process_file_is_synchronous() {
        let (db, _dir) = indexed_dir(&[("solo.txt", "needle in here")]).await;
        let indexer = ContentIndexer::new(db.clone(), Arc::new(ExtractorRegistry::with_defaults()));

        let row = db.query_one("SELECT id FROM files", &[]).await.unwrap();
        let file_id: i64 = row.try_get(0).unwrap();
        assert!(indexer.process_file(file_id).await.unwrap());

        let row = db
            .query_one("SELECT content FROM file_contents", &[])
            .await
            .unwrap();
        let content: String = row.try_get(0).unwrap();
        assert_eq!(content, "needle in here");
    }

    #[tokio::test]
    async fn reindex_wipes_and_requeues() {
        let (db, _dir) = indexed_dir(&[("a.txt", "first pass")]).await;
        let indexer = ContentIndexer::new(db.clone(), Arc::new(ExtractorRegistry::with_defaults()));
        indexer.start(None).await.unwrap();
        indexer.wait_until_idle().await;

        indexer.reindex_all(None).await.unwrap();
        indexer.wait_until_idle().await;

        let row = db
            .query_one("SELECT COUNT(*) FROM file_contents", &[])
            .await
            .unwrap();
        let n: i64 = row.try_get(0).unwrap();
        assert_eq!(n, 1);
    }
}
