//! File index management.
//!
//! Owns the `folders`/`files` tables and the ingestion pipeline: driving the
//! scanner, upserting records, invalidating stale content, writing deletion
//! tombstones and keeping folder statistics current.

pub mod stats;

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::TryStreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{info, warn};

use crate::db::{statement, Database, Value};
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::mime;
use crate::scanner::{self, ScannedEntry};
use crate::types::{now_ts, ContentType, Visibility};

/// Tombstones older than this may be pruned.
pub const TOMBSTONE_TTL_SECS: i64 = 30 * 24 * 3600;

const MIME_SNIFF_BYTES: usize = 8192;

/// One row of the `files` table.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    pub folder_id: i64,
    pub relative_path: String,
    pub name: String,
    pub extension: String,
    pub size: i64,
    pub mime_type: String,
    pub content_type: ContentType,
    pub checksum: Option<String>,
    pub created_at: Option<i64>,
    pub modified_at: i64,
    pub indexed_at: i64,
    /// `None` inherits the folder default.
    pub visibility: Option<Visibility>,
    pub source_device_id: Option<String>,
    pub is_remote: bool,
    pub sync_version: i64,
    pub last_modified_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FolderRecord {
    pub id: i64,
    pub path: PathBuf,
    pub name: String,
    pub enabled: bool,
    pub last_scan_at: Option<i64>,
    pub file_count: i64,
    pub total_size: i64,
    pub default_visibility: Visibility,
}

/// EXIF-style metadata for an image file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub taken_at: Option<i64>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub orientation: Option<i64>,
}

/// External metadata source for image files. EXIF parsing lives outside the
/// core; the default source yields nothing.
pub trait ImageMetadataSource: Send + Sync {
    fn read(&self, path: &Path) -> Option<ImageMetadata>;
}

pub struct NoopImageMetadataSource;

impl ImageMetadataSource for NoopImageMetadataSource {
    fn read(&self, _path: &Path) -> Option<ImageMetadata> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub processed: u64,
    pub total: u64,
    pub current_path: String,
}

pub type ScanProgressFn = Arc<dyn Fn(ScanProgress) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub scanned: u64,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    pub skipped: u64,
}

#[derive(Clone)]
pub struct IndexManager {
    db: Arc<Database>,
    identity: DeviceIdentity,
    image_source: Arc<dyn ImageMetadataSource>,
    active_scans: Arc<Mutex<HashSet<i64>>>,
    stop: Arc<AtomicBool>,
}

impl IndexManager {
    pub fn new(db: Arc<Database>, identity: DeviceIdentity) -> Self {
        Self {
            db,
            identity,
            image_source: Arc::new(NoopImageMetadataSource),
            active_scans: Arc::new(Mutex::new(HashSet::new())),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_image_source(mut self, source: Arc<dyn ImageMetadataSource>) -> Self {
        self.image_source = source;
        self
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    // ---- folders ---------------------------------------------------------

    pub async fn add_folder(
        &self,
        path: &Path,
        name: &str,
        visibility: Visibility,
    ) -> Result<i64> {
        let path_text = path.to_string_lossy().into_owned();
        let existing = self
            .db
            .query_optional("SELECT id FROM folders WHERE path = ?", &[(&path_text).into()])
            .await?;
        if existing.is_some() {
            return Err(Error::AlreadyExists(format!("folder {path_text}")));
        }
        self.db
            .execute(
                "INSERT INTO folders (path, name, default_visibility) VALUES (?, ?, ?)",
                &[path_text.into(), name.into(), visibility.as_i32().into()],
            )
            .await?;
        self.db.last_insert_id().await
    }

    /// Remove a folder; files, FTS rows, tags and content cascade away.
    pub async fn remove_folder(&self, folder_id: i64) -> Result<()> {
        let affected = self
            .db
            .execute("DELETE FROM folders WHERE id = ?", &[folder_id.into()])
            .await?;
        if affected == 0 {
            return Err(Error::NotFound(format!("folder {folder_id}")));
        }
        Ok(())
    }

    pub async fn get_folder(&self, folder_id: i64) -> Result<FolderRecord> {
        let row = self
            .db
            .query_optional("SELECT * FROM folders WHERE id = ?", &[folder_id.into()])
            .await?
            .ok_or_else(|| Error::NotFound(format!("folder {folder_id}")))?;
        folder_from_row(&row)
    }

    pub async fn list_folders(&self) -> Result<Vec<FolderRecord>> {
        let rows = self
            .db
            .query_all("SELECT * FROM folders ORDER BY name COLLATE NOCASE", &[])
            .await?;
        rows.iter().map(folder_from_row).collect()
    }

    pub async fn set_folder_visibility(
        &self,
        folder_id: i64,
        visibility: Visibility,
    ) -> Result<()> {
        let affected = self
            .db
            .execute(
                "UPDATE folders SET default_visibility = ? WHERE id = ?",
                &[visibility.as_i32().into(), folder_id.into()],
            )
            .await?;
        if affected == 0 {
            return Err(Error::NotFound(format!("folder {folder_id}")));
        }
        Ok(())
    }

    pub async fn set_folder_enabled(&self, folder_id: i64, enabled: bool) -> Result<()> {
        let affected = self
            .db
            .execute(
                "UPDATE folders SET enabled = ? WHERE id = ?",
                &[enabled.into(), folder_id.into()],
            )
            .await?;
        if affected == 0 {
            return Err(Error::NotFound(format!("folder {folder_id}")));
        }
        Ok(())
    }

    // ---- scanning --------------------------------------------------------

    /// Scan one folder. At most one scan per folder runs at a time; a second
    /// request while one is in flight fails with `Busy`. Progress events are
    /// emitted from the scan worker, never from the caller.
    pub async fn scan_folder(
        &self,
        folder_id: i64,
        progress: Option<ScanProgressFn>,
    ) -> Result<ScanSummary> {
        {
            let mut active = self.active_scans.lock().unwrap();
            if !active.insert(folder_id) {
                return Err(Error::Busy(format!("folder {folder_id} is already scanning")));
            }
            if active.len() == 1 {
                self.stop.store(false, Ordering::SeqCst);
            }
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let result = manager.scan_folder_inner(folder_id, progress).await;
            manager.active_scans.lock().unwrap().remove(&folder_id);
            result
        });
        handle
            .await
            .map_err(|e| Error::Internal(format!("scan task panicked: {e}")))?
    }

    /// Scan every enabled folder sequentially.
    pub async fn scan_all(&self, progress: Option<ScanProgressFn>) -> Result<ScanSummary> {
        let folders = self.list_folders().await?;
        let mut total = ScanSummary::default();
        for folder in folders.into_iter().filter(|f| f.enabled) {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match self.scan_folder(folder.id, progress.clone()).await {
                Ok(summary) => {
                    total.scanned += summary.scanned;
                    total.added += summary.added;
                    total.updated += summary.updated;
                    total.removed += summary.removed;
                    total.skipped += summary.skipped;
                }
                Err(Error::Busy(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Ask all in-flight scans to stop at the next entry boundary.
    pub fn stop_scans(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    async fn scan_folder_inner(
        &self,
        folder_id: i64,
        progress: Option<ScanProgressFn>,
    ) -> Result<ScanSummary> {
        let folder = self.get_folder(folder_id).await?;
        let root = folder.path.clone();
        let stop = self.stop.clone();

        let entries: Vec<ScannedEntry> =
            tokio::task::spawn_blocking(move || scanner::scan(&root, stop).collect())
                .await
                .map_err(|e| Error::Internal(format!("scanner task panicked: {e}")))?;

        // Stream the prior state; nothing else touches the connection while
        // this drains.
        let mut existing: HashMap<String, (i64, i64, i64)> = HashMap::new();
        {
            let params = [Value::from(folder_id)];
            let mut rows = self.db.query(
                "SELECT id, relative_path, size, modified_at FROM files
                 WHERE folder_id = ? AND is_remote = 0",
                &params,
            );
            while let Some(row) = rows.try_next().await? {
                existing.insert(
                    row.try_get("relative_path")?,
                    (
                        row.try_get("id")?,
                        row.try_get("size")?,
                        row.try_get("modified_at")?,
                    ),
                );
            }
        }

        let total = entries.len() as u64;
        let mut summary = ScanSummary::default();
        let mut seen: HashSet<String> = HashSet::new();

        for entry in entries {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            summary.scanned += 1;
            seen.insert(entry.relative_path.clone());

            match existing.get(&entry.relative_path) {
                Some(&(_, size, modified)) if size == entry.size && modified == entry.modified_at => {
                    summary.skipped += 1;
                }
                Some(&(file_id, _, _)) => {
                    if let Err(e) = self.update_entry(file_id, &entry).await {
                        warn!(path = %entry.absolute_path.display(), error = %e, "upsert failed");
                    } else {
                        summary.updated += 1;
                    }
                }
                None => {
                    if let Err(e) = self.insert_entry(&folder, &entry).await {
                        warn!(path = %entry.absolute_path.display(), error = %e, "insert failed");
                    } else {
                        summary.added += 1;
                    }
                }
            }

            if let Some(cb) = &progress {
                cb(ScanProgress {
                    processed: summary.scanned,
                    total,
                    current_path: entry.relative_path.clone(),
                });
            }
        }

        // Files that vanished from disk since the last scan.
        if !self.stop.load(Ordering::SeqCst) {
            for (relative_path, (file_id, _, _)) in existing {
                if !seen.contains(&relative_path) {
                    match self.delete_file_row(file_id).await {
                        Ok(()) => summary.removed += 1,
                        Err(e) => {
                            warn!(file_id, error = %e, "orphan removal failed")
                        }
                    }
                }
            }
        }

        self.refresh_folder_stats(folder_id).await?;
        info!(
            folder_id,
            scanned = summary.scanned,
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            "scan finished"
        );
        Ok(summary)
    }

    async fn insert_entry(&self, folder: &FolderRecord, entry: &ScannedEntry) -> Result<()> {
        let mime_type = sniff_mime(entry);
        let content_type = mime::content_type_for(&mime_type);
        let family = folder.default_visibility == Visibility::Family;

        let mut tx = self.db.transaction().await?;
        let (sync_version, modified_by) = if family {
            (
                next_sync_version(&mut tx).await?,
                Some(self.identity.device_id.clone()),
            )
        } else {
            (0, None)
        };

        statement(
            "INSERT INTO files (folder_id, relative_path, name, extension, size, mime_type,
                content_type, created_at, modified_at, indexed_at, sync_version, last_modified_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &[
                folder.id.into(),
                (&entry.relative_path).into(),
                (&entry.name).into(),
                (&entry.extension).into(),
                entry.size.into(),
                (&mime_type).into(),
                content_type.as_i32().into(),
                entry.created_at.into(),
                entry.modified_at.into(),
                now_ts().into(),
                sync_version.into(),
                modified_by.into(),
            ],
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if content_type == ContentType::Image {
            self.upsert_image_metadata_from_disk(&entry.absolute_path)
                .await?;
        }
        Ok(())
    }

    /// A changed file invalidates its checksum and extracted content; the FTS
    /// content column goes empty until the content indexer revisits it.
    async fn update_entry(&self, file_id: i64, entry: &ScannedEntry) -> Result<()> {
        let mime_type = sniff_mime(entry);
        let content_type = mime::content_type_for(&mime_type);
        let family = self.effective_visibility_of(file_id).await? == Visibility::Family;

        let mut tx = self.db.transaction().await?;
        let (sync_version, modified_by) = if family {
            (
                Some(next_sync_version(&mut tx).await?),
                Some(self.identity.device_id.clone()),
            )
        } else {
            (None, None)
        };

        statement(
            "UPDATE files SET size = ?, mime_type = ?, content_type = ?, created_at = ?,
                modified_at = ?, indexed_at = ?, checksum = NULL,
                sync_version = COALESCE(?, sync_version),
                last_modified_by = COALESCE(?, last_modified_by)
             WHERE id = ?",
            &[
                entry.size.into(),
                (&mime_type).into(),
                content_type.as_i32().into(),
                entry.created_at.into(),
                entry.modified_at.into(),
                now_ts().into(),
                sync_version.into(),
                modified_by.into(),
                file_id.into(),
            ],
        )
        .execute(&mut *tx)
        .await?;

        statement("DELETE FROM file_contents WHERE file_id = ?", &[file_id.into()])
            .execute(&mut *tx)
            .await?;
        statement("UPDATE files_fts SET content = '' WHERE rowid = ?", &[file_id.into()])
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if content_type == ContentType::Image {
            self.upsert_image_metadata_from_disk(&entry.absolute_path)
                .await?;
        }
        Ok(())
    }

    async fn upsert_image_metadata_from_disk(&self, path: &Path) -> Result<()> {
        let Some(meta) = self.image_source.read(path) else {
            return Ok(());
        };
        let row = self
            .db
            .query_optional(
                "SELECT f.id FROM files f JOIN folders fo ON fo.id = f.folder_id
                 WHERE fo.path || '/' || f.relative_path = ?",
                &[path.to_string_lossy().into_owned().into()],
            )
            .await?;
        let Some(row) = row else { return Ok(()) };
        let file_id: i64 = row.try_get(0)?;
        self.set_image_metadata(file_id, &meta).await
    }

    pub async fn set_image_metadata(&self, file_id: i64, meta: &ImageMetadata) -> Result<()> {
        self.db
            .execute(
                "INSERT INTO image_metadata (file_id, width, height, taken_at, camera_make,
                    camera_model, latitude, longitude, orientation)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (file_id) DO UPDATE SET
                    width = excluded.width, height = excluded.height,
                    taken_at = excluded.taken_at, camera_make = excluded.camera_make,
                    camera_model = excluded.camera_model, latitude = excluded.latitude,
                    longitude = excluded.longitude, orientation = excluded.orientation",
                &[
                    file_id.into(),
                    meta.width.into(),
                    meta.height.into(),
                    meta.taken_at.into(),
                    meta.camera_make.as_deref().into(),
                    meta.camera_model.as_deref().into(),
                    meta.latitude.into(),
                    meta.longitude.into(),
                    meta.orientation.into(),
                ],
            )
            .await?;
        Ok(())
    }

    // ---- file access -----------------------------------------------------

    pub async fn get_file(&self, file_id: i64) -> Result<FileRecord> {
        let row = self
            .db
            .query_optional("SELECT * FROM files WHERE id = ?", &[file_id.into()])
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        file_from_row(&row)
    }

    pub async fn get_recent(&self, limit: i64) -> Result<Vec<FileRecord>> {
        if limit <= 0 {
            return Err(Error::InvalidArgument("limit must be positive".into()));
        }
        let rows = self
            .db
            .query_all(
                "SELECT * FROM files ORDER BY indexed_at DESC, id DESC LIMIT ?",
                &[limit.into()],
            )
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn get_by_folder(
        &self,
        folder_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FileRecord>> {
        if limit <= 0 || offset < 0 {
            return Err(Error::InvalidArgument("bad limit/offset".into()));
        }
        let rows = self
            .db
            .query_all(
                "SELECT * FROM files WHERE folder_id = ?
                 ORDER BY relative_path LIMIT ? OFFSET ?",
                &[folder_id.into(), limit.into(), offset.into()],
            )
            .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn effective_visibility_of(&self, file_id: i64) -> Result<Visibility> {
        let row = self
            .db
            .query_optional(
                "SELECT COALESCE(f.visibility, fo.default_visibility) AS vis
                 FROM files f JOIN folders fo ON fo.id = f.folder_id WHERE f.id = ?",
                &[file_id.into()],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        Ok(Visibility::from_i32(row.try_get("vis")?))
    }

    pub async fn set_file_visibility(
        &self,
        file_id: i64,
        visibility: Option<Visibility>,
    ) -> Result<()> {
        let record = self.get_file(file_id).await?;
        let mut tx = self.db.transaction().await?;
        let (sync_version, modified_by) = if record.is_remote {
            (None, None)
        } else {
            (
                Some(next_sync_version(&mut tx).await?),
                Some(self.identity.device_id.clone()),
            )
        };
        statement(
            "UPDATE files SET visibility = ?,
                sync_version = COALESCE(?, sync_version),
                last_modified_by = COALESCE(?, last_modified_by),
                modified_at = ?
             WHERE id = ?",
            &[
                visibility.map(|v| v.as_i32()).into(),
                sync_version.into(),
                modified_by.into(),
                now_ts().into(),
                file_id.into(),
            ],
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record a freshly computed checksum without touching anything else.
    pub async fn set_checksum(&self, file_id: i64, checksum: &str) -> Result<()> {
        self.db
            .execute(
                "UPDATE files SET checksum = ? WHERE id = ?",
                &[checksum.into(), file_id.into()],
            )
            .await?;
        Ok(())
    }

    // ---- deletion --------------------------------------------------------

    pub async fn delete_file(&self, file_id: i64, also_from_disk: bool) -> Result<()> {
        let record = self.get_file(file_id).await?;
        if also_from_disk && !record.is_remote {
            let folder = self.get_folder(record.folder_id).await?;
            let path = folder.path.join(&record.relative_path);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(format!("remove {}: {e}", path.display()))),
            }
        }
        self.delete_file_row(file_id).await?;
        self.refresh_folder_stats(record.folder_id).await
    }

    /// Delete the row, writing a tombstone when the file was shareable and
    /// its checksum is known (otherwise peers could never match it).
    async fn delete_file_row(&self, file_id: i64) -> Result<()> {
        let record = self.get_file(file_id).await?;
        let visibility = self.effective_visibility_of(file_id).await?;

        let mut tx = self.db.transaction().await?;
        if visibility == Visibility::Family {
            if let Some(checksum) = &record.checksum {
                statement(
                    "INSERT INTO deleted_files (checksum, deleted_at, deleted_by)
                     VALUES (?, ?, ?)
                     ON CONFLICT (checksum) DO UPDATE SET
                        deleted_at = excluded.deleted_at, deleted_by = excluded.deleted_by",
                    &[
                        checksum.into(),
                        now_ts().into(),
                        (&self.identity.device_id).into(),
                    ],
                )
                .execute(&mut *tx)
                .await?;
            }
        }
        statement("DELETE FROM files WHERE id = ?", &[file_id.into()])
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop tombstones past their TTL.
    pub async fn prune_tombstones(&self) -> Result<u64> {
        self.db
            .execute(
                "DELETE FROM deleted_files WHERE deleted_at < ?",
                &[(now_ts() - TOMBSTONE_TTL_SECS).into()],
            )
            .await
    }

    // ---- maintenance -----------------------------------------------------

    async fn refresh_folder_stats(&self, folder_id: i64) -> Result<()> {
        self.db
            .execute(
                "UPDATE folders SET
                    file_count = (SELECT COUNT(*) FROM files WHERE folder_id = ?),
                    total_size = (SELECT COALESCE(SUM(size), 0) FROM files WHERE folder_id = ?),
                    last_scan_at = ?
                 WHERE id = ?",
                &[
                    folder_id.into(),
                    folder_id.into(),
                    now_ts().into(),
                    folder_id.into(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Rebuild the full-text index and compact the database file.
    pub async fn optimize(&self) -> Result<()> {
        self.db
            .execute("INSERT INTO files_fts (files_fts) VALUES ('rebuild')", &[])
            .await?;
        self.db.execute("VACUUM", &[]).await?;
        Ok(())
    }
}

/// Bump and return the per-device sync version counter.
pub(crate) async fn next_sync_version(tx: &mut Transaction<'_, Sqlite>) -> Result<i64> {
    let row = statement(
        "INSERT INTO device_state (key, value) VALUES ('sync_version', '1')
         ON CONFLICT (key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)
         RETURNING CAST(value AS INTEGER)",
        &[],
    )
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.try_get(0)?)
}

fn sniff_mime(entry: &ScannedEntry) -> String {
    let mut prefix = [0u8; MIME_SNIFF_BYTES];
    let read = std::fs::File::open(&entry.absolute_path)
        .and_then(|mut f| f.read(&mut prefix))
        .unwrap_or(0);
    mime::detect(&entry.name, &prefix[..read])
}

pub(crate) fn file_from_row(row: &SqliteRow) -> Result<FileRecord> {
    Ok(FileRecord {
        id: row.try_get("id")?,
        folder_id: row.try_get("folder_id")?,
        relative_path: row.try_get("relative_path")?,
        name: row.try_get("name")?,
        extension: row.try_get("extension")?,
        size: row.try_get("size")?,
        mime_type: row.try_get("mime_type")?,
        content_type: ContentType::from_i32(row.try_get("content_type")?),
        checksum: row.try_get("checksum")?,
        created_at: row.try_get("created_at")?,
        modified_at: row.try_get("modified_at")?,
        indexed_at: row.try_get("indexed_at")?,
        visibility: row
            .try_get::<Option<i64>, _>("visibility")?
            .map(|v| Visibility::from_i32(v as i32)),
        source_device_id: row.try_get("source_device_id")?,
        is_remote: row.try_get::<i64, _>("is_remote")? != 0,
        sync_version: row.try_get("sync_version")?,
        last_modified_by: row.try_get("last_modified_by")?,
    })
}

fn folder_from_row(row: &SqliteRow) -> Result<FolderRecord> {
    Ok(FolderRecord {
        id: row.try_get("id")?,
        path: PathBuf::from(row.try_get::<String, _>("path")?),
        name: row.try_get("name")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        last_scan_at: row.try_get("last_scan_at")?,
        file_count: row.try_get("file_count")?,
        total_size: row.try_get("total_size")?,
        default_visibility: Visibility::from_i32(row.try_get("default_visibility")?),
    })
}
