//! Checksum-based duplicate detection.
//!
//! Files group by SHA-256; a group distinguishes copies on this device from
//! copies known to live on other family devices, so the UI can tell "safe to
//! delete" from "last copy anywhere".

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::warn;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::index::{file_from_row, FileRecord, ScanProgress, ScanProgressFn};

#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub checksum: String,
    /// Size of one copy in bytes.
    pub size: i64,
    pub local_files: Vec<FileRecord>,
    pub remote_count: i64,
}

impl DuplicateGroup {
    /// Bytes reclaimed by keeping a single local copy.
    pub fn potential_savings(&self) -> i64 {
        self.size * (self.local_files.len() as i64 - 1).max(0)
    }

    /// Whether another family device also holds these bytes.
    pub fn has_remote_backup(&self) -> bool {
        self.remote_count > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateStats {
    pub group_count: i64,
    pub duplicate_files: i64,
    pub potential_savings: i64,
}

pub struct DuplicateFinder {
    db: Arc<Database>,
    stop: Arc<AtomicBool>,
}

impl DuplicateFinder {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// All checksum groups with more than one copy, largest savings first.
    pub async fn find(&self) -> Result<Vec<DuplicateGroup>> {
        let rows = self
            .db
            .query_all(
                "SELECT checksum FROM (
                    SELECT checksum, COUNT(*) AS copies FROM files
                    WHERE checksum IS NOT NULL
                    GROUP BY checksum HAVING copies > 1
                 )",
                &[],
            )
            .await?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            let checksum: String = row.try_get("checksum")?;
            let members = self
                .db
                .query_all(
                    "SELECT * FROM files WHERE checksum = ?",
                    &[(&checksum).into()],
                )
                .await?;
            let mut local_files = Vec::new();
            let mut remote_count = 0;
            let mut size = 0;
            for member in &members {
                let record = file_from_row(member)?;
                size = record.size;
                if record.is_remote {
                    remote_count += 1;
                } else {
                    local_files.push(record);
                }
            }
            // Shadow rows from peers count as remote backups too.
            let shadow = self
                .db
                .query_one(
                    "SELECT COUNT(*) FROM watched_remote_files
                     WHERE checksum = ? AND is_deleted = 0",
                    &[(&checksum).into()],
                )
                .await?;
            remote_count += shadow.try_get::<i64, _>(0)?;

            if local_files.len() + remote_count as usize > 1 && !local_files.is_empty() {
                groups.push(DuplicateGroup {
                    checksum,
                    size,
                    local_files,
                    remote_count,
                });
            }
        }
        groups.sort_by_key(|g| std::cmp::Reverse(g.potential_savings()));
        Ok(groups)
    }

    pub async fn stats(&self) -> Result<DuplicateStats> {
        let groups = self.find().await?;
        Ok(DuplicateStats {
            group_count: groups.len() as i64,
            duplicate_files: groups
                .iter()
                .map(|g| (g.local_files.len() as i64 - 1).max(0))
                .sum(),
            potential_savings: groups.iter().map(|g| g.potential_savings()).sum(),
        })
    }

    /// Duplicate groups with no copy on any other device.
    pub async fn without_backup(&self) -> Result<Vec<DuplicateGroup>> {
        Ok(self
            .find()
            .await?
            .into_iter()
            .filter(|g| !g.has_remote_backup())
            .collect())
    }

    /// Hash every local file that lacks a checksum. Fires `progress` once per
    /// file and honors cooperative cancellation between files.
    pub async fn compute_checksums(&self, progress: Option<ScanProgressFn>) -> Result<u64> {
        self.stop.store(false, Ordering::SeqCst);
        let rows = self
            .db
            .query_all(
                "SELECT f.id, f.relative_path, fo.path AS folder_path FROM files f
                 JOIN folders fo ON fo.id = f.folder_id
                 WHERE f.checksum IS NULL AND f.is_remote = 0
                 ORDER BY f.id",
                &[],
            )
            .await?;

        let total = rows.len() as u64;
        let mut done = 0u64;
        for row in rows {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let file_id: i64 = row.try_get("id")?;
            let relative_path: String = row.try_get("relative_path")?;
            let path =
                PathBuf::from(row.try_get::<String, _>("folder_path")?).join(&relative_path);

            match hash_file(path.clone()).await {
                Ok(checksum) => {
                    self.db
                        .execute(
                            "UPDATE files SET checksum = ? WHERE id = ?",
                            &[checksum.into(), file_id.into()],
                        )
                        .await?;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "checksum failed");
                }
            }
            done += 1;
            if let Some(cb) = &progress {
                cb(ScanProgress {
                    processed: done,
                    total,
                    current_path: relative_path,
                });
            }
        }
        Ok(done)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// SHA-256 of a file, streamed off the async executor.
pub async fn hash_file(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Internal(format!("hash task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;
    use crate::index::IndexManager;
    use crate::types::{DeviceType, Visibility};
    use std::fs;

    async fn setup(files: &[(&str, &[u8])]) -> (DuplicateFinder, Arc<Database>) {
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
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        for (name, body) in files {
            fs::write(dir.path().join(name), body).unwrap();
        }
        let folder_id = manager
            .add_folder(dir.path(), "docs", Visibility::Family)
            .await
            .unwrap();
        manager.scan_folder(folder_id, None).await.unwrap();
        // Leak the tempdir so files survive for checksum computation.
        std::mem::forget(dir);
        (DuplicateFinder::new(db.clone()), db)
    }

    #[tokio::test]
    async fn identical_copies_form_one_group() {
        let payload = b"the very same bytes".as_slice();
        let (finder, _db) = setup(&[
            ("photo.jpg", payload),
            ("sub/photo-copy.jpg", payload),
            ("sub/photo-again.jpg", payload),
            ("other.txt", b"different"),
        ])
        .await;

        let hashed = finder.compute_checksums(None).await.unwrap();
        assert_eq!(hashed, 4);

        let groups = finder.find().await.unwrap();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.local_files.len(), 3);
        assert_eq!(
            group.potential_savings(),
            2 * payload.len() as i64
        );
        assert!(!group.has_remote_backup());

        let stats = finder.stats().await.unwrap();
        assert_eq!(stats.group_count, 1);
        assert_eq!(stats.duplicate_files, 2);
    }

    #[tokio::test]
    async fn remote_shadow_counts_as_backup() {
        let payload = b"backed up twice".as_slice();
        let (finder, db) = setup(&[("a.bin", payload), ("b.bin", payload)]).await;
        finder.compute_checksums(None).await.unwrap();

        let row = db
            .query_one("SELECT checksum FROM files LIMIT 1", &[])
            .await
            .unwrap();
        let checksum: String = row.try_get(0).unwrap();
        db.execute(
            "INSERT INTO watched_remote_files
                (remote_id, source_device_id, relative_path, name, checksum)
             VALUES (?, ?, ?, ?, ?)",
            &[
                7.into(),
                "peer-1".into(),
                "a.bin".into(),
                "a.bin".into(),
                (&checksum).into(),
            ],
        )
        .await
        .unwrap();

        let groups = finder.find().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].has_remote_backup());
        assert!(finder.without_backup().await.unwrap().is_empty());
    }
}
