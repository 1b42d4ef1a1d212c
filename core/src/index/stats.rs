//! Aggregate index statistics.

use sqlx::Row;

use super::IndexManager;
use crate::error::Result;
use crate::types::ContentType;

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub folder_count: i64,
    pub total_files: i64,
    pub total_size: i64,
    pub remote_files: i64,
    /// Files with an extracted-content row.
    pub with_content: i64,
    /// Files whose checksum has not been computed yet.
    pub without_checksum: i64,
    /// File counts per coarse content type.
    pub by_content_type: Vec<(ContentType, i64)>,
}

impl IndexManager {
    pub async fn get_stats(&self) -> Result<IndexStats> {
        let row = self
            .database()
            .query_one(
                "SELECT
                    (SELECT COUNT(*) FROM folders) AS folder_count,
                    (SELECT COUNT(*) FROM files) AS total_files,
                    (SELECT COALESCE(SUM(size), 0) FROM files) AS total_size,
                    (SELECT COUNT(*) FROM files WHERE is_remote = 1) AS remote_files,
                    (SELECT COUNT(*) FROM file_contents) AS with_content,
                    (SELECT COUNT(*) FROM files WHERE checksum IS NULL AND is_remote = 0)
                        AS without_checksum",
                &[],
            )
            .await?;

        let mut stats = IndexStats {
            folder_count: row.try_get("folder_count")?,
            total_files: row.try_get("total_files")?,
            total_size: row.try_get("total_size")?,
            remote_files: row.try_get("remote_files")?,
            with_content: row.try_get("with_content")?,
            without_checksum: row.try_get("without_checksum")?,
            by_content_type: Vec::new(),
        };

        let rows = self
            .database()
            .query_all(
                "SELECT content_type, COUNT(*) AS n FROM files
                 GROUP BY content_type ORDER BY n DESC",
                &[],
            )
            .await?;
        for row in rows {
            stats.by_content_type.push((
                ContentType::from_i32(row.try_get("content_type")?),
                row.try_get("n")?,
            ));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;
    use crate::device::DeviceIdentity;
    use crate::index::IndexManager;
    use crate::types::{DeviceType, Visibility};
    use std::fs;

    #[tokio::test]
    async fn stats_reflect_indexed_files() {
        let db = Database::open_in_memory().await.unwrap();
        let manager = IndexManager::new(
            db,
            DeviceIdentity {
                device_id: "d".into(),
                device_name: "t".into(),
                device_type: DeviceType::Desktop,
            },
        );

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("b.txt"), b"world!").unwrap();
        let folder_id = manager
            .add_folder(dir.path(), "docs", Visibility::Family)
            .await
            .unwrap();
        manager.scan_folder(folder_id, None).await.unwrap();

        let stats = manager.get_stats().await.unwrap();
        assert_eq!(stats.folder_count, 1);
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_size, 11);
        assert_eq!(stats.with_content, 0);
        assert_eq!(stats.without_checksum, 2);
        assert!(!stats.by_content_type.is_empty());
    }
}
