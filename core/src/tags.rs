//! Tag management.
//!
//! Tag names are normalized (trimmed, lowercased) before hitting the table;
//! the `(file_id, tag_id)` association cascades away with either side.

use std::sync::Arc;

use sqlx::Row;

use crate::db::{statement, Database};
use crate::error::{Error, Result};
use crate::types::{now_ts, TagSource};

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub source: TagSource,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagWithCount {
    pub tag: Tag,
    pub file_count: i64,
}

pub struct TagManager {
    db: Arc<Database>,
}

impl TagManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Attach `name` to a file, creating the tag row on first use.
    /// Re-adding an existing association is a no-op.
    pub async fn add(&self, file_id: i64, name: &str, source: TagSource) -> Result<Tag> {
        let name = normalize(name)?;

        let mut tx = self.db.transaction().await?;
        let existing = statement("SELECT * FROM tags WHERE name = ?", &[(&name).into()])
            .fetch_optional(&mut *tx)
            .await?;
        let tag = match existing {
            Some(row) => tag_from_row(&row)?,
            None => {
                let created_at = now_ts();
                let res = statement(
                    "INSERT INTO tags (name, source, created_at) VALUES (?, ?, ?)",
                    &[(&name).into(), source.as_i32().into(), created_at.into()],
                )
                .execute(&mut *tx)
                .await?;
                Tag {
                    id: res.last_insert_rowid(),
                    name: name.clone(),
                    source,
                    created_at,
                }
            }
        };
        statement(
            "INSERT OR IGNORE INTO file_tags (file_id, tag_id) VALUES (?, ?)",
            &[file_id.into(), tag.id.into()],
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            // Unknown file id trips the foreign key.
            sqlx::Error::Database(db_err) if db_err.message().contains("FOREIGN KEY") => {
                Error::NotFound(format!("file {file_id}"))
            }
            other => other.into(),
        })?;
        tx.commit().await?;
        Ok(tag)
    }

    /// Detach `name` from a file. Unknown associations are a no-op.
    pub async fn remove(&self, file_id: i64, name: &str) -> Result<()> {
        let name = normalize(name)?;
        self.db
            .execute(
                "DELETE FROM file_tags WHERE file_id = ?
                 AND tag_id IN (SELECT id FROM tags WHERE name = ?)",
                &[file_id.into(), name.into()],
            )
            .await?;
        Ok(())
    }

    pub async fn get_for_file(&self, file_id: i64) -> Result<Vec<Tag>> {
        let rows = self
            .db
            .query_all(
                "SELECT t.* FROM tags t
                 JOIN file_tags ft ON ft.tag_id = t.id
                 WHERE ft.file_id = ? ORDER BY t.name",
                &[file_id.into()],
            )
            .await?;
        rows.iter().map(tag_from_row).collect()
    }

    pub async fn get_all(&self) -> Result<Vec<Tag>> {
        let rows = self
            .db
            .query_all("SELECT * FROM tags ORDER BY name", &[])
            .await?;
        rows.iter().map(tag_from_row).collect()
    }

    /// Tags ordered by how many files carry them.
    pub async fn get_popular(&self, limit: i64) -> Result<Vec<TagWithCount>> {
        if limit <= 0 {
            return Err(Error::InvalidArgument("limit must be positive".into()));
        }
        let rows = self
            .db
            .query_all(
                "SELECT t.*, COUNT(ft.file_id) AS file_count FROM tags t
                 LEFT JOIN file_tags ft ON ft.tag_id = t.id
                 GROUP BY t.id
                 ORDER BY file_count DESC, t.name
                 LIMIT ?",
                &[limit.into()],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(TagWithCount {
                    tag: tag_from_row(row)?,
                    file_count: row.try_get("file_count")?,
                })
            })
            .collect()
    }

    /// User-tag names for a file; the set synced to peers.
    pub async fn user_tag_names(&self, file_id: i64) -> Result<Vec<String>> {
        let rows = self
            .db
            .query_all(
                "SELECT t.name FROM tags t
                 JOIN file_tags ft ON ft.tag_id = t.id
                 WHERE ft.file_id = ? AND t.source = ? ORDER BY t.name",
                &[file_id.into(), TagSource::User.as_i32().into()],
            )
            .await?;
        rows.iter().map(|r| Ok(r.try_get("name")?)).collect()
    }
}

fn normalize(name: &str) -> Result<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty tag name".into()));
    }
    Ok(name)
}

fn tag_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Tag> {
    Ok(Tag {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source: TagSource::from_i32(row.try_get("source")?),
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;
    use crate::index::IndexManager;
    use crate::types::{DeviceType, Visibility};

    async fn setup() -> (TagManager, i64) {
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
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let folder_id = manager
            .add_folder(dir.path(), "docs", Visibility::Family)
            .await
            .unwrap();
        manager.scan_folder(folder_id, None).await.unwrap();
        let file = manager.get_by_folder(folder_id, 1, 0).await.unwrap().remove(0);
        (TagManager::new(db), file.id)
    }

    #[tokio::test]
    async fn names_are_normalized() {
        let (tags, file_id) = setup().await;
        let tag = tags.add(file_id, "  Holiday Photos  ", TagSource::User).await.unwrap();
        assert_eq!(tag.name, "holiday photos");
        assert!(tags.add(file_id, "", TagSource::User).await.is_err());
    }

    #[tokio::test]
    async fn add_is_idempotent_and_remove_restores() {
        let (tags, file_id) = setup().await;
        tags.add(file_id, "trip", TagSource::User).await.unwrap();
        tags.add(file_id, "trip", TagSource::User).await.unwrap();
        assert_eq!(tags.get_for_file(file_id).await.unwrap().len(), 1);

        tags.remove(file_id, "trip").await.unwrap();
        assert!(tags.get_for_file(file_id).await.unwrap().is_empty());

        // add → remove → add ends in the same state as a single add
        tags.add(file_id, "trip", TagSource::User).await.unwrap();
        let after = tags.get_for_file(file_id).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].name, "trip");
    }

    #[tokio::test]
    async fn popular_orders_by_usage() {
        let (tags, file_id) = setup().await;
        tags.add(file_id, "common", TagSource::User).await.unwrap();
        // "rare" exists but is attached to nothing after removal.
        tags.add(file_id, "rare", TagSource::User).await.unwrap();
        tags.remove(file_id, "rare").await.unwrap();

        let popular = tags.get_popular(10).await.unwrap();
        assert_eq!(popular[0].tag.name, "common");
        assert_eq!(popular[0].file_count, 1);
        assert_eq!(popular[1].file_count, 0);
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let (tags, _) = setup().await;
        let err = tags.add(9999, "ghost", TagSource::User).await.unwrap_err();
        assert_eq!(err.code(), 4);
    }
}
