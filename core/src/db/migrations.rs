//! Ordered schema migrations.
//!
//! Each migration runs in its own transaction and appends a `schema_version`
//! row; a failure rolls back and surfaces as a fatal `Database` error.
//! Before upgrading an existing database the file is copied aside with the
//! prior version as a suffix.

use std::sync::Arc;

use sqlx::Row;
use tracing::{info, warn};

use super::Database;
use crate::error::{Error, Result};
use crate::types::now_ts;

struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "core index schema",
        sql: r#"
CREATE TABLE folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_scan_at INTEGER,
    file_count INTEGER NOT NULL DEFAULT 0,
    total_size INTEGER NOT NULL DEFAULT 0,
    default_visibility INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    folder_id INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
    relative_path TEXT NOT NULL,
    name TEXT NOT NULL,
    extension TEXT NOT NULL DEFAULT '',
    size INTEGER NOT NULL DEFAULT 0,
    mime_type TEXT NOT NULL DEFAULT 'application/octet-stream',
    content_type INTEGER NOT NULL DEFAULT 0,
    checksum TEXT,
    created_at INTEGER,
    modified_at INTEGER NOT NULL DEFAULT 0,
    indexed_at INTEGER NOT NULL DEFAULT 0,
    visibility INTEGER,
    source_device_id TEXT,
    is_remote INTEGER NOT NULL DEFAULT 0,
    sync_version INTEGER NOT NULL DEFAULT 0,
    last_modified_by TEXT,
    UNIQUE (folder_id, relative_path)
);
CREATE INDEX idx_files_folder ON files(folder_id);
CREATE INDEX idx_files_checksum ON files(checksum) WHERE checksum IS NOT NULL;
CREATE INDEX idx_files_modified ON files(modified_at);

CREATE TABLE image_metadata (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    width INTEGER,
    height INTEGER,
    taken_at INTEGER,
    camera_make TEXT,
    camera_model TEXT,
    latitude REAL,
    longitude REAL,
    orientation INTEGER
);

CREATE TABLE file_contents (
    file_id INTEGER PRIMARY KEY REFERENCES files(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    method TEXT NOT NULL,
    language TEXT NOT NULL DEFAULT '',
    extracted_at INTEGER NOT NULL
);

CREATE TABLE tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    source INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE file_tags (
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (file_id, tag_id)
);

CREATE VIRTUAL TABLE files_fts USING fts5(name, relative_path, content);

CREATE TRIGGER files_fts_insert AFTER INSERT ON files BEGIN
    INSERT INTO files_fts (rowid, name, relative_path, content)
    VALUES (new.id, new.name, new.relative_path, '');
END;

CREATE TRIGGER files_fts_delete AFTER DELETE ON files BEGIN
    DELETE FROM files_fts WHERE rowid = old.id;
END;

CREATE TRIGGER files_fts_rename AFTER UPDATE OF name, relative_path ON files BEGIN
    UPDATE files_fts SET name = new.name, relative_path = new.relative_path
    WHERE rowid = new.id;
END;

CREATE TABLE device_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#,
    },
    Migration {
        version: 2,
        description: "sync, tombstones and remote shadows",
        sql: r#"
CREATE TABLE deleted_files (
    checksum TEXT PRIMARY KEY,
    deleted_at INTEGER NOT NULL,
    deleted_by TEXT NOT NULL
);

CREATE TABLE sync_state (
    device_id TEXT PRIMARY KEY,
    last_sync_version INTEGER NOT NULL DEFAULT 0,
    last_sync_at INTEGER NOT NULL DEFAULT 0,
    needs_full_resync INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE watched_remote_files (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    remote_id INTEGER NOT NULL,
    source_device_id TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    name TEXT NOT NULL,
    mime_type TEXT NOT NULL DEFAULT 'application/octet-stream',
    size INTEGER NOT NULL DEFAULT 0,
    modified_at INTEGER NOT NULL DEFAULT 0,
    checksum TEXT,
    sync_version INTEGER NOT NULL DEFAULT 0,
    last_modified_by TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    synced_at INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    UNIQUE (source_device_id, remote_id)
);
CREATE INDEX idx_shadow_device ON watched_remote_files(source_device_id);
CREATE INDEX idx_shadow_checksum ON watched_remote_files(checksum)
    WHERE checksum IS NOT NULL;
"#,
    },
];

/// Current target schema version.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply every migration newer than the on-disk schema version.
pub(super) async fn run(db: &Arc<Database>) -> Result<()> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
        &[],
    )
    .await?;

    let row = db
        .query_one("SELECT COALESCE(MAX(version), 0) FROM schema_version", &[])
        .await?;
    let current: i64 = row.try_get(0)?;

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(());
    }

    if current > 0 {
        backup_before_upgrade(db, current)?;
    }

    for migration in pending {
        info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        let mut tx = db.transaction().await?;
        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(format!("migration {} failed: {e}", migration.version))
            })?;
        super::statement(
            "INSERT INTO schema_version (version, description, applied_at) VALUES (?, ?, ?)",
            &[
                migration.version.into(),
                migration.description.into(),
                now_ts().into(),
            ],
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(format!("migration {} bookkeeping failed: {e}", migration.version))
        })?;
        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("migration {} commit failed: {e}", migration.version)))?;
    }

    Ok(())
}

fn backup_before_upgrade(db: &Arc<Database>, prior_version: i64) -> Result<()> {
    let Some(path) = db.file_path() else {
        return Ok(());
    };
    let backup = path.with_file_name(format!(
        "{}.v{prior_version}.bak",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "familyvault.db".to_string())
    ));
    match std::fs::copy(path, &backup) {
        Ok(_) => {
            info!(backup = %backup.display(), "database backed up before upgrade");
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "database backup failed, refusing to migrate");
            Err(Error::Io(format!("pre-migration backup failed: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn fresh_database_reaches_latest_version() {
        let db = Database::open_in_memory().await.unwrap();
        let row = db
            .query_one("SELECT MAX(version) FROM schema_version", &[])
            .await
            .unwrap();
        let version: i64 = row.try_get(0).unwrap();
        assert_eq!(version, latest_version());
    }

    #[tokio::test]
    async fn versions_are_strictly_increasing_without_gaps() {
        let db = Database::open_in_memory().await.unwrap();
        let rows = db
            .query_all("SELECT version FROM schema_version ORDER BY version", &[])
            .await
            .unwrap();
        let versions: Vec<i64> = rows.iter().map(|r| r.get(0)).collect();
        for (i, v) in versions.iter().enumerate() {
            assert_eq!(*v, i as i64 + 1);
        }
    }

    #[tokio::test]
    async fn reopen_is_idempotent_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("familyvault.db");
        {
            let db = Database::open(&path).await.unwrap();
            Database::close(&db).await.unwrap();
        }
        // Second open applies nothing and must not create a backup.
        {
            let db = Database::open(&path).await.unwrap();
            Database::close(&db).await.unwrap();
        }
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
            .collect();
        assert!(backups.is_empty());
    }

    #[tokio::test]
    async fn fts_triggers_mirror_files() {
        let db = Database::open_in_memory().await.unwrap();
        db.execute(
            "INSERT INTO folders (path, name, default_visibility) VALUES (?, ?, ?)",
            &["/d".into(), "d".into(), 1.into()],
        )
        .await
        .unwrap();
        db.execute(
            "INSERT INTO files (folder_id, relative_path, name, modified_at, indexed_at)
             VALUES (?, ?, ?, ?, ?)",
            &[1.into(), "a/readme.txt".into(), "readme.txt".into(), 10.into(), 10.into()],
        )
        .await
        .unwrap();

        let row = db
            .query_one(
                "SELECT COUNT(*) FROM files_fts WHERE files_fts MATCH ?",
                &["readme".into()],
            )
            .await
            .unwrap();
        let hits: i64 = row.try_get(0).unwrap();
        assert_eq!(hits, 1);

        db.execute("DELETE FROM files WHERE id = ?", &[1.into()])
            .await
            .unwrap();
        let row = db
            .query_one("SELECT COUNT(*) FROM files_fts", &[])
            .await
            .unwrap();
        let rest: i64 = row.try_get(0).unwrap();
        assert_eq!(rest, 0);
    }
}
