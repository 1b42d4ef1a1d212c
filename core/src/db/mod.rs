//! Embedded relational store.
//!
//! A single serialized SQLite connection shared by every manager through an
//! `Arc<Database>`. Serialization comes from the one-connection pool; writers
//! queue behind the 30-second busy timeout instead of failing.
//!
//! All SQL in the crate goes through the typed [`Value`] parameters here:
//! pool statements via the `execute`/`query*` methods, transaction-scoped
//! statements via [`statement`]. User input is only ever bound, never
//! interpolated.

pub mod migrations;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::info;

use crate::error::{Error, Result};

/// A typed positional bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Bind `params` onto `sql` in order. This is the one place bind parameters
/// meet sqlx; transaction scopes use it directly, the pool methods below wrap
/// it.
pub(crate) fn statement<'q>(
    sql: &'q str,
    params: &'q [Value],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(v) => query.bind(*v),
            Value::Real(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Blob(v) => query.bind(v.as_slice()),
        };
    }
    query
}

/// Shared handle to the embedded database.
///
/// Every manager holds a strong `Arc` reference; `close` refuses to run while
/// any other reference is alive so no manager is ever left with a dead pool.
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (creating if missing) the database at `path` and bring the schema
    /// up to date. A failed migration is fatal and leaves the previous file
    /// intact next to a `.v<N>.bak` copy.
    pub async fn open(path: &Path) -> Result<Arc<Self>> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30))
            .pragma("cache_size", "-65536")
            // Cascade deletes must still fire the FTS maintenance triggers.
            .pragma("recursive_triggers", "ON");

        let pool = Self::build_pool(opts).await?;
        let db = Arc::new(Self {
            pool,
            path: Some(path.to_path_buf()),
        });
        migrations::run(&db).await?;
        info!(path = %path.display(), "database open");
        Ok(db)
    }

    /// In-memory database for tests; same pragmas, same schema.
    pub async fn open_in_memory() -> Result<Arc<Self>> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::Database(e.to_string()))?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30))
            .pragma("recursive_triggers", "ON");
        let pool = Self::build_pool(opts).await?;
        let db = Arc::new(Self { pool, path: None });
        migrations::run(&db).await?;
        Ok(db)
    }

    async fn build_pool(opts: SqliteConnectOptions) -> Result<SqlitePool> {
        // One connection = full serialization; readers and writers contend
        // coarsely but can never deadlock each other.
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let res = statement(sql, params).execute(&self.pool).await?;
        Ok(res.rows_affected())
    }

    /// Lazily stream the rows of a query. The stream holds the (single)
    /// connection until it is drained or dropped, so callers must not issue
    /// further statements while iterating.
    pub fn query<'q>(
        &'q self,
        sql: &'q str,
        params: &'q [Value],
    ) -> impl Stream<Item = Result<SqliteRow>> + 'q {
        statement(sql, params)
            .fetch(&self.pool)
            .map(|row| row.map_err(Error::from))
    }

    /// Convenience over [`query`](Self::query): collect every row.
    pub async fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<SqliteRow>> {
        Ok(statement(sql, params).fetch_all(&self.pool).await?)
    }

    /// Fetch exactly one row; `NotFound` if the query yields none.
    pub async fn query_one(&self, sql: &str, params: &[Value]) -> Result<SqliteRow> {
        Ok(statement(sql, params).fetch_one(&self.pool).await?)
    }

    /// Fetch at most one row.
    pub async fn query_optional(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Option<SqliteRow>> {
        Ok(statement(sql, params).fetch_optional(&self.pool).await?)
    }

    /// Begin a transaction scope. The scope rolls back on drop unless
    /// `commit()` is called.
    pub async fn transaction(&self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Rowid of the most recent insert on the (single) connection.
    pub async fn last_insert_id(&self) -> Result<i64> {
        let row = self.query_one("SELECT last_insert_rowid()", &[]).await?;
        Ok(row.try_get(0)?)
    }

    /// Rows changed by the most recent mutation on the (single) connection.
    pub async fn changes(&self) -> Result<i64> {
        let row = self.query_one("SELECT changes()", &[]).await?;
        Ok(row.try_get(0)?)
    }

    /// Close the pool. Fails with `Busy` while any manager still holds a
    /// reference to the handle.
    pub async fn close(this: &Arc<Self>) -> Result<()> {
        let holders = Arc::strong_count(this);
        if holders > 1 {
            return Err(Error::Busy(format!(
                "database still referenced by {} handle(s)",
                holders - 1
            )));
        }
        this.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn close_refuses_while_shared() {
        let db = Database::open_in_memory().await.unwrap();
        let second = db.clone();
        let err = Database::close(&db).await.unwrap_err();
        assert_eq!(err.code(), 8);
        drop(second);
        Database::close(&db).await.unwrap();
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_drop() {
        let db = Database::open_in_memory().await.unwrap();
        {
            let mut tx = db.transaction().await.unwrap();
            statement(
                "INSERT INTO folders (path, name, default_visibility) VALUES (?, ?, ?)",
                &["/tmp/a".into(), "a".into(), 1.into()],
            )
            .execute(&mut *tx)
            .await
            .unwrap();
            // dropped without commit
        }
        let row = db
            .query_one("SELECT COUNT(*) FROM folders", &[])
            .await
            .unwrap();
        let count: i64 = row.try_get(0).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn typed_params_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        db.execute(
            "INSERT INTO folders (path, name, enabled, default_visibility) VALUES (?, ?, ?, ?)",
            &["/tmp/b".into(), "b".into(), true.into(), 1.into()],
        )
        .await
        .unwrap();

        let row = db
            .query_one("SELECT name, enabled FROM folders WHERE path = ?", &["/tmp/b".into()])
            .await
            .unwrap();
        let name: String = row.try_get("name").unwrap();
        assert_eq!(name, "b");

        let missing = db
            .query_optional("SELECT 1 FROM folders WHERE path = ?", &["/nowhere".into()])
            .await
            .unwrap();
        assert!(missing.is_none());

        assert!(db.last_insert_id().await.unwrap() > 0);
        assert_eq!(db.changes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_streams_rows_lazily() {
        let db = Database::open_in_memory().await.unwrap();
        for i in 0..5 {
            db.execute(
                "INSERT INTO folders (path, name, default_visibility) VALUES (?, ?, 0)",
                &[format!("/tmp/{i}").into(), format!("f{i}").into()],
            )
            .await
            .unwrap();
        }

        let params = [Value::Integer(0)];
        let mut stream = db.query(
            "SELECT path FROM folders WHERE default_visibility = ? ORDER BY path",
            &params,
        );
        let mut seen = 0;
        while let Some(row) = stream.try_next().await.unwrap() {
            let path: String = row.try_get("path").unwrap();
            assert!(path.starts_with("/tmp/"));
            seen += 1;
        }
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn null_params_bind_as_null() {
        let db = Database::open_in_memory().await.unwrap();
        db.execute(
            "INSERT INTO folders (path, name, last_scan_at, default_visibility)
             VALUES (?, ?, ?, 0)",
            &["/tmp/n".into(), "n".into(), Value::from(None::<i64>)],
        )
        .await
        .unwrap();
        let row = db
            .query_one("SELECT last_scan_at FROM folders WHERE path = '/tmp/n'", &[])
            .await
            .unwrap();
        let scanned: Option<i64> = row.try_get("last_scan_at").unwrap();
        assert_eq!(scanned, None);
    }
}
