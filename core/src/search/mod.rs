//! Search engine: structured queries projected onto FTS5 + SQL.
//!
//! User text only ever reaches the database as a bound parameter; the MATCH
//! expression is rebuilt from quoted tokens so FTS5 operators in user input
//! are inert.

pub mod input;

pub use input::{DateRange, SearchQuery, SizeRange};

use std::sync::Arc;

use serde::Serialize;
use sqlx::Row;

use crate::db::{Database, Value};
use crate::error::{Error, Result};
use crate::index::{file_from_row, FileRecord};
use crate::types::{ContentType, SortBy};

const SNIPPET_MAX_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub file: FileRecord,
    /// Context around the best FTS hit; present only for text queries.
    pub snippet: Option<String>,
}

/// Stripped result for list views and the FFI boundary.
#[derive(Debug, Clone, Serialize)]
pub struct CompactResult {
    pub id: i64,
    pub folder_id: i64,
    pub name: String,
    pub relative_path: String,
    pub size: i64,
    pub mime_type: String,
    pub content_type: ContentType,
    pub modified_at: i64,
    pub is_remote: bool,
    pub snippet: Option<String>,
}

pub struct SearchEngine {
    db: Arc<Database>,
}

impl SearchEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        query.validate()?;
        let fts = build_match_expression(&query.text);

        let mut sql = String::from("SELECT f.*");
        if fts.is_some() {
            sql.push_str(", snippet(files_fts, 2, '', '', '…', 24) AS hit");
        }
        sql.push_str(" FROM files f JOIN folders fo ON fo.id = f.folder_id");
        if fts.is_some() {
            sql.push_str(" JOIN files_fts ON files_fts.rowid = f.id");
        }

        let mut params = Vec::new();
        let conditions = build_conditions(query, &fts, &mut params)?;
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        sql.push_str(" ORDER BY ");
        sql.push_str(&order_clause(query, fts.is_some()));
        sql.push_str(" LIMIT ? OFFSET ?");
        params.push(query.limit.into());
        params.push(query.offset.into());

        let rows = self.db.query_all(&sql, &params).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let snippet = if fts.is_some() {
                row.try_get::<String, _>("hit")
                    .ok()
                    .map(|s| clip_snippet(&s))
                    .filter(|s| !s.is_empty())
            } else {
                None
            };
            results.push(SearchResult {
                file: file_from_row(&row)?,
                snippet,
            });
        }
        Ok(results)
    }

    /// Same results as [`search`](Self::search) with the heavyweight record
    /// stripped down.
    pub async fn search_compact(&self, query: &SearchQuery) -> Result<Vec<CompactResult>> {
        Ok(self
            .search(query)
            .await?
            .into_iter()
            .map(|r| CompactResult {
                id: r.file.id,
                folder_id: r.file.folder_id,
                name: r.file.name,
                relative_path: r.file.relative_path,
                size: r.file.size,
                mime_type: r.file.mime_type,
                content_type: r.file.content_type,
                modified_at: r.file.modified_at,
                is_remote: r.file.is_remote,
                snippet: r.snippet,
            })
            .collect())
    }

    /// Total number of rows the query would match, ignoring pagination.
    pub async fn count(&self, query: &SearchQuery) -> Result<i64> {
        query.validate()?;
        let fts = build_match_expression(&query.text);

        let mut sql =
            String::from("SELECT COUNT(*) FROM files f JOIN folders fo ON fo.id = f.folder_id");
        if fts.is_some() {
            sql.push_str(" JOIN files_fts ON files_fts.rowid = f.id");
        }
        let mut params = Vec::new();
        let conditions = build_conditions(query, &fts, &mut params)?;
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let row = self.db.query_one(&sql, &params).await?;
        Ok(row.try_get(0)?)
    }

    /// Name completion over the FTS name column.
    pub async fn suggest(&self, prefix: &str, limit: i64) -> Result<Vec<String>> {
        if limit <= 0 {
            return Err(Error::InvalidArgument("limit must be positive".into()));
        }
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        let escaped = prefix.replace('"', "\"\"");
        let rows = self
            .db
            .query_all(
                "SELECT DISTINCT name FROM files_fts WHERE files_fts MATCH ? LIMIT ?",
                &[format!("name:\"{escaped}\"*").into(), limit.into()],
            )
            .await?;
        rows.iter().map(|r| Ok(r.try_get("name")?)).collect()
    }
}

/// Quote each whitespace token so FTS5 operators in user input are literal.
fn build_match_expression(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

fn build_conditions(
    query: &SearchQuery,
    fts: &Option<String>,
    params: &mut Vec<Value>,
) -> Result<Vec<String>> {
    let mut conditions = Vec::new();

    if let Some(expression) = fts {
        conditions.push("files_fts MATCH ?".to_string());
        params.push(expression.into());
    }
    if let Some(content_type) = query.content_type {
        conditions.push("f.content_type = ?".to_string());
        params.push(content_type.as_i32().into());
    }
    if let Some(extension) = &query.extension {
        conditions.push("f.extension = ?".to_string());
        params.push(extension.to_ascii_lowercase().into());
    }
    if let Some(folder_id) = query.folder_id {
        conditions.push("f.folder_id = ?".to_string());
        params.push(folder_id.into());
    }
    if let Some(range) = &query.date_range {
        if let Some(from) = range.from {
            conditions.push("f.modified_at >= ?".to_string());
            params.push(from.into());
        }
        if let Some(to) = range.to {
            conditions.push("f.modified_at <= ?".to_string());
            params.push(to.into());
        }
    }
    if let Some(range) = &query.size_range {
        if let Some(min) = range.min {
            conditions.push("f.size >= ?".to_string());
            params.push(min.into());
        }
        if let Some(max) = range.max {
            conditions.push("f.size <= ?".to_string());
            params.push(max.into());
        }
    }
    for tag in &query.include_tags {
        conditions.push(
            "EXISTS (SELECT 1 FROM file_tags ft JOIN tags t ON t.id = ft.tag_id
                     WHERE ft.file_id = f.id AND t.name = ?)"
                .to_string(),
        );
        params.push(tag.trim().to_lowercase().into());
    }
    for tag in &query.exclude_tags {
        conditions.push(
            "NOT EXISTS (SELECT 1 FROM file_tags ft JOIN tags t ON t.id = ft.tag_id
                         WHERE ft.file_id = f.id AND t.name = ?)"
                .to_string(),
        );
        params.push(tag.trim().to_lowercase().into());
    }
    if let Some(visibility) = query.visibility {
        conditions.push("COALESCE(f.visibility, fo.default_visibility) = ?".to_string());
        params.push(visibility.as_i32().into());
    }
    if !query.include_remote {
        conditions.push("f.is_remote = 0".to_string());
    }
    Ok(conditions)
}

fn order_clause(query: &SearchQuery, has_text: bool) -> String {
    let direction = if query.sort_asc { "ASC" } else { "DESC" };
    match query.sort_by {
        // Relevance is only meaningful for text queries; it degrades to
        // newest-first otherwise.
        SortBy::Relevance if has_text => "files_fts.rank".to_string(),
        SortBy::Relevance => "f.modified_at DESC".to_string(),
        SortBy::Name => format!("f.name COLLATE NOCASE {direction}"),
        SortBy::Date => format!("f.modified_at {direction}"),
        SortBy::Size => format!("f.size {direction}"),
    }
}

fn clip_snippet(snippet: &str) -> String {
    if snippet.chars().count() <= SNIPPET_MAX_CHARS {
        return snippet.to_string();
    }
    let clipped: String = snippet.chars().take(SNIPPET_MAX_CHARS).collect();
    format!("{clipped}…")
}
