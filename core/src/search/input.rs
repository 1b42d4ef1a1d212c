//! Search query surface.

use serde::{Deserialize, Serialize};

use crate::types::{ContentType, SortBy, Visibility};

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// Inclusive lower bound, Unix seconds.
    pub from: Option<i64>,
    /// Inclusive upper bound, Unix seconds.
    pub to: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

/// A structured search request. Everything is optional; the default query
/// returns the newest files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Full-text input matched against name, path and extracted content.
    pub text: String,
    pub content_type: Option<ContentType>,
    /// Lowercased extension without the dot.
    pub extension: Option<String>,
    pub folder_id: Option<i64>,
    pub date_range: Option<DateRange>,
    pub size_range: Option<SizeRange>,
    /// Every listed tag must be present.
    pub include_tags: Vec<String>,
    /// No listed tag may be present.
    pub exclude_tags: Vec<String>,
    /// Filter on effective visibility.
    pub visibility: Option<Visibility>,
    pub include_remote: bool,
    pub limit: i64,
    pub offset: i64,
    pub sort_by: SortBy,
    pub sort_asc: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: String::new(),
            content_type: None,
            extension: None,
            folder_id: None,
            date_range: None,
            size_range: None,
            include_tags: Vec::new(),
            exclude_tags: Vec::new(),
            visibility: None,
            include_remote: true,
            limit: DEFAULT_LIMIT,
            offset: 0,
            sort_by: SortBy::Relevance,
            sort_asc: false,
        }
    }
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub(super) fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;
        if self.limit <= 0 || self.limit > MAX_LIMIT {
            return Err(Error::InvalidArgument(format!(
                "limit must be in 1..={MAX_LIMIT}"
            )));
        }
        if self.offset < 0 {
            return Err(Error::InvalidArgument("offset must not be negative".into()));
        }
        if let Some(range) = &self.date_range {
            if let (Some(from), Some(to)) = (range.from, range.to) {
                if from > to {
                    return Err(Error::InvalidArgument("date range is inverted".into()));
                }
            }
        }
        if let Some(range) = &self.size_range {
            if let (Some(min), Some(max)) = (range.min, range.max) {
                if min > max {
                    return Err(Error::InvalidArgument("size range is inverted".into()));
                }
            }
        }
        Ok(())
    }
}
