//! Shared enums with ABI-stable discriminants.
//!
//! The numeric values cross the FFI boundary and the wire; they are frozen.

use serde::{Deserialize, Serialize};

/// Broad classification of a file derived from its MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Unknown,
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Other,
}

impl ContentType {
    pub fn as_i32(self) -> i32 {
        match self {
            ContentType::Unknown => 0,
            ContentType::Image => 1,
            ContentType::Video => 2,
            ContentType::Audio => 3,
            ContentType::Document => 4,
            ContentType::Archive => 5,
            ContentType::Other => 99,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => ContentType::Image,
            2 => ContentType::Video,
            3 => ContentType::Audio,
            4 => ContentType::Document,
            5 => ContentType::Archive,
            99 => ContentType::Other,
            _ => ContentType::Unknown,
        }
    }
}

/// Who may see a file: only this device, or every paired family device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Family,
}

impl Visibility {
    pub fn as_i32(self) -> i32 {
        match self {
            Visibility::Private => 0,
            Visibility::Family => 1,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        if value == 1 {
            Visibility::Family
        } else {
            Visibility::Private
        }
    }
}

/// Where a tag came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagSource {
    User,
    Auto,
    Ai,
}

impl TagSource {
    pub fn as_i32(self) -> i32 {
        match self {
            TagSource::User => 0,
            TagSource::Auto => 1,
            TagSource::Ai => 2,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => TagSource::Auto,
            2 => TagSource::Ai,
            _ => TagSource::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    pub fn as_i32(self) -> i32 {
        match self {
            DeviceType::Desktop => 0,
            DeviceType::Mobile => 1,
            DeviceType::Tablet => 2,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => DeviceType::Mobile,
            2 => DeviceType::Tablet,
            _ => DeviceType::Desktop,
        }
    }
}

/// Result ordering for search queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    Relevance,
    Name,
    Date,
    Size,
}

impl SortBy {
    pub fn as_i32(self) -> i32 {
        match self {
            SortBy::Relevance => 0,
            SortBy::Name => 1,
            SortBy::Date => 2,
            SortBy::Size => 3,
        }
    }
}

/// Lifecycle state of the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl NetworkState {
    pub fn as_i32(self) -> i32 {
        match self {
            NetworkState::Stopped => 0,
            NetworkState::Starting => 1,
            NetworkState::Running => 2,
            NetworkState::Stopping => 3,
            NetworkState::Error => 4,
        }
    }
}

/// Current Unix timestamp in whole seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_round_trip() {
        for ct in [
            ContentType::Unknown,
            ContentType::Image,
            ContentType::Video,
            ContentType::Audio,
            ContentType::Document,
            ContentType::Archive,
            ContentType::Other,
        ] {
            assert_eq!(ContentType::from_i32(ct.as_i32()), ct);
        }
        assert_eq!(ContentType::Other.as_i32(), 99);
    }

    #[test]
    fn visibility_discriminants() {
        assert_eq!(Visibility::Private.as_i32(), 0);
        assert_eq!(Visibility::Family.as_i32(), 1);
    }
}
