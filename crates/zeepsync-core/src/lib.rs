//! Core domain model for the workshop level sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod payload;

pub use payload::{
    fingerprint, parse_level, parse_metrics, LevelFile, PayloadError, DEFAULT_GROUND,
    DEFAULT_SKYBOX, PLACEHOLDER_AUTHOR,
};

pub const CRATE_NAME: &str = "zeepsync-core";

/// Ordering of a catalog crawl pass. Both orderings are newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    LastModified,
    Created,
}

impl SortOrder {
    pub const ALL: [SortOrder; 2] = [SortOrder::LastModified, SortOrder::Created];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::LastModified => "modified",
            SortOrder::Created => "created",
        }
    }

    pub fn is_modified(&self) -> bool {
        matches!(self, SortOrder::LastModified)
    }
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one upstream catalog entry as observed during a crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkshopItem {
    pub id: String,
    pub creator_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint times embedded in a level payload.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LevelMetrics {
    pub validation: f64,
    pub gold: f64,
    pub silver: f64,
    pub bronze: f64,
    pub valid: bool,
}

impl LevelMetrics {
    pub fn unvalidated() -> Self {
        Self::default()
    }
}

/// Backend level entity. Records with `replaced_by` set are historical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelRecord {
    pub id: i64,
    pub workshop_id: String,
    pub author_id: String,
    pub name: String,
    pub file_uid: String,
    pub file_hash: String,
    #[serde(default)]
    pub file_author: String,
    #[serde(default)]
    pub file_url: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub validation: f64,
    #[serde(default)]
    pub gold: f64,
    #[serde(default)]
    pub silver: f64,
    #[serde(default)]
    pub bronze: f64,
    #[serde(default)]
    pub validated: bool,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub replaced_by: Option<i64>,
}

impl LevelRecord {
    pub fn is_active(&self) -> bool {
        self.replaced_by.is_none()
    }

    /// Whether this record belongs to the (name, author) lineage of a payload file.
    pub fn same_lineage(&self, name: &str, author_id: &str) -> bool {
        self.name == name && self.author_id == author_id
    }

    pub fn matches_content(&self, file_uid: &str, file_hash: &str) -> bool {
        self.file_uid == file_uid && self.file_hash == file_hash
    }
}

/// Iterate the non-superseded records of a lookup result.
pub fn active_records(records: &[LevelRecord]) -> impl Iterator<Item = &LevelRecord> {
    records.iter().filter(|r| r.is_active())
}

/// Fields sent to the backend when creating a level record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLevel {
    pub workshop_id: String,
    pub author_id: String,
    pub name: String,
    pub file_uid: String,
    pub file_hash: String,
    pub file_author: String,
    pub file_url: String,
    pub image_url: String,
    pub validation: f64,
    pub gold: f64,
    pub silver: f64,
    pub bronze: f64,
    pub validated: bool,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

impl NewLevel {
    pub fn from_level(
        item: &WorkshopItem,
        name: &str,
        level: &LevelFile,
        file_url: String,
        image_url: String,
    ) -> Self {
        Self {
            workshop_id: item.id.clone(),
            author_id: item.creator_id.clone(),
            name: name.to_string(),
            file_uid: level.uid.clone(),
            file_hash: level.fingerprint.clone(),
            file_author: level.author.clone(),
            file_url,
            image_url,
            validation: level.metrics.validation,
            gold: level.metrics.gold,
            silver: level.metrics.silver,
            bronze: level.metrics.bronze,
            validated: level.metrics.valid,
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}
