//! Collaborator contracts of the sync engine plus their concrete implementations.
//!
//! The engine only talks to the four traits below. `catalog`, `acquisition`,
//! `backend` and `upload` hold the production clients; `memory` holds
//! in-process stand-ins used by tests and local replays.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use zeepsync_core::{LevelRecord, NewLevel, SortOrder, WorkshopItem};
use zeepsync_storage::HttpError;

pub mod acquisition;
pub mod backend;
pub mod catalog;
pub mod memory;
pub mod upload;

pub use acquisition::{SteamCmdAcquisition, SteamCmdConfig};
pub use backend::RestLevelBackend;
pub use catalog::{SteamCatalogClient, SteamCatalogConfig};
pub use upload::HttpUploadClient;

pub const CRATE_NAME: &str = "zeepsync-adapters";

/// Outcome of a backend lookup. A missing entity is data, not an error.
#[derive(Debug)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Failure(BackendError),
}

impl<T> Lookup<T> {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("decoding backend response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("decoding catalog response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("decoding upload response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("acquisition session is not initialised")]
    NoSession,
    #[error("spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("download of item {item_id} exited with {status}: {stderr}")]
    Exit {
        item_id: String,
        status: String,
        stderr: String,
    },
    #[error("download of item {0} was cancelled")]
    Cancelled(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

/// Paginated, newest-first listing of the upstream marketplace.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn total_pages(&self, order: SortOrder) -> Result<u32, CatalogError>;

    /// One-based page of items.
    async fn page(&self, page: u32, order: SortOrder) -> Result<Vec<WorkshopItem>, CatalogError>;
}

/// Materialises the files of a workshop item into a local directory.
#[async_trait]
pub trait AcquisitionClient: Send + Sync {
    async fn init_session(&self) -> Result<(), AcquisitionError>;

    async fn fetch(
        &self,
        item_id: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AcquisitionError>;

    async fn dispose_session(&self) -> Result<(), AcquisitionError>;
}

/// Persistence of level records. The backend owns every record.
#[async_trait]
pub trait LevelBackend: Send + Sync {
    /// All records, active and historical, for a workshop item.
    async fn get_by_workshop_id(&self, workshop_id: &str) -> Lookup<Vec<LevelRecord>>;

    async fn create(&self, level: &NewLevel) -> Result<LevelRecord, BackendError>;

    async fn update_timestamp(
        &self,
        id: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<LevelRecord, BackendError>;

    /// Mark `old_id` as superseded by `new_id`.
    async fn replace(&self, old_id: i64, new_id: i64) -> Result<LevelRecord, BackendError>;

    async fn delete(&self, id: i64) -> Result<LevelRecord, BackendError>;

    /// `Ok(None)` means the backend is reachable but holds no records yet.
    async fn last_created(&self) -> Result<Option<LevelRecord>, BackendError>;

    async fn last_modified(&self) -> Result<Option<LevelRecord>, BackendError>;
}

/// Liveness probe run before a crawl pass in the given order.
pub async fn probe_backend(
    backend: &dyn LevelBackend,
    order: SortOrder,
) -> Result<Option<LevelRecord>, BackendError> {
    match order {
        SortOrder::LastModified => backend.last_modified().await,
        SortOrder::Created => backend.last_created().await,
    }
}

/// Blob storage for level archives and thumbnails. Returns public URLs.
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn upload_payload(&self, id: &str, bytes: Vec<u8>) -> Result<String, UploadError>;

    async fn upload_thumbnail(
        &self,
        id: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, UploadError>;
}
