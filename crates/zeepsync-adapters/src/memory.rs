//! In-process collaborators for tests and local replays.
//!
//! Every implementation records the calls it receives and can be told to
//! fail specific operations, so engine behaviour can be asserted without a
//! network or a steamcmd binary.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use zeepsync_core::{LevelRecord, NewLevel, SortOrder, WorkshopItem};

use crate::{
    AcquisitionClient, AcquisitionError, BackendError, CatalogClient, CatalogError, LevelBackend,
    Lookup, UploadClient, UploadError,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Lookup(String),
    Create { workshop_id: String, name: String },
    UpdateTimestamp { id: i64, updated_at: i64 },
    Replace { old_id: i64, new_id: i64 },
    Delete(i64),
    Probe(SortOrder),
}

#[derive(Debug, Default)]
struct BackendState {
    records: Vec<LevelRecord>,
    next_id: i64,
    calls: Vec<BackendCall>,
    failing_lookups: HashSet<String>,
    fail_create: bool,
    fail_replace: bool,
    fail_delete: bool,
    fail_probe: bool,
}

/// Level store held in memory, mirroring the REST backend contract.
#[derive(Debug, Default)]
pub struct MemoryLevelBackend {
    state: Mutex<BackendState>,
}

impl MemoryLevelBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<LevelRecord>) -> Self {
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0);
        Self {
            state: Mutex::new(BackendState {
                records,
                next_id,
                ..BackendState::default()
            }),
        }
    }

    pub fn records(&self) -> Vec<LevelRecord> {
        lock(&self.state).records.clone()
    }

    pub fn record(&self, id: i64) -> Option<LevelRecord> {
        lock(&self.state).records.iter().find(|r| r.id == id).cloned()
    }

    pub fn active_for(&self, workshop_id: &str) -> Vec<LevelRecord> {
        lock(&self.state)
            .records
            .iter()
            .filter(|r| r.workshop_id == workshop_id && r.is_active())
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.state).calls.clone()
    }

    /// Calls other than lookups and probes.
    pub fn mutations(&self) -> Vec<BackendCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, BackendCall::Lookup(_) | BackendCall::Probe(_)))
            .collect()
    }

    pub fn fail_lookups_for(&self, workshop_id: &str) {
        lock(&self.state)
            .failing_lookups
            .insert(workshop_id.to_string());
    }

    pub fn set_fail_create(&self, fail: bool) {
        lock(&self.state).fail_create = fail;
    }

    pub fn set_fail_replace(&self, fail: bool) {
        lock(&self.state).fail_replace = fail;
    }

    pub fn set_fail_delete(&self, fail: bool) {
        lock(&self.state).fail_delete = fail;
    }

    pub fn set_fail_probe(&self, fail: bool) {
        lock(&self.state).fail_probe = fail;
    }

    fn latest_by<F>(&self, order: SortOrder, key: F) -> Result<Option<LevelRecord>, BackendError>
    where
        F: Fn(&LevelRecord) -> DateTime<Utc>,
    {
        let mut state = lock(&self.state);
        state.calls.push(BackendCall::Probe(order));
        if state.fail_probe {
            return Err(BackendError::Rejected("probe failed".into()));
        }
        Ok(state.records.iter().max_by_key(|r| key(r)).cloned())
    }
}

#[async_trait]
impl LevelBackend for MemoryLevelBackend {
    async fn get_by_workshop_id(&self, workshop_id: &str) -> Lookup<Vec<LevelRecord>> {
        let mut state = lock(&self.state);
        state.calls.push(BackendCall::Lookup(workshop_id.to_string()));
        if state.failing_lookups.contains(workshop_id) {
            return Lookup::Failure(BackendError::Rejected(format!(
                "lookup of {workshop_id} failed"
            )));
        }
        let records: Vec<LevelRecord> = state
            .records
            .iter()
            .filter(|r| r.workshop_id == workshop_id)
            .cloned()
            .collect();
        if records.is_empty() {
            Lookup::NotFound
        } else {
            Lookup::Found(records)
        }
    }

    async fn create(&self, level: &NewLevel) -> Result<LevelRecord, BackendError> {
        let mut state = lock(&self.state);
        state.calls.push(BackendCall::Create {
            workshop_id: level.workshop_id.clone(),
            name: level.name.clone(),
        });
        if state.fail_create {
            return Err(BackendError::Rejected("create failed".into()));
        }
        state.next_id += 1;
        let record = LevelRecord {
            id: state.next_id,
            workshop_id: level.workshop_id.clone(),
            author_id: level.author_id.clone(),
            name: level.name.clone(),
            file_uid: level.file_uid.clone(),
            file_hash: level.file_hash.clone(),
            file_author: level.file_author.clone(),
            file_url: level.file_url.clone(),
            image_url: level.image_url.clone(),
            validation: level.validation,
            gold: level.gold,
            silver: level.silver,
            bronze: level.bronze,
            validated: level.validated,
            created_at: level.created_at,
            updated_at: level.updated_at,
            replaced_by: None,
        };
        state.records.push(record.clone());
        Ok(record)
    }

    async fn update_timestamp(
        &self,
        id: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<LevelRecord, BackendError> {
        let mut state = lock(&self.state);
        state.calls.push(BackendCall::UpdateTimestamp {
            id,
            updated_at: updated_at.timestamp(),
        });
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| BackendError::Rejected(format!("level {id} not found")))?;
        record.updated_at = updated_at;
        Ok(record.clone())
    }

    async fn replace(&self, old_id: i64, new_id: i64) -> Result<LevelRecord, BackendError> {
        let mut state = lock(&self.state);
        state.calls.push(BackendCall::Replace { old_id, new_id });
        if state.fail_replace {
            return Err(BackendError::Rejected("replace failed".into()));
        }
        if old_id == new_id {
            return Err(BackendError::Rejected(format!("level {old_id} cannot replace itself")));
        }
        let new_is_active = state
            .records
            .iter()
            .any(|r| r.id == new_id && r.is_active());
        if !new_is_active {
            return Err(BackendError::Rejected(format!(
                "replacement {new_id} is missing or historical"
            )));
        }
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id == old_id)
            .ok_or_else(|| BackendError::Rejected(format!("level {old_id} not found")))?;
        if record.replaced_by.is_some() {
            return Err(BackendError::Rejected(format!(
                "level {old_id} is already replaced"
            )));
        }
        record.replaced_by = Some(new_id);
        Ok(record.clone())
    }

    async fn delete(&self, id: i64) -> Result<LevelRecord, BackendError> {
        let mut state = lock(&self.state);
        state.calls.push(BackendCall::Delete(id));
        if state.fail_delete {
            return Err(BackendError::Rejected("delete failed".into()));
        }
        let index = state
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| BackendError::Rejected(format!("level {id} not found")))?;
        Ok(state.records.remove(index))
    }

    async fn last_created(&self) -> Result<Option<LevelRecord>, BackendError> {
        self.latest_by(SortOrder::Created, |r| r.created_at)
    }

    async fn last_modified(&self) -> Result<Option<LevelRecord>, BackendError> {
        self.latest_by(SortOrder::LastModified, |r| r.updated_at)
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    pages: HashMap<SortOrder, Vec<Vec<WorkshopItem>>>,
    requested: Vec<(SortOrder, u32)>,
    fail_pages: bool,
}

/// Fixed catalog listing, one vector of pages per sort order.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pages(&self, order: SortOrder, pages: Vec<Vec<WorkshopItem>>) {
        lock(&self.state).pages.insert(order, pages);
    }

    pub fn set_fail_pages(&self, fail: bool) {
        lock(&self.state).fail_pages = fail;
    }

    pub fn requested_pages(&self, order: SortOrder) -> Vec<u32> {
        lock(&self.state)
            .requested
            .iter()
            .filter(|(o, _)| *o == order)
            .map(|(_, p)| *p)
            .collect()
    }
}

#[async_trait]
impl CatalogClient for MemoryCatalog {
    async fn total_pages(&self, order: SortOrder) -> Result<u32, CatalogError> {
        let state = lock(&self.state);
        if state.fail_pages {
            return Err(CatalogError::Unavailable("catalog offline".into()));
        }
        Ok(state.pages.get(&order).map_or(0, |p| p.len() as u32))
    }

    async fn page(&self, page: u32, order: SortOrder) -> Result<Vec<WorkshopItem>, CatalogError> {
        let mut state = lock(&self.state);
        state.requested.push((order, page));
        if state.fail_pages {
            return Err(CatalogError::Unavailable("catalog offline".into()));
        }
        let index = page.checked_sub(1).map(|i| i as usize);
        Ok(index
            .and_then(|i| state.pages.get(&order).and_then(|p| p.get(i)))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct AcquisitionState {
    files: HashMap<String, Vec<(PathBuf, Vec<u8>)>>,
    fetched: Vec<String>,
    failing: HashSet<String>,
    sessions_opened: usize,
    sessions_closed: usize,
    fail_init: bool,
}

/// Writes preset files for an item into the destination directory.
#[derive(Debug, Default)]
pub struct MemoryAcquisition {
    state: Mutex<AcquisitionState>,
}

impl MemoryAcquisition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the file set published for `item_id`. Paths are relative.
    pub fn set_files(&self, item_id: &str, files: Vec<(PathBuf, Vec<u8>)>) {
        lock(&self.state).files.insert(item_id.to_string(), files);
    }

    pub fn fail_item(&self, item_id: &str) {
        lock(&self.state).failing.insert(item_id.to_string());
    }

    pub fn set_fail_init(&self, fail: bool) {
        lock(&self.state).fail_init = fail;
    }

    pub fn fetched(&self) -> Vec<String> {
        lock(&self.state).fetched.clone()
    }

    pub fn sessions(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.sessions_opened, state.sessions_closed)
    }
}

#[async_trait]
impl AcquisitionClient for MemoryAcquisition {
    async fn init_session(&self) -> Result<(), AcquisitionError> {
        let mut state = lock(&self.state);
        if state.fail_init {
            return Err(AcquisitionError::Failed("session refused".into()));
        }
        state.sessions_opened += 1;
        Ok(())
    }

    async fn fetch(
        &self,
        item_id: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AcquisitionError> {
        if cancel.is_cancelled() {
            return Err(AcquisitionError::Cancelled(item_id.to_string()));
        }
        let files = {
            let mut state = lock(&self.state);
            state.fetched.push(item_id.to_string());
            if state.failing.contains(item_id) {
                return Err(AcquisitionError::Failed(format!("download of {item_id} failed")));
            }
            state.files.get(item_id).cloned().unwrap_or_default()
        };
        for (relative, bytes) in files {
            let path = destination.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, bytes).await?;
        }
        Ok(())
    }

    async fn dispose_session(&self) -> Result<(), AcquisitionError> {
        lock(&self.state).sessions_closed += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct UploadState {
    payloads: Vec<String>,
    thumbnails: Vec<(String, String)>,
    fail: bool,
}

#[derive(Debug, Default)]
pub struct MemoryUploadClient {
    state: Mutex<UploadState>,
}

impl MemoryUploadClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }

    pub fn uploaded_payloads(&self) -> Vec<String> {
        lock(&self.state).payloads.clone()
    }

    /// Uploaded thumbnail ids with the content type each was sent as.
    pub fn uploaded_thumbnails(&self) -> Vec<(String, String)> {
        lock(&self.state).thumbnails.clone()
    }
}

#[async_trait]
impl UploadClient for MemoryUploadClient {
    async fn upload_payload(&self, id: &str, _bytes: Vec<u8>) -> Result<String, UploadError> {
        let mut state = lock(&self.state);
        if state.fail {
            return Err(UploadError::Rejected("upload failed".into()));
        }
        state.payloads.push(id.to_string());
        Ok(format!("memory://levels/{id}"))
    }

    async fn upload_thumbnail(
        &self,
        id: &str,
        _bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, UploadError> {
        let mut state = lock(&self.state);
        if state.fail {
            return Err(UploadError::Rejected("upload failed".into()));
        }
        state
            .thumbnails
            .push((id.to_string(), content_type.to_string()));
        Ok(format!("memory://thumbnails/{id}"))
    }
}
