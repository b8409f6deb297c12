//! Per-file reconciliation against the backend's records for a workshop item.

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeepsync_adapters::{BackendError, Lookup, UploadError};
use zeepsync_core::{active_records, LevelFile, LevelRecord, NewLevel, PayloadError, WorkshopItem};
use zeepsync_storage::{package_archive, StagedPayload};

use crate::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Same content uid and the same upstream update time.
    Republish,
    /// Upstream reports an update time older than the stored one.
    StaleUpstream,
    /// Same content uid with a later update time but a different fingerprint.
    Anomaly,
}

/// What to do with one payload file. Borrows the matched record when there is one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision<'a> {
    Create,
    Replace(&'a LevelRecord),
    Touch(&'a LevelRecord),
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Created(LevelRecord),
    Replaced { old_id: i64, new: LevelRecord },
    Touched(LevelRecord),
    Skipped(SkipReason),
}

impl FileOutcome {
    /// True when a record was created or superseded; touches and skips are not changes.
    pub fn is_change(&self) -> bool {
        matches!(self, FileOutcome::Created(_) | FileOutcome::Replaced { .. })
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid payload {file}: {source}")]
    Validation {
        file: String,
        #[source]
        source: PayloadError,
    },
    #[error("backend call for workshop item {workshop_id} failed: {source}")]
    Backend {
        workshop_id: String,
        #[source]
        source: BackendError,
    },
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error("packaging {file}: {message}")]
    Archive { file: String, message: String },
    #[error("level {new_id} was created but could not supersede level {old_id}: {source}")]
    Consistency {
        old_id: i64,
        new_id: i64,
        #[source]
        source: BackendError,
    },
}

impl ReconcileError {
    /// Only a failed supersession link leaves the backend inconsistent.
    pub fn is_critical(&self) -> bool {
        matches!(self, ReconcileError::Consistency { .. })
    }

    fn backend(workshop_id: &str, source: BackendError) -> Self {
        ReconcileError::Backend {
            workshop_id: workshop_id.to_string(),
            source,
        }
    }
}

/// Pure decision for one parsed payload.
///
/// `records` is `None` when the backend does not know the workshop item.
/// The active record of the file's (name, creator) lineage is the one compared.
pub fn decide<'a>(
    item: &WorkshopItem,
    name: &str,
    level: &LevelFile,
    records: Option<&'a [LevelRecord]>,
) -> Decision<'a> {
    let Some(records) = records else {
        return Decision::Create;
    };
    let Some(current) = active_records(records).find(|r| r.same_lineage(name, &item.creator_id))
    else {
        return Decision::Create;
    };

    if current.file_uid != level.uid {
        return Decision::Replace(current);
    }

    match current.updated_at.cmp(&item.updated_at) {
        std::cmp::Ordering::Equal => Decision::Skip(SkipReason::Republish),
        std::cmp::Ordering::Less if current.file_hash == level.fingerprint => {
            Decision::Touch(current)
        }
        std::cmp::Ordering::Less => Decision::Skip(SkipReason::Anomaly),
        std::cmp::Ordering::Greater => Decision::Skip(SkipReason::StaleUpstream),
    }
}

impl SyncEngine {
    pub async fn reconcile_file(
        &self,
        item: &WorkshopItem,
        payload: &StagedPayload,
        level: &LevelFile,
    ) -> Result<FileOutcome, ReconcileError> {
        let records = match self.collab.backend.get_by_workshop_id(&item.id).await {
            Lookup::Found(records) => Some(records),
            Lookup::NotFound => None,
            Lookup::Failure(source) => return Err(ReconcileError::backend(&item.id, source)),
        };

        match decide(item, &payload.name, level, records.as_deref()) {
            Decision::Create => {
                let record = self.create_level(item, payload, level).await?;
                info!(record_id = record.id, "created level");
                Ok(FileOutcome::Created(record))
            }
            Decision::Replace(old) => {
                let old_id = old.id;
                let new = self.create_level(item, payload, level).await?;
                if let Err(source) = self.collab.backend.replace(old_id, new.id).await {
                    return Err(ReconcileError::Consistency {
                        old_id,
                        new_id: new.id,
                        source,
                    });
                }
                info!(record_id = new.id, replaced = old_id, "replaced level");
                Ok(FileOutcome::Replaced { old_id, new })
            }
            Decision::Touch(record) => {
                let touched = self
                    .collab
                    .backend
                    .update_timestamp(record.id, item.updated_at)
                    .await
                    .map_err(|source| ReconcileError::backend(&item.id, source))?;
                debug!(record_id = touched.id, "metadata-only republish, timestamp updated");
                Ok(FileOutcome::Touched(touched))
            }
            Decision::Skip(reason) => {
                match reason {
                    SkipReason::Republish => debug!("unchanged republish"),
                    SkipReason::StaleUpstream => {
                        warn!(upstream = %item.updated_at, "upstream update time is older than the stored one")
                    }
                    SkipReason::Anomaly => error!(
                        uid = %level.uid,
                        fingerprint = %level.fingerprint,
                        "same uid with different content, leaving record untouched"
                    ),
                }
                Ok(FileOutcome::Skipped(reason))
            }
        }
    }

    /// Archive, upload and register one payload as a new record.
    async fn create_level(
        &self,
        item: &WorkshopItem,
        payload: &StagedPayload,
        level: &LevelFile,
    ) -> Result<LevelRecord, ReconcileError> {
        let file_name = payload.file_name();
        let archive =
            package_archive(&file_name, &payload.bytes).map_err(|err| ReconcileError::Archive {
                file: file_name.clone(),
                message: format!("{err:#}"),
            })?;

        let object_id = Uuid::new_v4().to_string();
        let file_url = self
            .collab
            .uploads
            .upload_payload(&object_id, archive)
            .await?;
        let image_url = match &payload.thumbnail {
            Some(thumbnail) => {
                self.collab
                    .uploads
                    .upload_thumbnail(
                        &object_id,
                        thumbnail.bytes.clone(),
                        thumbnail.content_type(),
                    )
                    .await?
            }
            None => self.settings.placeholder_thumbnail_url.clone(),
        };

        let new_level = NewLevel::from_level(item, &payload.name, level, file_url, image_url);
        self.collab
            .backend
            .create(&new_level)
            .await
            .map_err(|source| ReconcileError::backend(&item.id, source))
    }
}
