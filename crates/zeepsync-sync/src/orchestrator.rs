//! Acquisition of one workshop item and fan-out of its payload files.

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use zeepsync_adapters::Lookup;
use zeepsync_core::{active_records, parse_level, LevelFile, LevelRecord, PayloadError, WorkshopItem};
use zeepsync_storage::StagedPayload;

use crate::{CycleStats, ReconcileError, SyncEngine};

type ParsedPayload = (StagedPayload, Result<LevelFile, PayloadError>);

/// What processing one workshop item did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemReport {
    pub files: usize,
    pub changes: usize,
    pub no_ops: usize,
    pub failures: usize,
    pub deleted: usize,
    pub quarantine_touches: usize,
}

impl ItemReport {
    /// Every extracted file was skipped or touched. Vacuously true for an empty item.
    pub fn all_no_op(&self) -> bool {
        self.no_ops == self.files
    }

    pub fn is_productive(&self) -> bool {
        self.changes > 0 || self.failures > 0 || self.deleted > 0
    }
}

fn is_protected(record: &LevelRecord, creator_id: &str, parsed: &[ParsedPayload]) -> bool {
    parsed.iter().any(|(payload, level)| {
        record.same_lineage(&payload.name, creator_id)
            || level
                .as_ref()
                .is_ok_and(|l| record.matches_content(&l.uid, &l.fingerprint))
    })
}

fn log_file_failure(file: &str, err: &ReconcileError) {
    if err.is_critical() {
        error!(
            severity = "critical",
            file,
            error = %err,
            "supersession link failed, lineage now has two active records"
        );
    } else {
        warn!(file, error = %err, "file reconciliation failed");
    }
}

impl SyncEngine {
    /// Download, reconcile and clean up one item. The staging directory is
    /// removed whatever the outcome.
    pub async fn process_item(
        &self,
        item: &WorkshopItem,
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> Result<ItemReport> {
        let dir = self.collab.staging.prepare(&item.id).await?;
        let result = self.process_staged(item, &dir, cancel, stats).await;
        if let Err(err) = self.collab.staging.destroy(&dir).await {
            warn!(dir = %dir.display(), error = %format!("{err:#}"), "failed to remove staging directory");
        }
        result
    }

    async fn process_staged(
        &self,
        item: &WorkshopItem,
        dir: &Path,
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> Result<ItemReport> {
        self.collab
            .acquisition
            .fetch(&item.id, dir, cancel)
            .await
            .with_context(|| format!("acquiring workshop item {}", item.id))?;
        stats.items_acquired += 1;

        let parsed: Vec<ParsedPayload> = self
            .collab
            .staging
            .list_payloads(dir)
            .await?
            .into_iter()
            .map(|payload| {
                let level = parse_level(&payload.text());
                (payload, level)
            })
            .collect();

        let mut report = ItemReport {
            files: parsed.len(),
            ..ItemReport::default()
        };
        report.deleted = self.remove_orphans(item, &parsed, stats).await?;

        for (payload, level) in parsed {
            let file = payload.file_name();
            let level = match level {
                Ok(level) => level,
                Err(source) => {
                    let err = ReconcileError::Validation {
                        file: file.clone(),
                        source,
                    };
                    log_file_failure(&file, &err);
                    stats.record_failure(&err);
                    report.failures += 1;
                    continue;
                }
            };

            match self
                .reconcile_file(item, &payload, &level)
                .instrument(info_span!("file", file = %file))
                .await
            {
                Ok(outcome) => {
                    stats.record_outcome(&outcome);
                    if outcome.is_change() {
                        report.changes += 1;
                    } else {
                        report.no_ops += 1;
                    }
                }
                Err(err) => {
                    log_file_failure(&file, &err);
                    stats.record_failure(&err);
                    report.failures += 1;
                }
            }
        }

        if report.all_no_op() {
            report.quarantine_touches = self.quarantine_sync(item, report.files, stats).await?;
        }
        Ok(report)
    }

    /// Delete active records no extracted file accounts for, by content or lineage.
    async fn remove_orphans(
        &self,
        item: &WorkshopItem,
        parsed: &[ParsedPayload],
        stats: &mut CycleStats,
    ) -> Result<usize> {
        let records = match self.collab.backend.get_by_workshop_id(&item.id).await {
            Lookup::Found(records) => records,
            Lookup::NotFound => return Ok(0),
            Lookup::Failure(err) => {
                return Err(err)
                    .with_context(|| format!("looking up records of {} for orphan cleanup", item.id))
            }
        };

        let mut deleted = 0;
        for record in active_records(&records) {
            if is_protected(record, &item.creator_id, parsed) {
                continue;
            }
            self.collab
                .backend
                .delete(record.id)
                .await
                .with_context(|| format!("deleting orphaned level {}", record.id))?;
            info!(record_id = record.id, name = %record.name, "deleted orphaned level");
            stats.deleted += 1;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Timestamp-only repair when active records and extracted files disagree in number.
    async fn quarantine_sync(
        &self,
        item: &WorkshopItem,
        file_count: usize,
        stats: &mut CycleStats,
    ) -> Result<usize> {
        let records = match self.collab.backend.get_by_workshop_id(&item.id).await {
            Lookup::Found(records) => records,
            Lookup::NotFound => return Ok(0),
            Lookup::Failure(err) => {
                return Err(err)
                    .with_context(|| format!("looking up records of {} for quarantine", item.id))
            }
        };

        let active: Vec<&LevelRecord> = active_records(&records).collect();
        if active.len() == file_count {
            return Ok(0);
        }
        warn!(
            active = active.len(),
            files = file_count,
            "record count differs from extracted files, syncing timestamps"
        );

        let mut touched = 0;
        for record in active.into_iter().filter(|r| r.updated_at != item.updated_at) {
            self.collab
                .backend
                .update_timestamp(record.id, item.updated_at)
                .await
                .with_context(|| format!("quarantine timestamp sync of level {}", record.id))?;
            stats.quarantine_touches += 1;
            touched += 1;
        }
        Ok(touched)
    }
}
