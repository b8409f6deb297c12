//! Pre-download candidate filter.

use tracing::{debug, warn};
use zeepsync_adapters::{LevelBackend, Lookup};
use zeepsync_core::{active_records, LevelRecord, WorkshopItem};

/// Whether `item` has to be downloaded given the backend's view of it.
///
/// Unknown items and failed lookups are included; known items only when some
/// active record is strictly older than the upstream timestamps.
pub fn needs_download(item: &WorkshopItem, lookup: &Lookup<Vec<LevelRecord>>) -> bool {
    match lookup {
        Lookup::NotFound => true,
        Lookup::Failure(_) => true,
        Lookup::Found(records) => {
            let mut active = active_records(records).peekable();
            if active.peek().is_none() {
                return true;
            }
            active.any(|r| r.updated_at < item.updated_at || r.created_at < item.created_at)
        }
    }
}

pub async fn filter_candidates(
    backend: &dyn LevelBackend,
    items: Vec<WorkshopItem>,
) -> Vec<WorkshopItem> {
    let mut candidates = Vec::with_capacity(items.len());
    for item in items {
        let lookup = backend.get_by_workshop_id(&item.id).await;
        if let Lookup::Failure(err) = &lookup {
            warn!(workshop_id = %item.id, error = %err, "lookup failed, keeping item as candidate");
        }
        if needs_download(&item, &lookup) {
            candidates.push(item);
        } else {
            debug!(workshop_id = %item.id, "backend is current, skipping download");
        }
    }
    candidates
}
