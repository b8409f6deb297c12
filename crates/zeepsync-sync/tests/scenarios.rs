use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use zeepsync_adapters::memory::{
    BackendCall, MemoryAcquisition, MemoryCatalog, MemoryLevelBackend, MemoryUploadClient,
};
use zeepsync_core::{fingerprint, parse_level, LevelRecord, SortOrder, WorkshopItem};
use zeepsync_storage::LocalStaging;
use zeepsync_sync::{
    Collaborators, CycleStats, EngineSettings, PassStop, Phase, Supervisor, SyncEngine,
};

const WORKSHOP_ID: &str = "3001";
const CREATOR: &str = "76561198000000001";

struct Harness {
    catalog: Arc<MemoryCatalog>,
    acquisition: Arc<MemoryAcquisition>,
    backend: Arc<MemoryLevelBackend>,
    uploads: Arc<MemoryUploadClient>,
    staging_root: PathBuf,
    engine: SyncEngine,
    _tmp: TempDir,
}

fn harness(backend: MemoryLevelBackend) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let staging_root = tmp.path().join("items");
    let catalog = Arc::new(MemoryCatalog::new());
    let acquisition = Arc::new(MemoryAcquisition::new());
    let backend = Arc::new(backend);
    let uploads = Arc::new(MemoryUploadClient::new());

    let collab = Collaborators {
        catalog: catalog.clone(),
        acquisition: acquisition.clone(),
        backend: backend.clone(),
        uploads: uploads.clone(),
        staging: Arc::new(LocalStaging::new(&staging_root)),
    };
    Harness {
        catalog,
        acquisition,
        backend,
        uploads,
        staging_root,
        engine: SyncEngine::new(collab, EngineSettings::default()),
        _tmp: tmp,
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap() + Duration::seconds(secs)
}

fn item(id: &str, updated: i64) -> WorkshopItem {
    WorkshopItem {
        id: id.into(),
        creator_id: CREATOR.into(),
        title: "Canyon Run".into(),
        created_at: at(0),
        updated_at: at(updated),
    }
}

fn payload(uid: &str, body: &str) -> String {
    format!("LevelEditor2,bert,{uid}\n0,0,0\n30.5,32,40,50\n{body}\n")
}

fn hash_of(text: &str) -> String {
    parse_level(text).expect("payload").fingerprint
}

fn record(id: i64, name: &str, uid: &str, hash: &str, updated: i64) -> LevelRecord {
    LevelRecord {
        id,
        workshop_id: WORKSHOP_ID.into(),
        author_id: CREATOR.into(),
        name: name.into(),
        file_uid: uid.into(),
        file_hash: hash.into(),
        file_author: "bert".into(),
        file_url: "memory://levels/seed".into(),
        image_url: String::new(),
        validation: 30.5,
        gold: 32.0,
        silver: 40.0,
        bronze: 50.0,
        validated: true,
        created_at: at(0),
        updated_at: at(updated),
        replaced_by: None,
    }
}

fn files(entries: &[(&str, &str)]) -> Vec<(PathBuf, Vec<u8>)> {
    entries
        .iter()
        .map(|(path, text)| (PathBuf::from(path), text.as_bytes().to_vec()))
        .collect()
}

fn count_creates(calls: &[BackendCall]) -> usize {
    calls
        .iter()
        .filter(|c| matches!(c, BackendCall::Create { .. }))
        .count()
}

fn staging_is_clean(root: &Path) -> bool {
    !root.join(WORKSHOP_ID).exists()
}

#[tokio::test]
async fn new_item_with_one_file_creates_one_active_record() {
    let h = harness(MemoryLevelBackend::new());
    let text = payload("uid-1", "block,1,2,3");
    h.acquisition
        .set_files(WORKSHOP_ID, files(&[("canyon.zeeplevel", text.as_str())]));

    let mut stats = CycleStats::default();
    let report = h
        .engine
        .process_item(&item(WORKSHOP_ID, 0), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    assert!(report.is_productive());
    assert_eq!(count_creates(&h.backend.mutations()), 1);
    assert_eq!(h.backend.mutations().len(), 1);

    let active = h.backend.active_for(WORKSHOP_ID);
    assert_eq!(active.len(), 1);
    let created = &active[0];
    assert_eq!(created.replaced_by, None);
    assert_eq!(created.name, "canyon");
    assert_eq!(created.file_uid, "uid-1");
    assert_eq!(created.file_hash, fingerprint("0,-1\nblock,1,2,3"));
    assert!(created.validated);
    assert_eq!(created.image_url, EngineSettings::default().placeholder_thumbnail_url);
    assert_eq!(h.uploads.uploaded_payloads().len(), 1);
    assert!(h.uploads.uploaded_thumbnails().is_empty());
    assert_eq!(stats.created, 1);
    assert!(staging_is_clean(&h.staging_root));
}

#[tokio::test]
async fn sibling_image_is_uploaded_as_thumbnail() {
    let h = harness(MemoryLevelBackend::new());
    let text = payload("uid-1", "block,1,2,3");
    h.acquisition.set_files(
        WORKSHOP_ID,
        vec![
            (PathBuf::from("canyon.zeeplevel"), text.into_bytes()),
            (PathBuf::from("canyon.jpg"), vec![0xFFu8, 0xD8, 0xFF]),
        ],
    );

    let mut stats = CycleStats::default();
    h.engine
        .process_item(&item(WORKSHOP_ID, 0), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    let thumbnails = h.uploads.uploaded_thumbnails();
    assert_eq!(thumbnails.len(), 1);
    assert_eq!(thumbnails[0].1, "image/jpeg");
    let created = &h.backend.active_for(WORKSHOP_ID)[0];
    assert!(created.image_url.starts_with("memory://thumbnails/"));
}

#[tokio::test]
async fn png_thumbnail_is_uploaded_as_png() {
    let h = harness(MemoryLevelBackend::new());
    let text = payload("uid-1", "block,1,2,3");
    h.acquisition.set_files(
        WORKSHOP_ID,
        vec![
            (PathBuf::from("canyon.zeeplevel"), text.into_bytes()),
            (PathBuf::from("canyon.png"), vec![0x89u8, 0x50, 0x4E, 0x47]),
        ],
    );

    let mut stats = CycleStats::default();
    h.engine
        .process_item(&item(WORKSHOP_ID, 0), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    let thumbnails = h.uploads.uploaded_thumbnails();
    assert_eq!(thumbnails.len(), 1);
    assert_eq!(thumbnails[0].1, "image/png");
}

#[tokio::test]
async fn metadata_only_republish_touches_the_timestamp() {
    let text = payload("uid-1", "block,1,2,3");
    let backend =
        MemoryLevelBackend::with_records(vec![record(7, "canyon", "uid-1", &hash_of(&text), 0)]);
    let h = harness(backend);
    h.acquisition
        .set_files(WORKSHOP_ID, files(&[("canyon.zeeplevel", text.as_str())]));

    let mut stats = CycleStats::default();
    let report = h
        .engine
        .process_item(&item(WORKSHOP_ID, 10), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    assert!(!report.is_productive());
    assert_eq!(
        h.backend.mutations(),
        vec![BackendCall::UpdateTimestamp {
            id: 7,
            updated_at: at(10).timestamp()
        }]
    );
    let touched = h.backend.record(7).expect("record");
    assert_eq!(touched.file_uid, "uid-1");
    assert_eq!(touched.file_hash, hash_of(&text));
    assert_eq!(touched.updated_at, at(10));
    assert_eq!(stats.touched, 1);
}

#[tokio::test]
async fn different_uid_creates_and_supersedes() {
    let old_text = payload("uid-0", "block,0,0,0");
    let backend = MemoryLevelBackend::with_records(vec![record(
        1,
        "canyon",
        "uid-0",
        &hash_of(&old_text),
        0,
    )]);
    let h = harness(backend);
    h.acquisition.set_files(
        WORKSHOP_ID,
        files(&[("canyon.zeeplevel", payload("uid-1", "block,1,2,3").as_str())]),
    );

    let mut stats = CycleStats::default();
    h.engine
        .process_item(&item(WORKSHOP_ID, 10), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    let mutations = h.backend.mutations();
    assert_eq!(mutations.len(), 2);
    assert!(matches!(mutations[0], BackendCall::Create { .. }));
    assert_eq!(mutations[1], BackendCall::Replace { old_id: 1, new_id: 2 });
    assert_eq!(h.backend.record(1).expect("old").replaced_by, Some(2));
    let active = h.backend.active_for(WORKSHOP_ID);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].file_uid, "uid-1");
    assert_eq!(stats.replaced, 1);
}

#[tokio::test]
async fn orphaned_record_is_deleted_before_reconciliation() {
    let alpha = payload("uid-a", "block,1,1,1");
    let backend = MemoryLevelBackend::with_records(vec![
        record(1, "alpha", "uid-a", &hash_of(&alpha), 0),
        record(2, "beta", "uid-b", "BETA", 0),
    ]);
    let h = harness(backend);
    h.acquisition
        .set_files(WORKSHOP_ID, files(&[("alpha.zeeplevel", alpha.as_str())]));

    let mut stats = CycleStats::default();
    let report = h
        .engine
        .process_item(&item(WORKSHOP_ID, 0), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    assert_eq!(h.backend.mutations(), vec![BackendCall::Delete(2)]);
    let calls = h.backend.calls();
    let delete_at = calls
        .iter()
        .position(|c| *c == BackendCall::Delete(2))
        .expect("delete call");
    let last_lookup = calls
        .iter()
        .rposition(|c| matches!(c, BackendCall::Lookup(_)))
        .expect("lookup call");
    assert!(delete_at < last_lookup);
    assert_eq!(report.deleted, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(h.backend.active_for(WORKSHOP_ID).len(), 1);
}

#[tokio::test]
async fn unchanged_content_is_skipped_on_every_repeat() {
    let h = harness(MemoryLevelBackend::new());
    h.acquisition.set_files(
        WORKSHOP_ID,
        files(&[("canyon.zeeplevel", payload("uid-1", "block,1,2,3").as_str())]),
    );
    let cancel = CancellationToken::new();
    let mut stats = CycleStats::default();

    for _ in 0..3 {
        h.engine
            .process_item(&item(WORKSHOP_ID, 0), &cancel, &mut stats)
            .await
            .expect("item");
    }

    assert_eq!(count_creates(&h.backend.calls()), 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.skipped, 2);
    assert_eq!(h.backend.records().len(), 1);
}

#[tokio::test]
async fn replace_chain_stays_acyclic_with_one_active_record() {
    let h = harness(MemoryLevelBackend::new());
    let cancel = CancellationToken::new();
    let mut stats = CycleStats::default();

    for (version, uid) in ["uid-1", "uid-2", "uid-3", "uid-4"].iter().enumerate() {
        h.acquisition.set_files(
            WORKSHOP_ID,
            files(&[("canyon.zeeplevel", payload(uid, &format!("block,{version}")).as_str())]),
        );
        h.engine
            .process_item(&item(WORKSHOP_ID, version as i64 * 60), &cancel, &mut stats)
            .await
            .expect("item");
    }

    let records = h.backend.records();
    assert_eq!(records.len(), 4);
    assert_eq!(records.iter().filter(|r| r.is_active()).count(), 1);

    for start in &records {
        let mut seen = vec![start.id];
        let mut next = start.replaced_by;
        while let Some(id) = next {
            assert!(!seen.contains(&id), "replacement chain loops through {id}");
            seen.push(id);
            next = h.backend.record(id).expect("linked record").replaced_by;
        }
    }
    assert_eq!(stats.replaced, 3);
}

#[tokio::test]
async fn failed_link_is_a_critical_consistency_failure() {
    let backend = MemoryLevelBackend::with_records(vec![record(1, "canyon", "uid-0", "OLD", 0)]);
    backend.set_fail_replace(true);
    let h = harness(backend);
    h.acquisition.set_files(
        WORKSHOP_ID,
        files(&[("canyon.zeeplevel", payload("uid-1", "block,1,2,3").as_str())]),
    );

    let mut stats = CycleStats::default();
    let report = h
        .engine
        .process_item(&item(WORKSHOP_ID, 10), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    assert_eq!(report.failures, 1);
    assert_eq!(stats.consistency_failures, 1);
    assert_eq!(stats.file_failures, 1);
    assert_eq!(h.backend.active_for(WORKSHOP_ID).len(), 2);
}

#[tokio::test]
async fn invalid_file_does_not_abort_its_siblings() {
    let h = harness(MemoryLevelBackend::new());
    h.acquisition.set_files(
        WORKSHOP_ID,
        files(&[
            ("broken.zeeplevel", "only,two"),
            ("empty.zeeplevel", ""),
            ("good.zeeplevel", payload("uid-1", "block,1,2,3").as_str()),
        ]),
    );

    let mut stats = CycleStats::default();
    let report = h
        .engine
        .process_item(&item(WORKSHOP_ID, 0), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    assert_eq!(report.files, 3);
    assert_eq!(report.failures, 2);
    assert_eq!(report.changes, 1);
    assert_eq!(stats.file_failures, 2);
    assert_eq!(count_creates(&h.backend.mutations()), 1);
}

#[tokio::test]
async fn failed_create_leaves_no_record_and_siblings_still_run() {
    let backend = MemoryLevelBackend::new();
    backend.set_fail_create(true);
    let h = harness(backend);
    h.acquisition.set_files(
        WORKSHOP_ID,
        files(&[
            ("alpha.zeeplevel", payload("uid-a", "block,1,1,1").as_str()),
            ("beta.zeeplevel", payload("uid-b", "block,2,2,2").as_str()),
        ]),
    );

    let mut stats = CycleStats::default();
    let report = h
        .engine
        .process_item(&item(WORKSHOP_ID, 0), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    assert_eq!(report.failures, 2);
    assert!(report.is_productive());
    assert_eq!(count_creates(&h.backend.calls()), 2);
    assert!(h.backend.records().is_empty());
    // Uploaded archives are not rolled back.
    assert_eq!(h.uploads.uploaded_payloads().len(), 2);
    assert_eq!(stats.file_failures, 2);
    assert_eq!(stats.consistency_failures, 0);
    assert!(staging_is_clean(&h.staging_root));
}

#[tokio::test]
async fn upload_failure_aborts_only_that_file() {
    let alpha = payload("uid-a", "block,1,1,1");
    let backend =
        MemoryLevelBackend::with_records(vec![record(1, "alpha", "uid-a", &hash_of(&alpha), 0)]);
    let h = harness(backend);
    h.uploads.set_fail(true);
    h.acquisition.set_files(
        WORKSHOP_ID,
        files(&[
            ("alpha.zeeplevel", alpha.as_str()),
            ("beta.zeeplevel", payload("uid-b", "block,2,2,2").as_str()),
        ]),
    );

    let mut stats = CycleStats::default();
    let report = h
        .engine
        .process_item(&item(WORKSHOP_ID, 10), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    assert_eq!(report.failures, 1);
    assert_eq!(report.no_ops, 1);
    assert_eq!(stats.touched, 1);
    assert_eq!(stats.file_failures, 1);
    assert_eq!(count_creates(&h.backend.calls()), 0);
    assert_eq!(
        h.backend.mutations(),
        vec![BackendCall::UpdateTimestamp {
            id: 1,
            updated_at: at(10).timestamp()
        }]
    );
    assert_eq!(h.backend.records().len(), 1);
}

fn orphan_page(h: &Harness) -> Vec<WorkshopItem> {
    h.acquisition.set_files(
        WORKSHOP_ID,
        files(&[("canyon.zeeplevel", payload("uid-1", "block,1,2,3").as_str())]),
    );
    h.acquisition.set_files(
        "3002",
        files(&[("dunes.zeeplevel", payload("uid-2", "block,4,5,6").as_str())]),
    );
    vec![item(WORKSHOP_ID, 10), item("3002", 10)]
}

#[tokio::test]
async fn orphan_delete_failure_fails_the_item_but_not_the_pass() {
    let backend = MemoryLevelBackend::with_records(vec![record(1, "stale", "uid-s", "STALE", 0)]);
    backend.set_fail_delete(true);
    let h = harness(backend);
    let page = orphan_page(&h);
    h.catalog.set_pages(SortOrder::Created, vec![page]);

    let mut stats = CycleStats::default();
    let stop = h
        .engine
        .run_pass(SortOrder::Created, &CancellationToken::new(), &mut stats)
        .await
        .expect("pass");

    assert_eq!(stop, PassStop::Exhausted);
    assert_eq!(stats.item_failures, 1);
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.created, 1);
    assert!(h.backend.calls().contains(&BackendCall::Delete(1)));
    let untouched = h.backend.active_for(WORKSHOP_ID);
    assert_eq!(untouched.len(), 1);
    assert_eq!(untouched[0].name, "stale");
    assert_eq!(h.backend.active_for("3002").len(), 1);
    assert!(staging_is_clean(&h.staging_root));
}

#[tokio::test]
async fn orphan_lookup_failure_fails_the_item_but_not_the_pass() {
    let backend = MemoryLevelBackend::new();
    backend.fail_lookups_for(WORKSHOP_ID);
    let h = harness(backend);
    let page = orphan_page(&h);
    h.catalog.set_pages(SortOrder::Created, vec![page]);

    let mut stats = CycleStats::default();
    let stop = h
        .engine
        .run_pass(SortOrder::Created, &CancellationToken::new(), &mut stats)
        .await
        .expect("pass");

    assert_eq!(stop, PassStop::Exhausted);
    assert_eq!(stats.item_failures, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(
        h.acquisition.fetched(),
        vec![WORKSHOP_ID.to_string(), "3002".to_string()]
    );
    assert!(h.backend.active_for(WORKSHOP_ID).is_empty());
    assert_eq!(h.backend.active_for("3002").len(), 1);
}

#[tokio::test]
async fn acquisition_failure_fails_the_item_and_cleans_staging() {
    let h = harness(MemoryLevelBackend::new());
    h.acquisition.fail_item(WORKSHOP_ID);

    let mut stats = CycleStats::default();
    let result = h
        .engine
        .process_item(&item(WORKSHOP_ID, 0), &CancellationToken::new(), &mut stats)
        .await;

    assert!(result.is_err());
    assert!(h.backend.mutations().is_empty());
    assert_eq!(stats.items_acquired, 0);
    assert!(staging_is_clean(&h.staging_root));
}

#[tokio::test]
async fn quarantine_sync_repairs_timestamps_on_count_drift() {
    let text = payload("uid-1", "block,1,2,3");
    let backend =
        MemoryLevelBackend::with_records(vec![record(4, "canyon", "uid-1", &hash_of(&text), 100)]);
    let h = harness(backend);
    h.acquisition.set_files(
        WORKSHOP_ID,
        files(&[("a/canyon.zeeplevel", text.as_str()), ("b/canyon.zeeplevel", text.as_str())]),
    );

    let mut stats = CycleStats::default();
    let report = h
        .engine
        .process_item(&item(WORKSHOP_ID, 0), &CancellationToken::new(), &mut stats)
        .await
        .expect("item");

    assert!(report.all_no_op());
    assert_eq!(report.quarantine_touches, 1);
    assert_eq!(stats.quarantine_touches, 1);
    assert_eq!(
        h.backend.mutations(),
        vec![BackendCall::UpdateTimestamp {
            id: 4,
            updated_at: at(0).timestamp()
        }]
    );
}

#[tokio::test]
async fn pass_halts_after_five_unproductive_pages() {
    let text = payload("uid-1", "block,1,2,3");
    let mut seeded = Vec::new();
    let mut pages = Vec::new();
    for n in 1..=8 {
        let id = format!("item-{n}");
        let mut rec = record(n, "canyon", "uid-1", &hash_of(&text), 0);
        rec.workshop_id = id.clone();
        seeded.push(rec);
        pages.push(vec![item(&id, 0)]);
    }
    let h = harness(MemoryLevelBackend::with_records(seeded));
    h.catalog.set_pages(SortOrder::LastModified, pages);

    let mut stats = CycleStats::default();
    let stop = h
        .engine
        .run_pass(SortOrder::LastModified, &CancellationToken::new(), &mut stats)
        .await
        .expect("pass");

    assert_eq!(stop, PassStop::Unproductive);
    assert_eq!(
        h.catalog.requested_pages(SortOrder::LastModified),
        vec![1, 2, 3, 4, 5]
    );
    assert!(h.acquisition.fetched().is_empty());
    assert_eq!(stats.pages, 5);
}

#[tokio::test]
async fn productive_pages_run_the_pass_to_the_end() {
    let h = harness(MemoryLevelBackend::new());
    let mut pages = Vec::new();
    for n in 1..=7 {
        let id = format!("item-{n}");
        h.acquisition.set_files(
            &id,
            files(&[("level.zeeplevel", payload(&format!("uid-{n}"), "block").as_str())]),
        );
        pages.push(vec![item(&id, 0)]);
    }
    h.catalog.set_pages(SortOrder::Created, pages);

    let mut stats = CycleStats::default();
    let stop = h
        .engine
        .run_pass(SortOrder::Created, &CancellationToken::new(), &mut stats)
        .await
        .expect("pass");

    assert_eq!(stop, PassStop::Exhausted);
    assert_eq!(stats.created, 7);
    assert_eq!(h.catalog.requested_pages(SortOrder::Created).len(), 7);
}

#[tokio::test]
async fn failed_items_count_as_productive() {
    let h = harness(MemoryLevelBackend::new());
    let mut pages = Vec::new();
    for n in 1..=6 {
        let id = format!("item-{n}");
        h.acquisition.fail_item(&id);
        pages.push(vec![item(&id, 0)]);
    }
    h.catalog.set_pages(SortOrder::Created, pages);

    let mut stats = CycleStats::default();
    let stop = h
        .engine
        .run_pass(SortOrder::Created, &CancellationToken::new(), &mut stats)
        .await
        .expect("pass");

    assert_eq!(stop, PassStop::Exhausted);
    assert_eq!(stats.item_failures, 6);
}

#[tokio::test]
async fn failed_probe_skips_the_pass() {
    let backend = MemoryLevelBackend::new();
    backend.set_fail_probe(true);
    let h = harness(backend);
    h.catalog
        .set_pages(SortOrder::Created, vec![vec![item(WORKSHOP_ID, 0)]]);

    let mut stats = CycleStats::default();
    let stop = h
        .engine
        .run_pass(SortOrder::Created, &CancellationToken::new(), &mut stats)
        .await
        .expect("pass");

    assert_eq!(stop, PassStop::ProbeFailed);
    assert!(h.catalog.requested_pages(SortOrder::Created).is_empty());
}

#[tokio::test]
async fn cancellation_stops_before_the_first_page() {
    let h = harness(MemoryLevelBackend::new());
    h.catalog
        .set_pages(SortOrder::Created, vec![vec![item(WORKSHOP_ID, 0)]]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut stats = CycleStats::default();
    let stop = h
        .engine
        .run_pass(SortOrder::Created, &cancel, &mut stats)
        .await
        .expect("pass");

    assert_eq!(stop, PassStop::Cancelled);
    assert!(h.catalog.requested_pages(SortOrder::Created).is_empty());
}

#[tokio::test]
async fn cycle_runs_both_passes_and_closes_the_session() {
    let h = harness(MemoryLevelBackend::new());
    h.acquisition.set_files(
        WORKSHOP_ID,
        files(&[("canyon.zeeplevel", payload("uid-1", "block,1,2,3").as_str())]),
    );
    h.catalog
        .set_pages(SortOrder::LastModified, vec![vec![item(WORKSHOP_ID, 0)]]);
    h.catalog
        .set_pages(SortOrder::Created, vec![vec![item(WORKSHOP_ID, 0)]]);

    let stats = h
        .engine
        .run_cycle(&CancellationToken::new())
        .await
        .expect("cycle");

    assert_eq!(stats.pages, 2);
    assert_eq!(stats.created, 1);
    assert_eq!(h.acquisition.fetched(), vec![WORKSHOP_ID.to_string()]);
    assert_eq!(h.acquisition.sessions(), (1, 1));
}

#[tokio::test]
async fn catalog_failure_fails_the_cycle_but_releases_the_session() {
    let h = harness(MemoryLevelBackend::new());
    h.catalog.set_fail_pages(true);

    let result = h.engine.run_cycle(&CancellationToken::new()).await;

    assert!(result.is_err());
    assert_eq!(h.acquisition.sessions(), (1, 1));
}

#[tokio::test]
async fn session_init_failure_fails_the_cycle_and_still_disposes() {
    let h = harness(MemoryLevelBackend::new());
    h.acquisition.set_fail_init(true);
    h.catalog
        .set_pages(SortOrder::LastModified, vec![vec![item(WORKSHOP_ID, 0)]]);

    let result = h.engine.run_cycle(&CancellationToken::new()).await;

    assert!(result.is_err());
    assert_eq!(h.acquisition.sessions(), (0, 1));
    assert!(h.catalog.requested_pages(SortOrder::LastModified).is_empty());
    assert!(h.catalog.requested_pages(SortOrder::Created).is_empty());
    assert!(h.acquisition.fetched().is_empty());
}

#[tokio::test]
async fn supervisor_backs_off_and_resets() {
    let h = harness(MemoryLevelBackend::new());
    let mut supervisor = Supervisor::new(
        h.engine.clone(),
        StdDuration::from_secs(300),
        StdDuration::from_secs(60),
    );
    assert_eq!(supervisor.phase(), Phase::Idle);

    assert_eq!(supervisor.complete_cycle(false), StdDuration::from_secs(300));
    assert_eq!(supervisor.phase(), Phase::Backoff(StdDuration::from_secs(300)));
    assert_eq!(supervisor.complete_cycle(false), StdDuration::from_secs(600));
    assert_eq!(supervisor.complete_cycle(true), StdDuration::from_secs(60));
    assert_eq!(supervisor.phase(), Phase::Idle);
    assert_eq!(supervisor.backoff().current(), StdDuration::from_secs(300));
}

#[tokio::test]
async fn supervisor_stops_when_cancelled() {
    let h = harness(MemoryLevelBackend::new());
    let mut supervisor = Supervisor::new(
        h.engine.clone(),
        StdDuration::from_secs(300),
        StdDuration::from_secs(3600),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        trigger.cancel();
    });

    supervisor.run_until_cancelled(&cancel).await;

    assert_eq!(supervisor.cycles(), 1);
    assert_eq!(supervisor.phase(), Phase::Idle);
    assert_eq!(h.acquisition.sessions(), (1, 1));
}
