mod common;

use std::fs;
use std::thread;

use assert_matches::assert_matches;
use chrono::Utc;

use datastore_coordinator::domain::{Direction, FileState, JobId, RequestId, RequestState};
use datastore_coordinator::error::DatastoreError;
use datastore_coordinator::partition::{PartitionLimits, partition};
use datastore_coordinator::request::{RequestRecord, TransferJobHandle};
use datastore_coordinator::store::RequestStore;

use common::{archive_transfers, temp_store};

fn record() -> RequestRecord {
    let specs = partition(archive_transfers(3), PartitionLimits::default()).unwrap();
    RequestRecord::new(Direction::Archive, specs, Vec::new(), vec![10])
}

#[test]
fn records_roundtrip_through_disk() {
    let (_temp, store) = temp_store();
    let mut record = record();
    store.insert(&mut record).unwrap();
    assert_eq!(record.version, 1);
    assert!(store.version_path(&record.id, 1).as_std_path().exists());

    let loaded = store.load(&record.id).unwrap();
    assert_eq!(loaded, record);
    assert_eq!(loaded.cached_state, RequestState::Submitting);
}

#[test]
fn stale_save_is_a_version_conflict() {
    let (_temp, store) = temp_store();
    let mut record = record();
    store.insert(&mut record).unwrap();

    let mut first = store.load(&record.id).unwrap();
    let mut second = store.load(&record.id).unwrap();
    store.save(&mut first).unwrap();
    assert_eq!(first.version, 2);

    let err = store.save(&mut second).unwrap_err();
    assert_matches!(err, DatastoreError::VersionConflict { expected: 1, found: 2, .. });
    assert_eq!(second.version, 1);
}

#[test]
fn missing_request_is_not_found() {
    let (_temp, store) = temp_store();
    let record = record();
    assert_matches!(store.load(&record.id), Err(DatastoreError::RequestNotFound(_)));
    let mut unsaved = record;
    assert_matches!(store.save(&mut unsaved), Err(DatastoreError::RequestNotFound(_)));
}

#[test]
fn active_list_skips_finished_and_abandoned_requests() {
    let (_temp, store) = temp_store();

    let mut open = record();
    store.insert(&mut open).unwrap();

    let mut abandoned = record();
    abandoned.abandoned_at = Some(Utc::now());
    store.insert(&mut abandoned).unwrap();

    let mut closed = record();
    let id = closed.id;
    for spec in &mut closed.specs {
        let job: JobId = "job-closed".parse().unwrap();
        let mut handle = TransferJobHandle::new(job, id, &spec.spec);
        for file in &mut handle.files {
            file.state = FileState::Finished;
            file.catalogue_synced = true;
        }
        spec.handle = Some(handle);
    }
    closed.closing_update_issued = true;
    closed.refresh_state();
    store.insert(&mut closed).unwrap();

    assert_eq!(store.list().unwrap().len(), 3);
    let active: Vec<_> = store.list_active().unwrap().into_iter().map(|record| record.id).collect();
    assert_eq!(active, vec![open.id]);
}

#[test]
fn stores_sharing_a_root_never_lose_updates() {
    let (_temp, store) = temp_store();
    let mut record = record();
    store.insert(&mut record).unwrap();
    let id = record.id;

    let push_all = |offset: i64| {
        let store = RequestStore::new_with_root(store.root().to_path_buf());
        for value in offset..offset + 100 {
            loop {
                match store.update(&id, |record| {
                    record.datasets.push(value);
                    Ok(())
                }) {
                    Ok(_) => break,
                    Err(DatastoreError::VersionConflict { .. }) => continue,
                    Err(err) => panic!("update failed: {err}"),
                }
            }
        }
    };
    thread::scope(|scope| {
        scope.spawn(|| push_all(1_000));
        scope.spawn(|| push_all(2_000));
    });

    let stored = store.load(&id).unwrap();
    assert_eq!(stored.datasets.len(), 201);
    for value in (1_000..1_100).chain(2_000..2_100) {
        assert!(stored.datasets.contains(&value), "lost update {value}");
    }
    assert_eq!(stored.version, 201);
}

#[test]
fn unreadable_records_are_skipped_when_listing() {
    let (_temp, store) = temp_store();
    let mut healthy = record();
    store.insert(&mut healthy).unwrap();

    let broken = RequestId::new();
    let broken_path = store.version_path(&broken, 1);
    fs::create_dir_all(broken_path.parent().unwrap()).unwrap();
    fs::write(&broken_path, "{not json").unwrap();
    fs::write(store.requests_dir().join("broken.json"), "{not json").unwrap();
    fs::create_dir_all(store.requests_dir().join("not-a-request")).unwrap();

    let listed: Vec<_> = store.list().unwrap().into_iter().map(|record| record.id).collect();
    assert_eq!(listed, vec![healthy.id]);
    assert_matches!(store.load(&broken), Err(DatastoreError::Filesystem(_)));
}
