mod common;

use std::fs;

use assert_matches::assert_matches;
use chrono::Utc;

use datastore_coordinator::domain::{Direction, RequestState};
use datastore_coordinator::error::DatastoreError;
use datastore_coordinator::partition::{PartitionLimits, partition};
use datastore_coordinator::request::RequestRecord;
use datastore_coordinator::store::RequestStore;
use datastore_coordinator::submit::submit_pending;

use common::{FakeTransfer, archive_transfers, temp_store};

fn three_job_request(store: &RequestStore) -> RequestRecord {
    let limits = PartitionLimits {
        max_files: 2,
        ..PartitionLimits::default()
    };
    let specs = partition(archive_transfers(6), limits).unwrap();
    assert_eq!(specs.len(), 3);
    let mut record = RequestRecord::new(Direction::Archive, specs, Vec::new(), vec![10]);
    store.insert(&mut record).unwrap();
    record
}

#[test]
fn failed_job_keeps_earlier_handles() {
    let (_temp, store) = temp_store();
    let record = three_job_request(&store);
    let transfer = FakeTransfer::default().rejecting(1);

    let report = submit_pending(&transfer, &store, &record.id).unwrap();
    assert_eq!(report.state, RequestState::PartiallySubmitted);
    let submitted: Vec<usize> = report.submitted.iter().map(|job| job.ordinal).collect();
    assert_eq!(submitted, vec![0, 2]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].ordinal, 1);
    assert_eq!(report.failed[0].files, 2);

    let stored = store.load(&record.id).unwrap();
    assert_eq!(stored.cached_state, RequestState::PartiallySubmitted);
    assert_eq!(
        stored.specs[0].handle.as_ref().map(|handle| handle.job_id.to_string()),
        Some("job-1".to_string())
    );
    assert!(stored.specs[1].handle.is_none());
    assert!(stored.specs[1].submission_error.is_some());
    assert!(stored.specs[2].handle.is_some());
}

#[test]
fn resubmission_only_sends_unsubmitted_specs() {
    let (_temp, store) = temp_store();
    let record = three_job_request(&store);
    let transfer = FakeTransfer::default().rejecting(1);
    submit_pending(&transfer, &store, &record.id).unwrap();

    transfer.accept_all();
    let report = submit_pending(&transfer, &store, &record.id).unwrap();
    assert_eq!(report.submitted.len(), 1);
    assert_eq!(report.submitted[0].ordinal, 1);
    assert!(report.failed.is_empty());
    assert_eq!(report.state, RequestState::InProgress);

    let ordinals: Vec<usize> = transfer.submitted().iter().map(|spec| spec.ordinal).collect();
    assert_eq!(ordinals, vec![0, 2, 1]);

    let stored = store.load(&record.id).unwrap();
    assert_eq!(stored.job_ids().len(), 3);
    assert!(stored.specs.iter().all(|spec| spec.submission_error.is_none()));
    assert_eq!(
        stored.specs[0].handle.as_ref().map(|handle| handle.job_id.to_string()),
        Some("job-1".to_string())
    );
}

#[test]
fn abandoned_requests_are_not_submitted() {
    let (_temp, store) = temp_store();
    let record = three_job_request(&store);
    store
        .update(&record.id, |record| {
            record.abandoned_at = Some(Utc::now());
            Ok(())
        })
        .unwrap();

    let transfer = FakeTransfer::default();
    let err = submit_pending(&transfer, &store, &record.id).unwrap_err();
    assert_matches!(err, DatastoreError::InvalidRequest(_));
    assert!(transfer.submitted().is_empty());
}

#[test]
fn jobs_that_cannot_be_recorded_are_named() {
    let (_temp, store) = temp_store();
    let record = three_job_request(&store);
    let request_dir = store.request_dir(&record.id);
    let transfer = FakeTransfer::default().with_submit_hook(move |spec| {
        if spec.ordinal == 2 {
            fs::remove_dir_all(&request_dir).unwrap();
        }
    });

    let err = submit_pending(&transfer, &store, &record.id).unwrap_err();
    assert_matches!(
        err,
        DatastoreError::JobsNotRecorded { jobs, .. } if jobs == "0=job-1, 1=job-2, 2=job-3"
    );
    assert_eq!(transfer.submitted().len(), 3);
}
