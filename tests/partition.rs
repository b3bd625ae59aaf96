mod common;

use assert_matches::assert_matches;

use datastore_coordinator::error::DatastoreError;
use datastore_coordinator::partition::{PartitionLimits, estimate_payload, partition, validate_sizes};
use datastore_coordinator::request::FileTransfer;

use common::{archive_transfers, disk, tape};

fn limits(max_files: usize, max_payload_bytes: usize) -> PartitionLimits {
    PartitionLimits {
        max_files,
        max_payload_bytes,
    }
}

fn datafile_ids(files: &[FileTransfer]) -> Vec<i64> {
    files.iter().map(|file| file.datafile_id).collect()
}

#[test]
fn uniform_small_request_is_one_job() {
    let specs = partition(archive_transfers(4), PartitionLimits::default()).unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].ordinal, 0);
    assert_eq!(specs[0].files.len(), 4);
    assert_eq!(specs[0].source_key, "idc");
    assert_eq!(specs[0].destination_key, "tape");
    assert_eq!(specs[0].options.archive_timeout, Some(900));
}

#[test]
fn splits_at_the_file_limit() {
    let specs = partition(archive_transfers(2500), limits(1000, usize::MAX)).unwrap();
    let sizes: Vec<usize> = specs.iter().map(|spec| spec.files.len()).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
    let ordinals: Vec<usize> = specs.iter().map(|spec| spec.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
}

#[test]
fn keeps_order_without_loss_or_duplication() {
    let input = archive_transfers(2500);
    let specs = partition(input.clone(), limits(700, usize::MAX)).unwrap();
    let flattened: Vec<FileTransfer> = specs.into_iter().flat_map(|spec| spec.files).collect();
    assert_eq!(datafile_ids(&flattened), datafile_ids(&input));
}

#[test]
fn partitioning_is_deterministic() {
    let first = partition(archive_transfers(1234), limits(100, 64 * 1024)).unwrap();
    let second = partition(archive_transfers(1234), limits(100, 64 * 1024)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn staged_and_unstaged_files_never_share_a_job() {
    let staged = FileTransfer::between(&tape(), &disk("idc"), 1, 10, "inv/ds/a.nxs");
    let unstaged = FileTransfer::between(&disk("rdc"), &disk("idc"), 2, 10, "inv/ds/b.nxs");
    let staged_again = FileTransfer::between(&tape(), &disk("idc"), 3, 10, "inv/ds/c.nxs");

    let specs = partition(
        vec![staged, unstaged, staged_again],
        PartitionLimits::default(),
    )
    .unwrap();

    assert_eq!(specs.len(), 3);
    assert!(specs[0].options.requires_staging());
    assert!(!specs[1].options.requires_staging());
    assert!(specs[2].options.requires_staging());
    for spec in &specs {
        assert!(spec.files.iter().all(|file| file.options == spec.options));
    }
}

#[test]
fn payload_limit_bounds_every_job() {
    let files = archive_transfers(50);
    let largest = files.iter().map(estimate_payload).max().unwrap();
    let budget = 256 + largest * 10;
    let specs = partition(files, limits(1000, budget)).unwrap();

    assert!(specs.len() >= 5);
    assert_eq!(specs.iter().map(|spec| spec.files.len()).sum::<usize>(), 50);
    for spec in &specs {
        let payload: usize = spec.files.iter().map(estimate_payload).sum();
        assert!(256 + payload <= budget);
    }
}

#[test]
fn oversized_single_file_is_rejected() {
    let files = archive_transfers(1);
    let err = partition(files, limits(1000, 300)).unwrap_err();
    assert_matches!(err, DatastoreError::PayloadTooLarge { limit: 300, .. });
}

#[test]
fn empty_input_is_a_no_op() {
    assert!(partition(Vec::new(), PartitionLimits::default()).unwrap().is_empty());
}

#[test]
fn size_limits_name_the_offending_size() {
    let files: Vec<FileTransfer> = archive_transfers(3)
        .into_iter()
        .map(|file| file.with_size(Some(40)))
        .collect();
    assert!(validate_sizes(&files, Some(40), Some(120)).is_ok());
    assert_matches!(
        validate_sizes(&files, Some(39), None),
        Err(DatastoreError::FileTooLarge { size: 40, limit: 39 })
    );
    assert_matches!(
        validate_sizes(&files, None, Some(100)),
        Err(DatastoreError::TotalSizeExceeded { size: 120, limit: 100 })
    );
}
