use tracing::warn;

use crate::config::{default_max_files_per_job, default_max_payload_bytes};
use crate::domain::VerifyChecksum;
use crate::error::DatastoreError;
use crate::request::{FileTransfer, TransferJobSpec};

/// Envelope of a submitted job: parameters, braces and array framing.
const JOB_OVERHEAD_BYTES: usize = 256;
/// Per-file JSON keys and punctuation around the urls and checksum.
const FILE_OVERHEAD_BYTES: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLimits {
    pub max_files: usize,
    pub max_payload_bytes: usize,
}

impl Default for PartitionLimits {
    fn default() -> Self {
        Self {
            max_files: default_max_files_per_job(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

/// Estimated number of bytes `file` adds to a job submission.
pub fn estimate_payload(file: &FileTransfer) -> usize {
    file.source_url.len()
        + file.destination_url.len()
        + file.checksum.as_ref().map_or(0, String::len)
        + FILE_OVERHEAD_BYTES
}

/// Splits `files` into job specs in input order. A new spec starts whenever the endpoint pair
/// or job options change, or when adding the next file would break either limit.
pub fn partition(
    files: Vec<FileTransfer>,
    limits: PartitionLimits,
) -> Result<Vec<TransferJobSpec>, DatastoreError> {
    let max_files = limits.max_files.max(1);
    let mut specs: Vec<TransferJobSpec> = Vec::new();
    let mut payload = 0usize;

    for file in files {
        let cost = estimate_payload(&file);
        if JOB_OVERHEAD_BYTES + cost > limits.max_payload_bytes {
            return Err(DatastoreError::PayloadTooLarge {
                location: file.location,
                bytes: JOB_OVERHEAD_BYTES + cost,
                limit: limits.max_payload_bytes,
            });
        }

        let fits = specs.last().is_some_and(|spec| {
            spec.source_key == file.source_key
                && spec.destination_key == file.destination_key
                && spec.options == file.options
                && spec.files.len() < max_files
                && payload + cost <= limits.max_payload_bytes
        });

        if fits {
            if let Some(spec) = specs.last_mut() {
                payload += cost;
                spec.files.push(file);
                continue;
            }
        }

        payload = JOB_OVERHEAD_BYTES + cost;
        let ordinal = specs.len();
        specs.push(TransferJobSpec {
            ordinal,
            source_key: file.source_key.clone(),
            destination_key: file.destination_key.clone(),
            options: file.options,
            files: vec![file],
        });
    }

    Ok(specs)
}

/// Checks the per-file and per-request byte limits. Files of unknown size are not counted.
pub fn validate_sizes(
    files: &[FileTransfer],
    file_size_limit: Option<u64>,
    total_file_size_limit: Option<u64>,
) -> Result<(), DatastoreError> {
    let mut total = 0u64;
    for size in files.iter().filter_map(|file| file.size) {
        if let Some(limit) = file_size_limit {
            if size > limit {
                return Err(DatastoreError::FileTooLarge { size, limit });
            }
        }
        total = total.saturating_add(size);
    }
    if let Some(limit) = total_file_size_limit {
        if total > limit {
            return Err(DatastoreError::TotalSizeExceeded { size: total, limit });
        }
    }
    Ok(())
}

/// The checksum to hand to the transfer service for a `mechanism:value` string, or `None`
/// when the verification policy cannot use it.
pub fn select_checksum(
    policy: VerifyChecksum,
    supported: &[String],
    checksum: Option<&str>,
) -> Option<String> {
    if policy == VerifyChecksum::None {
        return None;
    }

    let (mechanism, value) = match checksum {
        Some(checksum) => {
            let (mechanism, value) = match checksum.split_once(':') {
                Some((mechanism, value)) => (mechanism, Some(value)),
                None => (checksum, None),
            };
            if !supported.iter().any(|known| known == mechanism) {
                warn!(
                    mechanism,
                    supported = %supported.join(","),
                    "checksum mechanism not supported"
                );
                return None;
            }
            (Some(mechanism), value.filter(|value| !value.is_empty()))
        }
        None => (None, None),
    };

    match policy {
        VerifyChecksum::Source | VerifyChecksum::Destination => {
            if mechanism.is_none() || value.is_none() {
                warn!(%policy, "both mechanism and value must be specified for checksum verification");
                return None;
            }
            checksum.map(str::to_string)
        }
        VerifyChecksum::Both => {
            if mechanism.is_none() {
                warn!(%policy, "mechanism must be specified for checksum verification");
                return None;
            }
            checksum.map(str::to_string)
        }
        VerifyChecksum::None => None,
    }
}
