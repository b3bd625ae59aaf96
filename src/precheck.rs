use tracing::{info, warn};

use crate::catalogue::{CatalogueClient, StateParameter};
use crate::domain::FileState;
use crate::error::DatastoreError;
use crate::request::FileTransfer;
use crate::transfer::TransferClient;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateOutcome {
    /// Files that still have to be transferred, in input order.
    pub pending: Vec<FileTransfer>,
    /// Files already present at their destination.
    pub satisfied: Vec<FileTransfer>,
}

/// Splits off files that already exist at their destination. A failed existence check
/// counts as "not present" so the file is transferred anyway.
pub fn filter_present<T: TransferClient + ?Sized>(
    transfer: &T,
    files: Vec<FileTransfer>,
) -> GateOutcome {
    let mut outcome = GateOutcome::default();
    for file in files {
        match transfer.stat(&file.destination_url) {
            Ok(Some(_)) => outcome.satisfied.push(file),
            Ok(None) => outcome.pending.push(file),
            Err(err) => {
                warn!(
                    url = %file.destination_url,
                    error = %err,
                    "destination existence check failed; assuming not present"
                );
                outcome.pending.push(file);
            }
        }
    }
    if !outcome.satisfied.is_empty() {
        info!(
            present = outcome.satisfied.len(),
            pending = outcome.pending.len(),
            "skipping files already at destination"
        );
    }
    outcome
}

/// Records files found at their destination as finished. Failures are logged; the request
/// still treats those files as satisfied.
pub fn mark_satisfied<C: CatalogueClient + ?Sized>(
    catalogue: &C,
    parameter: StateParameter,
    files: &[FileTransfer],
) {
    for file in files {
        if let Err(err) = catalogue.set_datafile_state(file.datafile_id, parameter, FileState::Finished)
        {
            warn!(datafile = file.datafile_id, error = %err, "failed to mark present file as finished");
        }
    }
}

/// Confirms every source exists, filling in sizes the request did not carry. Transport
/// failures are logged and the file is assumed present.
pub fn check_sources<T: TransferClient + ?Sized>(
    transfer: &T,
    files: &mut [FileTransfer],
) -> Result<(), DatastoreError> {
    for file in files.iter_mut() {
        let url = strip_query(&file.source_url);
        match transfer.stat(url) {
            Ok(Some(stat)) => {
                if file.size.is_none() {
                    file.size = stat.size;
                }
            }
            Ok(None) => return Err(DatastoreError::SourceMissing(url.to_string())),
            Err(err) => {
                warn!(url, error = %err, "source check failed; continuing");
            }
        }
    }
    Ok(())
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_copy_mode_query() {
        assert_eq!(
            strip_query("davs://cache.example/data/a.nxs?copy_mode=push"),
            "davs://cache.example/data/a.nxs"
        );
        assert_eq!(strip_query("root://a//b"), "root://a//b");
    }
}
