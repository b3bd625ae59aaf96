use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::catalogue::{CatalogueClient, StateParameter};
use crate::config::{ReconcilerSettings, ResolvedConfig};
use crate::domain::{Direction, FileState, JobId, RequestId, RequestState, VerifyChecksum};
use crate::endpoint::EndpointTable;
use crate::error::DatastoreError;
use crate::partition::{PartitionLimits, partition, select_checksum, validate_sizes};
use crate::precheck::{check_sources, filter_present, mark_satisfied};
use crate::progress::RequestSummary;
use crate::reconcile::{Reconciler, SweepReport};
use crate::request::{ArchiveRequest, FileTransfer, RequestRecord, RestoreRequest};
use crate::store::RequestStore;
use crate::submit::{SubmissionReport, submit_pending};
use crate::transfer::{JobState, TransferClient};

/// Everything the coordinator needs from configuration besides its clients.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub endpoints: EndpointTable,
    pub limits: PartitionLimits,
    pub reconciler: ReconcilerSettings,
    pub verify_checksum: VerifyChecksum,
    pub supported_checksums: Vec<String>,
    pub check_source: bool,
    pub file_size_limit: Option<u64>,
    pub total_file_size_limit: Option<u64>,
}

impl CoordinatorSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            limits: config.limits,
            reconciler: config.reconciler,
            verify_checksum: config.transfer.verify_checksum,
            supported_checksums: config.transfer.supported_checksums.clone(),
            check_source: config.transfer.check_source,
            file_size_limit: config.transfer.file_size_limit,
            total_file_size_limit: config.transfer.total_file_size_limit,
        }
    }

    fn checksum_for(&self, checksum: Option<&str>) -> Option<String> {
        select_checksum(self.verify_checksum, &self.supported_checksums, checksum)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub ordinal: usize,
    pub job_id: Option<JobId>,
    pub files: usize,
    pub submission_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileView {
    pub datafile_id: i64,
    pub dataset_id: i64,
    pub location: String,
    pub state: FileState,
    pub reason: Option<String>,
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub request_id: RequestId,
    pub direction: Direction,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub retry_of: Option<RequestId>,
    pub summary: RequestSummary,
    pub jobs: Vec<JobView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileView>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub request_id: RequestId,
    pub direction: Direction,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    pub jobs: usize,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub requests: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanceledJob {
    pub ordinal: usize,
    pub job_id: JobId,
    pub state: Option<JobState>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelReport {
    pub request_id: RequestId,
    pub jobs: Vec<CanceledJob>,
}

pub struct Coordinator<C: CatalogueClient, T: TransferClient> {
    catalogue: C,
    transfer: T,
    store: RequestStore,
    settings: CoordinatorSettings,
}

impl<C: CatalogueClient, T: TransferClient> Coordinator<C, T> {
    pub fn new(catalogue: C, transfer: T, store: RequestStore, settings: CoordinatorSettings) -> Self {
        Self {
            catalogue,
            transfer,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &RequestStore {
        &self.store
    }

    pub fn catalogue(&self) -> &C {
        &self.catalogue
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    /// Creates the catalogue entries for the request and moves its files to the archive
    /// endpoint.
    pub fn archive(&self, request: &ArchiveRequest) -> Result<SubmissionReport, DatastoreError> {
        request.validate()?;
        let endpoints = &self.settings.endpoints;
        let destination = endpoints.archive()?;

        let mut drafts = Vec::new();
        for investigation in &request.investigations {
            for dataset in &investigation.datasets {
                let source = endpoints.get(dataset.source.as_deref().unwrap_or(request.source.as_str()))?;
                for datafile in &dataset.datafiles {
                    drafts.push(
                        FileTransfer::between(source, destination, 0, 0, &datafile.location)
                            .with_checksum(self.settings.checksum_for(datafile.checksum.as_deref()))
                            .with_size(datafile.size),
                    );
                }
            }
        }

        if self.settings.check_source {
            check_sources(&self.transfer, &mut drafts)?;
        }
        validate_sizes(
            &drafts,
            self.settings.file_size_limit,
            self.settings.total_file_size_limit,
        )?;
        // Fail oversized files before anything is written to the catalogue.
        partition(drafts.clone(), self.settings.limits)?;

        let mut datasets = Vec::new();
        let mut pending = drafts.iter_mut();
        for investigation in &request.investigations {
            let created = self.catalogue.create_investigation(investigation)?;
            if created.len() != investigation.datasets.len() {
                return Err(DatastoreError::CatalogueStatus {
                    status: 200,
                    message: format!(
                        "expected {} datasets for investigation {}, catalogue returned {}",
                        investigation.datasets.len(),
                        investigation.name,
                        created.len()
                    ),
                });
            }
            for (dataset, catalogue_dataset) in investigation.datasets.iter().zip(&created) {
                datasets.push(catalogue_dataset.id);
                for (_, catalogue_file) in dataset.datafiles.iter().zip(&catalogue_dataset.datafiles) {
                    if let Some(draft) = pending.next() {
                        draft.datafile_id = catalogue_file.id;
                        draft.dataset_id = catalogue_dataset.id;
                    }
                }
            }
        }

        let specs = partition(drafts, self.settings.limits)?;
        let mut record = RequestRecord::new(Direction::Archive, specs, Vec::new(), datasets);
        self.store.insert(&mut record)?;
        info!(request = %record.id, jobs = record.specs.len(), "archive request accepted");

        let report = submit_pending(&self.transfer, &self.store, &record.id)?;
        self.record_job_ids(&record.id);
        Ok(report)
    }

    /// Moves the requested files from the archive (or the given source) to `destination`,
    /// skipping those already there.
    pub fn restore(&self, request: &RestoreRequest) -> Result<SubmissionReport, DatastoreError> {
        request.validate()?;
        let endpoints = &self.settings.endpoints;
        let source = endpoints.resolve(request.source.as_deref())?;
        let destination = endpoints.get(&request.destination)?;

        let datafiles = self.catalogue.resolve_datafiles(request)?;
        if datafiles.is_empty() {
            return Err(DatastoreError::InvalidRequest(
                "no datafiles found for the requested ids".to_string(),
            ));
        }

        let transfers: Vec<FileTransfer> = datafiles
            .iter()
            .map(|datafile| {
                FileTransfer::between(
                    source,
                    destination,
                    datafile.id,
                    datafile.dataset_id,
                    &datafile.location,
                )
                .with_checksum(self.settings.checksum_for(datafile.checksum.as_deref()))
                .with_size(datafile.size)
            })
            .collect();
        validate_sizes(
            &transfers,
            self.settings.file_size_limit,
            self.settings.total_file_size_limit,
        )?;

        let mut gate = filter_present(&self.transfer, transfers);
        if self.settings.check_source {
            check_sources(&self.transfer, &mut gate.pending)?;
        }
        let specs = partition(gate.pending, self.settings.limits)?;
        mark_satisfied(&self.catalogue, StateParameter::Restore, &gate.satisfied);

        let datasets: Vec<i64> = datafiles
            .iter()
            .map(|datafile| datafile.dataset_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut record = RequestRecord::new(Direction::Restore, specs, gate.satisfied, datasets);
        self.store.insert(&mut record)?;
        info!(
            request = %record.id,
            jobs = record.specs.len(),
            already_present = record.satisfied.len(),
            "restore request accepted"
        );

        submit_pending(&self.transfer, &self.store, &record.id)
    }

    /// Submits the jobs of a request that could not be submitted before.
    pub fn resubmit(&self, id: &RequestId) -> Result<SubmissionReport, DatastoreError> {
        let record = self.store.load(id)?;
        if record.unsubmitted().next().is_none() {
            return Err(DatastoreError::RetryNotPossible(format!(
                "request {id} has no unsubmitted jobs"
            )));
        }
        let report = submit_pending(&self.transfer, &self.store, id)?;
        if record.direction == Direction::Archive {
            self.record_job_ids(id);
        }
        Ok(report)
    }

    /// Starts a new request for the files that failed in a finished one.
    pub fn retry_failed(&self, id: &RequestId) -> Result<SubmissionReport, DatastoreError> {
        let record = self.store.load(id)?;
        let state = record.derive_state();
        match state {
            RequestState::Completed => {
                return Err(DatastoreError::RetryNotPossible(format!(
                    "request {id} completed, nothing to retry"
                )));
            }
            RequestState::PartiallyFailed | RequestState::Failed => {}
            other => {
                return Err(DatastoreError::RetryNotPossible(format!(
                    "cannot retry request {id} in state {other}"
                )));
            }
        }

        let failed = record.failed_transfers();
        if failed.is_empty() {
            return Err(DatastoreError::RetryNotPossible(format!(
                "request {id} has no failed files, nothing to retry"
            )));
        }

        let datasets: Vec<i64> = failed
            .iter()
            .map(|file| file.dataset_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let specs = partition(failed, self.settings.limits)?;
        let mut retry = RequestRecord::new(record.direction, specs, Vec::new(), datasets);
        retry.retry_of = Some(*id);
        self.store.insert(&mut retry)?;
        info!(request = %retry.id, retry_of = %id, "retrying failed files");

        let report = submit_pending(&self.transfer, &self.store, &retry.id)?;
        if retry.direction == Direction::Archive {
            self.record_job_ids(&retry.id);
        }
        Ok(report)
    }

    /// Stops tracking a request. Jobs already handed to the transfer service keep running.
    pub fn abandon(&self, id: &RequestId) -> Result<StatusReport, DatastoreError> {
        let (record, ()) = self.store.update(id, |record| {
            if record.abandoned_at.is_none() {
                if record.derive_state().is_terminal() {
                    return Err(DatastoreError::InvalidRequest(format!(
                        "request {} already finished",
                        record.id
                    )));
                }
                record.abandoned_at = Some(Utc::now());
            }
            record.refresh_state();
            Ok(())
        })?;
        info!(request = %id, "request abandoned");
        Ok(status_report(&record, false))
    }

    /// Asks the transfer service to cancel every open job of an in-progress request. The
    /// request stays tracked, so the canceled files reach the catalogue as failed on the
    /// next poll.
    pub fn cancel(&self, id: &RequestId) -> Result<CancelReport, DatastoreError> {
        let record = self.store.load(id)?;
        if record.abandoned_at.is_some() {
            return Err(DatastoreError::InvalidRequest(format!(
                "request {id} was abandoned"
            )));
        }
        let state = record.derive_state();
        if state != RequestState::InProgress {
            return Err(DatastoreError::InvalidRequest(format!(
                "request {id} is {state}; only IN_PROGRESS requests can be canceled"
            )));
        }

        let mut jobs = Vec::new();
        for spec in &record.specs {
            let Some(handle) = spec.handle.as_ref().filter(|handle| !handle.is_terminal()) else {
                continue;
            };
            let (state, error) = match self.transfer.cancel(&handle.job_id) {
                Ok(state) => (Some(state), None),
                Err(err) => {
                    warn!(request = %id, job_id = %handle.job_id, error = %err, "job cancel failed");
                    (None, Some(err.to_string()))
                }
            };
            jobs.push(CanceledJob {
                ordinal: spec.ordinal(),
                job_id: handle.job_id.clone(),
                state,
                error,
            });
        }

        self.store.update(id, |record| {
            record.next_poll_at = Utc::now();
            Ok(())
        })?;
        info!(request = %id, jobs = jobs.len(), "request canceled");
        Ok(CancelReport {
            request_id: *id,
            jobs,
        })
    }

    pub fn status(&self, id: &RequestId, include_files: bool) -> Result<StatusReport, DatastoreError> {
        let record = self.store.load(id)?;
        Ok(status_report(&record, include_files))
    }

    pub fn list(&self) -> Result<ListResult, DatastoreError> {
        let requests = self
            .store
            .list()?
            .iter()
            .map(|record| ListEntry {
                request_id: record.id,
                direction: record.direction,
                state: record.derive_state(),
                created_at: record.created_at,
                jobs: record.handles().count(),
                files: record
                    .specs
                    .iter()
                    .map(|spec| spec.spec.files.len())
                    .sum::<usize>()
                    + record.satisfied.len(),
            })
            .collect();
        Ok(ListResult { requests })
    }

    pub fn entity(&self, entity: &str, id: i64) -> Result<Value, DatastoreError> {
        self.catalogue.get_entity(entity, id)
    }

    pub fn reconciler(&self) -> Reconciler<'_, C, T> {
        Reconciler::new(
            &self.catalogue,
            &self.transfer,
            &self.store,
            self.settings.reconciler,
        )
    }

    pub fn reconcile_once(&self) -> Result<SweepReport, DatastoreError> {
        self.reconciler().sweep_once()
    }

    /// Writes the submitted job ids against each dataset of an archive. Failures are only
    /// logged; the closing update writes them again.
    fn record_job_ids(&self, id: &RequestId) {
        let record = match self.store.load(id) {
            Ok(record) => record,
            Err(err) => {
                warn!(request = %id, error = %err, "could not reload request to record job ids");
                return;
            }
        };
        for dataset_id in &record.datasets {
            let job_ids: Vec<JobId> = record
                .handles()
                .filter(|handle| {
                    handle
                        .files
                        .iter()
                        .any(|file| file.transfer.dataset_id == *dataset_id)
                })
                .map(|handle| handle.job_id.clone())
                .collect();
            if job_ids.is_empty() {
                continue;
            }
            if let Err(err) = self.catalogue.record_job_ids(*dataset_id, &job_ids) {
                warn!(dataset = dataset_id, error = %err, "recording job ids failed");
            }
        }
    }
}

fn status_report(record: &RequestRecord, include_files: bool) -> StatusReport {
    let jobs = record
        .specs
        .iter()
        .map(|spec| JobView {
            ordinal: spec.ordinal(),
            job_id: spec.handle.as_ref().map(|handle| handle.job_id.clone()),
            files: spec.spec.files.len(),
            submission_error: spec.submission_error.clone(),
        })
        .collect();

    let files = include_files.then(|| {
        let mut files: Vec<FileView> = record
            .satisfied
            .iter()
            .map(|file| FileView {
                datafile_id: file.datafile_id,
                dataset_id: file.dataset_id,
                location: file.location.clone(),
                state: FileState::Finished,
                reason: Some("already present at destination".to_string()),
                job_id: None,
            })
            .collect();
        for spec in &record.specs {
            match &spec.handle {
                Some(handle) => files.extend(handle.files.iter().map(|file| FileView {
                    datafile_id: file.transfer.datafile_id,
                    dataset_id: file.transfer.dataset_id,
                    location: file.transfer.location.clone(),
                    state: file.state,
                    reason: file.reason.clone(),
                    job_id: Some(handle.job_id.clone()),
                })),
                None => files.extend(spec.spec.files.iter().map(|file| FileView {
                    datafile_id: file.datafile_id,
                    dataset_id: file.dataset_id,
                    location: file.location.clone(),
                    state: FileState::Pending,
                    reason: spec.submission_error.clone(),
                    job_id: None,
                })),
            }
        }
        files
    });

    StatusReport {
        request_id: record.id,
        direction: record.direction,
        state: record.derive_state(),
        created_at: record.created_at,
        updated_at: record.updated_at,
        abandoned_at: record.abandoned_at,
        retry_of: record.retry_of,
        summary: RequestSummary::of(record),
        jobs,
        files,
    }
}
