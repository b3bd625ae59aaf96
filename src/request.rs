use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Direction, FileState, JobId, RequestId, RequestState};
use crate::endpoint::{JobOptions, StorageEndpoint, transfer_urls};
use crate::error::DatastoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    /// Storage key the files are read from.
    pub source: String,
    pub investigations: Vec<Investigation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investigation {
    pub name: String,
    pub visit_id: String,
    pub title: String,
    pub investigation_type: String,
    pub instrument: String,
    pub facility_cycle: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub release_date: Option<DateTime<Utc>>,
    pub datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub dataset_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Overrides the request's source storage key for this dataset.
    #[serde(default)]
    pub source: Option<String>,
    pub datafiles: Vec<Datafile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datafile {
    pub name: String,
    pub location: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// `mechanism:value`, e.g. `adler32:0a1b2c3d`.
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modification_time: Option<DateTime<Utc>>,
}

impl ArchiveRequest {
    pub fn validate(&self) -> Result<(), DatastoreError> {
        require_non_empty("source", &self.source)?;
        if self.investigations.is_empty() {
            return Err(DatastoreError::InvalidRequest(
                "at least one investigation is required".to_string(),
            ));
        }

        let mut locations = HashSet::new();
        let mut files = 0usize;
        for investigation in &self.investigations {
            require_non_empty("investigation name", &investigation.name)?;
            require_non_empty("visit id", &investigation.visit_id)?;
            require_non_empty("investigation type", &investigation.investigation_type)?;
            require_non_empty("instrument", &investigation.instrument)?;
            require_non_empty("facility cycle", &investigation.facility_cycle)?;
            for dataset in &investigation.datasets {
                require_non_empty("dataset name", &dataset.name)?;
                require_non_empty("dataset type", &dataset.dataset_type)?;
                for datafile in &dataset.datafiles {
                    require_non_empty("datafile name", &datafile.name)?;
                    require_non_empty("datafile location", &datafile.location)?;
                    if !locations.insert(datafile.location.as_str()) {
                        return Err(DatastoreError::InvalidRequest(format!(
                            "datafile location {} appears more than once",
                            datafile.location
                        )));
                    }
                    files += 1;
                }
            }
        }

        if files == 0 {
            return Err(DatastoreError::InvalidRequest(
                "request contains no datafiles".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    #[serde(default)]
    pub investigation_ids: BTreeSet<i64>,
    #[serde(default)]
    pub dataset_ids: BTreeSet<i64>,
    #[serde(default)]
    pub datafile_ids: BTreeSet<i64>,
    /// Storage key the files are restored to.
    pub destination: String,
    /// Storage key the files are read from. The archive endpoint when absent.
    #[serde(default)]
    pub source: Option<String>,
}

impl RestoreRequest {
    pub fn validate(&self) -> Result<(), DatastoreError> {
        require_non_empty("destination", &self.destination)?;
        if self.investigation_ids.is_empty()
            && self.dataset_ids.is_empty()
            && self.datafile_ids.is_empty()
        {
            return Err(DatastoreError::InvalidRequest(
                "at least one investigation, dataset or datafile id is required".to_string(),
            ));
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), DatastoreError> {
    if value.trim().is_empty() {
        return Err(DatastoreError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

/// One file to move, with both urls and the job options it needs already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub datafile_id: i64,
    pub dataset_id: i64,
    pub location: String,
    pub source_key: String,
    pub destination_key: String,
    pub source_url: String,
    pub destination_url: String,
    pub checksum: Option<String>,
    pub size: Option<u64>,
    pub options: JobOptions,
}

impl FileTransfer {
    pub fn between(
        source: &StorageEndpoint,
        destination: &StorageEndpoint,
        datafile_id: i64,
        dataset_id: i64,
        location: &str,
    ) -> Self {
        let (source_url, destination_url) = transfer_urls(source, destination, location);
        Self {
            datafile_id,
            dataset_id,
            location: location.to_string(),
            source_key: source.key.clone(),
            destination_key: destination.key.clone(),
            source_url,
            destination_url,
            checksum: None,
            size: None,
            options: JobOptions::between(source, destination),
        }
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }
}

/// A batch of files that the transfer service can accept as one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJobSpec {
    pub ordinal: usize,
    pub source_key: String,
    pub destination_key: String,
    pub options: JobOptions,
    pub files: Vec<FileTransfer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub transfer: FileTransfer,
    pub state: FileState,
    #[serde(default)]
    pub reason: Option<String>,
    /// False while a terminal state has not yet been written to the catalogue.
    pub catalogue_synced: bool,
}

impl TrackedFile {
    pub fn new(transfer: FileTransfer) -> Self {
        Self {
            transfer,
            state: FileState::Pending,
            reason: None,
            catalogue_synced: true,
        }
    }

    /// Applies an observed state. Terminal states are sticky and a file never moves back
    /// along its lifecycle. Returns whether the cached state changed.
    pub fn advance(&mut self, observed: FileState, reason: Option<String>) -> bool {
        if self.state.is_terminal() || observed.rank() <= self.state.rank() {
            return false;
        }
        self.state = observed;
        if observed == FileState::Failed {
            self.reason = reason;
        }
        if observed.is_terminal() {
            self.catalogue_synced = false;
        }
        true
    }

    pub fn needs_catalogue_sync(&self) -> bool {
        self.state.is_terminal() && !self.catalogue_synced
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJobHandle {
    pub job_id: JobId,
    pub request_id: RequestId,
    pub submitted_at: DateTime<Utc>,
    pub files: Vec<TrackedFile>,
}

impl TransferJobHandle {
    pub fn new(job_id: JobId, request_id: RequestId, spec: &TransferJobSpec) -> Self {
        Self {
            job_id,
            request_id,
            submitted_at: Utc::now(),
            files: spec.files.iter().cloned().map(TrackedFile::new).collect(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.files.iter().all(|file| file.state.is_terminal())
    }

    /// Fails every file that has not reached a terminal state yet.
    pub fn fail_remaining(&mut self, reason: &str) -> usize {
        self.files
            .iter_mut()
            .filter(|file| !file.state.is_terminal())
            .map(|file| file.advance(FileState::Failed, Some(reason.to_string())))
            .filter(|changed| *changed)
            .count()
    }

    /// The file matching a reported url pair. The destination alone decides when the
    /// service reports a rewritten source url.
    pub fn file_mut(&mut self, source_url: &str, destination_url: &str) -> Option<&mut TrackedFile> {
        let index = self
            .files
            .iter()
            .position(|file| {
                file.transfer.source_url == source_url
                    && file.transfer.destination_url == destination_url
            })
            .or_else(|| {
                self.files
                    .iter()
                    .position(|file| file.transfer.destination_url == destination_url)
            })?;
        self.files.get_mut(index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecRecord {
    pub spec: TransferJobSpec,
    #[serde(default)]
    pub handle: Option<TransferJobHandle>,
    #[serde(default)]
    pub submission_error: Option<String>,
}

impl SpecRecord {
    pub fn ordinal(&self) -> usize {
        self.spec.ordinal
    }

    pub fn is_submitted(&self) -> bool {
        self.handle.is_some()
    }
}

/// Persisted state of one archive or restore request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub version: u64,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub specs: Vec<SpecRecord>,
    /// Files the pre-check found already present at the destination.
    #[serde(default)]
    pub satisfied: Vec<FileTransfer>,
    #[serde(default)]
    pub datasets: Vec<i64>,
    /// Dataset states last written to the catalogue.
    #[serde(default)]
    pub dataset_states: BTreeMap<i64, String>,
    pub cached_state: RequestState,
    #[serde(default)]
    pub abandoned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closing_update_issued: bool,
    pub next_poll_at: DateTime<Utc>,
    /// The request whose failed files this one retries.
    #[serde(default)]
    pub retry_of: Option<RequestId>,
}

impl RequestRecord {
    pub fn new(
        direction: Direction,
        specs: Vec<TransferJobSpec>,
        satisfied: Vec<FileTransfer>,
        datasets: Vec<i64>,
    ) -> Self {
        let now = Utc::now();
        let mut record = Self {
            id: RequestId::new(),
            version: 0,
            direction,
            created_at: now,
            updated_at: now,
            specs: specs
                .into_iter()
                .map(|spec| SpecRecord {
                    spec,
                    handle: None,
                    submission_error: None,
                })
                .collect(),
            satisfied,
            datasets,
            dataset_states: BTreeMap::new(),
            cached_state: RequestState::Submitting,
            abandoned_at: None,
            closing_update_issued: false,
            next_poll_at: now,
            retry_of: None,
        };
        record.refresh_state();
        record
    }

    pub fn derive_state(&self) -> RequestState {
        if self.abandoned_at.is_some() {
            return RequestState::Abandoned;
        }
        if self.specs.iter().any(|spec| spec.submission_error.is_some()) {
            return RequestState::PartiallySubmitted;
        }
        if self.specs.iter().any(|spec| !spec.is_submitted()) {
            return RequestState::Submitting;
        }

        let mut finished = 0usize;
        let mut failed = 0usize;
        for file in self.tracked_files() {
            match file.state {
                FileState::Finished => finished += 1,
                FileState::Failed => failed += 1,
                _ => return RequestState::InProgress,
            }
        }

        if failed == 0 {
            RequestState::Completed
        } else if finished == 0 && self.satisfied.is_empty() {
            RequestState::Failed
        } else {
            RequestState::PartiallyFailed
        }
    }

    pub fn refresh_state(&mut self) -> RequestState {
        self.cached_state = self.derive_state();
        self.cached_state
    }

    pub fn is_terminal(&self) -> bool {
        self.derive_state().is_terminal()
    }

    pub fn handles(&self) -> impl Iterator<Item = &TransferJobHandle> {
        self.specs.iter().filter_map(|spec| spec.handle.as_ref())
    }

    pub fn handles_mut(&mut self) -> impl Iterator<Item = &mut TransferJobHandle> {
        self.specs.iter_mut().filter_map(|spec| spec.handle.as_mut())
    }

    pub fn tracked_files(&self) -> impl Iterator<Item = &TrackedFile> {
        self.handles().flat_map(|handle| handle.files.iter())
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.handles().map(|handle| handle.job_id.clone()).collect()
    }

    pub fn unsubmitted(&self) -> impl Iterator<Item = &SpecRecord> {
        self.specs.iter().filter(|spec| !spec.is_submitted())
    }

    pub fn failed_transfers(&self) -> Vec<FileTransfer> {
        self.tracked_files()
            .filter(|file| file.state == FileState::Failed)
            .map(|file| file.transfer.clone())
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
