#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde_json::{Value, json};
use tempfile::TempDir;

use datastore_coordinator::app::CoordinatorSettings;
use datastore_coordinator::catalogue::{
    CatalogueClient, CatalogueDatafile, CatalogueDataset, StateParameter,
};
use datastore_coordinator::config::ReconcilerSettings;
use datastore_coordinator::domain::{FileState, JobId, VerifyChecksum};
use datastore_coordinator::endpoint::{EndpointTable, StorageEndpoint, StorageKind};
use datastore_coordinator::error::DatastoreError;
use datastore_coordinator::partition::PartitionLimits;
use datastore_coordinator::progress::DatasetState;
use datastore_coordinator::request::{
    ArchiveRequest, Datafile, Dataset, FileTransfer, Investigation, RestoreRequest,
    TransferJobSpec,
};
use datastore_coordinator::store::RequestStore;
use datastore_coordinator::transfer::{
    FileStat, FileStatusReport, JobState, JobStatusReport, TransferClient,
};

pub fn disk(key: &str) -> StorageEndpoint {
    StorageEndpoint::new(key, &format!("root://{key}.example:1094//"), StorageKind::Disk).unwrap()
}

pub fn tape() -> StorageEndpoint {
    StorageEndpoint::new(
        "tape",
        "root://tape.example:1094//",
        StorageKind::Tape {
            bring_online: 600,
            archive_timeout: 900,
        },
    )
    .unwrap()
}

pub fn endpoints() -> EndpointTable {
    EndpointTable::new(vec![disk("idc"), disk("rdc"), tape()], Some("tape".to_string())).unwrap()
}

/// Archive-direction transfers (`idc` to `tape`) for datafiles `1..=count` in dataset 10.
pub fn archive_transfers(count: i64) -> Vec<FileTransfer> {
    (1..=count)
        .map(|id| {
            FileTransfer::between(&disk("idc"), &tape(), id, 10, &format!("inv/ds/file{id}.nxs"))
        })
        .collect()
}

pub fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        endpoints: endpoints(),
        limits: PartitionLimits::default(),
        reconciler: ReconcilerSettings {
            poll_interval: Duration::ZERO,
            tick: Duration::from_secs(1),
            workers: 2,
        },
        verify_checksum: VerifyChecksum::None,
        supported_checksums: Vec::new(),
        check_source: false,
        file_size_limit: None,
        total_file_size_limit: None,
    }
}

pub fn temp_store() -> (TempDir, RequestStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, RequestStore::new_with_root(root))
}

pub fn archive_request(datasets: &[usize]) -> ArchiveRequest {
    let datasets = datasets
        .iter()
        .enumerate()
        .map(|(index, files)| Dataset {
            name: format!("dataset-{index}"),
            dataset_type: "raw".to_string(),
            description: None,
            doi: None,
            start_date: None,
            end_date: None,
            source: None,
            datafiles: (0..*files)
                .map(|file| Datafile {
                    name: format!("file{file}.nxs"),
                    location: format!("inv/dataset-{index}/file{file}.nxs"),
                    size: Some(1024),
                    checksum: None,
                    description: None,
                    create_time: None,
                    modification_time: None,
                })
                .collect(),
        })
        .collect();
    ArchiveRequest {
        source: "idc".to_string(),
        investigations: vec![Investigation {
            name: "RB2000123".to_string(),
            visit_id: "1".to_string(),
            title: "Diffraction run".to_string(),
            investigation_type: "experiment".to_string(),
            instrument: "INSTR".to_string(),
            facility_cycle: "20241".to_string(),
            summary: None,
            doi: None,
            start_date: None,
            end_date: None,
            release_date: None,
            datasets,
        }],
    }
}

pub fn restore_request(dataset_ids: &[i64], destination: &str) -> RestoreRequest {
    RestoreRequest {
        dataset_ids: dataset_ids.iter().copied().collect(),
        destination: destination.to_string(),
        ..RestoreRequest::default()
    }
}

enum JobScript {
    Files(Vec<FileStatusReport>),
    Gone,
    Unavailable,
}

/// Transfer service double. Submitted jobs report every file as pending until a test moves
/// them along.
#[derive(Default)]
pub struct FakeTransfer {
    present: Mutex<HashSet<String>>,
    stat_failures: Mutex<HashSet<String>>,
    reject: Mutex<HashSet<usize>>,
    submitted: Mutex<Vec<TransferJobSpec>>,
    jobs: Mutex<BTreeMap<String, JobScript>>,
    job_states: Mutex<BTreeMap<String, JobState>>,
    canceled: Mutex<Vec<JobId>>,
    status_calls: Mutex<usize>,
    on_submit: Mutex<Option<SubmitHook>>,
}

type SubmitHook = Box<dyn Fn(&TransferJobSpec) + Send>;

impl FakeTransfer {
    pub fn with_present(self, url: &str) -> Self {
        self.present.lock().unwrap().insert(url.to_string());
        self
    }

    pub fn with_stat_failure(self, url: &str) -> Self {
        self.stat_failures.lock().unwrap().insert(url.to_string());
        self
    }

    /// Refuses submission of the spec with this ordinal until [`FakeTransfer::accept_all`].
    pub fn rejecting(self, ordinal: usize) -> Self {
        self.reject.lock().unwrap().insert(ordinal);
        self
    }

    /// Runs `hook` after each accepted submission.
    pub fn with_submit_hook(self, hook: impl Fn(&TransferJobSpec) + Send + 'static) -> Self {
        *self.on_submit.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn accept_all(&self) {
        self.reject.lock().unwrap().clear();
    }

    pub fn submitted(&self) -> Vec<TransferJobSpec> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> usize {
        *self.status_calls.lock().unwrap()
    }

    pub fn set_all(&self, job_id: &JobId, state: FileState, reason: Option<&str>) {
        if let Some(JobScript::Files(files)) = self.jobs.lock().unwrap().get_mut(job_id.as_str()) {
            for file in files {
                file.state = state;
                file.reason = reason.map(str::to_string);
            }
        }
    }

    pub fn set_file(&self, job_id: &JobId, destination_url: &str, state: FileState, reason: Option<&str>) {
        if let Some(JobScript::Files(files)) = self.jobs.lock().unwrap().get_mut(job_id.as_str()) {
            for file in files.iter_mut().filter(|file| file.destination_url == destination_url) {
                file.state = state;
                file.reason = reason.map(str::to_string);
            }
        }
    }

    /// Job-level state reported from now on. Jobs report `ACTIVE` until set.
    pub fn set_job_state(&self, job_id: &JobId, state: JobState) {
        self.job_states
            .lock()
            .unwrap()
            .insert(job_id.as_str().to_string(), state);
    }

    /// Reports the file at `from` under another destination url.
    pub fn rewrite_destination(&self, job_id: &JobId, from: &str, to: &str) {
        if let Some(JobScript::Files(files)) = self.jobs.lock().unwrap().get_mut(job_id.as_str()) {
            for file in files.iter_mut().filter(|file| file.destination_url == from) {
                file.destination_url = to.to_string();
            }
        }
    }

    pub fn canceled(&self) -> Vec<JobId> {
        self.canceled.lock().unwrap().clone()
    }

    pub fn forget(&self, job_id: &JobId) {
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.as_str().to_string(), JobScript::Gone);
    }

    pub fn make_unavailable(&self, job_id: &JobId) {
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.as_str().to_string(), JobScript::Unavailable);
    }
}

impl TransferClient for FakeTransfer {
    fn submit(&self, spec: &TransferJobSpec) -> Result<JobId, DatastoreError> {
        if self.reject.lock().unwrap().contains(&spec.ordinal) {
            return Err(DatastoreError::SubmissionRejected(format!(
                "spec {} refused",
                spec.ordinal
            )));
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(spec.clone());
        let job_id = format!("job-{}", submitted.len());
        let files = spec
            .files
            .iter()
            .map(|file| FileStatusReport {
                source_url: file.source_url.clone(),
                destination_url: file.destination_url.clone(),
                state: FileState::Pending,
                reason: None,
            })
            .collect();
        drop(submitted);
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.clone(), JobScript::Files(files));
        if let Some(hook) = self.on_submit.lock().unwrap().as_ref() {
            hook(spec);
        }
        job_id.parse()
    }

    fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport, DatastoreError> {
        *self.status_calls.lock().unwrap() += 1;
        match self.jobs.lock().unwrap().get(job_id.as_str()) {
            Some(JobScript::Files(files)) => Ok(JobStatusReport {
                job_state: self
                    .job_states
                    .lock()
                    .unwrap()
                    .get(job_id.as_str())
                    .copied()
                    .unwrap_or(JobState::Active),
                files: files.clone(),
            }),
            Some(JobScript::Unavailable) => Err(DatastoreError::TransferServiceUnavailable(
                "connection refused".to_string(),
            )),
            Some(JobScript::Gone) | None => Err(DatastoreError::JobNotFound(job_id.to_string())),
        }
    }

    fn cancel(&self, job_id: &JobId) -> Result<JobState, DatastoreError> {
        match self.jobs.lock().unwrap().get_mut(job_id.as_str()) {
            Some(JobScript::Files(files)) => {
                for file in files.iter_mut().filter(|file| !file.state.is_terminal()) {
                    file.state = FileState::Failed;
                    file.reason = Some("canceled".to_string());
                }
            }
            Some(JobScript::Unavailable) => {
                return Err(DatastoreError::TransferServiceUnavailable(
                    "connection refused".to_string(),
                ));
            }
            Some(JobScript::Gone) | None => {
                return Err(DatastoreError::JobNotFound(job_id.to_string()));
            }
        }
        self.set_job_state(job_id, JobState::Canceled);
        self.canceled.lock().unwrap().push(job_id.clone());
        Ok(JobState::Canceled)
    }

    fn stat(&self, url: &str) -> Result<Option<FileStat>, DatastoreError> {
        if self.stat_failures.lock().unwrap().contains(url) {
            return Err(DatastoreError::TransferServiceUnavailable("stat timed out".to_string()));
        }
        if self.present.lock().unwrap().contains(url) {
            return Ok(Some(FileStat { size: Some(1024) }));
        }
        Ok(None)
    }
}

/// Catalogue double that records every write.
#[derive(Default)]
pub struct FakeCatalogue {
    next_id: Mutex<i64>,
    datafiles: Mutex<Vec<CatalogueDatafile>>,
    investigations: Mutex<usize>,
    transient_failures: Mutex<usize>,
    datafile_states: Mutex<Vec<(i64, StateParameter, FileState)>>,
    dataset_states: Mutex<Vec<(i64, StateParameter, DatasetState)>>,
    job_ids: Mutex<Vec<(i64, Vec<JobId>)>>,
}

impl FakeCatalogue {
    /// Datafiles `first..first + count` of `dataset_id`, as restore would find them.
    pub fn with_datafiles(self, dataset_id: i64, first: i64, count: i64) -> Self {
        let mut datafiles = self.datafiles.lock().unwrap();
        for id in first..first + count {
            datafiles.push(CatalogueDatafile {
                id,
                dataset_id,
                location: format!("inv/ds{dataset_id}/file{id}.nxs"),
                checksum: None,
                size: Some(2048),
            });
        }
        drop(datafiles);
        self
    }

    /// The next `count` datafile state writes fail as if the catalogue were down.
    pub fn fail_next_datafile_writes(&self, count: usize) {
        *self.transient_failures.lock().unwrap() = count;
    }

    pub fn investigations_created(&self) -> usize {
        *self.investigations.lock().unwrap()
    }

    pub fn datafile_states(&self) -> Vec<(i64, StateParameter, FileState)> {
        self.datafile_states.lock().unwrap().clone()
    }

    pub fn dataset_states(&self) -> Vec<(i64, StateParameter, DatasetState)> {
        self.dataset_states.lock().unwrap().clone()
    }

    pub fn job_ids(&self) -> Vec<(i64, Vec<JobId>)> {
        self.job_ids.lock().unwrap().clone()
    }

    fn allocate(&self) -> i64 {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        *next
    }
}

impl CatalogueClient for FakeCatalogue {
    fn create_investigation(
        &self,
        investigation: &Investigation,
    ) -> Result<Vec<CatalogueDataset>, DatastoreError> {
        *self.investigations.lock().unwrap() += 1;
        Ok(investigation
            .datasets
            .iter()
            .map(|dataset| {
                let dataset_id = 100 + self.allocate();
                CatalogueDataset {
                    id: dataset_id,
                    name: dataset.name.clone(),
                    datafiles: dataset
                        .datafiles
                        .iter()
                        .map(|datafile| CatalogueDatafile {
                            id: 1000 + self.allocate(),
                            dataset_id,
                            location: datafile.location.clone(),
                            checksum: datafile.checksum.clone(),
                            size: datafile.size,
                        })
                        .collect(),
                }
            })
            .collect())
    }

    fn resolve_datafiles(
        &self,
        request: &RestoreRequest,
    ) -> Result<Vec<CatalogueDatafile>, DatastoreError> {
        Ok(self
            .datafiles
            .lock()
            .unwrap()
            .iter()
            .filter(|datafile| {
                request.dataset_ids.contains(&datafile.dataset_id)
                    || request.datafile_ids.contains(&datafile.id)
            })
            .cloned()
            .collect())
    }

    fn set_datafile_state(
        &self,
        datafile_id: i64,
        parameter: StateParameter,
        state: FileState,
    ) -> Result<(), DatastoreError> {
        let mut failures = self.transient_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(DatastoreError::CatalogueUnavailable("icat down".to_string()));
        }
        self.datafile_states
            .lock()
            .unwrap()
            .push((datafile_id, parameter, state));
        Ok(())
    }

    fn set_dataset_state(
        &self,
        dataset_id: i64,
        parameter: StateParameter,
        state: DatasetState,
    ) -> Result<(), DatastoreError> {
        self.dataset_states
            .lock()
            .unwrap()
            .push((dataset_id, parameter, state));
        Ok(())
    }

    fn record_job_ids(&self, dataset_id: i64, job_ids: &[JobId]) -> Result<(), DatastoreError> {
        self.job_ids
            .lock()
            .unwrap()
            .push((dataset_id, job_ids.to_vec()));
        Ok(())
    }

    fn get_entity(&self, entity: &str, id: i64) -> Result<Value, DatastoreError> {
        Ok(json!({"entity": entity, "id": id}))
    }
}
