use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalogue::{CatalogueClient, StateParameter};
use crate::config::ReconcilerSettings;
use crate::domain::{Direction, JobId, RequestId, RequestState};
use crate::error::DatastoreError;
use crate::progress::{DatasetState, RequestSummary};
use crate::request::RequestRecord;
use crate::store::RequestStore;
use crate::transfer::{JobStatusReport, TransferClient};

/// Reason recorded against files whose job the transfer service no longer knows.
pub const STATUS_UNAVAILABLE: &str = "status-unavailable";

#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub request_id: RequestId,
    pub state: RequestState,
    pub files_changed: usize,
    pub catalogue_pending: usize,
    pub closing_update_issued: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub polled: usize,
    pub outcomes: Vec<RequestOutcome>,
    pub failures: Vec<SweepFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub request_id: RequestId,
    pub error: String,
}

enum Observation {
    Report(JobStatusReport),
    Gone,
}

/// Catalogue writes that went through during one pass over a request.
#[derive(Default)]
struct CatalogueProgress {
    synced: Vec<(JobId, i64)>,
    dataset_states: BTreeMap<i64, String>,
    closing_update_issued: bool,
}

pub struct Reconciler<'a, C: CatalogueClient, T: TransferClient> {
    catalogue: &'a C,
    transfer: &'a T,
    store: &'a RequestStore,
    settings: ReconcilerSettings,
}

impl<'a, C: CatalogueClient, T: TransferClient> Reconciler<'a, C, T> {
    pub fn new(
        catalogue: &'a C,
        transfer: &'a T,
        store: &'a RequestStore,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            catalogue,
            transfer,
            store,
            settings,
        }
    }

    /// Sweeps on every tick until `stop` is set.
    pub fn run(&self, stop: &AtomicBool) -> Result<(), DatastoreError> {
        info!(
            tick_secs = self.settings.tick.as_secs(),
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            workers = self.settings.workers,
            "reconciler started"
        );
        while !stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            match self.sweep_once() {
                Ok(report) if report.polled > 0 => {
                    info!(
                        polled = report.polled,
                        failures = report.failures.len(),
                        "sweep finished"
                    );
                }
                Ok(_) => debug!("no requests due"),
                Err(err) => error!(error = %err, "sweep failed"),
            }

            while !stop.load(Ordering::Relaxed) && started.elapsed() < self.settings.tick {
                thread::sleep(Duration::from_millis(200).min(self.settings.tick));
            }
        }
        info!("reconciler stopped");
        Ok(())
    }

    pub fn sweep_once(&self) -> Result<SweepReport, DatastoreError> {
        self.sweep_at(Utc::now())
    }

    /// Reconciles every active request whose next poll is due at `now`. Due requests are
    /// queued and drained by a bounded set of workers.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, DatastoreError> {
        let due: VecDeque<RequestId> = self
            .store
            .list_active()?
            .into_iter()
            .filter(|record| record.next_poll_at <= now)
            .map(|record| record.id)
            .collect();
        if due.is_empty() {
            return Ok(SweepReport::default());
        }

        let polled = due.len();
        let workers = self.settings.workers.max(1).min(polled);
        let queue = Mutex::new(due);
        let queue = &queue;

        let results: Vec<(RequestId, Result<RequestOutcome, DatastoreError>)> =
            thread::scope(|scope| {
                let handles: Vec<_> = (0..workers)
                    .map(|_| {
                        scope.spawn(move || {
                            let mut done = Vec::new();
                            loop {
                                let next = match queue.lock() {
                                    Ok(mut queue) => queue.pop_front(),
                                    Err(_) => None,
                                };
                                let Some(id) = next else {
                                    break;
                                };
                                done.push((id, self.reconcile_request(&id, now)));
                            }
                            done
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .filter_map(|handle| handle.join().ok())
                    .flatten()
                    .collect()
            });

        let mut report = SweepReport {
            polled,
            ..SweepReport::default()
        };
        for (request_id, result) in results {
            match result {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(err) => {
                    warn!(request = %request_id, error = %err, "request reconciliation failed");
                    report.failures.push(SweepFailure {
                        request_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        report.outcomes.sort_by_key(|outcome| outcome.request_id);
        Ok(report)
    }

    /// One pass over a request: poll its open jobs, persist what changed, then bring the
    /// catalogue up to date.
    pub fn reconcile_request(
        &self,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<RequestOutcome, DatastoreError> {
        let record = self.store.load(request_id)?;
        if record.abandoned_at.is_some() {
            return Ok(outcome(&record, 0));
        }

        let observations = self.poll(&record);
        let next_poll_at = now
            + chrono::Duration::from_std(self.settings.poll_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let (record, files_changed) = self.store.update(request_id, |record| {
            let changed = apply_observations(record, &observations);
            record.next_poll_at = next_poll_at;
            record.refresh_state();
            Ok(changed)
        })?;

        let progress = self.sync_catalogue(&record);
        if progress.synced.is_empty()
            && progress.dataset_states.is_empty()
            && !progress.closing_update_issued
        {
            return Ok(outcome(&record, files_changed));
        }

        let (record, ()) = self.store.update(request_id, |record| {
            for (job_id, datafile_id) in &progress.synced {
                if let Some(handle) = record
                    .handles_mut()
                    .find(|handle| &handle.job_id == job_id)
                {
                    for file in handle
                        .files
                        .iter_mut()
                        .filter(|file| file.transfer.datafile_id == *datafile_id)
                    {
                        file.catalogue_synced = true;
                    }
                }
            }
            for (dataset_id, state) in &progress.dataset_states {
                record.dataset_states.insert(*dataset_id, state.clone());
            }
            if progress.closing_update_issued {
                record.closing_update_issued = true;
            }
            Ok(())
        })?;

        if progress.closing_update_issued {
            info!(request = %record.id, state = %record.cached_state, "request finalized");
        }
        Ok(outcome(&record, files_changed))
    }

    fn poll(&self, record: &RequestRecord) -> Vec<(JobId, Observation)> {
        let mut observations = Vec::new();
        for handle in record.handles().filter(|handle| !handle.is_terminal()) {
            match self.transfer.job_status(&handle.job_id) {
                Ok(report) => {
                    debug!(job_id = %handle.job_id, job_state = %report.job_state, "polled job");
                    observations.push((handle.job_id.clone(), Observation::Report(report)));
                }
                Err(DatastoreError::JobNotFound(_)) => {
                    warn!(job_id = %handle.job_id, "transfer job no longer known; failing its open files");
                    observations.push((handle.job_id.clone(), Observation::Gone));
                }
                Err(err) => {
                    warn!(job_id = %handle.job_id, error = %err, "job status unavailable; retrying next tick");
                }
            }
        }
        observations
    }

    fn sync_catalogue(&self, record: &RequestRecord) -> CatalogueProgress {
        let parameter = StateParameter::from(record.direction);
        let mut progress = CatalogueProgress::default();
        let mut all_synced = true;

        for handle in record.handles() {
            for file in handle.files.iter().filter(|file| file.needs_catalogue_sync()) {
                match self.catalogue.set_datafile_state(
                    file.transfer.datafile_id,
                    parameter,
                    file.state,
                ) {
                    Ok(()) => {
                        progress
                            .synced
                            .push((handle.job_id.clone(), file.transfer.datafile_id));
                    }
                    Err(err) if err.is_transient() => {
                        warn!(
                            datafile = file.transfer.datafile_id,
                            error = %err,
                            "catalogue update failed; retrying next tick"
                        );
                        all_synced = false;
                    }
                    Err(err) => {
                        error!(
                            datafile = file.transfer.datafile_id,
                            error = %err,
                            "catalogue rejected datafile state; giving up on it"
                        );
                        progress
                            .synced
                            .push((handle.job_id.clone(), file.transfer.datafile_id));
                    }
                }
            }
        }

        let summary = RequestSummary::of(record);
        let mut datasets_synced = true;
        for (dataset_id, state) in &summary.datasets {
            if record.dataset_states.get(dataset_id).map(String::as_str) == Some(state.as_str()) {
                continue;
            }
            match self.set_dataset_state(*dataset_id, parameter, *state) {
                Ok(()) => {
                    progress
                        .dataset_states
                        .insert(*dataset_id, state.as_str().to_string());
                }
                Err(_) => datasets_synced = false,
            }
        }

        let state = record.derive_state();
        if state.is_terminal()
            && state != RequestState::Abandoned
            && !record.closing_update_issued
            && all_synced
            && datasets_synced
        {
            progress.closing_update_issued = self.closing_update(record);
        }
        progress
    }

    fn set_dataset_state(
        &self,
        dataset_id: i64,
        parameter: StateParameter,
        state: DatasetState,
    ) -> Result<(), DatastoreError> {
        self.catalogue
            .set_dataset_state(dataset_id, parameter, state)
            .inspect_err(|err| {
                warn!(dataset = dataset_id, %state, error = %err, "dataset state update failed");
            })
    }

    /// Writes the job ids that touched each dataset of an archive. Returns whether every
    /// write succeeded.
    fn closing_update(&self, record: &RequestRecord) -> bool {
        if record.direction != Direction::Archive {
            return true;
        }

        let mut jobs_by_dataset = BTreeMap::<i64, BTreeSet<usize>>::new();
        let handles: Vec<_> = record.handles().collect();
        for (index, handle) in handles.iter().enumerate() {
            for file in &handle.files {
                jobs_by_dataset
                    .entry(file.transfer.dataset_id)
                    .or_default()
                    .insert(index);
            }
        }

        let mut complete = true;
        for (dataset_id, indices) in jobs_by_dataset {
            let job_ids: Vec<JobId> = indices
                .into_iter()
                .map(|index| handles[index].job_id.clone())
                .collect();
            if let Err(err) = self.catalogue.record_job_ids(dataset_id, &job_ids) {
                warn!(dataset = dataset_id, error = %err, "recording job ids failed");
                complete = false;
            }
        }
        complete
    }
}

/// Applies polled file states to the record. Returns how many files changed state.
fn apply_observations(record: &mut RequestRecord, observations: &[(JobId, Observation)]) -> usize {
    let mut changed = 0usize;
    for (job_id, observation) in observations {
        let Some(handle) = record
            .handles_mut()
            .find(|handle| &handle.job_id == job_id)
        else {
            continue;
        };
        match observation {
            Observation::Gone => changed += handle.fail_remaining(STATUS_UNAVAILABLE),
            Observation::Report(report) => {
                for file_report in &report.files {
                    let Some(file) =
                        handle.file_mut(&file_report.source_url, &file_report.destination_url)
                    else {
                        debug!(url = %file_report.destination_url, "status for unknown file ignored");
                        continue;
                    };
                    if file.advance(file_report.state, file_report.reason.clone()) {
                        changed += 1;
                        if file.state.is_terminal() {
                            info!(
                                job_id = %job_id,
                                datafile = file.transfer.datafile_id,
                                state = %file.state,
                                "file transfer finished"
                            );
                        }
                    }
                }
                // A finished job reports nothing further for files it did not account for.
                if report.job_state.is_terminal() {
                    let failed = handle.fail_remaining(STATUS_UNAVAILABLE);
                    if failed > 0 {
                        warn!(
                            job_id = %job_id,
                            job_state = %report.job_state,
                            files = failed,
                            "job ended without reporting some files; failing them"
                        );
                    }
                    changed += failed;
                }
            }
        }
    }
    changed
}

fn outcome(record: &RequestRecord, files_changed: usize) -> RequestOutcome {
    RequestOutcome {
        request_id: record.id,
        state: record.cached_state,
        files_changed,
        catalogue_pending: record
            .tracked_files()
            .filter(|file| file.needs_catalogue_sync())
            .count(),
        closing_update_issued: record.closing_update_issued,
    }
}
