use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::{JobId, RequestId, RequestState};
use crate::error::DatastoreError;
use crate::request::TransferJobHandle;
use crate::store::RequestStore;
use crate::transfer::TransferClient;

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedJob {
    pub ordinal: usize,
    pub job_id: JobId,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedSpec {
    pub ordinal: usize,
    pub files: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReport {
    pub request_id: RequestId,
    pub submitted: Vec<SubmittedJob>,
    pub failed: Vec<FailedSpec>,
    pub state: RequestState,
}

enum Outcome {
    Submitted(TransferJobHandle),
    Failed(String),
}

/// Submits every spec of the request that has no job yet, in order. A failed spec does not
/// stop later ones, and earlier jobs are kept. All results are recorded in one store write;
/// if that write fails, the jobs already created are logged and named in the error.
pub fn submit_pending<T: TransferClient + ?Sized>(
    transfer: &T,
    store: &RequestStore,
    request_id: &RequestId,
) -> Result<SubmissionReport, DatastoreError> {
    let record = store.load(request_id)?;
    if record.abandoned_at.is_some() {
        return Err(DatastoreError::InvalidRequest(format!(
            "request {request_id} was abandoned"
        )));
    }

    let mut outcomes = Vec::new();
    let mut submitted = Vec::new();
    let mut failed = Vec::new();
    for spec_record in record.unsubmitted() {
        let spec = &spec_record.spec;
        match transfer.submit(spec) {
            Ok(job_id) => {
                submitted.push(SubmittedJob {
                    ordinal: spec.ordinal,
                    job_id: job_id.clone(),
                    files: spec.files.len(),
                });
                outcomes.push((
                    spec.ordinal,
                    Outcome::Submitted(TransferJobHandle::new(job_id, *request_id, spec)),
                ));
            }
            Err(err) => {
                warn!(
                    request = %request_id,
                    ordinal = spec.ordinal,
                    error = %err,
                    "transfer job submission failed"
                );
                failed.push(FailedSpec {
                    ordinal: spec.ordinal,
                    files: spec.files.len(),
                    error: err.to_string(),
                });
                outcomes.push((spec.ordinal, Outcome::Failed(err.to_string())));
            }
        }
    }

    let recorded = store.update(request_id, |record| {
        for (ordinal, outcome) in &outcomes {
            let Some(spec_record) = record
                .specs
                .iter_mut()
                .find(|spec_record| spec_record.ordinal() == *ordinal)
            else {
                continue;
            };
            if spec_record.handle.is_some() {
                continue;
            }
            match outcome {
                Outcome::Submitted(handle) => {
                    spec_record.handle = Some(handle.clone());
                    spec_record.submission_error = None;
                }
                Outcome::Failed(error) => {
                    spec_record.submission_error = Some(error.clone());
                }
            }
        }
        record.refresh_state();
        Ok(())
    });
    let (record, ()) = match recorded {
        Ok(recorded) => recorded,
        Err(err) if submitted.is_empty() => return Err(err),
        Err(err) => {
            for job in &submitted {
                error!(
                    request = %request_id,
                    ordinal = job.ordinal,
                    job_id = %job.job_id,
                    error = %err,
                    "transfer job submitted but not recorded"
                );
            }
            let jobs = submitted
                .iter()
                .map(|job| format!("{}={}", job.ordinal, job.job_id))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(DatastoreError::JobsNotRecorded {
                request_id: request_id.to_string(),
                jobs,
                reason: err.to_string(),
            });
        }
    };

    info!(
        request = %request_id,
        submitted = submitted.len(),
        failed = failed.len(),
        state = %record.cached_state,
        "recorded transfer jobs"
    );
    Ok(SubmissionReport {
        request_id: *request_id,
        submitted,
        failed,
        state: record.cached_state,
    })
}
