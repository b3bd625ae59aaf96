use std::fmt;
use std::fs;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::TransferSettings;
use crate::domain::{FileState, JobId};
use crate::error::DatastoreError;
use crate::request::TransferJobSpec;

/// Status of one job as reported by the transfer service, with file states already mapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusReport {
    pub job_state: JobState,
    pub files: Vec<FileStatusReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatusReport {
    pub source_url: String,
    pub destination_url: String,
    pub state: FileState,
    pub reason: Option<String>,
}

/// Job-level state. A terminal job has no further file transitions to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Staging,
    Active,
    Finished,
    FinishedDirty,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::FinishedDirty | JobState::Failed | JobState::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Staging => "STAGING",
            JobState::Active => "ACTIVE",
            JobState::Finished => "FINISHED",
            JobState::FinishedDirty => "FINISHED_DIRTY",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: Option<u64>,
}

pub trait TransferClient: Send + Sync {
    fn submit(&self, spec: &TransferJobSpec) -> Result<JobId, DatastoreError>;
    fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport, DatastoreError>;
    /// Cancels a job and returns the state the service left it in.
    fn cancel(&self, job_id: &JobId) -> Result<JobState, DatastoreError>;
    /// `None` when nothing exists at `url`.
    fn stat(&self, url: &str) -> Result<Option<FileStat>, DatastoreError>;
}

/// Maps a transfer service file state onto [`FileState`], filling in a reason for states
/// that end a transfer without one.
pub fn map_file_state(raw: &str, reason: Option<String>) -> (FileState, Option<String>) {
    let reason = reason.filter(|reason| !reason.trim().is_empty());
    match raw.to_ascii_uppercase().as_str() {
        "SUBMITTED" | "READY" | "ON_HOLD" => (FileState::Pending, None),
        "STAGING" | "STARTED" | "ON_HOLD_STAGING" => (FileState::Staging, None),
        "ACTIVE" => (FileState::Active, None),
        "ARCHIVING" => (FileState::Archiving, None),
        "FINISHED" => (FileState::Finished, None),
        "FAILED" => (FileState::Failed, reason),
        "CANCELED" => (
            FileState::Failed,
            reason.or_else(|| Some("canceled".to_string())),
        ),
        "NOT_USED" => (
            FileState::Failed,
            reason.or_else(|| Some("not used by transfer service".to_string())),
        ),
        other => {
            warn!(state = other, "unexpected transfer file state; treating as pending");
            (FileState::Pending, None)
        }
    }
}

pub fn map_job_state(raw: &str) -> JobState {
    match raw.to_ascii_uppercase().as_str() {
        "SUBMITTED" | "READY" | "ON_HOLD" => JobState::Pending,
        "STAGING" | "ON_HOLD_STAGING" => JobState::Staging,
        "ACTIVE" | "ARCHIVING" | "QOS_TRANSITION" | "QOS_REQUEST_SUBMITTED" => JobState::Active,
        "FINISHED" => JobState::Finished,
        "FINISHEDDIRTY" => JobState::FinishedDirty,
        "FAILED" => JobState::Failed,
        "CANCELED" => JobState::Canceled,
        other => {
            warn!(state = other, "unexpected transfer job state; treating as pending");
            JobState::Pending
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    job_state: String,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    source_surl: String,
    dest_surl: String,
    file_state: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatResponse {
    #[serde(default)]
    size: Option<u64>,
}

pub struct Fts3HttpClient {
    client: Client,
    settings: TransferSettings,
}

impl Fts3HttpClient {
    pub fn new(settings: TransferSettings) -> Result<Self, DatastoreError> {
        let mut pem = fs::read(&settings.identity.key).map_err(|err| {
            DatastoreError::InvalidConfig(format!(
                "read {}: {err}",
                settings.identity.key.display()
            ))
        })?;
        if settings.identity.cert != settings.identity.key {
            let cert = fs::read(&settings.identity.cert).map_err(|err| {
                DatastoreError::InvalidConfig(format!(
                    "read {}: {err}",
                    settings.identity.cert.display()
                ))
            })?;
            pem.push(b'\n');
            pem.extend_from_slice(&cert);
        }
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|err| DatastoreError::InvalidConfig(format!("x509 identity: {err}")))?;

        let client = Client::builder()
            .default_headers(default_headers()?)
            .identity(identity)
            .danger_accept_invalid_certs(!settings.verify)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| DatastoreError::TransferServiceUnavailable(err.to_string()))?;
        Ok(Self::with_client(client, settings))
    }

    /// Uses a prepared client as is. The settings' identity is not read.
    pub fn with_client(client: Client, settings: TransferSettings) -> Self {
        Self { client, settings }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.endpoint)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, DatastoreError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(DatastoreError::TransferServiceUnavailable(err.to_string()));
                }
            }
        }
    }

    fn read_json<T: for<'de> Deserialize<'de>>(
        &self,
        response: Response,
        job_id: Option<&JobId>,
    ) -> Result<T, DatastoreError> {
        let status = response.status().as_u16();
        if status == 404 {
            if let Some(job_id) = job_id {
                return Err(DatastoreError::JobNotFound(job_id.to_string()));
            }
        }
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "transfer service request failed".to_string());
            return Err(DatastoreError::TransferStatus { status, message });
        }
        response
            .json::<T>()
            .map_err(|err| DatastoreError::TransferStatus {
                status,
                message: format!("unexpected response body: {err}"),
            })
    }
}

impl TransferClient for Fts3HttpClient {
    fn submit(&self, spec: &TransferJobSpec) -> Result<JobId, DatastoreError> {
        let files: Vec<_> = spec
            .files
            .iter()
            .map(|file| {
                let mut entry = json!({
                    "sources": [file.source_url],
                    "destinations": [file.destination_url],
                });
                if let Some(checksum) = &file.checksum {
                    entry["checksum"] = json!(checksum);
                }
                entry
            })
            .collect();
        let body = json!({
            "files": files,
            "params": {
                "retry": self.settings.retry,
                "verify_checksum": self.settings.verify_checksum.to_string(),
                "bring_online": spec.options.bring_online.map_or(-1, i64::from),
                "archive_timeout": spec.options.archive_timeout.map_or(-1, i64::from),
                "strict_copy": spec.options.strict_copy,
            },
        });
        debug!(files = spec.files.len(), body = %body, "submitting transfer job");

        let response = self
            .client
            .post(self.url("/jobs"))
            .json(&body)
            .send()
            .map_err(|err| DatastoreError::TransferServiceUnavailable(err.to_string()))?;

        let status = response.status().as_u16();
        match status {
            413 => {
                return Err(DatastoreError::RequestTooLarge {
                    files: spec.files.len(),
                });
            }
            400..=499 => {
                let message = response
                    .text()
                    .unwrap_or_else(|_| "job rejected".to_string());
                return Err(DatastoreError::SubmissionRejected(message));
            }
            _ => {}
        }

        let submitted: SubmitResponse = self.read_json(response, None)?;
        let job_id: JobId = submitted.job_id.parse()?;
        info!(job_id = %job_id, files = spec.files.len(), "submitted transfer job");
        Ok(job_id)
    }

    fn job_status(&self, job_id: &JobId) -> Result<JobStatusReport, DatastoreError> {
        let job_url = self.url(&format!("/jobs/{}", job_id.as_str()));
        let response = self.send_with_retries(|| self.client.get(&job_url))?;
        let job: JobResponse = self.read_json(response, Some(job_id))?;

        let files_url = format!("{job_url}/files");
        let response = self.send_with_retries(|| self.client.get(&files_url))?;
        let files: Vec<FileResponse> = self.read_json(response, Some(job_id))?;

        Ok(JobStatusReport {
            job_state: map_job_state(&job.job_state),
            files: files
                .into_iter()
                .map(|file| {
                    let (state, reason) = map_file_state(&file.file_state, file.reason);
                    FileStatusReport {
                        source_url: file.source_surl,
                        destination_url: file.dest_surl,
                        state,
                        reason,
                    }
                })
                .collect(),
        })
    }

    fn cancel(&self, job_id: &JobId) -> Result<JobState, DatastoreError> {
        let job_url = self.url(&format!("/jobs/{}", job_id.as_str()));
        let response = self.send_with_retries(|| self.client.delete(&job_url))?;
        let job: JobResponse = self.read_json(response, Some(job_id))?;
        let state = map_job_state(&job.job_state);
        info!(job_id = %job_id, state = %state, "canceled transfer job");
        Ok(state)
    }

    fn stat(&self, url: &str) -> Result<Option<FileStat>, DatastoreError> {
        let stat_url = self.url("/dm/stat");
        let response =
            self.send_with_retries(|| self.client.get(&stat_url).query(&[("surl", url)]))?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let stat: StatResponse = self.read_json(response, None)?;
        Ok(Some(FileStat { size: stat.size }))
    }
}

fn default_headers() -> Result<HeaderMap, DatastoreError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!(
            "datastore-coordinator/{}",
            env!("CARGO_PKG_VERSION")
        ))
        .map_err(|err| DatastoreError::InvalidConfig(err.to_string()))?,
    );
    Ok(headers)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
