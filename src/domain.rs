use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatastoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = DatastoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|_| DatastoreError::InvalidRequest(format!("invalid request id: {value}")))
    }
}

/// Identifier the transfer service assigned to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DatastoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.contains(',') || trimmed.contains('/') {
            return Err(DatastoreError::SubmissionRejected(format!(
                "unusable job id returned: {value:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Archive,
    Restore,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Archive => write!(f, "archive"),
            Direction::Restore => write!(f, "restore"),
        }
    }
}

/// Per-file transfer state. External status strings never reach past the transfer client;
/// they are mapped onto this enum there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    Pending,
    Staging,
    Active,
    Archiving,
    Finished,
    Failed,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Finished | FileState::Failed)
    }

    /// Position along the per-file lifecycle. Terminal states share the top rank.
    pub fn rank(self) -> u8 {
        match self {
            FileState::Pending => 0,
            FileState::Staging => 1,
            FileState::Active => 2,
            FileState::Archiving => 3,
            FileState::Finished | FileState::Failed => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Pending => "PENDING",
            FileState::Staging => "STAGING",
            FileState::Active => "ACTIVE",
            FileState::Archiving => "ARCHIVING",
            FileState::Finished => "FINISHED",
            FileState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate state of a request, derived from its specs and jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Submitting,
    PartiallySubmitted,
    InProgress,
    Completed,
    PartiallyFailed,
    Failed,
    Abandoned,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::PartiallyFailed
                | RequestState::Failed
                | RequestState::Abandoned
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Submitting => "SUBMITTING",
            RequestState::PartiallySubmitted => "PARTIALLY_SUBMITTED",
            RequestState::InProgress => "IN_PROGRESS",
            RequestState::Completed => "COMPLETED",
            RequestState::PartiallyFailed => "PARTIALLY_FAILED",
            RequestState::Failed => "FAILED",
            RequestState::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyChecksum {
    #[default]
    None,
    Source,
    Destination,
    Both,
}

impl fmt::Display for VerifyChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyChecksum::None => write!(f, "none"),
            VerifyChecksum::Source => write!(f, "source"),
            VerifyChecksum::Destination => write!(f, "destination"),
            VerifyChecksum::Both => write!(f, "both"),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_request_id_roundtrips_display() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_request_id_invalid() {
        let err = "not-a-uuid".parse::<RequestId>().unwrap_err();
        assert_matches!(err, DatastoreError::InvalidRequest(_));
    }

    #[test]
    fn job_id_rejects_lists() {
        let err = "a,b".parse::<JobId>().unwrap_err();
        assert_matches!(err, DatastoreError::SubmissionRejected(_));
        let id: JobId = " 3f2a ".parse().unwrap();
        assert_eq!(id.as_str(), "3f2a");
    }

    #[test]
    fn terminal_states_share_top_rank() {
        assert!(FileState::Finished.is_terminal());
        assert!(FileState::Failed.is_terminal());
        assert!(!FileState::Archiving.is_terminal());
        assert_eq!(FileState::Finished.rank(), FileState::Failed.rank());
        assert!(FileState::Staging.rank() < FileState::Active.rank());
    }

    #[test]
    fn abandoned_is_terminal_but_not_failed() {
        assert!(RequestState::Abandoned.is_terminal());
        assert_ne!(RequestState::Abandoned, RequestState::Failed);
        assert!(!RequestState::PartiallySubmitted.is_terminal());
    }
}
