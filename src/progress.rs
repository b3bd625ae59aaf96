use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::domain::FileState;
use crate::request::RequestRecord;

/// State recorded against a dataset in the catalogue, aggregated over its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasetState {
    Staging,
    Pending,
    Active,
    Archiving,
    Finished,
    Failed,
    FinishedDirty,
}

impl DatasetState {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetState::Staging => "STAGING",
            DatasetState::Pending => "SUBMITTED",
            DatasetState::Active => "ACTIVE",
            DatasetState::Archiving => "ARCHIVING",
            DatasetState::Finished => "FINISHED",
            DatasetState::Failed => "FAILED",
            DatasetState::FinishedDirty => "FINISHEDDIRTY",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DatasetState::Finished | DatasetState::Failed | DatasetState::FinishedDirty
        )
    }
}

impl fmt::Display for DatasetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub total: usize,
    pub pending: usize,
    pub staging: usize,
    pub active: usize,
    pub archiving: usize,
    pub finished: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn record(&mut self, state: FileState) {
        self.total += 1;
        match state {
            FileState::Pending => self.pending += 1,
            FileState::Staging => self.staging += 1,
            FileState::Active => self.active += 1,
            FileState::Archiving => self.archiving += 1,
            FileState::Finished => self.finished += 1,
            FileState::Failed => self.failed += 1,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending + self.staging + self.active + self.archiving
    }

    /// Earliest non-terminal state wins. Once everything is terminal, a uniform outcome is
    /// reported as is and a mixed one as dirty.
    pub fn dataset_state(&self) -> DatasetState {
        if self.staging > 0 {
            DatasetState::Staging
        } else if self.pending > 0 {
            DatasetState::Pending
        } else if self.active > 0 {
            DatasetState::Active
        } else if self.archiving > 0 {
            DatasetState::Archiving
        } else if self.failed == 0 {
            DatasetState::Finished
        } else if self.finished == 0 {
            DatasetState::Failed
        } else {
            DatasetState::FinishedDirty
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub counts: StateCounts,
    pub unsubmitted_files: usize,
    pub already_present: usize,
    pub datasets: BTreeMap<i64, DatasetState>,
}

impl RequestSummary {
    pub fn of(record: &RequestRecord) -> Self {
        let mut counts = StateCounts::default();
        let mut per_dataset = BTreeMap::<i64, StateCounts>::new();

        for file in &record.satisfied {
            per_dataset
                .entry(file.dataset_id)
                .or_default()
                .record(FileState::Finished);
            counts.record(FileState::Finished);
        }
        for file in record.tracked_files() {
            per_dataset
                .entry(file.transfer.dataset_id)
                .or_default()
                .record(file.state);
            counts.record(file.state);
        }

        let mut unsubmitted_files = 0usize;
        for file in record.unsubmitted().flat_map(|spec| spec.spec.files.iter()) {
            per_dataset
                .entry(file.dataset_id)
                .or_default()
                .record(FileState::Pending);
            unsubmitted_files += 1;
        }

        Self {
            counts,
            unsubmitted_files,
            already_present: record.satisfied.len(),
            datasets: per_dataset
                .into_iter()
                .map(|(id, counts)| (id, counts.dataset_state()))
                .collect(),
        }
    }
}
