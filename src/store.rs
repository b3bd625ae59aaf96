use std::fs;
use std::io::{ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::Builder;
use tracing::{debug, warn};

use crate::domain::RequestId;
use crate::error::DatastoreError;
use crate::request::RequestRecord;

const UPDATE_ATTEMPTS: usize = 5;
const LOAD_ATTEMPTS: usize = 5;
/// Superseded versions kept next to the latest one, so readers that listed a version just
/// before a newer save can still open it.
const RETAINED_VERSIONS: u64 = 4;

/// Request records on disk. Each request is a directory under `<root>/requests` holding one
/// JSON document per saved version; the highest version is the current record.
///
/// A save writes version `N + 1` with a no-clobber rename, so of two writers that loaded
/// version `N` (in this process or another one) exactly one wins and the other gets
/// `VersionConflict`, reloads and re-applies.
#[derive(Debug)]
pub struct RequestStore {
    root: Utf8PathBuf,
}

enum WriteError {
    Exists,
    Failed(DatastoreError),
}

impl RequestStore {
    pub fn new() -> Result<Self, DatastoreError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("datastore-coordinator"))
                    .ok()
            })
            .ok_or_else(|| {
                DatastoreError::Filesystem("unable to resolve data directory".to_string())
            })?;
        Ok(Self::new_with_root(root))
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn requests_dir(&self) -> Utf8PathBuf {
        self.root.join("requests")
    }

    pub fn request_dir(&self, id: &RequestId) -> Utf8PathBuf {
        self.requests_dir().join(id.to_string())
    }

    pub fn version_path(&self, id: &RequestId, version: u64) -> Utf8PathBuf {
        self.request_dir(id).join(format!("{version:010}.json"))
    }

    pub fn insert(&self, record: &mut RequestRecord) -> Result<(), DatastoreError> {
        let id = record.id;
        let dir = self.request_dir(&id);
        let already_stored = || DatastoreError::Filesystem(format!("request {id} already stored"));
        if latest_version(&dir)?.is_some() {
            return Err(already_stored());
        }
        record.version = 1;
        match write_version(&self.version_path(&id, 1), record) {
            Ok(()) => Ok(()),
            Err(WriteError::Exists) => Err(already_stored()),
            Err(WriteError::Failed(err)) => Err(err),
        }
    }

    pub fn load(&self, id: &RequestId) -> Result<RequestRecord, DatastoreError> {
        let dir = self.request_dir(id);
        for _ in 0..LOAD_ATTEMPTS {
            let Some(version) = latest_version(&dir)? else {
                return Err(DatastoreError::RequestNotFound(id.to_string()));
            };
            // `None` means the version was pruned after it was listed.
            if let Some(record) = read_record(&self.version_path(id, version))? {
                return Ok(record);
            }
            debug!(request = %id, version, "request version pruned while loading; relisting");
        }
        Err(DatastoreError::Filesystem(format!(
            "request {id} kept changing while loading"
        )))
    }

    /// Writes `record` as the next version if nobody saved a newer version since it was
    /// loaded.
    pub fn save(&self, record: &mut RequestRecord) -> Result<(), DatastoreError> {
        let dir = self.request_dir(&record.id);
        let Some(latest) = latest_version(&dir)? else {
            return Err(DatastoreError::RequestNotFound(record.id.to_string()));
        };
        if latest != record.version {
            return Err(conflict(record, latest));
        }

        let expected = record.version;
        let next = expected + 1;
        let path = self.version_path(&record.id, next);
        record.version = next;
        record.touch();
        match write_version(&path, record) {
            Ok(()) => {}
            Err(WriteError::Exists) => {
                record.version = expected;
                let found = latest_version(&dir)?.unwrap_or(next);
                return Err(conflict(record, found));
            }
            Err(WriteError::Failed(err)) => {
                record.version = expected;
                return Err(err);
            }
        }

        // A pruned slot can be won after newer versions were written; such a write is stale.
        let latest = latest_version(&dir)?.unwrap_or(next);
        if latest > next {
            if let Err(err) = fs::remove_file(path.as_std_path()) {
                debug!(path = %path, error = %err, "stale request version already gone");
            }
            record.version = expected;
            return Err(conflict(record, latest));
        }

        prune(&dir, next);
        Ok(())
    }

    /// Loads the latest record, applies `change` and saves it, re-applying on the latest
    /// version whenever another writer got there first. `change` must not call out to
    /// external services; it can run more than once.
    pub fn update<T, F>(&self, id: &RequestId, mut change: F) -> Result<(RequestRecord, T), DatastoreError>
    where
        F: FnMut(&mut RequestRecord) -> Result<T, DatastoreError>,
    {
        let mut attempt = 0usize;
        loop {
            let mut record = self.load(id)?;
            let value = change(&mut record)?;
            match self.save(&mut record) {
                Ok(()) => return Ok((record, value)),
                Err(DatastoreError::VersionConflict { found, .. })
                    if attempt + 1 < UPDATE_ATTEMPTS =>
                {
                    debug!(request = %id, found, "request changed concurrently; re-applying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// All readable requests, oldest first. Entries that are not request directories and
    /// records that cannot be read are logged and skipped.
    pub fn list(&self) -> Result<Vec<RequestRecord>, DatastoreError> {
        let dir = self.requests_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| DatastoreError::Filesystem(format!("read {dir}: {err}")))?;
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable request store entry");
                    continue;
                }
            };
            if !path.is_dir() {
                debug!(path = %path.display(), "ignoring stray file in request store");
                continue;
            }
            let Some(id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse::<RequestId>().ok())
            else {
                warn!(path = %path.display(), "skipping directory that is not a request");
                continue;
            };
            match self.load(&id) {
                Ok(record) => records.push(record),
                Err(err) => warn!(request = %id, error = %err, "skipping unreadable request"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Requests that still need polling, submission or a closing catalogue update.
    pub fn list_active(&self) -> Result<Vec<RequestRecord>, DatastoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| {
                record.abandoned_at.is_none()
                    && (!record.is_terminal() || !record.closing_update_issued)
            })
            .collect())
    }
}

fn conflict(record: &RequestRecord, found: u64) -> DatastoreError {
    DatastoreError::VersionConflict {
        request_id: record.id.to_string(),
        expected: record.version,
        found,
    }
}

fn stored_versions(dir: &Utf8Path) -> Result<Vec<u64>, DatastoreError> {
    let entries = match fs::read_dir(dir.as_std_path()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(DatastoreError::Filesystem(format!("read {dir}: {err}"))),
    };
    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| DatastoreError::Filesystem(format!("read {dir}: {err}")))?;
        let name = entry.file_name();
        if let Some(version) = name
            .to_str()
            .and_then(|name| name.strip_suffix(".json"))
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            versions.push(version);
        }
    }
    Ok(versions)
}

fn latest_version(dir: &Utf8Path) -> Result<Option<u64>, DatastoreError> {
    Ok(stored_versions(dir)?.into_iter().max())
}

fn prune(dir: &Utf8Path, latest: u64) {
    let Ok(versions) = stored_versions(dir) else {
        return;
    };
    for version in versions
        .into_iter()
        .filter(|version| *version + RETAINED_VERSIONS < latest)
    {
        let path = dir.join(format!("{version:010}.json"));
        if let Err(err) = fs::remove_file(path.as_std_path()) {
            debug!(path = %path, error = %err, "old request version not pruned");
        }
    }
}

fn read_record(path: &Utf8Path) -> Result<Option<RequestRecord>, DatastoreError> {
    let content = match fs::read_to_string(path.as_std_path()) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(DatastoreError::Filesystem(format!("read {path}: {err}"))),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| DatastoreError::Filesystem(format!("parse {path}: {err}")))
}

fn write_version(path: &Utf8Path, record: &RequestRecord) -> Result<(), WriteError> {
    let failed = |err: String| WriteError::Failed(DatastoreError::Filesystem(err));
    let parent = path
        .parent()
        .ok_or_else(|| failed("invalid request path".to_string()))?;
    fs::create_dir_all(parent.as_std_path()).map_err(|err| failed(err.to_string()))?;
    let content = serde_json::to_vec_pretty(record).map_err(|err| failed(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".request")
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| failed(err.to_string()))?;
    temp.write_all(&content)
        .map_err(|err| failed(err.to_string()))?;
    match temp.persist_noclobber(path.as_std_path()) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Err(WriteError::Exists),
        Err(err) => Err(failed(format!("write {path}: {}", err.error))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;

    fn temp_store() -> (tempfile::TempDir, RequestStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, RequestStore::new_with_root(root))
    }

    #[test]
    fn layout_paths() {
        let store = RequestStore::new_with_root(Utf8PathBuf::from("/var/lib/datastore"));
        let id: RequestId = "6f1c1a56-6d1e-4f9e-9d55-8d0a1e7d6b10".parse().unwrap();
        assert_eq!(
            store.version_path(&id, 12),
            "/var/lib/datastore/requests/6f1c1a56-6d1e-4f9e-9d55-8d0a1e7d6b10/0000000012.json"
        );
    }

    #[test]
    fn update_survives_a_concurrent_save() {
        let (_temp, store) = temp_store();
        let mut record = RequestRecord::new(Direction::Archive, Vec::new(), Vec::new(), vec![7]);
        store.insert(&mut record).unwrap();

        let mut calls = 0;
        let (updated, ()) = store
            .update(&record.id, |latest| {
                calls += 1;
                if calls == 1 {
                    let mut other = store.load(&latest.id).unwrap();
                    store.save(&mut other).unwrap();
                }
                latest.closing_update_issued = true;
                Ok(())
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(updated.version, 3);
        assert!(store.load(&record.id).unwrap().closing_update_issued);
    }

    #[test]
    fn old_versions_are_pruned() {
        let (_temp, store) = temp_store();
        let mut record = RequestRecord::new(Direction::Archive, Vec::new(), Vec::new(), vec![7]);
        store.insert(&mut record).unwrap();
        for _ in 0..9 {
            store.save(&mut record).unwrap();
        }

        let mut versions = stored_versions(&store.request_dir(&record.id)).unwrap();
        versions.sort_unstable();
        assert_eq!(versions, vec![6, 7, 8, 9, 10]);
        assert_eq!(store.load(&record.id).unwrap().version, 10);
    }
}
