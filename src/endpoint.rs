use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DatastoreError;

const ALLOWED_SCHEMES: &[&str] = &["root", "http", "https", "davs"];

/// Eight hours, the staging and archiving bound used when a tape endpoint does not set one.
pub const DEFAULT_TAPE_TIMEOUT_SECS: u32 = 28_800;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "storage_type", rename_all = "lowercase")]
pub enum StorageKind {
    Disk,
    Tape {
        bring_online: u32,
        archive_timeout: u32,
    },
    S3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEndpoint {
    pub key: String,
    pub url: String,
    pub kind: StorageKind,
}

impl StorageEndpoint {
    pub fn new(key: &str, url: &str, kind: StorageKind) -> Result<Self, DatastoreError> {
        let url = validate_endpoint_url(key, url)?;
        Ok(Self {
            key: key.to_string(),
            url,
            kind,
        })
    }

    /// Base url as the transfer service expects it. Object stores are addressed through the
    /// signed `s3s` scheme regardless of how they are configured.
    pub fn formatted_url(&self) -> String {
        match self.kind {
            StorageKind::S3 => match self.url.split_once("://") {
                Some((_, rest)) => format!("s3s://{rest}"),
                None => self.url.clone(),
            },
            _ => self.url.clone(),
        }
    }

    pub fn is_tape(&self) -> bool {
        matches!(self.kind, StorageKind::Tape { .. })
    }

    pub fn is_s3(&self) -> bool {
        matches!(self.kind, StorageKind::S3)
    }

    /// Full url of `location` on this endpoint.
    pub fn url_for(&self, location: &str) -> String {
        format!("{}{}", self.formatted_url(), location.trim_start_matches('/'))
    }
}

/// Job-wide options. The transfer service applies these to every file of a job, so files
/// that need different values can never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub bring_online: Option<u32>,
    pub archive_timeout: Option<u32>,
    pub strict_copy: bool,
}

impl JobOptions {
    pub fn between(source: &StorageEndpoint, destination: &StorageEndpoint) -> Self {
        let bring_online = match source.kind {
            StorageKind::Tape { bring_online, .. } => Some(bring_online),
            _ => None,
        };
        let archive_timeout = match destination.kind {
            StorageKind::Tape {
                archive_timeout, ..
            } => Some(archive_timeout),
            _ => None,
        };
        Self {
            bring_online,
            archive_timeout,
            strict_copy: destination.is_s3(),
        }
    }

    pub fn requires_staging(&self) -> bool {
        self.bring_online.is_some()
    }
}

/// Source and destination urls for moving `location` between two endpoints.
pub fn transfer_urls(
    source: &StorageEndpoint,
    destination: &StorageEndpoint,
    location: &str,
) -> (String, String) {
    let query = if destination.is_s3() {
        "?copy_mode=push"
    } else {
        ""
    };
    (
        format!("{}{query}", source.url_for(location)),
        destination.url_for(location),
    )
}

pub fn validate_endpoint_url(key: &str, raw: &str) -> Result<String, DatastoreError> {
    let invalid = |reason: String| DatastoreError::InvalidEndpoint {
        key: key.to_string(),
        reason,
    };
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|err| invalid(format!("{trimmed}: {err}")))?;

    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(invalid(format!(
            "scheme {} not one of {}",
            url.scheme(),
            ALLOWED_SCHEMES.join(", ")
        )));
    }
    if url.query().is_some() {
        return Err(invalid("url query not supported".to_string()));
    }
    if url.fragment().is_some() {
        return Err(invalid("url fragment not supported".to_string()));
    }
    if url.host_str().is_none() {
        return Err(invalid(format!("{trimmed} has no host")));
    }

    let path = url.path();
    if url.scheme() == "root" && !path.starts_with("//") {
        return Err(invalid(format!("{trimmed} path did not start with '//'")));
    }
    if !path.ends_with('/') {
        return Err(invalid(format!("{trimmed} path did not end with '/'")));
    }

    Ok(trimmed.to_string())
}

/// Immutable lookup of configured storage endpoints, shared by reference with everything that
/// needs to turn a storage key into urls or options.
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    endpoints: BTreeMap<String, StorageEndpoint>,
    archive_key: Option<String>,
}

impl EndpointTable {
    pub fn new(
        endpoints: Vec<StorageEndpoint>,
        archive_key: Option<String>,
    ) -> Result<Self, DatastoreError> {
        let mut map = BTreeMap::new();
        for endpoint in endpoints {
            let key = endpoint.key.clone();
            if map.insert(key.clone(), endpoint).is_some() {
                return Err(DatastoreError::InvalidConfig(format!(
                    "storage endpoint {key} defined twice"
                )));
            }
        }
        if let Some(key) = &archive_key {
            if !map.contains_key(key) {
                return Err(DatastoreError::InvalidConfig(format!(
                    "archive endpoint {key} is not a configured storage endpoint"
                )));
            }
        }
        Ok(Self {
            endpoints: map,
            archive_key,
        })
    }

    pub fn get(&self, key: &str) -> Result<&StorageEndpoint, DatastoreError> {
        self.endpoints
            .get(key)
            .ok_or_else(|| DatastoreError::UnknownEndpoint(key.to_string()))
    }

    pub fn archive(&self) -> Result<&StorageEndpoint, DatastoreError> {
        let key = self.archive_key.as_deref().ok_or_else(|| {
            DatastoreError::InvalidConfig("no archive endpoint configured".to_string())
        })?;
        self.get(key)
    }

    /// The endpoint named by `key`, or the archive endpoint when no key is given.
    pub fn resolve(&self, key: Option<&str>) -> Result<&StorageEndpoint, DatastoreError> {
        match key {
            Some(key) => self.get(key),
            None => self.archive(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn tape() -> StorageEndpoint {
        StorageEndpoint::new(
            "tape",
            "root://archive.example:1094//",
            StorageKind::Tape {
                bring_online: 600,
                archive_timeout: 900,
            },
        )
        .unwrap()
    }

    fn disk() -> StorageEndpoint {
        StorageEndpoint::new("idc", "davs://cache.example/data/", StorageKind::Disk).unwrap()
    }

    fn s3() -> StorageEndpoint {
        StorageEndpoint::new(
            "echo",
            "https://s3.example/",
            StorageKind::S3,
        )
        .unwrap()
    }

    #[test]
    fn rejects_root_path_without_double_slash() {
        let err = validate_endpoint_url("tape", "root://archive.example:1094/data/").unwrap_err();
        assert_matches!(err, DatastoreError::InvalidEndpoint { .. });
    }

    #[test]
    fn rejects_query_and_missing_trailing_slash() {
        assert!(validate_endpoint_url("x", "https://host/path/?a=b").is_err());
        assert!(validate_endpoint_url("x", "https://host/path").is_err());
        assert!(validate_endpoint_url("x", "ftp://host/path/").is_err());
    }

    #[test]
    fn s3_urls_use_signed_scheme_and_push_mode() {
        let (source, destination) = transfer_urls(&disk(), &s3(), "/inv/ds/file.nxs");
        assert_eq!(source, "davs://cache.example/data/inv/ds/file.nxs?copy_mode=push");
        assert_eq!(destination, "s3s://s3.example/inv/ds/file.nxs");
    }

    #[test]
    fn options_follow_tape_side() {
        let restore = JobOptions::between(&tape(), &disk());
        assert_eq!(restore.bring_online, Some(600));
        assert_eq!(restore.archive_timeout, None);
        assert!(restore.requires_staging());

        let archive = JobOptions::between(&disk(), &tape());
        assert_eq!(archive.bring_online, None);
        assert_eq!(archive.archive_timeout, Some(900));

        assert!(JobOptions::between(&tape(), &s3()).strict_copy);
    }

    #[test]
    fn table_requires_known_archive_key() {
        let err = EndpointTable::new(vec![disk()], Some("tape".to_string())).unwrap_err();
        assert_matches!(err, DatastoreError::InvalidConfig(_));

        let table = EndpointTable::new(vec![disk(), tape()], Some("tape".to_string())).unwrap();
        assert_eq!(table.resolve(None).unwrap().key, "tape");
        assert_matches!(table.get("rdc"), Err(DatastoreError::UnknownEndpoint(_)));
    }
}
