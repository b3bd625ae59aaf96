use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::VerifyChecksum;
use crate::endpoint::{DEFAULT_TAPE_TIMEOUT_SECS, EndpointTable, StorageEndpoint, StorageKind};
use crate::error::DatastoreError;
use crate::partition::PartitionLimits;

pub const DEFAULT_CONFIG_FILE: &str = "datastore.json";
pub const PASSWORD_ENV: &str = "DATASTORE_ICAT_PASSWORD";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub icat: IcatConfig,
    pub fts3: Fts3Config,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub store_root: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IcatConfig {
    pub url: String,
    #[serde(default = "default_true")]
    pub check_cert: bool,
    pub facility_name: String,
    pub functional_user: FunctionalUser,
    #[serde(default = "default_embargo_period_years")]
    pub embargo_period_years: i32,
    #[serde(default)]
    pub embargo_types: Vec<String>,
    #[serde(default = "default_parameter_type_job_ids")]
    pub parameter_type_job_ids: String,
    #[serde(default = "default_parameter_type_job_state")]
    pub parameter_type_job_state: String,
    #[serde(default = "default_parameter_type_restore_state")]
    pub parameter_type_restore_state: String,
    #[serde(default)]
    pub create_parameter_types: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionalUser {
    pub auth: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Fts3Config {
    pub endpoint: String,
    #[serde(default)]
    pub x509_user_proxy: Option<String>,
    #[serde(default)]
    pub x509_user_cert: Option<String>,
    #[serde(default)]
    pub x509_user_key: Option<String>,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_retry")]
    pub retry: i32,
    #[serde(default)]
    pub verify_checksum: VerifyChecksum,
    #[serde(default)]
    pub supported_checksums: Vec<String>,
    #[serde(default)]
    pub check_source: bool,
    #[serde(default)]
    pub file_size_limit: Option<u64>,
    #[serde(default)]
    pub total_file_size_limit: Option<u64>,
    #[serde(default)]
    pub archive_endpoint: Option<String>,
    #[serde(default)]
    pub storage_endpoints: BTreeMap<String, EndpointEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Disk,
    Tape,
    S3,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EndpointEntry {
    pub url: String,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub bring_online: Option<u32>,
    #[serde(default)]
    pub archive_timeout: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PartitionConfig {
    #[serde(default = "default_max_files_per_job")]
    pub max_files_per_job: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            max_files_per_job: default_max_files_per_job(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            tick_secs: default_tick_secs(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogueSettings {
    pub url: String,
    pub check_cert: bool,
    pub facility_name: String,
    pub functional_user: FunctionalUser,
    pub embargo_period_years: i32,
    pub embargo_types: Vec<String>,
    pub parameter_type_job_ids: String,
    pub parameter_type_job_state: String,
    pub parameter_type_restore_state: String,
    pub create_parameter_types: bool,
}

/// Client identity presented to the transfer service. A proxy file holds both halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509Identity {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub endpoint: String,
    pub identity: X509Identity,
    pub verify: bool,
    pub retry: i32,
    pub verify_checksum: VerifyChecksum,
    pub supported_checksums: Vec<String>,
    pub check_source: bool,
    pub file_size_limit: Option<u64>,
    pub total_file_size_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    /// Minimum time between two polls of the same request.
    pub poll_interval: Duration,
    /// How often the sweep looks for requests that are due.
    pub tick: Duration,
    pub workers: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(default_poll_interval_secs()),
            tick: Duration::from_secs(default_tick_secs()),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub catalogue: CatalogueSettings,
    pub transfer: TransferSettings,
    pub endpoints: EndpointTable,
    pub limits: PartitionLimits,
    pub reconciler: ReconcilerSettings,
    pub store_root: Option<Utf8PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, DatastoreError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(DatastoreError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| DatastoreError::ConfigRead(config_path.clone()))?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|err| DatastoreError::ConfigParse(err.to_string()))?;

        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.trim().is_empty() {
                config.icat.functional_user.password = password.trim().to_string();
            }
        }

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, DatastoreError> {
        let Config {
            icat,
            fts3,
            partition,
            reconciler,
            store_root,
        } = config;

        validate_http_url("icat.url", &icat.url)?;
        validate_http_url("fts3.endpoint", &fts3.endpoint)?;

        if fts3.verify_checksum != VerifyChecksum::None && fts3.supported_checksums.is_empty() {
            return Err(DatastoreError::InvalidConfig(
                "at least one checksum mechanism needs to be provided if `verify_checksum` is not 'none'"
                    .to_string(),
            ));
        }
        if partition.max_files_per_job == 0 {
            return Err(DatastoreError::InvalidConfig(
                "partition.max_files_per_job must be at least 1".to_string(),
            ));
        }
        if reconciler.workers == 0 {
            return Err(DatastoreError::InvalidConfig(
                "reconciler.workers must be at least 1".to_string(),
            ));
        }

        let identity = resolve_identity(
            fts3.x509_user_proxy.as_deref(),
            fts3.x509_user_cert.as_deref(),
            fts3.x509_user_key.as_deref(),
        )?;

        let endpoints = fts3
            .storage_endpoints
            .iter()
            .map(|(key, entry)| resolve_endpoint(key, entry))
            .collect::<Result<Vec<_>, DatastoreError>>()?;
        let endpoints = EndpointTable::new(endpoints, fts3.archive_endpoint.clone())?;

        Ok(ResolvedConfig {
            catalogue: CatalogueSettings {
                url: icat.url.trim_end_matches('/').to_string(),
                check_cert: icat.check_cert,
                facility_name: icat.facility_name,
                functional_user: icat.functional_user,
                embargo_period_years: icat.embargo_period_years,
                embargo_types: icat.embargo_types,
                parameter_type_job_ids: icat.parameter_type_job_ids,
                parameter_type_job_state: icat.parameter_type_job_state,
                parameter_type_restore_state: icat.parameter_type_restore_state,
                create_parameter_types: icat.create_parameter_types,
            },
            transfer: TransferSettings {
                endpoint: fts3.endpoint.trim_end_matches('/').to_string(),
                identity,
                verify: fts3.verify,
                retry: fts3.retry,
                verify_checksum: fts3.verify_checksum,
                supported_checksums: fts3.supported_checksums,
                check_source: fts3.check_source,
                file_size_limit: fts3.file_size_limit,
                total_file_size_limit: fts3.total_file_size_limit,
            },
            endpoints,
            limits: PartitionLimits {
                max_files: partition.max_files_per_job,
                max_payload_bytes: partition.max_payload_bytes,
            },
            reconciler: ReconcilerSettings {
                poll_interval: Duration::from_secs(reconciler.poll_interval_secs),
                tick: Duration::from_secs(reconciler.tick_secs.max(1)),
                workers: reconciler.workers,
            },
            store_root: store_root.map(Utf8PathBuf::from),
        })
    }
}

fn resolve_endpoint(key: &str, entry: &EndpointEntry) -> Result<StorageEndpoint, DatastoreError> {
    let kind = match entry.storage_type {
        StorageType::Disk => StorageKind::Disk,
        StorageType::Tape => StorageKind::Tape {
            bring_online: entry.bring_online.unwrap_or(DEFAULT_TAPE_TIMEOUT_SECS),
            archive_timeout: entry.archive_timeout.unwrap_or(DEFAULT_TAPE_TIMEOUT_SECS),
        },
        StorageType::S3 => StorageKind::S3,
    };
    StorageEndpoint::new(key, &entry.url, kind)
}

fn resolve_identity(
    proxy: Option<&str>,
    cert: Option<&str>,
    key: Option<&str>,
) -> Result<X509Identity, DatastoreError> {
    match (cert, key, proxy) {
        (Some(cert), Some(key), _) => {
            check_readable("x509_user_cert", Path::new(cert))?;
            check_readable("x509_user_key", Path::new(key))?;
            Ok(X509Identity {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            })
        }
        (Some(_), None, _) => Err(DatastoreError::InvalidConfig(
            "x509_user_key not set".to_string(),
        )),
        (None, _, Some(proxy)) => {
            check_readable("x509_user_proxy", Path::new(proxy))?;
            Ok(X509Identity {
                cert: PathBuf::from(proxy),
                key: PathBuf::from(proxy),
            })
        }
        (None, _, None) => Err(DatastoreError::InvalidConfig(
            "neither x509_user_cert nor x509_user_proxy set".to_string(),
        )),
    }
}

fn check_readable(setting: &str, path: &Path) -> Result<(), DatastoreError> {
    match fs::File::open(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(
            DatastoreError::InvalidConfig(format!("{setting} set but doesn't exist")),
        ),
        Err(_) => Err(DatastoreError::InvalidConfig(format!(
            "{setting} exists but is not readable"
        ))),
    }
}

fn validate_http_url(setting: &str, raw: &str) -> Result<(), DatastoreError> {
    let url = url::Url::parse(raw)
        .map_err(|err| DatastoreError::InvalidConfig(format!("{setting}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DatastoreError::InvalidConfig(format!(
            "{setting} must be an http(s) url"
        )));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_embargo_period_years() -> i32 {
    2
}

fn default_parameter_type_job_ids() -> String {
    "Archival ids".to_string()
}

fn default_parameter_type_job_state() -> String {
    "Archival state".to_string()
}

fn default_parameter_type_restore_state() -> String {
    "Restore state".to_string()
}

fn default_retry() -> i32 {
    -1
}

pub fn default_max_files_per_job() -> usize {
    1000
}

pub fn default_max_payload_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_tick_secs() -> u64 {
    10
}

fn default_workers() -> usize {
    4
}
