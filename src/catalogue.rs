use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::config::CatalogueSettings;
use crate::domain::{Direction, FileState, JobId};
use crate::error::DatastoreError;
use crate::progress::DatasetState;
use crate::request::{Investigation, RestoreRequest};

/// State written to new datasets and datafiles before any job exists.
pub const INITIAL_STATE: &str = "SUBMITTED";

/// Which parameter type records the state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateParameter {
    Archival,
    Restore,
}

impl From<Direction> for StateParameter {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Archive => StateParameter::Archival,
            Direction::Restore => StateParameter::Restore,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueDatafile {
    pub id: i64,
    pub dataset_id: i64,
    pub location: String,
    pub checksum: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogueDataset {
    pub id: i64,
    pub name: String,
    /// Same order as the datafiles of the dataset that was created.
    pub datafiles: Vec<CatalogueDatafile>,
}

pub trait CatalogueClient: Send + Sync {
    /// Creates the investigation (reusing it when one with the same name and visit id exists)
    /// and its datasets and datafiles. Datasets come back in request order.
    fn create_investigation(
        &self,
        investigation: &Investigation,
    ) -> Result<Vec<CatalogueDataset>, DatastoreError>;

    /// Every datafile below the requested ids, each once, in catalogue order.
    fn resolve_datafiles(
        &self,
        request: &RestoreRequest,
    ) -> Result<Vec<CatalogueDatafile>, DatastoreError>;

    fn set_datafile_state(
        &self,
        datafile_id: i64,
        parameter: StateParameter,
        state: FileState,
    ) -> Result<(), DatastoreError>;

    fn set_dataset_state(
        &self,
        dataset_id: i64,
        parameter: StateParameter,
        state: DatasetState,
    ) -> Result<(), DatastoreError>;

    fn record_job_ids(&self, dataset_id: i64, job_ids: &[JobId]) -> Result<(), DatastoreError>;

    fn get_entity(&self, entity: &str, id: i64) -> Result<Value, DatastoreError>;
}

#[derive(Debug, Default, Deserialize)]
struct IcatFailure {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl IcatFailure {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| IcatFailure {
            code: String::new(),
            message: body.trim().to_string(),
        })
    }

    fn into_error(self, status: u16) -> DatastoreError {
        match self.code.as_str() {
            "OBJECT_ALREADY_EXISTS" => DatastoreError::CatalogueConflict(self.message),
            "NO_SUCH_OBJECT_FOUND" => DatastoreError::CatalogueNotFound(self.message),
            "SESSION" => {
                DatastoreError::CatalogueUnavailable(format!("session rejected: {}", self.message))
            }
            _ => DatastoreError::CatalogueStatus {
                status,
                message: if self.code.is_empty() {
                    self.message
                } else {
                    format!("{}: {}", self.code, self.message)
                },
            },
        }
    }
}

pub struct IcatHttpClient {
    client: Client,
    settings: CatalogueSettings,
    session: Mutex<Option<String>>,
    parameter_types: Mutex<HashMap<String, i64>>,
}

impl IcatHttpClient {
    pub fn new(settings: CatalogueSettings) -> Result<Self, DatastoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!(
                "datastore-coordinator/{}",
                env!("CARGO_PKG_VERSION")
            ))
            .map_err(|err| DatastoreError::InvalidConfig(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(!settings.check_cert)
            .build()
            .map_err(|err| DatastoreError::CatalogueUnavailable(err.to_string()))?;

        Ok(Self {
            client,
            settings,
            session: Mutex::new(None),
            parameter_types: Mutex::new(HashMap::new()),
        })
    }

    fn entity_manager_url(&self) -> String {
        format!("{}/icat/entityManager", self.settings.url)
    }

    fn login(&self) -> Result<String, DatastoreError> {
        let user = &self.settings.functional_user;
        let body = json!({
            "plugin": user.auth,
            "credentials": [
                {"username": user.username},
                {"password": user.password},
            ],
        })
        .to_string();
        let url = format!("{}/icat/session", self.settings.url);
        let response = self
            .client
            .post(&url)
            .form(&[("json", body.as_str())])
            .send()
            .map_err(|err| DatastoreError::CatalogueUnavailable(err.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .map_err(|err| DatastoreError::CatalogueUnavailable(err.to_string()))?;
        if !(200..300).contains(&status) {
            let failure = IcatFailure::parse(&text);
            return Err(DatastoreError::CatalogueUnavailable(format!(
                "functional login failed with status {status}: {}",
                failure.message
            )));
        }

        #[derive(Deserialize)]
        struct Session {
            #[serde(rename = "sessionId")]
            session_id: String,
        }
        let session: Session = serde_json::from_str(&text).map_err(|err| {
            DatastoreError::CatalogueUnavailable(format!("unexpected login response: {err}"))
        })?;
        info!(user = %user.username, "logged in to catalogue");
        Ok(session.session_id)
    }

    fn session_id(&self) -> Result<String, DatastoreError> {
        let cached = self
            .session
            .lock()
            .map_err(|_| DatastoreError::CatalogueUnavailable("session lock poisoned".to_string()))?
            .clone();
        if let Some(session) = cached {
            return Ok(session);
        }
        let session = self.login()?;
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session.clone());
        }
        Ok(session)
    }

    fn forget_session(&self) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = None;
        }
    }

    /// Runs one catalogue call, logging in again once if the session has expired.
    fn call<F>(&self, idempotent: bool, make_req: F) -> Result<Value, DatastoreError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let mut relogged = false;
        loop {
            let session = self.session_id()?;
            let response = if idempotent {
                self.send_with_retries(|| make_req(&session))?
            } else {
                make_req(&session)
                    .send()
                    .map_err(|err| DatastoreError::CatalogueUnavailable(err.to_string()))?
            };

            let status = response.status().as_u16();
            let body = response
                .text()
                .map_err(|err| DatastoreError::CatalogueUnavailable(err.to_string()))?;
            if (200..300).contains(&status) {
                if body.trim().is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_str(&body).map_err(|err| DatastoreError::CatalogueStatus {
                    status,
                    message: format!("unparseable response: {err}"),
                });
            }

            let failure = IcatFailure::parse(&body);
            if failure.code == "SESSION" && !relogged {
                debug!("catalogue session expired; logging in again");
                self.forget_session();
                relogged = true;
                continue;
            }
            return Err(failure.into_error(status));
        }
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
                    return Err(DatastoreError::CatalogueUnavailable(err.to_string()));
                }
            }
        }
    }

    fn search(&self, query: &str) -> Result<Vec<Value>, DatastoreError> {
        debug!(query, "catalogue search");
        let url = self.entity_manager_url();
        let result = self.call(true, |session| {
            self.client
                .get(&url)
                .query(&[("sessionId", session), ("query", query)])
        })?;
        Ok(match result {
            Value::Array(items) => items.into_iter().map(unwrap_entity).collect(),
            Value::Null => Vec::new(),
            other => vec![unwrap_entity(other)],
        })
    }

    fn search_single(&self, entity: &str, query: &str) -> Result<Value, DatastoreError> {
        self.search(query)?
            .into_iter()
            .next()
            .ok_or_else(|| DatastoreError::CatalogueNotFound(format!("no {entity} matching {query}")))
    }

    /// Creates entities without an id and updates those with one. Returns the ids in order.
    fn write(&self, entities: &[Value]) -> Result<Vec<i64>, DatastoreError> {
        let payload = Value::Array(entities.to_vec()).to_string();
        let url = self.entity_manager_url();
        let result = self.call(false, |session| {
            self.client
                .post(&url)
                .form(&[("sessionId", session), ("entities", payload.as_str())])
        })?;
        Ok(match result {
            Value::Array(ids) => ids.iter().filter_map(Value::as_i64).collect(),
            Value::Number(id) => id.as_i64().into_iter().collect(),
            _ => Vec::new(),
        })
    }

    fn facility_id(&self) -> Result<i64, DatastoreError> {
        let query = format!(
            "SELECT f FROM Facility f WHERE f.name = '{}'",
            escape(&self.settings.facility_name)
        );
        entity_id(&self.search_single("Facility", &query)?)
    }

    /// Id of a facility-scoped entity looked up by name.
    fn named_id(&self, entity: &str, name: &str) -> Result<i64, DatastoreError> {
        let query = format!(
            "SELECT e FROM {entity} e WHERE e.name = '{}' AND e.facility.name = '{}'",
            escape(name),
            escape(&self.settings.facility_name)
        );
        entity_id(&self.search_single(entity, &query)?)
    }

    fn parameter_type_name(&self, parameter: StateParameter) -> &str {
        match parameter {
            StateParameter::Archival => &self.settings.parameter_type_job_state,
            StateParameter::Restore => &self.settings.parameter_type_restore_state,
        }
    }

    fn parameter_type_id(&self, name: &str) -> Result<i64, DatastoreError> {
        let cached = self
            .parameter_types
            .lock()
            .ok()
            .and_then(|types| types.get(name).copied());
        if let Some(id) = cached {
            return Ok(id);
        }

        let query = format!(
            "SELECT pt FROM ParameterType pt WHERE pt.name = '{}' AND pt.facility.name = '{}' AND pt.units = ''",
            escape(name),
            escape(&self.settings.facility_name)
        );
        let id = match self.search(&query)?.first() {
            Some(found) => entity_id(found)?,
            None if self.settings.create_parameter_types => {
                let facility = self.facility_id()?;
                let created = self.write(&[json!({
                    "ParameterType": {
                        "name": name,
                        "units": "",
                        "valueType": "STRING",
                        "applicableToDataset": true,
                        "applicableToDatafile": true,
                        "facility": {"id": facility},
                    }
                })])?;
                let id = created.first().copied().ok_or_else(|| {
                    DatastoreError::CatalogueStatus {
                        status: 200,
                        message: format!("no id returned for parameter type {name}"),
                    }
                })?;
                info!(name, id, "created parameter type");
                id
            }
            None => {
                return Err(DatastoreError::CatalogueNotFound(format!(
                    "parameter type {name}"
                )));
            }
        };

        if let Ok(mut types) = self.parameter_types.lock() {
            types.insert(name.to_string(), id);
        }
        Ok(id)
    }

    /// Sets the string value of the parameter of type `type_name` on a dataset or datafile,
    /// creating the parameter if it does not exist yet.
    fn upsert_parameter(
        &self,
        owner: ParameterOwner,
        owner_id: i64,
        type_name: &str,
        value: &str,
    ) -> Result<(), DatastoreError> {
        let type_id = self.parameter_type_id(type_name)?;
        let (entity, field) = owner.names();
        let query = format!(
            "SELECT p FROM {entity} p WHERE p.{field}.id = {owner_id} AND p.type.id = {type_id}"
        );

        for _ in 0..2 {
            if let Some(existing) = self.search(&query)?.first() {
                let id = entity_id(existing)?;
                self.write(&[json!({entity: {"id": id, "stringValue": value}})])?;
                return Ok(());
            }
            let created = self.write(&[json!({
                entity: {
                    field: {"id": owner_id},
                    "type": {"id": type_id},
                    "stringValue": value,
                }
            })]);
            match created {
                Ok(_) => return Ok(()),
                // Someone else created it between the search and the write.
                Err(DatastoreError::CatalogueConflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DatastoreError::CatalogueConflict(format!(
            "{entity} of type {type_name} for {field} {owner_id}"
        )))
    }

    fn find_investigation(&self, investigation: &Investigation) -> Result<Option<i64>, DatastoreError> {
        let query = format!(
            "SELECT i FROM Investigation i WHERE i.name = '{}' AND i.visitId = '{}' AND i.facility.name = '{}'",
            escape(&investigation.name),
            escape(&investigation.visit_id),
            escape(&self.settings.facility_name)
        );
        self.search(&query)?.first().map(entity_id).transpose()
    }

    fn new_investigation(&self, investigation: &Investigation) -> Result<i64, DatastoreError> {
        let facility = self.facility_id()?;
        let investigation_type =
            self.named_id("InvestigationType", &investigation.investigation_type)?;
        let instrument = self.named_id("Instrument", &investigation.instrument)?;
        let facility_cycle = self.named_id("FacilityCycle", &investigation.facility_cycle)?;

        let mut fields = Map::new();
        fields.insert("name".to_string(), json!(investigation.name));
        fields.insert("visitId".to_string(), json!(investigation.visit_id));
        fields.insert("title".to_string(), json!(investigation.title));
        insert_opt(&mut fields, "summary", investigation.summary.as_ref());
        insert_opt(&mut fields, "doi", investigation.doi.as_ref());
        insert_opt(
            &mut fields,
            "startDate",
            investigation.start_date.map(format_date).as_ref(),
        );
        insert_opt(
            &mut fields,
            "endDate",
            investigation.end_date.map(format_date).as_ref(),
        );
        let release = release_date(
            investigation,
            self.settings.embargo_period_years,
            &self.settings.embargo_types,
            Utc::now(),
        );
        insert_opt(&mut fields, "releaseDate", release.map(format_date).as_ref());
        fields.insert("facility".to_string(), json!({"id": facility}));
        fields.insert("type".to_string(), json!({"id": investigation_type}));
        fields.insert(
            "investigationInstruments".to_string(),
            json!([{"instrument": {"id": instrument}}]),
        );
        fields.insert(
            "investigationFacilityCycles".to_string(),
            json!([{"facilityCycle": {"id": facility_cycle}}]),
        );

        let ids = self.write(&[json!({"Investigation": Value::Object(fields)})])?;
        let id = ids.first().copied().ok_or_else(|| DatastoreError::CatalogueStatus {
            status: 200,
            message: "no id returned for investigation".to_string(),
        })?;
        info!(name = %investigation.name, visit_id = %investigation.visit_id, id, "created investigation");
        Ok(id)
    }

    fn datafiles_where(&self, condition: &str) -> Result<Vec<CatalogueDatafile>, DatastoreError> {
        let query = format!(
            "SELECT df FROM Datafile df WHERE {condition} ORDER BY df.id INCLUDE df.dataset"
        );
        self.search(&query)?.iter().map(parse_datafile).collect()
    }

    fn check_ids(&self, entity: &str, ids: &[i64]) -> Result<(), DatastoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let query = format!("SELECT e FROM {entity} e WHERE e.id IN ({})", id_list(ids));
        let found: HashSet<i64> = self
            .search(&query)?
            .iter()
            .map(entity_id)
            .collect::<Result<_, _>>()?;
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !found.contains(id))
            .map(i64::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(DatastoreError::CatalogueNotFound(format!(
                "{entity} ids {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

impl CatalogueClient for IcatHttpClient {
    fn create_investigation(
        &self,
        investigation: &Investigation,
    ) -> Result<Vec<CatalogueDataset>, DatastoreError> {
        let investigation_id = match self.find_investigation(investigation)? {
            Some(id) => {
                debug!(id, "reusing existing investigation");
                id
            }
            None => self.new_investigation(investigation)?,
        };

        let state_type = self.parameter_type_id(&self.settings.parameter_type_job_state)?;
        let ids_type = self.parameter_type_id(&self.settings.parameter_type_job_ids)?;

        let mut created = Vec::with_capacity(investigation.datasets.len());
        for dataset in &investigation.datasets {
            let dataset_type = self.named_id("DatasetType", &dataset.dataset_type)?;
            let datafiles: Vec<Value> = dataset
                .datafiles
                .iter()
                .map(|datafile| {
                    let mut fields = Map::new();
                    fields.insert("name".to_string(), json!(datafile.name));
                    fields.insert("location".to_string(), json!(datafile.location));
                    insert_opt(&mut fields, "fileSize", datafile.size.as_ref());
                    insert_opt(&mut fields, "checksum", datafile.checksum.as_ref());
                    insert_opt(&mut fields, "description", datafile.description.as_ref());
                    insert_opt(
                        &mut fields,
                        "datafileCreateTime",
                        datafile.create_time.map(format_date).as_ref(),
                    );
                    insert_opt(
                        &mut fields,
                        "datafileModTime",
                        datafile.modification_time.map(format_date).as_ref(),
                    );
                    fields.insert(
                        "parameters".to_string(),
                        json!([{"type": {"id": state_type}, "stringValue": INITIAL_STATE}]),
                    );
                    Value::Object(fields)
                })
                .collect();

            let mut fields = Map::new();
            fields.insert("name".to_string(), json!(dataset.name));
            insert_opt(&mut fields, "description", dataset.description.as_ref());
            insert_opt(&mut fields, "doi", dataset.doi.as_ref());
            insert_opt(
                &mut fields,
                "startDate",
                dataset.start_date.map(format_date).as_ref(),
            );
            insert_opt(
                &mut fields,
                "endDate",
                dataset.end_date.map(format_date).as_ref(),
            );
            fields.insert("investigation".to_string(), json!({"id": investigation_id}));
            fields.insert("type".to_string(), json!({"id": dataset_type}));
            fields.insert("datafiles".to_string(), Value::Array(datafiles));
            fields.insert(
                "parameters".to_string(),
                json!([
                    {"type": {"id": state_type}, "stringValue": INITIAL_STATE},
                    {"type": {"id": ids_type}, "stringValue": ""},
                ]),
            );

            let ids = self.write(&[json!({"Dataset": Value::Object(fields)})])?;
            let dataset_id = ids.first().copied().ok_or_else(|| DatastoreError::CatalogueStatus {
                status: 200,
                message: format!("no id returned for dataset {}", dataset.name),
            })?;

            let mut by_location: HashMap<String, CatalogueDatafile> = self
                .datafiles_where(&format!("df.dataset.id = {dataset_id}"))?
                .into_iter()
                .map(|datafile| (datafile.location.clone(), datafile))
                .collect();
            let datafiles = dataset
                .datafiles
                .iter()
                .map(|datafile| {
                    by_location.remove(&datafile.location).ok_or_else(|| {
                        DatastoreError::CatalogueNotFound(format!(
                            "datafile {} of dataset {dataset_id}",
                            datafile.location
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            info!(name = %dataset.name, id = dataset_id, files = datafiles.len(), "created dataset");
            created.push(CatalogueDataset {
                id: dataset_id,
                name: dataset.name.clone(),
                datafiles,
            });
        }
        Ok(created)
    }

    fn resolve_datafiles(
        &self,
        request: &RestoreRequest,
    ) -> Result<Vec<CatalogueDatafile>, DatastoreError> {
        let investigations: Vec<i64> = request.investigation_ids.iter().copied().collect();
        let datasets: Vec<i64> = request.dataset_ids.iter().copied().collect();
        let datafiles: Vec<i64> = request.datafile_ids.iter().copied().collect();

        self.check_ids("Investigation", &investigations)?;
        self.check_ids("Dataset", &datasets)?;
        self.check_ids("Datafile", &datafiles)?;

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        let conditions = [
            (&investigations, "df.dataset.investigation.id"),
            (&datasets, "df.dataset.id"),
            (&datafiles, "df.id"),
        ];
        for (ids, field) in conditions {
            if ids.is_empty() {
                continue;
            }
            for datafile in self.datafiles_where(&format!("{field} IN ({})", id_list(ids)))? {
                if seen.insert(datafile.id) {
                    resolved.push(datafile);
                }
            }
        }
        Ok(resolved)
    }

    fn set_datafile_state(
        &self,
        datafile_id: i64,
        parameter: StateParameter,
        state: FileState,
    ) -> Result<(), DatastoreError> {
        self.upsert_parameter(
            ParameterOwner::Datafile,
            datafile_id,
            self.parameter_type_name(parameter),
            state.as_str(),
        )
    }

    fn set_dataset_state(
        &self,
        dataset_id: i64,
        parameter: StateParameter,
        state: DatasetState,
    ) -> Result<(), DatastoreError> {
        self.upsert_parameter(
            ParameterOwner::Dataset,
            dataset_id,
            self.parameter_type_name(parameter),
            state.as_str(),
        )
    }

    fn record_job_ids(&self, dataset_id: i64, job_ids: &[JobId]) -> Result<(), DatastoreError> {
        let joined = job_ids
            .iter()
            .map(JobId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.upsert_parameter(
            ParameterOwner::Dataset,
            dataset_id,
            &self.settings.parameter_type_job_ids,
            &joined,
        )
    }

    fn get_entity(&self, entity: &str, id: i64) -> Result<Value, DatastoreError> {
        if entity.is_empty() || !entity.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DatastoreError::InvalidRequest(format!(
                "invalid entity name: {entity}"
            )));
        }
        self.search_single(entity, &format!("SELECT e FROM {entity} e WHERE e.id = {id}"))
    }
}

#[derive(Debug, Clone, Copy)]
enum ParameterOwner {
    Dataset,
    Datafile,
}

impl ParameterOwner {
    fn names(self) -> (&'static str, &'static str) {
        match self {
            ParameterOwner::Dataset => ("DatasetParameter", "dataset"),
            ParameterOwner::Datafile => ("DatafileParameter", "datafile"),
        }
    }
}

/// Release date for a new investigation: the explicit one if given, otherwise the end (or
/// start, or current) date moved forward by the embargo period. Embargoed investigation types
/// get none.
pub fn release_date(
    investigation: &Investigation,
    embargo_period_years: i32,
    embargo_types: &[String],
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if embargo_types
        .iter()
        .any(|kind| kind == &investigation.investigation_type)
    {
        return None;
    }
    if investigation.release_date.is_some() {
        return investigation.release_date;
    }

    let base = investigation
        .end_date
        .or(investigation.start_date)
        .unwrap_or(now)
        .date_naive();
    let year = base.year() + embargo_period_years;
    NaiveDate::from_ymd_opt(year, base.month(), base.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, base.month(), base.day() - 1))
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| date.and_utc())
}

fn format_date(date: DateTime<Utc>) -> String {
    date.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string()
}

fn insert_opt<T: serde::Serialize>(fields: &mut Map<String, Value>, key: &str, value: Option<&T>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), json!(value));
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn id_list(ids: &[i64]) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ")
}

/// Search results wrap each entity in an object keyed by its type.
fn unwrap_entity(item: Value) -> Value {
    match item {
        Value::Object(map) if map.len() == 1 => {
            map.into_iter().next().map(|(_, inner)| inner).unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn entity_id(entity: &Value) -> Result<i64, DatastoreError> {
    entity
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| DatastoreError::CatalogueStatus {
            status: 200,
            message: format!("entity without id: {entity}"),
        })
}

fn parse_datafile(entity: &Value) -> Result<CatalogueDatafile, DatastoreError> {
    let id = entity_id(entity)?;
    let dataset_id = entity
        .get("dataset")
        .map(entity_id)
        .transpose()?
        .ok_or_else(|| DatastoreError::CatalogueStatus {
            status: 200,
            message: format!("datafile {id} returned without its dataset"),
        })?;
    let location = entity
        .get("location")
        .and_then(Value::as_str)
        .ok_or_else(|| DatastoreError::CatalogueStatus {
            status: 200,
            message: format!("datafile {id} has no location"),
        })?;
    Ok(CatalogueDatafile {
        id,
        dataset_id,
        location: location.to_string(),
        checksum: entity
            .get("checksum")
            .and_then(Value::as_str)
            .map(str::to_string),
        size: entity.get("fileSize").and_then(Value::as_u64),
    })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn investigation() -> Investigation {
        Investigation {
            name: "RB1234".to_string(),
            visit_id: "1".to_string(),
            title: "Title".to_string(),
            investigation_type: "experiment".to_string(),
            instrument: "INSTR".to_string(),
            facility_cycle: "20201".to_string(),
            summary: None,
            doi: None,
            start_date: Some(Utc.with_ymd_and_hms(2020, 3, 1, 9, 0, 0).unwrap()),
            end_date: Some(Utc.with_ymd_and_hms(2020, 3, 4, 18, 0, 0).unwrap()),
            release_date: None,
            datasets: Vec::new(),
        }
    }

    #[test]
    fn release_date_defaults_to_end_plus_embargo() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let release = release_date(&investigation(), 2, &[], now).unwrap();
        assert_eq!(release, Utc.with_ymd_and_hms(2022, 3, 4, 0, 0, 0).unwrap());
    }

    #[test]
    fn embargoed_types_get_no_release_date() {
        let now = Utc::now();
        let mut investigation = investigation();
        investigation.release_date = Some(now);
        let embargo = vec!["experiment".to_string()];
        assert_eq!(release_date(&investigation, 2, &embargo, now), None);
    }

    #[test]
    fn leap_day_falls_back_a_day() {
        let mut investigation = investigation();
        investigation.end_date = Some(Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());
        let release = release_date(&investigation, 1, &[], Utc::now()).unwrap();
        assert_eq!(release, Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap());
    }

    #[test]
    fn icat_error_codes_map_to_variants() {
        let conflict = IcatFailure::parse(r#"{"code":"OBJECT_ALREADY_EXISTS","message":"dup"}"#);
        assert!(matches!(
            conflict.into_error(400),
            DatastoreError::CatalogueConflict(message) if message == "dup"
        ));
        let plain = IcatFailure::parse("gateway down");
        assert!(matches!(
            plain.into_error(502),
            DatastoreError::CatalogueStatus { status: 502, .. }
        ));
    }
}
