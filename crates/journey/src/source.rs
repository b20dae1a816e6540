//! Data retrieval for steps.
//!
//! A [`Source`] turns backend specific data into JSON records for one
//! journey. Empty results are never returned: they surface as
//! [`StepError::DataNotAvailable`] so the step is parked as WAITING.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{named_params, Connection};
use serde_json::{json, Value};
use tracing::{debug, warn};
use waypoint_core::codec::decode_datetime;
use waypoint_store::sqlite::is_missing_table;
use waypoint_store::StoreError;

use crate::cache::RowCache;
use crate::driver::Driver;
use crate::error::{EngineError, StepError};
use crate::process::Process;
use crate::types::{compare_values, display_value, is_empty_data, Record};

#[derive(Debug, Clone)]
pub struct Source {
    pub title: String,
    pub kind: SourceKind,
    /// Applied in order to each retrieved record.
    pub processes: Vec<Process>,
}

#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Returned as is for every journey, without the emptiness check.
    Constant(Value),
    /// Data keyed by journey reference.
    Static(HashMap<String, Value>),
    /// Merge of named sub-sources; unavailable if any part is.
    Collated(Vec<(String, Source)>),
    Broker { data_type: String },
    Database(DbSource),
    TimeBased(TimeBasedSource),
    /// `{output_field: state}` for the latest state of `label` at the clock time.
    State { label: String, output_field: String },
    /// `{output_field: value}` from a previously recorded step.
    StepResult { step_name: String, output_field: String },
    Table(TableSource),
}

impl Source {
    pub fn new(title: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            title: title.into(),
            kind,
            processes: Vec::new(),
        }
    }

    pub fn constant(title: impl Into<String>, data: Value) -> Self {
        Self::new(title, SourceKind::Constant(data))
    }

    pub fn static_data(title: impl Into<String>, data: HashMap<String, Value>) -> Self {
        Self::new(title, SourceKind::Static(data))
    }

    pub fn collated(title: impl Into<String>, sources: Vec<(String, Source)>) -> Self {
        Self::new(title, SourceKind::Collated(sources))
    }

    pub fn broker(title: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self::new(
            title,
            SourceKind::Broker {
                data_type: data_type.into(),
            },
        )
    }

    pub fn with_process(mut self, process: Process) -> Self {
        self.processes.push(process);
        self
    }

    pub fn retrieve(&self, driver: &Driver, step: &str) -> Result<Value, StepError> {
        if let SourceKind::Constant(data) = &self.kind {
            return Ok(data.clone());
        }

        let data = self.retrieve_final_data(driver, step)?;
        if is_empty_data(&data) {
            debug!(journey = %driver.reference(), step = %step, source = %self.title, "Source returned no data");
            return Err(StepError::not_available(step));
        }
        Ok(data)
    }

    fn retrieve_final_data(&self, driver: &Driver, step: &str) -> Result<Value, StepError> {
        let reference = driver.reference();
        match &self.kind {
            SourceKind::Constant(data) => Ok(data.clone()),
            SourceKind::Static(data) => {
                let raw = data
                    .get(reference)
                    .cloned()
                    .ok_or_else(|| StepError::not_available(step))?;
                self.process(raw, step)
            }
            SourceKind::Collated(sources) => {
                let mut merged = Record::new();
                for (name, source) in sources {
                    let data = match source.retrieve(driver, step) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(
                                journey = %reference,
                                step = %step,
                                source = %name,
                                "Data from sub-source '{}' not found",
                                source.title
                            );
                            return Err(e);
                        }
                    };
                    match data {
                        Value::Object(map) => merged.extend(map),
                        other => {
                            merged.insert("data".into(), other);
                        }
                    }
                }
                self.process(Value::Object(merged), step)
            }
            SourceKind::Broker { data_type } => {
                let raw = driver
                    .get_broker_data(data_type)?
                    .filter(|data| !is_empty_data(data))
                    .ok_or_else(|| StepError::not_available(step))?;
                self.process(raw, step)
            }
            SourceKind::Database(db) => db.retrieve(driver, |raw| self.process(raw, step)),
            SourceKind::TimeBased(source) => {
                let rows = source
                    .db
                    .retrieve(driver, |raw| self.process(raw, step))?;
                let rows = match rows {
                    Value::Array(rows) => rows,
                    other => vec![other],
                };
                Ok(source.select(&rows, driver.timestamp()).unwrap_or(Value::Null))
            }
            SourceKind::State {
                label,
                output_field,
            } => Ok(match driver.current_state(label)? {
                Some(state) => json!({ output_field.as_str(): state.state }),
                None => Value::Null,
            }),
            SourceKind::StepResult {
                step_name,
                output_field,
            } => Ok(match driver.get_specific_step(step_name)? {
                Some(record) => json!({ output_field.as_str(): record.value }),
                None => Value::Null,
            }),
            SourceKind::Table(table) => {
                let raw = table
                    .lookup(reference)
                    .ok_or_else(|| StepError::not_available(step))?;
                self.process(Value::Object(raw), step)
            }
        }
    }

    /// Run the processes over each record; null and scalars pass through.
    fn process(&self, raw: Value, step: &str) -> Result<Value, StepError> {
        match raw {
            Value::Object(record) => self.process_record(record, step).map(Value::Object),
            Value::Array(rows) => rows
                .into_iter()
                .map(|row| match row {
                    Value::Object(record) => self.process_record(record, step).map(Value::Object),
                    other => Ok(other),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other),
        }
    }

    fn process_record(&self, mut record: Record, step: &str) -> Result<Record, StepError> {
        for process in &self.processes {
            record = process
                .apply(record)
                .map_err(|e| StepError::invalid(step, e))?;
        }
        Ok(record)
    }
}

/// Rows from a SQLite table or query matched on the journey reference.
#[derive(Clone)]
pub struct DbSource {
    connection: Arc<Mutex<Connection>>,
    sql: String,
    reference_field: String,
    multiple_rows: bool,
    cache: Arc<RowCache>,
}

impl std::fmt::Debug for DbSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSource")
            .field("sql", &self.sql)
            .field("reference_field", &self.reference_field)
            .field("multiple_rows", &self.multiple_rows)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl DbSource {
    pub fn connect(path: impl AsRef<Path>) -> Result<Arc<Mutex<Connection>>, StoreError> {
        Ok(Arc::new(Mutex::new(Connection::open(path)?)))
    }

    /// Rows of `table` whose `reference_field` equals the journey reference.
    pub fn table(connection: Arc<Mutex<Connection>>, table: &str, reference_field: &str) -> Self {
        let sql = format!(
            "SELECT * FROM \"{table}\" WHERE \"{reference_field}\" = :reference ORDER BY rowid"
        );
        Self::sql(connection, sql, reference_field)
    }

    /// Arbitrary query binding the journey reference as `:reference`.
    pub fn sql(
        connection: Arc<Mutex<Connection>>,
        sql: impl Into<String>,
        reference_field: &str,
    ) -> Self {
        Self {
            connection,
            sql: sql.into(),
            reference_field: reference_field.to_string(),
            multiple_rows: false,
            cache: Arc::new(RowCache::default()),
        }
    }

    pub fn with_multiple_rows(mut self) -> Self {
        self.multiple_rows = true;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Arc::new(RowCache::new(ttl, 10_000));
        self
    }

    pub fn reference_field(&self) -> &str {
        &self.reference_field
    }

    /// Query rows for `reference`. A missing table is no data.
    pub fn fetch(&self, reference: &str) -> Result<Vec<Record>, StoreError> {
        let conn = self.connection.lock();
        let mut stmt = match conn.prepare(&self.sql) {
            Ok(stmt) => stmt,
            Err(e) if is_missing_table(&e) => {
                debug!(error = %e, "Source table missing, treating as no data");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(named_params! {":reference": reference})?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (idx, column) in columns.iter().enumerate() {
                record.insert(column.clone(), column_value(row.get_ref(idx)?));
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Rows are cached per reference for the driver's current run only.
    fn retrieve(
        &self,
        driver: &Driver,
        process: impl Fn(Value) -> Result<Value, StepError>,
    ) -> Result<Value, StepError> {
        let reference = driver.reference();
        if let Some(hit) = self.cache.get(reference, driver.run_id()) {
            return Ok(hit);
        }

        let mut rows = self
            .fetch(reference)
            .map_err(|e| StepError::Engine(EngineError::Store(e)))?;
        let raw = if self.multiple_rows {
            Value::Array(rows.into_iter().map(Value::Object).collect())
        } else if rows.is_empty() {
            Value::Null
        } else {
            Value::Object(rows.swap_remove(0))
        };

        let data = process(raw)?;
        if !is_empty_data(&data) {
            self.cache.put(reference.to_string(), driver.run_id(), data.clone());
        }
        Ok(data)
    }
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}

/// Database rows narrowed to the one current at the clock's time.
#[derive(Debug, Clone)]
pub struct TimeBasedSource {
    pub db: DbSource,
    pub timestamp_field: String,
    pub sort_field: Option<String>,
    pub reverse_sort: bool,
}

impl TimeBasedSource {
    pub fn new(db: DbSource, timestamp_field: impl Into<String>) -> Self {
        Self {
            db: db.with_multiple_rows(),
            timestamp_field: timestamp_field.into(),
            sort_field: None,
            reverse_sort: false,
        }
    }

    pub fn with_sort_field(mut self, sort_field: impl Into<String>, reverse: bool) -> Self {
        self.sort_field = Some(sort_field.into());
        self.reverse_sort = reverse;
        self
    }

    pub fn select(&self, rows: &[Value], now: DateTime<Utc>) -> Option<Value> {
        select_current(
            rows,
            now,
            &self.timestamp_field,
            self.sort_field.as_deref(),
            self.reverse_sort,
        )
    }
}

/// Most recent row at or before `now`. When `sort_field` is set and rows
/// exist within the last hour, the first of those ordered by `sort_field`
/// (descending if `reverse`) wins instead.
pub fn select_current(
    rows: &[Value],
    now: DateTime<Utc>,
    timestamp_field: &str,
    sort_field: Option<&str>,
    reverse: bool,
) -> Option<Value> {
    let mut dated: Vec<(DateTime<Utc>, &Value)> = rows
        .iter()
        .filter_map(|row| {
            let ts = row.get(timestamp_field).and_then(decode_datetime)?;
            (ts <= now).then_some((ts, row))
        })
        .collect();
    dated.sort_by(|a, b| b.0.cmp(&a.0));

    if let Some(sort_field) = sort_field {
        let window_start = now - TimeDelta::hours(1);
        let mut recent: Vec<&Value> = dated
            .iter()
            .filter(|(ts, _)| *ts >= window_start)
            .map(|(_, row)| *row)
            .collect();
        if !recent.is_empty() {
            recent.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(sort_field).unwrap_or(&Value::Null),
                    b.get(sort_field).unwrap_or(&Value::Null),
                )
                .unwrap_or(std::cmp::Ordering::Equal);
                if reverse {
                    ord.reverse()
                } else {
                    ord
                }
            });
            return recent.first().map(|row| (*row).clone());
        }
    }

    dated.first().map(|(_, row)| (*row).clone())
}

/// In-memory rows looked up by reference.
#[derive(Debug, Clone)]
pub struct TableSource {
    rows: Vec<Record>,
    reference_field: String,
}

impl TableSource {
    /// With `timestamp_field` set rows are ordered newest first, so a lookup
    /// returns the latest row for the reference.
    pub fn new(
        mut rows: Vec<Record>,
        reference_field: impl Into<String>,
        timestamp_field: Option<&str>,
    ) -> Self {
        if let Some(field) = timestamp_field {
            rows.sort_by(|a, b| {
                let ts = |r: &Record| r.get(field).and_then(decode_datetime);
                ts(b).cmp(&ts(a))
            });
        }
        Self {
            rows,
            reference_field: reference_field.into(),
        }
    }

    pub fn lookup(&self, reference: &str) -> Option<Record> {
        self.rows
            .iter()
            .find(|row| {
                row.get(&self.reference_field)
                    .map(|v| display_value(v) == reference)
                    .unwrap_or(false)
            })
            .cloned()
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn reference_field(&self) -> &str {
        &self.reference_field
    }
}
