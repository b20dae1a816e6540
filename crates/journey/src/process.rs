//! Post-retrieval transforms applied record by record.

use std::fmt;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use thiserror::Error;
use waypoint_core::codec::{decode_date, decode_datetime, encode_datetime};

use crate::types::{display_value, is_empty_value, Record};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error("field '{0}' is not present in the input data")]
    MissingField(String),
}

pub type RecordFn = Arc<dyn Fn(Record) -> Record + Send + Sync>;

#[derive(Clone)]
pub enum Process {
    ExcludeFields(Vec<String>),
    RenameField {
        from_field: String,
        to_field: String,
    },
    /// Replace `field` with `mappings[value]`, or null when unmapped.
    MapValues {
        field: String,
        mappings: Record,
    },
    /// Unparseable or missing values become null.
    ConvertToFloat(Vec<String>),
    /// As [`Process::ConvertToFloat`] then rounded.
    ConvertToInt(Vec<String>),
    /// Fill empty fields. With `present_flag_field` set, the flag records
    /// whether any of the fields already had a value.
    DefaultValues {
        values: Record,
        present_flag_field: Option<String>,
    },
    /// Parse text with a `strftime` format into a tagged datetime.
    ParseDateTime {
        field: String,
        format: String,
    },
    /// Whole years between two date fields.
    Age {
        from_field: String,
        to_field: String,
        target_field: String,
    },
    Custom(RecordFn),
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Process::ExcludeFields(fields) => f.debug_tuple("ExcludeFields").field(fields).finish(),
            Process::RenameField { from_field, to_field } => f
                .debug_struct("RenameField")
                .field("from_field", from_field)
                .field("to_field", to_field)
                .finish(),
            Process::MapValues { field, .. } => {
                f.debug_struct("MapValues").field("field", field).finish()
            }
            Process::ConvertToFloat(fields) => {
                f.debug_tuple("ConvertToFloat").field(fields).finish()
            }
            Process::ConvertToInt(fields) => f.debug_tuple("ConvertToInt").field(fields).finish(),
            Process::DefaultValues {
                present_flag_field, ..
            } => f
                .debug_struct("DefaultValues")
                .field("present_flag_field", present_flag_field)
                .finish(),
            Process::ParseDateTime { field, format } => f
                .debug_struct("ParseDateTime")
                .field("field", field)
                .field("format", format)
                .finish(),
            Process::Age { target_field, .. } => {
                f.debug_struct("Age").field("target_field", target_field).finish()
            }
            Process::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Process {
    pub fn custom(f: impl Fn(Record) -> Record + Send + Sync + 'static) -> Self {
        Process::Custom(Arc::new(f))
    }

    pub fn apply(&self, mut record: Record) -> Result<Record, ProcessError> {
        match self {
            Process::ExcludeFields(fields) => {
                for field in fields {
                    record.remove(field);
                }
            }
            Process::RenameField { from_field, to_field } => {
                if let Some(value) = record.remove(from_field) {
                    record.insert(to_field.clone(), value);
                }
            }
            Process::MapValues { field, mappings } => {
                let mapped = record
                    .get(field)
                    .and_then(|value| mappings.get(&display_value(value)))
                    .cloned()
                    .unwrap_or(Value::Null);
                record.insert(field.clone(), mapped);
            }
            Process::ConvertToFloat(fields) => {
                for field in fields {
                    let value = record.get(field).and_then(to_float).map_or(Value::Null, |v| json!(v));
                    record.insert(field.clone(), value);
                }
            }
            Process::ConvertToInt(fields) => {
                for field in fields {
                    let value = record
                        .get(field)
                        .and_then(to_float)
                        .filter(|v| v.is_finite())
                        .map_or(Value::Null, |v| json!(v.round() as i64));
                    record.insert(field.clone(), value);
                }
            }
            Process::DefaultValues {
                values,
                present_flag_field,
            } => {
                let mut present = false;
                for (field, default) in values {
                    if is_empty_value(record.get(field)) {
                        record.insert(field.clone(), default.clone());
                    } else {
                        present = true;
                    }
                }
                if let Some(flag) = present_flag_field {
                    let flag_value = if present { 1 } else { 0 };
                    record.insert(flag.clone(), json!(flag_value));
                }
            }
            Process::ParseDateTime { field, format } => {
                let value = record
                    .get(field)
                    .ok_or_else(|| ProcessError::MissingField(field.clone()))?;
                let parsed = match value {
                    Value::String(text) => NaiveDateTime::parse_from_str(text, format)
                        .ok()
                        .map(|dt| encode_datetime(&dt.and_utc())),
                    other => decode_datetime(other).map(|dt| encode_datetime(&dt)),
                };
                record.insert(field.clone(), parsed.unwrap_or(Value::Null));
            }
            Process::Age {
                from_field,
                to_field,
                target_field,
            } => {
                let from = record.get(from_field).and_then(decode_date);
                let to = record.get(to_field).and_then(decode_date);
                let age = match (from, to) {
                    (Some(from), Some(to)) => json!(whole_years(from, to)),
                    _ => Value::Null,
                };
                record.insert(target_field.clone(), age);
            }
            Process::Custom(f) => record = f(record),
        }
        Ok(record)
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Years completed between `from` and `to`. A 29 February start counts its
/// anniversary as 1 March in non-leap years.
pub fn whole_years(from: NaiveDate, to: NaiveDate) -> i32 {
    let years = to.year() - from.year();
    let anniversary = NaiveDate::from_ymd_opt(to.year(), from.month(), from.day())
        .or_else(|| NaiveDate::from_ymd_opt(to.year(), 3, 1));
    match anniversary {
        Some(anniversary) if anniversary > to => years - 1,
        _ => years,
    }
}
