//! JSON codec shared by every store column and broker channel.
//!
//! Plain JSON already round-trips integers, floats (shortest exact
//! representation) and arrays. Temporal values are carried as tagged objects
//! so they come back as the same type they went in as:
//!
//! ```json
//! {"__datetime__": true, "as_str": "2024-03-01T08:00:00Z"}
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::types::BrokerMessage;

const DATETIME_TAG: &str = "__datetime__";
const DATE_TAG: &str = "__date__";
const TIME_TAG: &str = "__time__";
const AS_STR: &str = "as_str";

/// Stateless encoder/decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> CoreResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    pub fn decode<T: DeserializeOwned>(text: &str) -> CoreResult<T> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn decode_slice<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode_message(message: &BrokerMessage) -> CoreResult<String> {
        Self::encode(message)
    }

    pub fn decode_message(bytes: &[u8]) -> CoreResult<BrokerMessage> {
        let message: BrokerMessage = Self::decode_slice(bytes)?;
        if message.reference.is_empty() {
            return Err(CoreError::Codec("broker message without reference".into()));
        }
        Ok(message)
    }
}

pub fn encode_datetime(ts: &DateTime<Utc>) -> Value {
    json!({ DATETIME_TAG: true, AS_STR: ts.to_rfc3339_opts(SecondsFormat::AutoSi, true) })
}

pub fn encode_date(date: &NaiveDate) -> Value {
    json!({ DATE_TAG: true, AS_STR: date.format("%Y-%m-%d").to_string() })
}

pub fn encode_time(time: &NaiveTime) -> Value {
    json!({ TIME_TAG: true, AS_STR: time.format("%H:%M:%S%.f").to_string() })
}

fn tagged<'a>(value: &'a Value, tag: &str) -> Option<&'a str> {
    let map = value.as_object()?;
    if map.get(tag).and_then(Value::as_bool) != Some(true) {
        return None;
    }
    map.get(AS_STR).and_then(Value::as_str)
}

/// Read a timestamp from a tagged datetime, a date/time string or epoch seconds.
pub fn decode_datetime(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(text) = tagged(value, DATETIME_TAG) {
        return parse_timestamp(text);
    }
    if let Some(text) = tagged(value, DATE_TAG) {
        return parse_timestamp(text);
    }
    match value {
        Value::String(text) => parse_timestamp(text),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

pub fn decode_date(value: &Value) -> Option<NaiveDate> {
    if let Some(text) = tagged(value, DATE_TAG) {
        return NaiveDate::parse_from_str(text, "%Y-%m-%d").ok();
    }
    decode_datetime(value).map(|ts| ts.date_naive())
}

pub fn decode_time(value: &Value) -> Option<NaiveTime> {
    let text = tagged(value, TIME_TAG).or_else(|| value.as_str())?;
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .ok()
}

/// Parse RFC 3339, naive `YYYY-MM-DD HH:MM:SS[.f]` (taken as UTC) or a bare date.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Fixed-width UTC text that sorts chronologically as a plain string.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
