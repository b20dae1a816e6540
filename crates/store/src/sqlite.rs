//! Embedded SQLite backends.
//!
//! Tables:
//! - `journey(id, reference, source, label, complete, timestamp)`
//! - `step(id, journey, name, status, status_info, reason, value, result, outcome, next_step, timestamp)`
//! - `state(id, journey, label, state, reason, from_step, timestamp)`
//! - `data_store(id, ref, data_type, data, external, timestamp)` for the broker
//!
//! JSON columns hold codec text; timestamps are fixed-width RFC 3339 so they
//! compare correctly as strings. A read against a missing table is "no data".

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info};
use waypoint_core::codec::{format_timestamp, parse_timestamp};
use waypoint_core::{
    BrokerMessage, Channel, Journey, JsonCodec, StateRecord, StateUpdate, StepRecord, StepStatus,
    StepUpdate, StepWrite,
};

use crate::broker::Broker;
use crate::client::Client;
use crate::error::{StoreError, StoreResult};

const CLIENT_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS journey (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference TEXT NOT NULL,
    source TEXT NOT NULL,
    label TEXT NULL,
    complete INTEGER NOT NULL DEFAULT 0,
    timestamp DATETIME NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS journey_reference_uidx ON journey (reference, source);
CREATE TABLE IF NOT EXISTS step (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    journey INTEGER NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    status_info TEXT NULL,
    reason TEXT NULL,
    value TEXT NULL,
    result TEXT NULL,
    outcome TEXT NULL,
    next_step TEXT NULL,
    timestamp DATETIME NULL
);
CREATE INDEX IF NOT EXISTS step_journey_idx ON step (journey);
CREATE TABLE IF NOT EXISTS state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    journey INTEGER NOT NULL,
    label TEXT NOT NULL,
    state TEXT NOT NULL,
    reason TEXT NULL,
    from_step TEXT NULL,
    timestamp DATETIME NULL
);
CREATE INDEX IF NOT EXISTS state_journey_idx ON state (journey);
";

const BROKER_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS data_store (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ref TEXT NOT NULL,
    data_type TEXT NOT NULL,
    data TEXT NULL,
    external INTEGER NOT NULL DEFAULT 0,
    timestamp DATETIME NULL,
    UNIQUE (ref, data_type)
);
";

const JOURNEY_COLUMNS: &str = "id, reference, source, label, complete";
const STEP_COLUMNS: &str =
    "id, journey, name, status, status_info, reason, value, result, outcome, next_step, timestamp";
const STATE_COLUMNS: &str = "id, journey, label, state, reason, from_step, timestamp";

fn open_connection(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// SQLite reports querying an absent table as a generic failure.
pub fn is_missing_table(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.starts_with("no such table"))
}

fn or_empty<T: Default>(result: rusqlite::Result<T>) -> StoreResult<T> {
    match result {
        Err(e) if is_missing_table(&e) => {
            debug!(error = %e, "Table missing, treating as no data");
            Ok(T::default())
        }
        other => Ok(other?),
    }
}

fn collect_rows<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    f: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, f)?;
    rows.collect()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    Ok(text.as_deref().and_then(parse_timestamp))
}

fn json_text(value: &Option<Value>) -> StoreResult<Option<String>> {
    Ok(value.as_ref().map(JsonCodec::encode).transpose()?)
}

fn journey_from_row(row: &Row<'_>) -> rusqlite::Result<Journey> {
    Ok(Journey {
        id: row.get(0)?,
        reference: row.get(1)?,
        source: row.get(2)?,
        label: row.get(3)?,
        complete: row.get(4)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepRecord> {
    let status: String = row.get(3)?;
    Ok(StepRecord {
        id: row.get(0)?,
        journey_id: row.get(1)?,
        name: row.get(2)?,
        status: status
            .parse::<StepStatus>()
            .map_err(|e| conversion_error(3, e))?,
        status_info: row.get(4)?,
        reason: row.get(5)?,
        value: json_column(row, 6)?,
        result: json_column(row, 7)?,
        outcome: json_column(row, 8)?,
        next_step: row.get(9)?,
        timestamp: timestamp_column(row, 10)?,
    })
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<StateRecord> {
    Ok(StateRecord {
        id: row.get(0)?,
        journey_id: row.get(1)?,
        label: row.get(2)?,
        state: row.get(3)?,
        reason: row.get(4)?,
        from_step: row.get(5)?,
        timestamp: timestamp_column(row, 6)?,
    })
}

/// Insert a journey, or fold it into the stored row for the same
/// `(reference, source)`. Returns the stored id.
fn insert_journey(conn: &Connection, journey: &Journey) -> StoreResult<i64> {
    let id = conn.query_row(
        "INSERT INTO journey (reference, source, label, complete, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (reference, source) DO UPDATE SET
             label = COALESCE(journey.label, excluded.label),
             complete = MAX(journey.complete, excluded.complete)
         RETURNING id",
        params![
            journey.reference,
            journey.source,
            journey.label,
            journey.complete,
            format_timestamp(&Utc::now())
        ],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn insert_step(conn: &Connection, step: &StepRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO step (journey, name, status, status_info, reason, value, result, outcome, next_step, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            step.journey_id,
            step.name,
            step.status.as_str(),
            step.status_info,
            step.reason,
            json_text(&step.value)?,
            json_text(&step.result)?,
            json_text(&step.outcome)?,
            step.next_step,
            step.timestamp.as_ref().map(format_timestamp),
        ],
    )?;
    Ok(())
}

fn update_step(conn: &Connection, id: i64, update: &StepUpdate) -> StoreResult<()> {
    conn.execute(
        "UPDATE step SET status = ?1, status_info = ?2, reason = ?3, value = ?4, result = ?5,
             outcome = ?6, next_step = ?7, timestamp = ?8
         WHERE id = ?9",
        params![
            update.status.as_str(),
            update.status_info,
            update.reason,
            json_text(&update.value)?,
            json_text(&update.result)?,
            json_text(&update.outcome)?,
            update.next_step,
            update.timestamp.as_ref().map(format_timestamp),
            id,
        ],
    )?;
    Ok(())
}

fn insert_state(conn: &Connection, state: &StateRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO state (journey, label, state, reason, from_step, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            state.journey_id,
            state.label,
            state.state,
            state.reason,
            state.from_step,
            state.timestamp.as_ref().map(format_timestamp),
        ],
    )?;
    Ok(())
}

/// Journey store on a single SQLite connection.
pub struct SqliteClient {
    conn: Mutex<Connection>,
}

impl SqliteClient {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening SQLite journey store");
        Self::from_connection(open_connection(path)?)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(CLIENT_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert buffered journeys with their steps and states in one
    /// transaction. Child rows reference journeys by the ids they were
    /// buffered under; the returned map takes those ids to stored ones.
    pub(crate) fn insert_batch(
        &self,
        journeys: &[Journey],
        steps: &[StepRecord],
        states: &[StateRecord],
    ) -> StoreResult<HashMap<i64, i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut ids = HashMap::with_capacity(journeys.len());
        for journey in journeys {
            ids.insert(journey.id, insert_journey(&tx, journey)?);
        }

        let stored = |buffered: i64| ids.get(&buffered).copied().ok_or(StoreError::JourneyNotFound(buffered));
        for step in steps {
            let mut step = step.clone();
            step.journey_id = stored(step.journey_id)?;
            insert_step(&tx, &step)?;
        }
        for state in states {
            let mut state = state.clone();
            state.journey_id = stored(state.journey_id)?;
            insert_state(&tx, &state)?;
        }

        tx.commit()?;
        Ok(ids)
    }

    fn query_steps(&self, sql: &str, journey_id: i64) -> StoreResult<Vec<StepRecord>> {
        or_empty(collect_rows(&self.conn.lock(), sql, params![journey_id], step_from_row))
    }
}

impl Client for SqliteClient {
    fn create_journey(
        &self,
        reference: &str,
        source: &str,
        label: Option<&str>,
    ) -> StoreResult<Journey> {
        let conn = self.conn.lock();
        let created = conn.execute(
            "INSERT INTO journey (reference, source, label, complete, timestamp)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT (reference, source) DO NOTHING",
            params![reference, source, label, format_timestamp(&Utc::now())],
        )?;
        let journey = conn.query_row(
            &format!("SELECT {JOURNEY_COLUMNS} FROM journey WHERE reference = ?1 AND source = ?2"),
            params![reference, source],
            journey_from_row,
        )?;
        if created > 0 {
            debug!(journey_id = journey.id, reference = %reference, "Created journey");
        }
        Ok(journey)
    }

    fn get_journey(&self, reference: &str, source: &str) -> StoreResult<Option<Journey>> {
        let conn = self.conn.lock();
        or_empty(
            conn.query_row(
                &format!(
                    "SELECT {JOURNEY_COLUMNS} FROM journey WHERE reference = ?1 AND source = ?2
                     ORDER BY id LIMIT 1"
                ),
                params![reference, source],
                journey_from_row,
            )
            .optional(),
        )
    }

    fn get_journey_by_id(&self, journey_id: i64) -> StoreResult<Option<Journey>> {
        let conn = self.conn.lock();
        or_empty(
            conn.query_row(
                &format!("SELECT {JOURNEY_COLUMNS} FROM journey WHERE id = ?1"),
                params![journey_id],
                journey_from_row,
            )
            .optional(),
        )
    }

    fn get_journeys(&self) -> StoreResult<Vec<Journey>> {
        or_empty(collect_rows(
            &self.conn.lock(),
            &format!("SELECT {JOURNEY_COLUMNS} FROM journey ORDER BY id"),
            [],
            journey_from_row,
        ))
    }

    fn complete_journey(&self, journey_id: i64) -> StoreResult<()> {
        let changed = self.conn.lock().execute(
            "UPDATE journey SET complete = 1 WHERE id = ?1",
            params![journey_id],
        )?;
        if changed == 0 {
            return Err(StoreError::JourneyNotFound(journey_id));
        }
        Ok(())
    }

    fn set_current_state(&self, journey_id: i64, update: StateUpdate) -> StoreResult<()> {
        insert_state(&self.conn.lock(), &update.into_record(0, journey_id))
    }

    fn get_all_states(&self, journey_id: i64) -> StoreResult<Vec<StateRecord>> {
        or_empty(collect_rows(
            &self.conn.lock(),
            &format!("SELECT {STATE_COLUMNS} FROM state WHERE journey = ?1 ORDER BY id"),
            params![journey_id],
            state_from_row,
        ))
    }

    fn set_current_step(&self, journey_id: i64, update: StepUpdate) -> StoreResult<()> {
        let conn = self.conn.lock();
        let latest = or_empty(
            conn.query_row(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM step WHERE journey = ?1 AND name = ?2
                     ORDER BY id DESC LIMIT 1"
                ),
                params![journey_id, update.name],
                step_from_row,
            )
            .optional(),
        )?;

        let status = update.status;
        match StepWrite::plan(latest.as_ref(), &update) {
            StepWrite::Insert => insert_step(&conn, &update.into_record(0, journey_id))?,
            StepWrite::Update(id) => update_step(&conn, id, &update)?,
            StepWrite::Skip => {
                debug!(journey_id, step = %update.name, %status, "Step status unchanged");
                return Ok(());
            }
        }
        metrics::counter!("store.step.write", "status" => status.as_str()).increment(1);
        Ok(())
    }

    fn get_steps(&self, journey_id: i64) -> StoreResult<Vec<StepRecord>> {
        self.query_steps(
            &format!("SELECT {STEP_COLUMNS} FROM step WHERE journey = ?1 ORDER BY id"),
            journey_id,
        )
    }

    fn get_current_state(
        &self,
        journey_id: i64,
        label: &str,
        at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<StateRecord>> {
        let conn = self.conn.lock();
        let result = match at {
            Some(at) => conn
                .query_row(
                    &format!(
                        "SELECT {STATE_COLUMNS} FROM state
                         WHERE journey = ?1 AND label = ?2 AND timestamp <= ?3
                         ORDER BY timestamp DESC, id DESC LIMIT 1"
                    ),
                    params![journey_id, label, format_timestamp(&at)],
                    state_from_row,
                )
                .optional(),
            None => conn
                .query_row(
                    &format!(
                        "SELECT {STATE_COLUMNS} FROM state WHERE journey = ?1 AND label = ?2
                         ORDER BY timestamp DESC, id DESC LIMIT 1"
                    ),
                    params![journey_id, label],
                    state_from_row,
                )
                .optional(),
        };
        or_empty(result)
    }

    fn get_latest_step(&self, journey_id: i64) -> StoreResult<Option<StepRecord>> {
        Ok(self
            .query_steps(
                &format!("SELECT {STEP_COLUMNS} FROM step WHERE journey = ?1 ORDER BY id DESC LIMIT 1"),
                journey_id,
            )?
            .pop())
    }
}

/// Broker entries in a `data_store` table. SQLite has no channels, so
/// publishing is recorded in the `external` column only.
pub struct SqliteBroker {
    conn: Mutex<Connection>,
}

impl SqliteBroker {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening SQLite broker store");
        Self::from_connection(open_connection(path)?)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(BROKER_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert many entries in one transaction.
    pub(crate) fn store_many(
        &self,
        entries: &[(String, String, Value, Option<Channel>)],
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (reference, data_type, data, publish) in entries {
            upsert_entry(&tx, reference, data_type, data, *publish)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn upsert_entry(
    conn: &Connection,
    reference: &str,
    data_type: &str,
    data: &Value,
    publish: Option<Channel>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO data_store (ref, data_type, data, external, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (ref, data_type) DO UPDATE SET
             data = excluded.data, external = excluded.external, timestamp = excluded.timestamp",
        params![
            reference,
            data_type,
            JsonCodec::encode(data)?,
            publish == Some(Channel::External),
            format_timestamp(&Utc::now()),
        ],
    )?;
    Ok(())
}

impl Broker for SqliteBroker {
    fn store_data(
        &self,
        reference: &str,
        data_type: &str,
        data: &Value,
        publish: Option<Channel>,
    ) -> StoreResult<()> {
        upsert_entry(&self.conn.lock(), reference, data_type, data, publish)?;
        metrics::counter!("store.broker.store").increment(1);
        Ok(())
    }

    fn retrieve_data(&self, reference: &str, data_type: &str) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock();
        let text: Option<Option<String>> = or_empty(
            conn.query_row(
                "SELECT data FROM data_store WHERE ref = ?1 AND data_type = ?2",
                params![reference, data_type],
                |row| row.get(0),
            )
            .optional(),
        )?;
        Ok(text.flatten().map(|t| JsonCodec::decode(&t)).transpose()?)
    }

    fn send_message(&self, channel: Channel, message: &BrokerMessage) -> StoreResult<()> {
        debug!(
            channel = channel.as_str(),
            reference = %message.reference,
            data_type = %message.data_type,
            "SQLite broker has no subscribers, message not delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_journey_create_or_get() {
        let client = SqliteClient::in_memory().unwrap();
        let journey = client.create_journey("A1", "admissions", Some("bay 3")).unwrap();
        assert_eq!(client.create_journey("A1", "admissions", None).unwrap(), journey);
        assert_eq!(client.get_journey_by_id(journey.id).unwrap(), Some(journey.clone()));

        client.complete_journey(journey.id).unwrap();
        assert!(client.get_journey("A1", "admissions").unwrap().unwrap().complete);
        assert!(matches!(
            client.complete_journey(999),
            Err(StoreError::JourneyNotFound(999))
        ));
    }

    #[test]
    fn test_concurrent_creates_share_one_journey() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journeys.db");
        let first = SqliteClient::open(&path).unwrap();
        let second = SqliteClient::open(&path).unwrap();

        let ids: Vec<i64> = std::thread::scope(|scope| {
            let handles: Vec<_> = [&first, &second]
                .into_iter()
                .map(|client| {
                    scope.spawn(move || {
                        (0..20)
                            .map(|_| client.create_journey("A1", "admissions", None).unwrap().id)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(first.get_journeys().unwrap().len(), 1);
    }

    #[test]
    fn test_step_rows_round_trip_json_columns() {
        let client = SqliteClient::in_memory().unwrap();
        let journey = client.create_journey("A1", "admissions", None).unwrap();
        let outcome = json!({
            "outcome_step": "catheter_check",
            "next_step": "itu",
            "reason": "positive",
            "value": 1,
            "result": {"value": 1.0, "data": {"systolic_bp": 92}}
        });

        client
            .set_current_step(journey.id, StepUpdate::new("catheter_check", StepStatus::Init, ts(8)))
            .unwrap();
        client
            .set_current_step(
                journey.id,
                StepUpdate::new("catheter_check", StepStatus::Complete, ts(8)).with_outcome(outcome.clone()),
            )
            .unwrap();

        let step = client.get_step(journey.id, "catheter_check").unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Complete);
        assert_eq!(step.outcome, Some(outcome));
        assert_eq!(step.next_step.as_deref(), Some("itu"));
        assert_eq!(step.value, Some(json!(1)));
        assert_eq!(step.timestamp, Some(ts(8)));
        assert_eq!(client.get_steps(journey.id).unwrap().len(), 1);
    }

    #[test]
    fn test_current_state_as_of_timestamp() {
        let client = SqliteClient::in_memory().unwrap();
        let journey = client.create_journey("A1", "admissions", None).unwrap();
        for (value, hour) in [("ed", 8), ("ward", 10), ("discharged", 12)] {
            client
                .set_current_state(
                    journey.id,
                    StateUpdate {
                        label: "location".into(),
                        state: value.into(),
                        reason: Some("moved".into()),
                        from_step: None,
                        timestamp: Some(ts(hour)),
                    },
                )
                .unwrap();
        }

        let state = |at| client.get_current_state(journey.id, "location", at).unwrap().map(|s| s.state);
        assert_eq!(state(Some(ts(9))).as_deref(), Some("ed"));
        assert_eq!(state(Some(ts(10))).as_deref(), Some("ward"));
        assert_eq!(state(None).as_deref(), Some("discharged"));
        assert_eq!(state(Some(ts(7))), None);
        assert_eq!(client.get_current_states(journey.id).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_table_reads_as_empty() {
        let client = SqliteClient::in_memory().unwrap();
        client.conn.lock().execute_batch("DROP TABLE step; DROP TABLE state;").unwrap();
        assert!(client.get_steps(1).unwrap().is_empty());
        assert!(client.get_latest_step(1).unwrap().is_none());
        assert!(client.get_current_state(1, "location", None).unwrap().is_none());
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journeys.db");
        let id = {
            let client = SqliteClient::open(&path).unwrap();
            let journey = client.create_journey("A1", "admissions", None).unwrap();
            client
                .set_current_step(journey.id, StepUpdate::new("admission", StepStatus::Complete, ts(8)))
                .unwrap();
            journey.id
        };

        let client = SqliteClient::open(&path).unwrap();
        assert_eq!(client.get_step_route(id).unwrap(), vec!["admission"]);
    }

    #[test]
    fn test_broker_upserts_by_reference_and_type() {
        let broker = SqliteBroker::in_memory().unwrap();
        broker.store_data("A1", "labs", &json!({"crp": 5}), None).unwrap();
        broker
            .store_data("A1", "labs", &json!({"crp": 40}), Some(Channel::External))
            .unwrap();

        assert_eq!(broker.retrieve_data("A1", "labs").unwrap(), Some(json!({"crp": 40})));
        assert!(broker.retrieve_data("A1", "vitals").unwrap().is_none());
        let count: i64 = broker
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM data_store", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
