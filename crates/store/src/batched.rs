//! Write-behind batching in front of the SQLite backends.
//!
//! New journeys and everything written for them stay in memory under
//! negative buffer ids until `batch_size` journeys have accumulated, then land
//! in the underlying store in one transaction with child rows remapped to the
//! stored journey ids. Journeys that already exist in the store are written
//! through directly.
//!
//! Buffered rows are only durable after a flush. Call [`BatchedSqliteClient::flush`]
//! before shutdown; drop attempts a final flush and logs if it fails.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info};
use waypoint_core::{
    BrokerMessage, Channel, Journey, StateRecord, StateUpdate, StepRecord, StepUpdate, StepWrite,
};

use crate::broker::Broker;
use crate::client::Client;
use crate::error::{StoreError, StoreResult};
use crate::sqlite::{SqliteBroker, SqliteClient};

#[derive(Default)]
struct ClientBuffer {
    journeys: Vec<Journey>,
    steps: Vec<StepRecord>,
    states: Vec<StateRecord>,
    next_journey: i64,
    next_row: i64,
    /// Buffer id -> stored id for journeys already flushed.
    flushed: HashMap<i64, i64>,
}

impl ClientBuffer {
    /// Journey buffer ids are negative so they never collide with stored ids.
    fn journey_id(&mut self) -> i64 {
        self.next_journey -= 1;
        self.next_journey
    }

    fn row_id(&mut self) -> i64 {
        self.next_row += 1;
        self.next_row
    }

    fn journey_mut(&mut self, journey_id: i64) -> Option<&mut Journey> {
        self.journeys.iter_mut().find(|j| j.id == journey_id)
    }
}

/// Where the rows of a journey currently live.
enum Target {
    Buffered(i64),
    Stored(i64),
}

pub struct BatchedSqliteClient {
    inner: SqliteClient,
    batch_size: usize,
    buffer: Mutex<ClientBuffer>,
}

impl BatchedSqliteClient {
    pub fn new(inner: SqliteClient, batch_size: usize) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
            buffer: Mutex::new(ClientBuffer::default()),
        }
    }

    /// Journeys waiting for the next flush.
    pub fn buffered_journeys(&self) -> usize {
        self.buffer.lock().journeys.len()
    }

    pub fn inner(&self) -> &SqliteClient {
        &self.inner
    }

    /// Write every buffered row to the underlying store.
    pub fn flush(&self) -> StoreResult<usize> {
        let mut buffer = self.buffer.lock();
        self.flush_locked(&mut buffer)
    }

    fn flush_locked(&self, buffer: &mut ClientBuffer) -> StoreResult<usize> {
        if buffer.journeys.is_empty() {
            return Ok(0);
        }
        let ids = self
            .inner
            .insert_batch(&buffer.journeys, &buffer.steps, &buffer.states)?;
        let count = buffer.journeys.len();
        info!(
            journeys = count,
            steps = buffer.steps.len(),
            states = buffer.states.len(),
            "Flushed journey batch"
        );
        metrics::counter!("store.batch.flush").increment(1);

        buffer.flushed.extend(ids);
        buffer.journeys.clear();
        buffer.steps.clear();
        buffer.states.clear();
        Ok(count)
    }

    fn target(&self, buffer: &ClientBuffer, journey_id: i64) -> StoreResult<Target> {
        if journey_id >= 0 {
            return Ok(Target::Stored(journey_id));
        }
        if buffer.journeys.iter().any(|j| j.id == journey_id) {
            return Ok(Target::Buffered(journey_id));
        }
        buffer
            .flushed
            .get(&journey_id)
            .map(|id| Target::Stored(*id))
            .ok_or(StoreError::JourneyNotFound(journey_id))
    }
}

impl Client for BatchedSqliteClient {
    fn create_journey(
        &self,
        reference: &str,
        source: &str,
        label: Option<&str>,
    ) -> StoreResult<Journey> {
        let mut buffer = self.buffer.lock();
        if let Some(existing) = buffer
            .journeys
            .iter()
            .find(|j| j.reference == reference && j.source == source)
        {
            return Ok(existing.clone());
        }
        if let Some(existing) = self.inner.get_journey(reference, source)? {
            return Ok(existing);
        }

        let journey = Journey {
            id: buffer.journey_id(),
            reference: reference.to_string(),
            source: source.to_string(),
            label: label.map(str::to_string),
            complete: false,
        };
        buffer.journeys.push(journey.clone());
        if buffer.journeys.len() >= self.batch_size {
            self.flush_locked(&mut buffer)?;
        }
        Ok(journey)
    }

    fn get_journey(&self, reference: &str, source: &str) -> StoreResult<Option<Journey>> {
        let buffered = self
            .buffer
            .lock()
            .journeys
            .iter()
            .find(|j| j.reference == reference && j.source == source)
            .cloned();
        match buffered {
            Some(journey) => Ok(Some(journey)),
            None => self.inner.get_journey(reference, source),
        }
    }

    fn get_journey_by_id(&self, journey_id: i64) -> StoreResult<Option<Journey>> {
        let buffer = self.buffer.lock();
        match self.target(&buffer, journey_id) {
            Ok(Target::Buffered(id)) => Ok(buffer.journeys.iter().find(|j| j.id == id).cloned()),
            Ok(Target::Stored(id)) => self.inner.get_journey_by_id(id),
            Err(StoreError::JourneyNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get_journeys(&self) -> StoreResult<Vec<Journey>> {
        let mut journeys = self.inner.get_journeys()?;
        journeys.extend(self.buffer.lock().journeys.iter().cloned());
        Ok(journeys)
    }

    fn complete_journey(&self, journey_id: i64) -> StoreResult<()> {
        let mut buffer = self.buffer.lock();
        match self.target(&buffer, journey_id)? {
            Target::Buffered(id) => {
                if let Some(journey) = buffer.journey_mut(id) {
                    journey.complete = true;
                }
                Ok(())
            }
            Target::Stored(id) => self.inner.complete_journey(id),
        }
    }

    fn set_current_state(&self, journey_id: i64, update: StateUpdate) -> StoreResult<()> {
        let mut buffer = self.buffer.lock();
        match self.target(&buffer, journey_id)? {
            Target::Buffered(id) => {
                let row = buffer.row_id();
                buffer.states.push(update.into_record(row, id));
                Ok(())
            }
            Target::Stored(id) => self.inner.set_current_state(id, update),
        }
    }

    fn get_all_states(&self, journey_id: i64) -> StoreResult<Vec<StateRecord>> {
        let buffer = self.buffer.lock();
        match self.target(&buffer, journey_id)? {
            Target::Buffered(id) => Ok(buffer
                .states
                .iter()
                .filter(|s| s.journey_id == id)
                .cloned()
                .collect()),
            Target::Stored(id) => self.inner.get_all_states(id),
        }
    }

    fn set_current_step(&self, journey_id: i64, update: StepUpdate) -> StoreResult<()> {
        let mut buffer = self.buffer.lock();
        let id = match self.target(&buffer, journey_id)? {
            Target::Buffered(id) => id,
            Target::Stored(id) => return self.inner.set_current_step(id, update),
        };

        let latest = buffer
            .steps
            .iter()
            .rev()
            .find(|s| s.journey_id == id && s.name == update.name);
        match StepWrite::plan(latest, &update) {
            StepWrite::Insert => {
                let row = buffer.row_id();
                buffer.steps.push(update.into_record(row, id));
            }
            StepWrite::Update(row) => {
                if let Some(existing) = buffer.steps.iter_mut().find(|s| s.id == row) {
                    update.apply_to(existing);
                }
            }
            StepWrite::Skip => {}
        }
        Ok(())
    }

    fn get_steps(&self, journey_id: i64) -> StoreResult<Vec<StepRecord>> {
        let buffer = self.buffer.lock();
        match self.target(&buffer, journey_id)? {
            Target::Buffered(id) => Ok(buffer
                .steps
                .iter()
                .filter(|s| s.journey_id == id)
                .cloned()
                .collect()),
            Target::Stored(id) => self.inner.get_steps(id),
        }
    }

    fn flush(&self) -> StoreResult<usize> {
        BatchedSqliteClient::flush(self)
    }
}

impl Drop for BatchedSqliteClient {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "Failed to flush buffered journeys on shutdown");
        }
    }
}

type BrokerEntry = (String, String, Value, Option<Channel>);

/// Broker entries buffered until `batch_size` distinct references accumulate.
pub struct BatchedSqliteBroker {
    inner: SqliteBroker,
    batch_size: usize,
    buffer: Mutex<Vec<BrokerEntry>>,
}

impl BatchedSqliteBroker {
    pub fn new(inner: SqliteBroker, batch_size: usize) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn flush(&self) -> StoreResult<usize> {
        let mut buffer = self.buffer.lock();
        self.flush_locked(&mut buffer)
    }

    fn flush_locked(&self, buffer: &mut Vec<BrokerEntry>) -> StoreResult<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }
        self.inner.store_many(buffer)?;
        let count = buffer.len();
        info!(entries = count, "Flushed broker batch");
        metrics::counter!("store.batch.flush").increment(1);
        buffer.clear();
        Ok(count)
    }
}

impl Broker for BatchedSqliteBroker {
    fn store_data(
        &self,
        reference: &str,
        data_type: &str,
        data: &Value,
        publish: Option<Channel>,
    ) -> StoreResult<()> {
        let mut buffer = self.buffer.lock();
        buffer.push((
            reference.to_string(),
            data_type.to_string(),
            data.clone(),
            publish,
        ));
        let references = buffer
            .iter()
            .map(|(r, ..)| r.as_str())
            .collect::<HashSet<_>>()
            .len();
        if references >= self.batch_size {
            self.flush_locked(&mut buffer)?;
        }
        Ok(())
    }

    fn retrieve_data(&self, reference: &str, data_type: &str) -> StoreResult<Option<Value>> {
        let buffered = self
            .buffer
            .lock()
            .iter()
            .rev()
            .find(|(r, t, ..)| r == reference && t == data_type)
            .map(|(_, _, data, _)| data.clone());
        match buffered {
            Some(data) => Ok(Some(data)),
            None => self.inner.retrieve_data(reference, data_type),
        }
    }

    fn send_message(&self, channel: Channel, message: &BrokerMessage) -> StoreResult<()> {
        self.inner.send_message(channel, message)
    }

    fn flush(&self) -> StoreResult<usize> {
        BatchedSqliteBroker::flush(self)
    }
}

impl Drop for BatchedSqliteBroker {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "Failed to flush buffered broker entries on shutdown");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use waypoint_core::StepStatus;

    fn ts(hour: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn write_history(client: &dyn Client, journey: &Journey) {
        client
            .set_current_step(journey.id, StepUpdate::new("admission", StepStatus::Init, ts(8)))
            .unwrap();
        client
            .set_current_step(journey.id, StepUpdate::new("admission", StepStatus::Complete, ts(8)))
            .unwrap();
        client
            .set_current_state(
                journey.id,
                StateUpdate {
                    label: "admission".into(),
                    state: "admitted".into(),
                    reason: None,
                    from_step: Some("admission".into()),
                    timestamp: Some(ts(8)),
                },
            )
            .unwrap();
    }

    #[test]
    fn test_rows_stay_buffered_below_batch_size() {
        let client = BatchedSqliteClient::new(SqliteClient::in_memory().unwrap(), 3);
        let journey = client.create_journey("A1", "admissions", None).unwrap();
        assert!(journey.id < 0);
        write_history(&client, &journey);

        assert_eq!(client.buffered_journeys(), 1);
        assert!(client.inner().get_journeys().unwrap().is_empty());
        assert_eq!(client.get_steps(journey.id).unwrap().len(), 1);
        assert_eq!(client.get_step_route(journey.id).unwrap(), vec!["admission"]);
    }

    #[test]
    fn test_flush_on_batch_size_remaps_children() {
        let client = BatchedSqliteClient::new(SqliteClient::in_memory().unwrap(), 3);
        let mut buffered = Vec::new();
        for reference in ["A1", "A2"] {
            let journey = client.create_journey(reference, "admissions", None).unwrap();
            write_history(&client, &journey);
            buffered.push(journey);
        }
        client.complete_journey(buffered[0].id).unwrap();
        let third = client.create_journey("A3", "admissions", None).unwrap();

        assert_eq!(client.buffered_journeys(), 0);
        let stored = client.inner().get_journeys().unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|j| j.id > 0));

        let a1 = client.inner().get_journey("A1", "admissions").unwrap().unwrap();
        assert!(a1.complete);
        let steps = client.inner().get_steps(a1.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].journey_id, a1.id);
        assert_eq!(steps[0].status, StepStatus::Complete);
        assert_eq!(client.inner().get_all_states(a1.id).unwrap().len(), 1);

        // Buffer ids handed out before the flush keep working.
        assert_eq!(client.get_steps(buffered[1].id).unwrap().len(), 1);
        write_history(&client, &third);
        let a3 = client.inner().get_journey("A3", "admissions").unwrap().unwrap();
        assert_eq!(client.inner().get_steps(a3.id).unwrap().len(), 1);
    }

    #[test]
    fn test_flush_through_trait_object_writes_partial_batch() {
        let client = std::sync::Arc::new(BatchedSqliteClient::new(
            SqliteClient::in_memory().unwrap(),
            10,
        ));
        let shared: std::sync::Arc<dyn Client> = client.clone();
        let journey = shared.create_journey("A1", "admissions", None).unwrap();
        write_history(shared.as_ref(), &journey);

        assert_eq!(shared.flush().unwrap(), 1);
        assert_eq!(client.buffered_journeys(), 0);
        let stored = client.inner().get_journey("A1", "admissions").unwrap().unwrap();
        assert_eq!(client.inner().get_steps(stored.id).unwrap().len(), 1);
        assert_eq!(shared.flush().unwrap(), 0);
    }

    #[test]
    fn test_existing_journeys_write_through() {
        let inner = SqliteClient::in_memory().unwrap();
        let existing = inner.create_journey("A1", "admissions", None).unwrap();
        let client = BatchedSqliteClient::new(inner, 10);

        assert_eq!(client.create_journey("A1", "admissions", None).unwrap(), existing);
        write_history(&client, &existing);
        assert_eq!(client.inner().get_steps(existing.id).unwrap().len(), 1);
    }

    #[test]
    fn test_drop_flushes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batched.db");
        {
            let client = BatchedSqliteClient::new(SqliteClient::open(&path).unwrap(), 50);
            let journey = client.create_journey("A1", "admissions", None).unwrap();
            write_history(&client, &journey);
        }
        let reopened = SqliteClient::open(&path).unwrap();
        let journey = reopened.get_journey("A1", "admissions").unwrap().unwrap();
        assert_eq!(reopened.get_step_route(journey.id).unwrap(), vec!["admission"]);
    }

    #[test]
    fn test_broker_batches_by_reference() {
        let broker = BatchedSqliteBroker::new(SqliteBroker::in_memory().unwrap(), 2);
        broker.store_data("A1", "labs", &json!({"crp": 5}), None).unwrap();
        broker.store_data("A1", "vitals", &json!({"hr": 80}), None).unwrap();
        assert_eq!(broker.buffer.lock().len(), 2);
        assert_eq!(broker.retrieve_data("A1", "labs").unwrap(), Some(json!({"crp": 5})));

        broker.store_data("A2", "labs", &json!({"crp": 9}), None).unwrap();
        assert!(broker.buffer.lock().is_empty());
        assert_eq!(broker.inner.retrieve_data("A2", "labs").unwrap(), Some(json!({"crp": 9})));
        assert_eq!(broker.retrieve_data("A1", "vitals").unwrap(), Some(json!({"hr": 80})));
    }
}
