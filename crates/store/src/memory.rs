//! In-process backends backed by DashMap. No durability; used by tests and
//! simulation runs.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};
use waypoint_core::{
    BrokerMessage, Channel, Journey, JsonCodec, StateRecord, StateUpdate, StepRecord, StepUpdate,
    StepWrite,
};

use crate::broker::{envelope, Broker, MessageHandler};
use crate::client::Client;
use crate::error::{StoreError, StoreResult};

struct JourneyEntry {
    journey: Journey,
    steps: Vec<StepRecord>,
    states: Vec<StateRecord>,
}

/// Journey store keyed by `(source, reference)`.
pub struct MemoryClient {
    journeys: DashMap<i64, JourneyEntry>,
    index: DashMap<(String, String), i64>,
    next_journey_id: AtomicI64,
    next_row_id: AtomicI64,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            journeys: DashMap::new(),
            index: DashMap::new(),
            next_journey_id: AtomicI64::new(1),
            next_row_id: AtomicI64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.journeys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.journeys.is_empty()
    }

    fn with_entry<T>(
        &self,
        journey_id: i64,
        f: impl FnOnce(&mut JourneyEntry) -> T,
    ) -> StoreResult<T> {
        let mut entry = self
            .journeys
            .get_mut(&journey_id)
            .ok_or(StoreError::JourneyNotFound(journey_id))?;
        Ok(f(&mut entry))
    }

    fn row_id(&self) -> i64 {
        self.next_row_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Client for MemoryClient {
    fn create_journey(
        &self,
        reference: &str,
        source: &str,
        label: Option<&str>,
    ) -> StoreResult<Journey> {
        match self.index.entry((source.to_string(), reference.to_string())) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                self.get_journey_by_id(id)?
                    .ok_or(StoreError::JourneyNotFound(id))
            }
            Entry::Vacant(slot) => {
                let journey = Journey {
                    id: self.next_journey_id.fetch_add(1, Ordering::Relaxed),
                    reference: reference.to_string(),
                    source: source.to_string(),
                    label: label.map(str::to_string),
                    complete: false,
                };
                debug!(journey_id = journey.id, reference = %reference, "Created journey in memory");
                self.journeys.insert(
                    journey.id,
                    JourneyEntry {
                        journey: journey.clone(),
                        steps: Vec::new(),
                        states: Vec::new(),
                    },
                );
                slot.insert(journey.id);
                Ok(journey)
            }
        }
    }

    fn get_journey(&self, reference: &str, source: &str) -> StoreResult<Option<Journey>> {
        let id = match self.index.get(&(source.to_string(), reference.to_string())) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_journey_by_id(id)
    }

    fn get_journey_by_id(&self, journey_id: i64) -> StoreResult<Option<Journey>> {
        Ok(self.journeys.get(&journey_id).map(|e| e.journey.clone()))
    }

    fn get_journeys(&self) -> StoreResult<Vec<Journey>> {
        let mut journeys: Vec<Journey> = self.journeys.iter().map(|e| e.journey.clone()).collect();
        journeys.sort_by_key(|j| j.id);
        Ok(journeys)
    }

    fn complete_journey(&self, journey_id: i64) -> StoreResult<()> {
        self.with_entry(journey_id, |entry| entry.journey.complete = true)
    }

    fn set_current_state(&self, journey_id: i64, update: StateUpdate) -> StoreResult<()> {
        let id = self.row_id();
        self.with_entry(journey_id, |entry| {
            entry.states.push(update.into_record(id, journey_id))
        })
    }

    fn get_all_states(&self, journey_id: i64) -> StoreResult<Vec<StateRecord>> {
        Ok(self
            .journeys
            .get(&journey_id)
            .map(|e| e.states.clone())
            .unwrap_or_default())
    }

    fn set_current_step(&self, journey_id: i64, update: StepUpdate) -> StoreResult<()> {
        let id = self.row_id();
        self.with_entry(journey_id, |entry| {
            let latest = entry.steps.iter().rev().find(|s| s.name == update.name);
            match StepWrite::plan(latest, &update) {
                StepWrite::Insert => entry.steps.push(update.into_record(id, journey_id)),
                StepWrite::Update(row) => {
                    if let Some(existing) = entry.steps.iter_mut().find(|s| s.id == row) {
                        update.apply_to(existing);
                    }
                }
                StepWrite::Skip => {}
            }
        })
    }

    fn get_steps(&self, journey_id: i64) -> StoreResult<Vec<StepRecord>> {
        Ok(self
            .journeys
            .get(&journey_id)
            .map(|e| e.steps.clone())
            .unwrap_or_default())
    }
}

/// Keyed broker that keeps published envelopes encoded until dispatched.
#[derive(Default)]
pub struct MemoryBroker {
    entries: DashMap<(String, String), Value>,
    published: Mutex<Vec<(Channel, String)>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded envelopes still pending on `channel`.
    pub fn messages(&self, channel: Channel) -> StoreResult<Vec<BrokerMessage>> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, payload)| Ok(JsonCodec::decode_message(payload.as_bytes())?))
            .collect()
    }

    /// Hand every pending envelope on `channel` to `handler`, draining it.
    /// Handler failures are logged and do not stop the drain.
    pub fn dispatch(&self, channel: Channel, handler: &dyn MessageHandler) -> StoreResult<usize> {
        let pending: Vec<String> = {
            let mut published = self.published.lock();
            let (matching, rest): (Vec<_>, Vec<_>) =
                published.drain(..).partition(|(c, _)| *c == channel);
            *published = rest;
            matching.into_iter().map(|(_, payload)| payload).collect()
        };

        let mut handled = 0;
        for payload in pending {
            let message = JsonCodec::decode_message(payload.as_bytes())?;
            if let Err(e) = handler.handle(message) {
                warn!(channel = channel.as_str(), error = %e, "Message handler failed");
            }
            handled += 1;
        }
        Ok(handled)
    }
}

impl Broker for MemoryBroker {
    fn store_data(
        &self,
        reference: &str,
        data_type: &str,
        data: &Value,
        publish: Option<Channel>,
    ) -> StoreResult<()> {
        self.entries
            .insert((reference.to_string(), data_type.to_string()), data.clone());
        if let Some(channel) = publish {
            self.send_message(channel, &envelope(reference, data_type, data))?;
        }
        Ok(())
    }

    fn retrieve_data(&self, reference: &str, data_type: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .entries
            .get(&(reference.to_string(), data_type.to_string()))
            .map(|v| v.clone()))
    }

    fn send_message(&self, channel: Channel, message: &BrokerMessage) -> StoreResult<()> {
        let payload = JsonCodec::encode_message(message)?;
        self.published.lock().push((channel, payload));
        Ok(())
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

    #[test]
    fn test_create_journey_is_create_or_get() {
        let client = MemoryClient::new();
        let first = client.create_journey("A1", "admissions", None).unwrap();
        let again = client.create_journey("A1", "admissions", None).unwrap();
        let other = client.create_journey("A1", "outpatients", None).unwrap();

        assert_eq!(first, again);
        assert_ne!(first.id, other.id);
        assert_eq!(client.len(), 2);
        assert!(client.get_journey("A2", "admissions").unwrap().is_none());
    }

    #[test]
    fn test_step_rows_follow_write_rules() {
        let client = MemoryClient::new();
        let journey = client.create_journey("A1", "admissions", None).unwrap();

        client
            .set_current_step(journey.id, StepUpdate::new("check", StepStatus::Init, ts(8)))
            .unwrap();
        client
            .set_current_step(
                journey.id,
                StepUpdate::new("check", StepStatus::Waiting, ts(8)).with_status_info("no data"),
            )
            .unwrap();
        client
            .set_current_step(
                journey.id,
                StepUpdate::new("check", StepStatus::Waiting, ts(9)).with_status_info("still none"),
            )
            .unwrap();

        let steps = client.get_steps(journey.id).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Waiting);
        assert_eq!(steps[0].status_info.as_deref(), Some("still none"));

        client
            .set_current_step(journey.id, StepUpdate::new("check", StepStatus::Complete, ts(9)))
            .unwrap();
        client
            .set_current_step(journey.id, StepUpdate::new("check", StepStatus::Init, ts(12)))
            .unwrap();
        assert_eq!(client.get_steps(journey.id).unwrap().len(), 2);
        assert_eq!(client.get_step_route(journey.id).unwrap(), vec!["check"]);
        assert_eq!(
            client.get_latest_step(journey.id).unwrap().unwrap().status,
            StepStatus::Init
        );
    }

    #[test]
    fn test_states_append_and_resolve_as_of() {
        let client = MemoryClient::new();
        let journey = client.create_journey("A1", "admissions", None).unwrap();
        for (state, hour) in [("ed", 8), ("ward", 10)] {
            client
                .set_current_state(
                    journey.id,
                    StateUpdate {
                        label: "location".into(),
                        state: state.into(),
                        reason: None,
                        from_step: Some("admission".into()),
                        timestamp: Some(ts(hour)),
                    },
                )
                .unwrap();
        }

        assert_eq!(client.get_all_states(journey.id).unwrap().len(), 2);
        let at_nine = client
            .get_current_state(journey.id, "location", Some(ts(9)))
            .unwrap()
            .unwrap();
        assert_eq!(at_nine.state, "ed");
        assert_eq!(client.get_current_states(journey.id).unwrap()["location"].state, "ward");
    }

    #[test]
    fn test_writes_to_unknown_journey_fail() {
        let client = MemoryClient::new();
        let err = client.complete_journey(42).unwrap_err();
        assert!(matches!(err, StoreError::JourneyNotFound(42)));
    }

    struct Collect(Mutex<Vec<BrokerMessage>>);

    impl MessageHandler for Collect {
        fn handle(&self, message: BrokerMessage) -> anyhow::Result<()> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    #[test]
    fn test_broker_store_publish_and_dispatch() {
        let broker = MemoryBroker::new();
        broker
            .store_data("A1", "outcome:check", &json!({"value": 1}), Some(Channel::External))
            .unwrap();
        broker
            .store_data("A1", "labs", &json!({"crp": 12}), None)
            .unwrap();

        assert_eq!(
            broker.retrieve_data("A1", "labs").unwrap(),
            Some(json!({"crp": 12}))
        );
        assert!(broker.retrieve_data("A2", "labs").unwrap().is_none());
        assert!(broker.messages(Channel::Internal).unwrap().is_empty());

        let handler = Collect(Mutex::new(Vec::new()));
        assert_eq!(broker.dispatch(Channel::External, &handler).unwrap(), 1);
        let received = handler.0.lock();
        assert_eq!(received[0].data_type, "outcome:check");
        assert_eq!(received[0].data, json!({"value": 1}));
        assert!(broker.messages(Channel::External).unwrap().is_empty());
    }
}
