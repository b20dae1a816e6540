use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};
use waypoint_core::{
    BrokerMessage, Channel, Journey, StateRecord, StateUpdate, StepRecord, StepStatus, StepUpdate,
};
use waypoint_store::{Broker, Client, MemoryBroker, MemoryClient};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::outcome::Outcome;

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

fn next_run_id() -> u64 {
    NEXT_RUN.fetch_add(1, Ordering::Relaxed)
}

/// Per-journey facade over one [`Client`], one [`Broker`] and one [`Clock`].
/// Every write is stamped with the journey id and the clock's timestamp.
pub struct Driver {
    client: Arc<dyn Client>,
    broker: Arc<dyn Broker>,
    clock: Clock,
    journey: Journey,
    run_id: u64,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("journey", &self.journey)
            .field("clock", &self.clock)
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl Driver {
    /// Look the journey up by reference; fails when it does not exist.
    pub fn from_reference(
        reference: &str,
        source: &str,
        client: Arc<dyn Client>,
        broker: Arc<dyn Broker>,
        clock: Clock,
    ) -> EngineResult<Self> {
        let journey =
            client
                .get_journey(reference, source)?
                .ok_or_else(|| EngineError::JourneyNotFound {
                    reference: reference.to_string(),
                    namespace: source.to_string(),
                })?;
        Ok(Self::from_journey(journey, client, broker, clock))
    }

    /// Wrap an already loaded journey without another lookup.
    pub fn from_journey(
        journey: Journey,
        client: Arc<dyn Client>,
        broker: Arc<dyn Broker>,
        clock: Clock,
    ) -> Self {
        Self {
            client,
            broker,
            clock,
            journey,
            run_id: next_run_id(),
        }
    }

    /// Like [`Driver::from_reference`] but creates the journey on first sight.
    pub fn find_or_create(
        reference: &str,
        source: &str,
        client: Arc<dyn Client>,
        broker: Arc<dyn Broker>,
        clock: Clock,
    ) -> EngineResult<Self> {
        let journey = match client.get_journey(reference, source)? {
            Some(journey) => journey,
            None => {
                info!(journey = %reference, source = %source, "Create journey (not found)");
                client.create_journey(reference, source, None)?
            }
        };
        Ok(Self::from_journey(journey, client, broker, clock))
    }

    /// Driver over fresh in-memory backends.
    pub fn in_memory(reference: &str, source: &str, clock: Clock) -> EngineResult<Self> {
        Self::find_or_create(
            reference,
            source,
            Arc::new(MemoryClient::new()),
            Arc::new(MemoryBroker::new()),
            clock,
        )
    }

    /// Start a new run. Source data cached under the previous run id is
    /// no longer served.
    pub fn begin_run(&mut self) {
        self.run_id = next_run_id();
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn journey(&self) -> &Journey {
        &self.journey
    }

    pub fn journey_id(&self) -> i64 {
        self.journey.id
    }

    pub fn reference(&self) -> &str {
        &self.journey.reference
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut Clock {
        &mut self.clock
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.clock.timestamp()
    }

    pub fn store_state(
        &self,
        label: &str,
        state: &str,
        from_step: Option<&str>,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        self.client.set_current_state(
            self.journey.id,
            StateUpdate {
                label: label.to_string(),
                state: state.to_string(),
                reason: reason.map(str::to_string),
                from_step: from_step.map(str::to_string),
                timestamp: Some(self.timestamp()),
            },
        )?;
        Ok(())
    }

    /// Record a step status. Only successful outcomes are encoded onto the row.
    pub fn store_step(
        &self,
        name: &str,
        status: StepStatus,
        status_info: Option<&str>,
        outcome: Option<&Outcome>,
    ) -> EngineResult<()> {
        let mut update = StepUpdate::new(name, status, self.timestamp());
        if let Some(info) = status_info {
            update = update.with_status_info(info);
        }
        if let Some(outcome) = outcome.filter(|o| o.is_successful()) {
            update = update.with_outcome(outcome.to_record());
        }
        debug!(journey = %self.journey.reference, step = %name, status = %status, "Store step");
        self.client.set_current_step(self.journey.id, update)?;
        Ok(())
    }

    pub fn current_states(&self) -> EngineResult<HashMap<String, StateRecord>> {
        Ok(self.client.get_current_states(self.journey.id)?)
    }

    pub fn all_states(&self) -> EngineResult<Vec<StateRecord>> {
        Ok(self.client.get_all_states(self.journey.id)?)
    }

    /// Latest state for `label` at or before the clock's timestamp.
    pub fn current_state(&self, label: &str) -> EngineResult<Option<StateRecord>> {
        Ok(self
            .client
            .get_current_state(self.journey.id, label, Some(self.timestamp()))?)
    }

    pub fn get_current_journey_step(&self) -> EngineResult<Option<StepRecord>> {
        Ok(self.client.get_latest_step(self.journey.id)?)
    }

    pub fn get_specific_step(&self, name: &str) -> EngineResult<Option<StepRecord>> {
        Ok(self.client.get_step(self.journey.id, name)?)
    }

    pub fn get_route(&self) -> EngineResult<Vec<String>> {
        Ok(self.client.get_step_route(self.journey.id)?)
    }

    pub fn get_broker_data(&self, data_type: &str) -> EngineResult<Option<Value>> {
        Ok(self.broker.retrieve_data(&self.journey.reference, data_type)?)
    }

    pub fn store_data_in_broker(
        &self,
        data_type: &str,
        data: &Value,
        publish: Option<Channel>,
    ) -> EngineResult<()> {
        self.broker
            .store_data(&self.journey.reference, data_type, data, publish)?;
        Ok(())
    }

    pub fn send_broker_message(
        &self,
        channel: Channel,
        data_type: &str,
        data: Value,
    ) -> EngineResult<()> {
        let message = BrokerMessage {
            reference: self.journey.reference.clone(),
            data_type: data_type.to_string(),
            data,
        };
        self.broker.send_message(channel, &message)?;
        Ok(())
    }

    pub fn complete_journey(&mut self) -> EngineResult<()> {
        info!(journey = %self.journey.reference, "Journey complete");
        self.client.complete_journey(self.journey.id)?;
        self.journey.complete = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmResult;
    use chrono::Duration;
    use serde_json::json;

    fn at(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_from_reference_requires_journey() {
        let client: Arc<dyn Client> = Arc::new(MemoryClient::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let err = Driver::from_reference("A1", "admissions", client.clone(), broker.clone(), Clock::Local)
            .unwrap_err();
        assert!(matches!(err, EngineError::JourneyNotFound { .. }));

        client.create_journey("A1", "admissions", None).unwrap();
        let driver =
            Driver::from_reference("A1", "admissions", client, broker, Clock::Local).unwrap();
        assert_eq!(driver.reference(), "A1");
    }

    #[test]
    fn test_store_step_encodes_successful_outcome_only() {
        let driver = Driver::in_memory("A1", "admissions", Clock::Local).unwrap();
        let outcome = Outcome::result(
            "check",
            Some("itu".into()),
            "positive",
            json!(1),
            AlgorithmResult::new(json!(1)),
        );
        driver
            .store_step("check", StepStatus::Complete, None, Some(&outcome))
            .unwrap();
        let row = driver.get_specific_step("check").unwrap().unwrap();
        assert_eq!(row.next_step.as_deref(), Some("itu"));
        assert_eq!(row.value, Some(json!(1)));

        let failed = Outcome::missing_data("labs", "Data not available in step labs");
        driver
            .store_step("labs", StepStatus::Waiting, Some("no labs"), Some(&failed))
            .unwrap();
        let row = driver.get_current_journey_step().unwrap().unwrap();
        assert_eq!(row.name, "labs");
        assert!(row.outcome.is_none());
        assert_eq!(row.status_info.as_deref(), Some("no labs"));
    }

    #[test]
    fn test_current_state_respects_clock() {
        let start = at("2021-03-01T08:00:00Z");
        let mut driver = Driver::in_memory("A1", "admissions", Clock::Fixed(start)).unwrap();
        driver.store_state("location", "ED", Some("admission"), None).unwrap();
        *driver.clock_mut() = Clock::Fixed(start + Duration::hours(2));
        driver.store_state("location", "ITU", Some("itu"), None).unwrap();

        *driver.clock_mut() = Clock::Fixed(start + Duration::hours(1));
        assert_eq!(driver.current_state("location").unwrap().unwrap().state, "ED");
        assert_eq!(driver.current_states().unwrap()["location"].state, "ITU");
        assert_eq!(driver.all_states().unwrap().len(), 2);
    }

    #[test]
    fn test_broker_round_trip_and_completion() {
        let mut driver = Driver::in_memory("A1", "admissions", Clock::Local).unwrap();
        driver
            .store_data_in_broker("outcome:check", &json!({"value": 1}), None)
            .unwrap();
        assert_eq!(
            driver.get_broker_data("outcome:check").unwrap(),
            Some(json!({"value": 1}))
        );
        driver.complete_journey().unwrap();
        assert!(driver.journey().complete);
        let stored = driver
            .client()
            .get_journey("A1", "admissions")
            .unwrap()
            .unwrap();
        assert!(stored.complete);
    }
}
