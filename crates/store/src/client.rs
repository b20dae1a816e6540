use std::collections::HashMap;

use chrono::{DateTime, Utc};
use waypoint_core::types::{current_state_of, step_route};
use waypoint_core::{Journey, StateRecord, StateUpdate, StepRecord, StepUpdate};

use crate::error::StoreResult;

/// Journey, step and state persistence.
///
/// Step writes follow [`waypoint_core::StepWrite::plan`]: an unchanged
/// status is a no-op except for WAITING, a non-terminal row is updated in
/// place, and a later attempt at a completed step gets a new row.
pub trait Client: Send + Sync {
    /// Create the journey for `(reference, source)`, or return the existing one.
    fn create_journey(
        &self,
        reference: &str,
        source: &str,
        label: Option<&str>,
    ) -> StoreResult<Journey>;

    fn get_journey(&self, reference: &str, source: &str) -> StoreResult<Option<Journey>>;

    fn get_journey_by_id(&self, journey_id: i64) -> StoreResult<Option<Journey>>;

    fn get_journeys(&self) -> StoreResult<Vec<Journey>>;

    fn complete_journey(&self, journey_id: i64) -> StoreResult<()>;

    /// Append a state to the journey's history.
    fn set_current_state(&self, journey_id: i64, update: StateUpdate) -> StoreResult<()>;

    /// All states in insertion order.
    fn get_all_states(&self, journey_id: i64) -> StoreResult<Vec<StateRecord>>;

    fn set_current_step(&self, journey_id: i64, update: StepUpdate) -> StoreResult<()>;

    /// All step rows in insertion order.
    fn get_steps(&self, journey_id: i64) -> StoreResult<Vec<StepRecord>>;

    /// Most recent state for `label`, bounded by `at` when replaying history.
    fn get_current_state(
        &self,
        journey_id: i64,
        label: &str,
        at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<StateRecord>> {
        Ok(current_state_of(&self.get_all_states(journey_id)?, label, at))
    }

    /// Latest state per label.
    fn get_current_states(&self, journey_id: i64) -> StoreResult<HashMap<String, StateRecord>> {
        let states = self.get_all_states(journey_id)?;
        let mut current = HashMap::new();
        for state in &states {
            if current.contains_key(&state.label) {
                continue;
            }
            if let Some(latest) = current_state_of(&states, &state.label, None) {
                current.insert(state.label.clone(), latest);
            }
        }
        Ok(current)
    }

    /// The row written most recently, which is where a run resumes.
    fn get_latest_step(&self, journey_id: i64) -> StoreResult<Option<StepRecord>> {
        Ok(self.get_steps(journey_id)?.pop())
    }

    fn get_step(&self, journey_id: i64, name: &str) -> StoreResult<Option<StepRecord>> {
        Ok(self
            .get_steps(journey_id)?
            .into_iter()
            .filter(|s| s.name == name)
            .last())
    }

    /// Unique step names in the order they were first reached.
    fn get_step_route(&self, journey_id: i64) -> StoreResult<Vec<String>> {
        Ok(step_route(&self.get_steps(journey_id)?))
    }

    /// Write out anything buffered; returns the number of journeys written.
    fn flush(&self) -> StoreResult<usize> {
        Ok(0)
    }
}
