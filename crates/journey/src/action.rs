//! Callbacks attached to steps and fired at fixed points of a step attempt.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use waypoint_core::codec::encode_datetime;
use waypoint_core::Channel;

use crate::algorithm::AlgorithmResult;
use crate::driver::Driver;
use crate::error::EngineResult;
use crate::outcome::Outcome;
use crate::step::{Step, StepRef};
use crate::types::Record;

/// Point in a step attempt at which actions fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    BeforeRun,
    AfterData,
    AfterRun,
    MissingData,
    InvalidData,
}

/// Mutable view of a step attempt handed to actions. Setting `outcome`
/// from a `missing_data` or `invalid_data` hook substitutes the failure.
pub struct ActionEvent<'a> {
    pub step: &'a Step,
    pub driver: &'a mut Driver,
    pub previous_outcome: Option<&'a Outcome>,
    pub data: Option<Value>,
    pub outcome: Option<Outcome>,
}

impl<'a> ActionEvent<'a> {
    pub fn new(step: &'a Step, driver: &'a mut Driver, previous_outcome: Option<&'a Outcome>) -> Self {
        Self {
            step,
            driver,
            previous_outcome,
            data: None,
            outcome: None,
        }
    }
}

/// User supplied action. Every hook defaults to a no-op.
pub trait StepHook: Send + Sync {
    fn before_run(&self, _event: &mut ActionEvent<'_>) -> EngineResult<()> {
        Ok(())
    }

    fn after_data(&self, _event: &mut ActionEvent<'_>) -> EngineResult<()> {
        Ok(())
    }

    fn after_run(&self, _event: &mut ActionEvent<'_>) -> EngineResult<()> {
        Ok(())
    }

    fn missing_data(&self, _event: &mut ActionEvent<'_>) -> EngineResult<()> {
        Ok(())
    }

    fn invalid_data(&self, _event: &mut ActionEvent<'_>) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub enum Action {
    /// After a run, store input data, result and context in the broker
    /// under `outcome:{step}`, optionally publishing on the external channel.
    /// A non-empty `decision_steps` restricts this to outcomes routing there.
    ResultStore {
        decision_steps: Vec<String>,
        send_message: bool,
    },
    CompleteJourney,
    /// Copy the previous outcome's value into the retrieved data.
    PassPreviousResult { as_field: String },
    /// Append a state once the step has run.
    PreRunState { label: String, state: String },
    /// Replace missing data with a result outcome carrying `default_value`.
    IgnoreMissingData {
        default_value: Value,
        next_step: StepRef,
    },
    /// As `IgnoreMissingData`, stamping the clock time into `timestamp_field`.
    IgnoreMissingTimebasedData {
        default_value: Record,
        next_step: StepRef,
        timestamp_field: String,
    },
    Custom(Arc<dyn StepHook>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ResultStore {
                decision_steps,
                send_message,
            } => f
                .debug_struct("ResultStore")
                .field("decision_steps", decision_steps)
                .field("send_message", send_message)
                .finish(),
            Action::CompleteJourney => f.write_str("CompleteJourney"),
            Action::PassPreviousResult { as_field } => f
                .debug_struct("PassPreviousResult")
                .field("as_field", as_field)
                .finish(),
            Action::PreRunState { label, state } => f
                .debug_struct("PreRunState")
                .field("label", label)
                .field("state", state)
                .finish(),
            Action::IgnoreMissingData { next_step, .. } => f
                .debug_struct("IgnoreMissingData")
                .field("next_step", next_step)
                .finish(),
            Action::IgnoreMissingTimebasedData {
                next_step,
                timestamp_field,
                ..
            } => f
                .debug_struct("IgnoreMissingTimebasedData")
                .field("next_step", next_step)
                .field("timestamp_field", timestamp_field)
                .finish(),
            Action::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Action {
    pub fn custom(hook: impl StepHook + 'static) -> Self {
        Action::Custom(Arc::new(hook))
    }

    /// Step that a substituted outcome routes to, if any.
    pub fn next_step(&self) -> Option<&StepRef> {
        match self {
            Action::IgnoreMissingData { next_step, .. }
            | Action::IgnoreMissingTimebasedData { next_step, .. } => Some(next_step),
            _ => None,
        }
    }

    pub fn fire(&self, hook: Hook, event: &mut ActionEvent<'_>) -> EngineResult<()> {
        match (self, hook) {
            (Action::Custom(custom), hook) => match hook {
                Hook::BeforeRun => custom.before_run(event),
                Hook::AfterData => custom.after_data(event),
                Hook::AfterRun => custom.after_run(event),
                Hook::MissingData => custom.missing_data(event),
                Hook::InvalidData => custom.invalid_data(event),
            },
            (
                Action::ResultStore {
                    decision_steps,
                    send_message,
                },
                Hook::AfterRun,
            ) => store_result(event, decision_steps, *send_message),
            (Action::CompleteJourney, Hook::AfterRun) => event.driver.complete_journey(),
            (Action::PassPreviousResult { as_field }, Hook::AfterData) => {
                if let (Some(previous), Some(Value::Object(data))) =
                    (event.previous_outcome, event.data.as_mut())
                {
                    data.insert(
                        as_field.clone(),
                        previous.value().cloned().unwrap_or(Value::Null),
                    );
                }
                Ok(())
            }
            (Action::PreRunState { label, state }, Hook::AfterRun) => {
                event
                    .driver
                    .store_state(label, state, Some(&event.step.name), None)
            }
            (
                Action::IgnoreMissingData {
                    default_value,
                    next_step,
                },
                Hook::MissingData,
            ) => {
                let outcome = default_outcome(event, default_value.clone(), next_step);
                event.outcome = Some(outcome);
                Ok(())
            }
            (
                Action::IgnoreMissingTimebasedData {
                    default_value,
                    next_step,
                    timestamp_field,
                },
                Hook::MissingData,
            ) => {
                let mut values = default_value.clone();
                values.insert(
                    timestamp_field.clone(),
                    encode_datetime(&event.driver.timestamp()),
                );
                let outcome = default_outcome(event, Value::Object(values), next_step);
                event.outcome = Some(outcome);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn default_outcome(event: &ActionEvent<'_>, value: Value, next_step: &StepRef) -> Outcome {
    let data = match &value {
        Value::Object(map) => map.clone(),
        _ => Record::new(),
    };
    let result = AlgorithmResult::new(Value::Null)
        .with_label("Default result")
        .with_data(data);
    Outcome::result(
        event.step.name.clone(),
        Some(next_step.to_name()),
        "Missing data",
        value,
        result,
    )
    .with_input_data(event.data.clone())
}

fn store_result(
    event: &mut ActionEvent<'_>,
    decision_steps: &[String],
    send_message: bool,
) -> EngineResult<()> {
    let Some(outcome) = event.outcome.as_ref() else {
        return Ok(());
    };
    if !decision_steps.is_empty() {
        let routed = outcome
            .next_step()
            .map(|next| decision_steps.iter().any(|step| step == next))
            .unwrap_or(false);
        if !routed {
            return Ok(());
        }
    }

    let mut data = match outcome.input_data() {
        Some(Value::Object(map)) => map.clone(),
        _ => Record::new(),
    };
    data.insert(
        "result".into(),
        outcome
            .algorithm_result()
            .map(AlgorithmResult::to_value)
            .unwrap_or(Value::Null),
    );
    data.insert(
        "context".into(),
        outcome.context().cloned().unwrap_or(Value::Null),
    );

    let data_type = format!("outcome:{}", outcome.outcome_step());
    debug!(journey = %event.driver.reference(), data_type = %data_type, "Store outcome in broker");
    let publish = send_message.then_some(Channel::External);
    event
        .driver
        .store_data_in_broker(&data_type, &Value::Object(data), publish)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use serde_json::json;
    use waypoint_core::codec::decode_datetime;

    fn driver() -> Driver {
        let ts = DateTime::parse_from_rfc3339("2021-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Driver::in_memory("A1", "admissions", Clock::Fixed(ts)).unwrap()
    }

    fn step() -> Step {
        Step::pre("obs", "Observations", StepRef::new("check"))
    }

    fn result_outcome(next: &str) -> Outcome {
        Outcome::result(
            "check",
            Some(next.into()),
            "positive",
            json!(1),
            AlgorithmResult::new(json!(1)),
        )
        .with_input_data(Some(json!({"systolic_bp": 92})))
    }

    #[test]
    fn test_result_store_filters_on_decision_steps() {
        let step = step();
        let mut driver = driver();
        let action = Action::ResultStore {
            decision_steps: vec!["itu".into()],
            send_message: false,
        };

        let mut event = ActionEvent::new(&step, &mut driver, None);
        event.outcome = Some(result_outcome("discharge"));
        action.fire(Hook::AfterRun, &mut event).unwrap();
        assert!(event.driver.get_broker_data("outcome:check").unwrap().is_none());

        event.outcome = Some(result_outcome("itu"));
        action.fire(Hook::AfterRun, &mut event).unwrap();
        let stored = event.driver.get_broker_data("outcome:check").unwrap().unwrap();
        assert_eq!(stored["systolic_bp"], json!(92));
        assert_eq!(stored["result"]["value"], json!(1));
        assert_eq!(stored["context"], Value::Null);
    }

    #[test]
    fn test_pass_previous_result_sets_field() {
        let step = step();
        let mut driver = driver();
        let previous = result_outcome("itu");
        let mut event = ActionEvent::new(&step, &mut driver, Some(&previous));
        event.data = Some(json!({"hr": 80}));
        Action::PassPreviousResult {
            as_field: "bp_flag".into(),
        }
        .fire(Hook::AfterData, &mut event)
        .unwrap();
        assert_eq!(event.data.unwrap()["bp_flag"], json!(1));
    }

    #[test]
    fn test_ignore_missing_timebased_data_stamps_clock() {
        let step = step();
        let mut driver = driver();
        let mut event = ActionEvent::new(&step, &mut driver, None);
        Action::IgnoreMissingTimebasedData {
            default_value: json!({"news": 0}).as_object().cloned().unwrap(),
            next_step: StepRef::new("check"),
            timestamp_field: "ts".into(),
        }
        .fire(Hook::MissingData, &mut event)
        .unwrap();
        let outcome = event.outcome.unwrap();
        assert_eq!(outcome.reason(), Some("Missing data"));
        assert_eq!(outcome.next_step(), Some("check"));
        let value = outcome.value().unwrap();
        assert_eq!(value["news"], json!(0));
        assert_eq!(
            decode_datetime(&value["ts"]).unwrap().to_rfc3339(),
            "2021-03-01T10:00:00+00:00"
        );
    }

    #[test]
    fn test_actions_ignore_other_hooks() {
        let step = step();
        let mut driver = driver();
        let mut event = ActionEvent::new(&step, &mut driver, None);
        Action::CompleteJourney
            .fire(Hook::BeforeRun, &mut event)
            .unwrap();
        assert!(!event.driver.journey().complete);
        Action::CompleteJourney.fire(Hook::AfterRun, &mut event).unwrap();
        assert!(event.driver.journey().complete);
    }

    struct Recorder(Mutex<Vec<Hook>>);

    impl StepHook for Recorder {
        fn before_run(&self, _event: &mut ActionEvent<'_>) -> EngineResult<()> {
            self.0.lock().push(Hook::BeforeRun);
            Ok(())
        }

        fn invalid_data(&self, _event: &mut ActionEvent<'_>) -> EngineResult<()> {
            self.0.lock().push(Hook::InvalidData);
            Ok(())
        }
    }

    #[test]
    fn test_custom_hook_dispatch() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let action = Action::Custom(recorder.clone());
        let step = step();
        let mut driver = driver();
        let mut event = ActionEvent::new(&step, &mut driver, None);
        for hook in [Hook::BeforeRun, Hook::AfterRun, Hook::InvalidData] {
            action.fire(hook, &mut event).unwrap();
        }
        assert_eq!(*recorder.0.lock(), vec![Hook::BeforeRun, Hook::InvalidData]);
    }
}
