//! Step definitions and the per-step state machine.
//!
//! A fresh attempt is recorded as INIT, then ends as COMPLETE (outcome
//! determined), WAITING (data not available yet) or ERROR (data invalid).
//! Failure hooks may substitute an outcome, which is then recorded as
//! COMPLETE with the original failure kept in `status_info`.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use waypoint_core::StepStatus;

use crate::action::{Action, ActionEvent, Hook};
use crate::algorithm::Algorithm;
use crate::decision::{BinaryDecision, Decision};
use crate::driver::Driver;
use crate::error::{EngineResult, StepError};
use crate::outcome::Outcome;
use crate::plan::Plan;
use crate::types::{is_empty_data, Record};

/// Name of a step, resolved against the owning [`Plan`] when followed.
/// Steps may reference steps that are added to the plan later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepRef(String);

impl StepRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn to_name(&self) -> String {
        self.0.clone()
    }
}

impl From<&str> for StepRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub enum StepKind {
    /// Entry point of the plan.
    Start { next_step: StepRef },
    /// Optional data retrieval, then straight on to `next_step`.
    Pre { next_step: StepRef },
    Algorithm {
        algorithm: Arc<dyn Algorithm>,
        decision: Decision,
    },
    /// Stops the run; the next run continues at `next_step`.
    Pause { next_step: StepRef },
    End,
    /// Evaluated on every run before resumption. Only a positive result
    /// redirects; missing or invalid data is ignored.
    CheckEnd {
        algorithm: Arc<dyn Algorithm>,
        decision: Decision,
    },
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub title: String,
    pub kind: StepKind,
    /// Name of the source in the plan's catalog.
    pub source: Option<String>,
    pub actions: Vec<Action>,
}

impl Step {
    fn new(name: impl Into<String>, title: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            kind,
            source: None,
            actions: Vec::new(),
        }
    }

    pub fn start(name: impl Into<String>, title: impl Into<String>, next_step: StepRef) -> Self {
        Self::new(name, title, StepKind::Start { next_step })
    }

    pub fn pre(name: impl Into<String>, title: impl Into<String>, next_step: StepRef) -> Self {
        Self::new(name, title, StepKind::Pre { next_step })
    }

    pub fn algorithm(
        name: impl Into<String>,
        title: impl Into<String>,
        algorithm: Arc<dyn Algorithm>,
        decision: Decision,
    ) -> Self {
        Self::new(name, title, StepKind::Algorithm { algorithm, decision })
    }

    pub fn pause(name: impl Into<String>, title: impl Into<String>, next_step: StepRef) -> Self {
        Self::new(name, title, StepKind::Pause { next_step })
    }

    /// End step; completing the journey is attached as its first action.
    pub fn end(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(name, title, StepKind::End).with_action(Action::CompleteJourney)
    }

    pub fn check_end(
        name: impl Into<String>,
        title: impl Into<String>,
        algorithm: Arc<dyn Algorithm>,
        true_step: StepRef,
    ) -> Self {
        let decision = Decision::Binary(BinaryDecision::new(true_step, None));
        Self::new(name, title, StepKind::CheckEnd { algorithm, decision })
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn is_start(&self) -> bool {
        matches!(self.kind, StepKind::Start { .. })
    }

    pub fn is_check(&self) -> bool {
        matches!(self.kind, StepKind::CheckEnd { .. })
    }

    /// Reason label to candidate next step.
    pub fn possible_links(&self) -> Vec<(String, Option<StepRef>)> {
        match &self.kind {
            StepKind::Start { next_step }
            | StepKind::Pre { next_step }
            | StepKind::Pause { next_step } => vec![("next".into(), Some(next_step.clone()))],
            StepKind::Algorithm { decision, .. } | StepKind::CheckEnd { decision, .. } => {
                decision.possible_links()
            }
            StepKind::End => Vec::new(),
        }
    }

    /// Every step this one can route to, including through its actions.
    pub fn referenced_steps(&self) -> Vec<StepRef> {
        let mut refs: Vec<StepRef> = self
            .possible_links()
            .into_iter()
            .filter_map(|(_, step)| step)
            .collect();
        refs.extend(self.actions.iter().filter_map(Action::next_step).cloned());
        refs
    }

    /// Run a fresh attempt: before-run hooks, INIT, then the step logic.
    pub fn run(
        &self,
        plan: &Plan,
        driver: &mut Driver,
        previous: Option<&Outcome>,
    ) -> EngineResult<Outcome> {
        if self.is_check() {
            return self.run_check(plan, driver);
        }

        let mut event = ActionEvent::new(self, driver, previous);
        self.fire(Hook::BeforeRun, &mut event)?;
        event
            .driver
            .store_step(&self.name, StepStatus::Init, None, None)?;
        self.run_step_logic(plan, &mut event)
    }

    /// Re-attempt a WAITING step without recording a new INIT.
    pub(crate) fn resume(&self, plan: &Plan, driver: &mut Driver) -> EngineResult<Outcome> {
        let mut event = ActionEvent::new(self, driver, None);
        self.run_step_logic(plan, &mut event)
    }

    fn run_step_logic(&self, plan: &Plan, event: &mut ActionEvent<'_>) -> EngineResult<Outcome> {
        match self.determine_outcome(plan, event) {
            Ok(outcome) => {
                event
                    .driver
                    .store_step(&self.name, StepStatus::Complete, None, Some(&outcome))?;
                event.outcome = Some(outcome.clone());
                self.fire(Hook::AfterRun, event)?;
                Ok(outcome)
            }
            Err(StepError::Engine(e)) => Err(e),
            Err(err @ StepError::DataNotAvailable { .. }) => {
                let reason = err.to_string();
                warn!(
                    journey = %event.driver.reference(),
                    step = %self.name,
                    "Step data not available [status:WAITING]"
                );
                event
                    .driver
                    .store_step(&self.name, StepStatus::Waiting, Some(&reason), None)?;
                metrics::counter!("journey.step.waiting").increment(1);

                self.fire(Hook::MissingData, event)?;
                match event.outcome.take() {
                    Some(substitute) => self.complete_substitute(event, substitute, &reason),
                    None => Ok(Outcome::missing_data(&self.name, reason)),
                }
            }
            Err(err @ StepError::InvalidData { .. }) => {
                let reason = err.to_string();
                self.fire(Hook::InvalidData, event)?;
                if let Some(substitute) = event.outcome.take() {
                    return self.complete_substitute(event, substitute, &reason);
                }

                warn!(
                    journey = %event.driver.reference(),
                    step = %self.name,
                    reason = %reason,
                    "Step data invalid [status:ERROR]"
                );
                event
                    .driver
                    .store_step(&self.name, StepStatus::Error, Some(&reason), None)?;
                metrics::counter!("journey.step.error").increment(1);
                Ok(Outcome::invalid_data(&self.name, reason))
            }
        }
    }

    fn complete_substitute(
        &self,
        event: &mut ActionEvent<'_>,
        outcome: Outcome,
        reason: &str,
    ) -> EngineResult<Outcome> {
        info!(
            journey = %event.driver.reference(),
            step = %self.name,
            next_step = ?outcome.next_step(),
            "Failed step replaced by substitute outcome"
        );
        event
            .driver
            .store_step(&self.name, StepStatus::Complete, Some(reason), Some(&outcome))?;
        Ok(outcome)
    }

    fn run_check(&self, plan: &Plan, driver: &mut Driver) -> EngineResult<Outcome> {
        let mut event = ActionEvent::new(self, driver, None);
        self.fire(Hook::BeforeRun, &mut event)?;

        match self.determine_outcome(plan, &mut event) {
            Ok(outcome) => {
                event.outcome = Some(outcome.clone());
                self.fire(Hook::AfterRun, &mut event)?;
                if outcome.next_step().is_some() {
                    event
                        .driver
                        .store_step(&self.name, StepStatus::Complete, None, Some(&outcome))?;
                }
                Ok(outcome)
            }
            Err(StepError::Engine(e)) => Err(e),
            Err(err @ StepError::DataNotAvailable { .. }) => {
                debug!(step = %self.name, "Check step has no data");
                Ok(Outcome::missing_data(&self.name, err.to_string()))
            }
            Err(err @ StepError::InvalidData { .. }) => {
                debug!(step = %self.name, reason = %err, "Check step data invalid");
                Ok(Outcome::invalid_data(&self.name, err.to_string()))
            }
        }
    }

    fn determine_outcome(
        &self,
        plan: &Plan,
        event: &mut ActionEvent<'_>,
    ) -> Result<Outcome, StepError> {
        match &self.kind {
            StepKind::Start { next_step } | StepKind::Pre { next_step } => {
                let data = match self.source {
                    Some(_) => Some(self.retrieve_data(plan, event)?),
                    None => None,
                };
                Ok(Outcome::next(&self.name, next_step.to_name(), "next", data))
            }
            StepKind::Algorithm {
                algorithm,
                decision,
            }
            | StepKind::CheckEnd {
                algorithm,
                decision,
            } => self.decide(plan, event, algorithm.as_ref(), decision),
            StepKind::Pause { next_step } => {
                event.driver.store_step(
                    &self.name,
                    StepStatus::Pause,
                    Some("Paused for next time transition"),
                    None,
                )?;
                Ok(Outcome::pause(&self.name, next_step.to_name()))
            }
            StepKind::End => Ok(Outcome::end(&self.name)),
        }
    }

    fn decide(
        &self,
        plan: &Plan,
        event: &mut ActionEvent<'_>,
        algorithm: &dyn Algorithm,
        decision: &Decision,
    ) -> Result<Outcome, StepError> {
        let data = self.retrieve_data(plan, event)?;
        let record = match data {
            Value::Object(map) => map,
            other => {
                let mut record = Record::new();
                record.insert("data".into(), other);
                record
            }
        };

        let dataset = algorithm
            .create_input_dataset(record)
            .map_err(|e| StepError::invalid(&self.name, e))?;
        let result = algorithm
            .single_result(&dataset)
            .map_err(|e| StepError::invalid(&self.name, e))?;
        decision
            .decide_outcome(result, None, &dataset, &self.name)
            .map_err(|e| StepError::invalid(&self.name, e))
    }

    fn retrieve_data(&self, plan: &Plan, event: &mut ActionEvent<'_>) -> Result<Value, StepError> {
        let name = self
            .source
            .as_deref()
            .ok_or_else(|| StepError::invalid(&self.name, "no source specified"))?;
        let source = plan.source(name)?;
        let data = source.retrieve(&*event.driver, &self.name)?;

        event.data = Some(data);
        self.fire(Hook::AfterData, event)?;
        event
            .data
            .clone()
            .filter(|data| !is_empty_data(data))
            .ok_or_else(|| StepError::not_available(&self.name))
    }

    fn fire(&self, hook: Hook, event: &mut ActionEvent<'_>) -> EngineResult<()> {
        for action in &self.actions {
            action.fire(hook, event)?;
        }
        Ok(())
    }
}
