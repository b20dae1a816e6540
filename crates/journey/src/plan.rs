use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use waypoint_core::StepStatus;

use crate::driver::Driver;
use crate::error::{EngineError, EngineResult};
use crate::outcome::{Outcome, OutcomeKind};
use crate::source::{Source, SourceKind};
use crate::step::{Step, StepRef};

/// Upper bound on steps evaluated in one run; a cyclic graph without a
/// pause would otherwise never return.
const MAX_CHAIN_STEPS: usize = 1000;

/// Where a call to [`Plan::run`] stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing to do, the journey was complete before the run.
    AlreadyComplete,
    Completed,
    /// A pause step was reached; the next run continues after it.
    Paused { step: String },
    /// Data not available yet; the step is WAITING.
    Waiting { step: String, reason: String },
    /// Data invalid; the step is in ERROR.
    Invalid { step: String, reason: String },
    /// Latest step has a status the run-loop does not resume from.
    Halted { step: String, status: StepStatus },
    /// A successful outcome without a next step on an incomplete journey.
    Stopped { step: String },
}

impl RunStatus {
    /// Whether the journey can still make progress on a later run.
    pub fn is_blocked(&self) -> bool {
        matches!(self, RunStatus::Waiting { .. } | RunStatus::Invalid { .. })
    }
}

/// A journey graph: steps stored in insertion order and indexed by name,
/// plus the catalog of named sources they read from.
#[derive(Clone)]
pub struct Plan {
    pub title: String,
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    sources: HashMap<String, Source>,
    watch_messages: HashSet<String>,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("title", &self.title)
            .field("steps", &self.steps.len())
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl Plan {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            steps: Vec::new(),
            index: HashMap::new(),
            sources: HashMap::new(),
            watch_messages: HashSet::new(),
        }
    }

    /// Add a step, replacing any step with the same name in place.
    pub fn add_step(&mut self, step: Step) -> &mut Self {
        match self.index.get(&step.name) {
            Some(&idx) => self.steps[idx] = step,
            None => {
                self.index.insert(step.name.clone(), self.steps.len());
                self.steps.push(step);
            }
        }
        self
    }

    pub fn add_source(&mut self, name: impl Into<String>, source: Source) -> &mut Self {
        self.sources.insert(name.into(), source);
        self
    }

    /// Swap the data behind a named source, keeping its title and processes.
    pub fn replace_source(&mut self, name: &str, kind: SourceKind) -> EngineResult<()> {
        let source = self
            .sources
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownSource(name.to_string()))?;
        debug!(source = %name, "Replace source");
        source.kind = kind;
        Ok(())
    }

    /// Replace a named source with fixed data for a single reference.
    pub fn replace_source_data(&mut self, name: &str, reference: &str, data: Value) -> EngineResult<()> {
        let values = HashMap::from([(reference.to_string(), data)]);
        self.replace_source(name, SourceKind::Static(values))
    }

    /// Replace one part of a collated source with fixed data for a reference.
    pub fn replace_collated_part(
        &mut self,
        name: &str,
        part: &str,
        reference: &str,
        data: Value,
    ) -> EngineResult<()> {
        let source = self
            .sources
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownSource(name.to_string()))?;
        let SourceKind::Collated(parts) = &mut source.kind else {
            return Err(EngineError::Config(format!(
                "Source '{name}' is not a collated source"
            )));
        };
        let (_, sub_source) = parts
            .iter_mut()
            .find(|(part_name, _)| part_name == part)
            .ok_or_else(|| EngineError::UnknownSource(format!("{name}.{part}")))?;
        sub_source.kind = SourceKind::Static(HashMap::from([(reference.to_string(), data)]));
        Ok(())
    }

    /// Message data types that restart the run at the step of the same name.
    pub fn watch_message(&mut self, data_type: impl Into<String>) -> &mut Self {
        self.watch_messages.insert(data_type.into());
        self
    }

    pub fn watches(&self, data_type: &str) -> bool {
        self.watch_messages.contains(data_type)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> EngineResult<&Step> {
        self.index
            .get(name)
            .map(|&idx| &self.steps[idx])
            .ok_or_else(|| EngineError::UnknownStep(name.to_string()))
    }

    pub fn resolve(&self, step: &StepRef) -> EngineResult<&Step> {
        self.step(step.name())
    }

    pub fn source(&self, name: &str) -> EngineResult<&Source> {
        self.sources
            .get(name)
            .ok_or_else(|| EngineError::UnknownSource(name.to_string()))
    }

    /// The single entry step.
    pub fn start_step(&self) -> EngineResult<&Step> {
        let mut starts = self.steps.iter().filter(|step| step.is_start());
        match (starts.next(), starts.next()) {
            (Some(step), None) => Ok(step),
            (None, _) => Err(EngineError::Config(format!(
                "Plan '{}' has no start step",
                self.title
            ))),
            (Some(_), Some(_)) => Err(EngineError::Config(format!(
                "Plan '{}' has more than one start step",
                self.title
            ))),
        }
    }

    pub fn check_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|step| step.is_check())
    }

    /// Reason label to next step name for every step in the plan.
    pub fn possible_links(&self) -> Vec<(String, Vec<(String, Option<String>)>)> {
        self.steps
            .iter()
            .map(|step| {
                let links = step
                    .possible_links()
                    .into_iter()
                    .map(|(reason, next)| (reason, next.as_ref().map(StepRef::to_name)))
                    .collect();
                (step.name.clone(), links)
            })
            .collect()
    }

    /// Check the graph is runnable: exactly one start step, and every step
    /// or source referenced by name is present.
    pub fn validate(&self) -> EngineResult<()> {
        self.start_step()?;
        for step in &self.steps {
            for next in step.referenced_steps() {
                if !self.index.contains_key(next.name()) {
                    return Err(EngineError::UnknownStep(format!(
                        "{} (linked from {})",
                        next.name(),
                        step.name
                    )));
                }
            }
            if let Some(source) = &step.source {
                if !self.sources.contains_key(source) {
                    return Err(EngineError::UnknownSource(format!(
                        "{source} (used by {})",
                        step.name
                    )));
                }
            }
        }
        for data_type in &self.watch_messages {
            if !self.index.contains_key(data_type) {
                return Err(EngineError::UnknownStep(format!(
                    "{data_type} (watched message)"
                )));
            }
        }
        Ok(())
    }

    /// Work out where the journey is and drive the step chain from there.
    pub fn run(&self, driver: &mut Driver) -> EngineResult<RunStatus> {
        driver.begin_run();
        if driver.journey().complete {
            info!(journey = %driver.reference(), "Journey is already complete");
            return Ok(RunStatus::AlreadyComplete);
        }

        for check in self.check_steps() {
            check.run(self, driver, None)?;
        }

        let Some(current) = driver.get_current_journey_step()? else {
            let start = self.start_step()?;
            return self.run_chain(start, driver, None);
        };

        let step = self.step(&current.name)?;
        match current.status {
            StepStatus::Waiting => {
                debug!(journey = %driver.reference(), step = %step.name, "Retry waiting step");
                let outcome = step.resume(self, driver)?;
                match self.next_in_chain(step, &outcome, driver)? {
                    Ok(next) => self.run_chain(next, driver, Some(outcome)),
                    Err(status) => Ok(status),
                }
            }
            StepStatus::Complete => {
                let next = match (&current.outcome, &current.next_step) {
                    (Some(_), Some(next)) => Some(next.as_str()),
                    (Some(_), None) => {
                        warn!(journey = %driver.reference(), "No next step in journey from previous outcome");
                        None
                    }
                    (None, _) => None,
                };
                match next {
                    Some(name) => self.run_chain(self.step(name)?, driver, None),
                    None => {
                        driver.complete_journey()?;
                        Ok(RunStatus::Completed)
                    }
                }
            }
            status => {
                info!(
                    journey = %driver.reference(),
                    step = %current.name,
                    status = %status,
                    "Latest step is not resumable"
                );
                Ok(RunStatus::Halted {
                    step: current.name,
                    status,
                })
            }
        }
    }

    /// Drive the chain from a named step regardless of the recorded position.
    pub fn run_from(&self, step_name: &str, driver: &mut Driver) -> EngineResult<RunStatus> {
        let step = self.step(step_name)?;
        driver.begin_run();
        self.run_chain(step, driver, None)
    }

    fn run_chain<'p>(
        &'p self,
        first: &'p Step,
        driver: &mut Driver,
        mut previous: Option<Outcome>,
    ) -> EngineResult<RunStatus> {
        let mut step = first;
        for _ in 0..MAX_CHAIN_STEPS {
            let outcome = step.run(self, driver, previous.as_ref())?;
            match self.next_in_chain(step, &outcome, driver)? {
                Ok(next) => {
                    step = next;
                    previous = Some(outcome);
                }
                Err(status) => return Ok(status),
            }
        }
        Err(EngineError::Config(format!(
            "Plan '{}' ran more than {MAX_CHAIN_STEPS} steps without stopping",
            self.title
        )))
    }

    /// The step to evaluate next, or the status the run stops with.
    fn next_in_chain<'p>(
        &'p self,
        step: &Step,
        outcome: &Outcome,
        driver: &Driver,
    ) -> EngineResult<Result<&'p Step, RunStatus>> {
        let reason = || outcome.reason().unwrap_or_default().to_string();
        match outcome.kind() {
            OutcomeKind::MissingData => {
                return Ok(Err(RunStatus::Waiting {
                    step: step.name.clone(),
                    reason: reason(),
                }))
            }
            OutcomeKind::InvalidData => {
                return Ok(Err(RunStatus::Invalid {
                    step: step.name.clone(),
                    reason: reason(),
                }))
            }
            _ => {}
        }

        let Some(next) = outcome.next_step() else {
            if driver.journey().complete {
                return Ok(Err(RunStatus::Completed));
            }
            error!(
                journey = %driver.reference(),
                step = %step.name,
                "Journey is not marked complete, but no next step was obtained from latest step"
            );
            return Ok(Err(RunStatus::Stopped {
                step: step.name.clone(),
            }));
        };

        if outcome.is_pause() {
            info!(journey = %driver.reference(), step = %step.name, next_step = %next, "Journey paused");
            return Ok(Err(RunStatus::Paused {
                step: step.name.clone(),
            }));
        }

        self.step(next).map(Ok)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::algorithm::ExpressionAlgorithm;
    use crate::clock::Clock;
    use crate::decision::Decision;
    use crate::expression::{Expression, Operator};
    use serde_json::json;

    fn bp_plan() -> Plan {
        let mut plan = Plan::new("Admission");
        plan.add_step(Step::start("admission", "Admission", StepRef::new("bp_check")))
            .add_step(
                Step::algorithm(
                    "bp_check",
                    "BP check",
                    Arc::new(ExpressionAlgorithm::new(
                        "BP over 90",
                        Expression::compare("systolic_bp", Operator::Gt, json!(90)),
                    )),
                    Decision::binary(StepRef::new("itu"), StepRef::new("discharge")),
                )
                .with_source("obs"),
            )
            .add_step(Step::end("itu", "ITU"))
            .add_step(Step::end("discharge", "Discharge"))
            .add_source("obs", Source::broker("Observations", "obs"));
        plan
    }

    #[test]
    fn test_validate_accepts_complete_graph() {
        bp_plan().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_links_and_sources() {
        let mut plan = bp_plan();
        plan.add_step(Step::pre("extra", "Extra", StepRef::new("missing")));
        assert!(matches!(plan.validate(), Err(EngineError::UnknownStep(_))));

        let mut plan = bp_plan();
        plan.add_step(Step::pre("extra", "Extra", StepRef::new("itu")).with_source("labs"));
        assert!(matches!(plan.validate(), Err(EngineError::UnknownSource(_))));
    }

    #[test]
    fn test_multiple_start_steps_rejected() {
        let mut plan = bp_plan();
        plan.add_step(Step::start("second", "Second", StepRef::new("itu")));
        assert!(matches!(plan.validate(), Err(EngineError::Config(_))));
        assert!(Plan::new("empty").start_step().is_err());
    }

    #[test]
    fn test_add_step_replaces_same_name() {
        let mut plan = bp_plan();
        plan.add_step(Step::pre("itu", "ITU review", StepRef::new("discharge")));
        assert_eq!(plan.steps().len(), 4);
        assert_eq!(plan.step("itu").unwrap().title, "ITU review");
    }

    #[test]
    fn test_replace_source_keeps_processes_and_rejects_unknown() {
        let mut plan = bp_plan();
        plan.replace_source_data("obs", "A1", json!({"systolic_bp": 95}))
            .unwrap();
        assert_eq!(plan.source("obs").unwrap().title, "Observations");
        assert!(matches!(
            plan.replace_source_data("labs", "A1", json!({})),
            Err(EngineError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_run_waits_then_resumes() {
        let mut plan = bp_plan();
        let mut driver = Driver::in_memory("A1", "admissions", Clock::Local).unwrap();

        let status = plan.run(&mut driver).unwrap();
        assert!(matches!(status, RunStatus::Waiting { ref step, .. } if step == "bp_check"));
        assert!(status.is_blocked());
        assert_eq!(plan.run(&mut driver).unwrap(), status);

        plan.replace_source_data("obs", "A1", json!({"systolic_bp": 95}))
            .unwrap();
        assert_eq!(plan.run(&mut driver).unwrap(), RunStatus::Completed);
        assert_eq!(
            driver.get_route().unwrap(),
            vec!["admission", "bp_check", "itu"]
        );
        assert_eq!(plan.run(&mut driver).unwrap(), RunStatus::AlreadyComplete);
    }

    #[test]
    fn test_run_halts_on_error_step() {
        let mut plan = bp_plan();
        plan.replace_source_data("obs", "A1", json!({"systolic_bp": null}))
            .unwrap();
        let mut driver = Driver::in_memory("A1", "admissions", Clock::Local).unwrap();
        assert!(matches!(
            plan.run(&mut driver).unwrap(),
            RunStatus::Invalid { .. }
        ));
        assert_eq!(
            plan.run(&mut driver).unwrap(),
            RunStatus::Halted {
                step: "bp_check".into(),
                status: StepStatus::Error
            }
        );
    }

    #[test]
    fn test_run_from_named_step() {
        let mut plan = bp_plan();
        plan.replace_source_data("obs", "A1", json!({"systolic_bp": 80}))
            .unwrap();
        let mut driver = Driver::in_memory("A1", "admissions", Clock::Local).unwrap();
        assert_eq!(
            plan.run_from("bp_check", &mut driver).unwrap(),
            RunStatus::Completed
        );
        assert_eq!(driver.get_route().unwrap(), vec!["bp_check", "discharge"]);
        assert!(plan.run_from("nowhere", &mut driver).is_err());
    }

    #[test]
    fn test_cycle_without_pause_is_bounded() {
        let mut plan = Plan::new("Loop");
        plan.add_step(Step::start("a", "A", StepRef::new("b")))
            .add_step(Step::pre("b", "B", StepRef::new("a")));
        let mut driver = Driver::in_memory("A1", "admissions", Clock::Local).unwrap();
        assert!(matches!(
            plan.run(&mut driver),
            Err(EngineError::Config(_))
        ));
    }
}
