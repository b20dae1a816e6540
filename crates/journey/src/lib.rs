//! Journey orchestration: a graph of steps that pull data from sources, feed
//! it through algorithms and decisions, and persist every attempt through a
//! [`Driver`] so a run can stop at any step and resume later.

#![warn(clippy::unwrap_used)]

pub mod action;
pub mod algorithm;
pub mod cache;
pub mod clock;
pub mod decision;
pub mod driver;
pub mod error;
pub mod expression;
pub mod outcome;
pub mod plan;
pub mod process;
pub mod simulation;
pub mod source;
pub mod step;
pub mod types;
pub mod worker;

pub use action::{Action, ActionEvent, Hook, StepHook};
pub use algorithm::{
    Algorithm, AlgorithmResult, ExpressionAlgorithm, Factor, ScoreAlgorithm, ScoreRange,
};
pub use clock::{Clock, HourlyClock};
pub use decision::{BinaryDecision, Decision, DecisionCase};
pub use driver::Driver;
pub use error::{EngineError, EngineResult, StepError};
pub use expression::{Expression, Operator};
pub use outcome::{is_successful_outcome, Outcome, OutcomeKind};
pub use plan::{Plan, RunStatus};
pub use process::Process;
pub use simulation::{JourneyReplay, Simulation, SimulationEntry};
pub use source::{DbSource, Source, SourceKind, TableSource, TimeBasedSource};
pub use step::{Step, StepKind, StepRef};
pub use types::Record;
pub use worker::JourneyWorker;
