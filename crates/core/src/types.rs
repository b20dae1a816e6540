use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Lifecycle of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Attempt started.
    Init,
    /// Required data absent; retried on the next run.
    Waiting,
    /// Outcome determined.
    Complete,
    /// Reserved for externally driven long-running steps.
    Pending,
    /// Data invalid; needs operator action.
    Error,
    /// Halted by a pause step until the next time transition.
    Pause,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Init => "INIT",
            StepStatus::Waiting => "WAITING",
            StepStatus::Complete => "COMPLETE",
            StepStatus::Pending => "PENDING",
            StepStatus::Error => "ERROR",
            StepStatus::Pause => "PAUSE",
        }
    }

    /// A completed occurrence is never rewritten by a later attempt at a
    /// different timestamp; the later attempt gets its own row.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Complete)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(StepStatus::Init),
            "WAITING" => Ok(StepStatus::Waiting),
            "COMPLETE" => Ok(StepStatus::Complete),
            "PENDING" => Ok(StepStatus::Pending),
            "ERROR" => Ok(StepStatus::Error),
            "PAUSE" => Ok(StepStatus::Pause),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// One tracked entity moving through a plan, unique per (reference, source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub id: i64,
    pub reference: String,
    pub source: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub complete: bool,
}

/// Persisted outcome of attempting a named step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: i64,
    #[serde(rename = "journey")]
    pub journey_id: i64,
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub status_info: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub outcome: Option<Value>,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One entry in the append-only state history of a journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: i64,
    #[serde(rename = "journey")]
    pub journey_id: i64,
    pub label: String,
    pub state: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub from_step: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A step status write. Outcome-derived columns are filled from the encoded
/// outcome so stores can query them without decoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepUpdate {
    pub name: String,
    pub status: StepStatus,
    pub status_info: Option<String>,
    pub reason: Option<String>,
    pub value: Option<Value>,
    pub result: Option<Value>,
    pub outcome: Option<Value>,
    pub next_step: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StepUpdate {
    pub fn new(name: impl Into<String>, status: StepStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status,
            status_info: None,
            reason: None,
            value: None,
            result: None,
            outcome: None,
            next_step: None,
            timestamp: Some(timestamp),
        }
    }

    pub fn with_status_info(mut self, info: impl Into<String>) -> Self {
        self.status_info = Some(info.into());
        self
    }

    /// Attach an encoded outcome and denormalise `reason`, `value`, `result`
    /// and `next_step` out of it.
    pub fn with_outcome(mut self, outcome: Value) -> Self {
        let field = |key: &str| outcome.get(key).filter(|v| !v.is_null()).cloned();
        self.reason = field("reason").and_then(|v| v.as_str().map(str::to_string));
        self.next_step = field("next_step").and_then(|v| v.as_str().map(str::to_string));
        self.value = field("value");
        self.result = field("result");
        self.outcome = Some(outcome);
        self
    }

    pub fn into_record(self, id: i64, journey_id: i64) -> StepRecord {
        StepRecord {
            id,
            journey_id,
            name: self.name,
            status: self.status,
            status_info: self.status_info,
            reason: self.reason,
            value: self.value,
            result: self.result,
            outcome: self.outcome,
            next_step: self.next_step,
            timestamp: self.timestamp,
        }
    }

    /// Overwrite everything but the identity columns of an existing row.
    pub fn apply_to(self, record: &mut StepRecord) {
        let id = record.id;
        let journey_id = record.journey_id;
        *record = self.into_record(id, journey_id);
    }
}

/// What a store must do with a [`StepUpdate`] given the latest row already
/// stored for the same journey and step name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepWrite {
    Insert,
    Update(i64),
    Skip,
}

impl StepWrite {
    pub fn plan(existing: Option<&StepRecord>, update: &StepUpdate) -> Self {
        let Some(row) = existing else {
            return StepWrite::Insert;
        };

        if row.status == update.status {
            // WAITING rows always refresh their reason and timestamp.
            return if update.status == StepStatus::Waiting {
                StepWrite::Update(row.id)
            } else {
                StepWrite::Skip
            };
        }

        if row.status.is_terminal() && row.timestamp != update.timestamp {
            StepWrite::Insert
        } else {
            StepWrite::Update(row.id)
        }
    }
}

/// A state change to append to a journey's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateUpdate {
    pub label: String,
    pub state: String,
    pub reason: Option<String>,
    pub from_step: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StateUpdate {
    pub fn into_record(self, id: i64, journey_id: i64) -> StateRecord {
        StateRecord {
            id,
            journey_id,
            label: self.label,
            state: self.state,
            reason: self.reason,
            from_step: self.from_step,
            timestamp: self.timestamp,
        }
    }
}

/// Step names ordered by first occurrence in time.
pub fn step_route(steps: &[StepRecord]) -> Vec<String> {
    let mut ordered: Vec<&StepRecord> = steps.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

    let mut route: Vec<String> = Vec::new();
    for step in ordered {
        if !route.contains(&step.name) {
            route.push(step.name.clone());
        }
    }
    route
}

/// Most recent state for `label`, optionally as of `at`.
pub fn current_state_of(
    states: &[StateRecord],
    label: &str,
    at: Option<DateTime<Utc>>,
) -> Option<StateRecord> {
    states
        .iter()
        .filter(|s| s.label == label)
        .filter(|s| match (at, s.timestamp) {
            (Some(at), Some(ts)) => ts <= at,
            (Some(_), None) => false,
            (None, _) => true,
        })
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)))
        .cloned()
}

/// Pub/sub channel a broker message is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Internal,
    External,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Internal => "internal",
            Channel::External => "external",
        }
    }
}

/// Envelope published on a broker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub reference: String,
    pub data_type: String,
    pub data: Value,
}
