use serde_json::{json, Value};

use crate::algorithm::AlgorithmResult;

/// Variant specific part of an [`Outcome`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    /// Plain routing to `next_step`.
    Next,
    /// Routing carrying a computed value and the algorithm result.
    Result {
        value: Value,
        result: AlgorithmResult,
    },
    /// Terminal outcome of an end step.
    End,
    /// Routing that stops the current run.
    Pause,
    MissingData,
    InvalidData,
}

/// What evaluating one step produced. Fixed once built; read through the
/// accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    outcome_step: String,
    next_step: Option<String>,
    reason: Option<String>,
    context: Option<Value>,
    input_data: Option<Value>,
    kind: OutcomeKind,
}

impl Outcome {
    pub fn next(
        outcome_step: impl Into<String>,
        next_step: impl Into<String>,
        reason: impl Into<String>,
        input_data: Option<Value>,
    ) -> Self {
        Self {
            outcome_step: outcome_step.into(),
            next_step: Some(next_step.into()),
            reason: Some(reason.into()),
            context: None,
            input_data,
            kind: OutcomeKind::Next,
        }
    }

    /// Plain routing where the next step may be unknown.
    pub fn routed(
        outcome_step: impl Into<String>,
        next_step: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            outcome_step: outcome_step.into(),
            next_step,
            reason: Some(reason.into()),
            context: None,
            input_data: None,
            kind: OutcomeKind::Next,
        }
    }

    pub fn result(
        outcome_step: impl Into<String>,
        next_step: Option<String>,
        reason: impl Into<String>,
        value: Value,
        result: AlgorithmResult,
    ) -> Self {
        Self {
            outcome_step: outcome_step.into(),
            next_step,
            reason: Some(reason.into()),
            context: None,
            input_data: None,
            kind: OutcomeKind::Result { value, result },
        }
    }

    pub fn end(outcome_step: impl Into<String>) -> Self {
        Self {
            outcome_step: outcome_step.into(),
            next_step: None,
            reason: None,
            context: None,
            input_data: None,
            kind: OutcomeKind::End,
        }
    }

    pub fn pause(outcome_step: impl Into<String>, next_step: impl Into<String>) -> Self {
        Self {
            outcome_step: outcome_step.into(),
            next_step: Some(next_step.into()),
            reason: Some("next".into()),
            context: None,
            input_data: None,
            kind: OutcomeKind::Pause,
        }
    }

    pub fn missing_data(outcome_step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::failed(outcome_step, reason, OutcomeKind::MissingData)
    }

    pub fn invalid_data(outcome_step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::failed(outcome_step, reason, OutcomeKind::InvalidData)
    }

    fn failed(outcome_step: impl Into<String>, reason: impl Into<String>, kind: OutcomeKind) -> Self {
        Self {
            outcome_step: outcome_step.into(),
            next_step: None,
            reason: Some(reason.into()),
            context: None,
            input_data: None,
            kind,
        }
    }

    pub fn with_context(mut self, context: Option<Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_input_data(mut self, input_data: Option<Value>) -> Self {
        self.input_data = input_data;
        self
    }

    pub fn outcome_step(&self) -> &str {
        &self.outcome_step
    }

    pub fn next_step(&self) -> Option<&str> {
        self.next_step.as_deref()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn context(&self) -> Option<&Value> {
        self.context.as_ref()
    }

    pub fn input_data(&self) -> Option<&Value> {
        self.input_data.as_ref()
    }

    pub fn kind(&self) -> &OutcomeKind {
        &self.kind
    }

    pub fn is_successful(&self) -> bool {
        !matches!(self.kind, OutcomeKind::MissingData | OutcomeKind::InvalidData)
    }

    pub fn is_pause(&self) -> bool {
        matches!(self.kind, OutcomeKind::Pause)
    }

    /// The computed value of a result outcome.
    pub fn value(&self) -> Option<&Value> {
        match &self.kind {
            OutcomeKind::Result { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn algorithm_result(&self) -> Option<&AlgorithmResult> {
        match &self.kind {
            OutcomeKind::Result { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Encoded form persisted on the step record.
    pub fn to_record(&self) -> Value {
        if self.kind == OutcomeKind::End {
            return json!({"outcome_step": self.outcome_step});
        }

        let mut record = json!({
            "outcome_step": self.outcome_step,
            "next_step": self.next_step,
            "reason": self.reason,
            "context": self.context.clone().unwrap_or_else(|| json!({})),
            "input_data": self.input_data.clone().unwrap_or_else(|| json!({})),
        });
        if let OutcomeKind::Result { value, result } = &self.kind {
            record["value"] = value.clone();
            record["result"] = result.to_value();
        }
        record
    }
}

/// `false` only for the failed family; a missing outcome counts as failed.
pub fn is_successful_outcome(outcome: Option<&Outcome>) -> bool {
    outcome.map(Outcome::is_successful).unwrap_or(false)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_classification() {
        let result = Outcome::result(
            "catheter_check",
            Some("itu".into()),
            "positive",
            json!(1),
            AlgorithmResult::new(json!(1)),
        );
        assert!(is_successful_outcome(Some(&Outcome::next("a", "b", "next", None))));
        assert!(is_successful_outcome(Some(&result)));
        assert!(is_successful_outcome(Some(&Outcome::end("itu"))));
        assert!(is_successful_outcome(Some(&Outcome::pause("wait", "check"))));
        assert!(!is_successful_outcome(Some(&Outcome::missing_data("a", "gone"))));
        assert!(!is_successful_outcome(Some(&Outcome::invalid_data("a", "bad"))));
        assert!(!is_successful_outcome(None));
    }

    #[test]
    fn test_accessors_expose_built_outcome() {
        let outcome = Outcome::next("admission", "catheter_check", "next", None)
            .with_context(Some(json!({"ward": "ED"})))
            .with_input_data(Some(json!({"systolic_bp": 92})));
        assert_eq!(outcome.outcome_step(), "admission");
        assert_eq!(outcome.next_step(), Some("catheter_check"));
        assert_eq!(outcome.reason(), Some("next"));
        assert_eq!(outcome.context(), Some(&json!({"ward": "ED"})));
        assert_eq!(outcome.input_data().unwrap()["systolic_bp"], json!(92));
        assert_eq!(outcome.kind(), &OutcomeKind::Next);
        assert!(outcome.value().is_none());

        let unrouted = Outcome::routed("triage", None, "");
        assert!(unrouted.next_step().is_none());
        assert!(unrouted.is_successful());
    }

    #[test]
    fn test_end_record_only_names_step() {
        assert_eq!(
            Outcome::end("itu").to_record(),
            json!({"outcome_step": "itu"})
        );
    }

    #[test]
    fn test_result_record_fields() {
        let outcome = Outcome::result(
            "catheter_check",
            Some("itu".into()),
            "positive",
            json!(1),
            AlgorithmResult::new(json!(1)),
        )
        .with_input_data(Some(json!({"systolic_bp": 92})));
        let record = outcome.to_record();
        assert_eq!(record["next_step"], json!("itu"));
        assert_eq!(record["reason"], json!("positive"));
        assert_eq!(record["value"], json!(1));
        assert_eq!(record["context"], json!({}));
        assert_eq!(record["input_data"]["systolic_bp"], json!(92));
        assert_eq!(record["result"]["value"], json!(1));
    }
}
