//! Algorithm collaborator seam plus the two rule-based algorithms bundled
//! with the engine. Statistical models plug in through [`Algorithm`].

use std::fmt;

use serde_json::{json, Value};
use thiserror::Error;

use crate::expression::{Expression, ExpressionError};
use crate::types::{is_empty_value, Record};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlgorithmError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Output of an algorithm: a primary `value`, an optional `label` and the
/// input the value was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmResult {
    pub value: Value,
    pub label: Option<String>,
    pub data: Record,
    /// Algorithm specific fields (matched factors, ranges, probabilities).
    pub extra: Record,
}

impl AlgorithmResult {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            label: None,
            data: Record::new(),
            extra: Record::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_data(mut self, data: Record) -> Self {
        self.data = data;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Named field lookup; unknown names yield `None`.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "value" => Some(self.value.clone()),
            "label" => self.label.clone().map(Value::String),
            "data" => Some(Value::Object(self.data.clone())),
            other => self.extra.get(other).cloned(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("value".into(), self.value.clone());
        map.insert(
            "label".into(),
            self.label.clone().map(Value::String).unwrap_or(Value::Null),
        );
        map.insert("data".into(), Value::Object(self.data.clone()));
        Value::Object(map)
    }
}

pub trait Algorithm: fmt::Debug + Send + Sync {
    fn title(&self) -> &str;

    /// Shape raw source data into the algorithm's input.
    fn create_input_dataset(&self, data: Record) -> Result<Record, AlgorithmError> {
        Ok(data)
    }

    fn single_result(&self, data: &Record) -> Result<AlgorithmResult, AlgorithmError>;
}

/// One scored rule of a [`ScoreAlgorithm`].
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    pub title: String,
    pub expression: Expression,
    pub penalty: f64,
}

impl Factor {
    pub fn new(title: impl Into<String>, expression: Expression, penalty: f64) -> Self {
        Self {
            title: title.into(),
            expression,
            penalty,
        }
    }
}

/// Named score band; open ends are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRange {
    pub label: String,
    pub from: Option<f64>,
    pub to: Option<f64>,
}

impl ScoreRange {
    fn contains(&self, score: f64) -> bool {
        self.from.map_or(true, |from| score >= from) && self.to.map_or(true, |to| score <= to)
    }
}

/// Start score plus the penalty of every matched factor.
#[derive(Debug, Clone)]
pub struct ScoreAlgorithm {
    pub title: String,
    pub factors: Vec<Factor>,
    pub ranges: Vec<ScoreRange>,
    pub start_score: f64,
    pub required_fields: Vec<String>,
}

impl ScoreAlgorithm {
    pub fn new(title: impl Into<String>, factors: Vec<Factor>) -> Self {
        Self {
            title: title.into(),
            factors,
            ranges: Vec::new(),
            start_score: 0.0,
            required_fields: Vec::new(),
        }
    }

    pub fn with_ranges(mut self, ranges: Vec<ScoreRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn with_start_score(mut self, start_score: f64) -> Self {
        self.start_score = start_score;
        self
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    fn find_label(&self, score: f64) -> Option<String> {
        self.ranges
            .iter()
            .find(|range| range.contains(score))
            .map(|range| range.label.clone())
    }
}

impl Algorithm for ScoreAlgorithm {
    fn title(&self) -> &str {
        &self.title
    }

    fn create_input_dataset(&self, data: Record) -> Result<Record, AlgorithmError> {
        if let Some(missing) = self
            .required_fields
            .iter()
            .find(|field| is_empty_value(data.get(field.as_str())))
        {
            return Err(AlgorithmError::InvalidInput(format!(
                "field '{missing}' is required"
            )));
        }
        Ok(data)
    }

    fn single_result(&self, data: &Record) -> Result<AlgorithmResult, AlgorithmError> {
        let mut score = self.start_score;
        let mut matched = Vec::new();
        for factor in &self.factors {
            if factor.expression.evaluate(data)? {
                score += factor.penalty;
                matched.push(json!({"title": factor.title, "penalty": factor.penalty}));
            }
        }

        let mut result = AlgorithmResult::new(json!(score))
            .with_data(data.clone())
            .with_extra("matched_factors", Value::Array(matched));
        if let Some(label) = self.find_label(score) {
            result = result.with_label(label);
        }
        Ok(result)
    }
}

/// `1` when the expression holds, `0` otherwise.
#[derive(Debug, Clone)]
pub struct ExpressionAlgorithm {
    pub title: String,
    pub expression: Expression,
}

impl ExpressionAlgorithm {
    pub fn new(title: impl Into<String>, expression: Expression) -> Self {
        Self {
            title: title.into(),
            expression,
        }
    }
}

impl Algorithm for ExpressionAlgorithm {
    fn title(&self) -> &str {
        &self.title
    }

    fn single_result(&self, data: &Record) -> Result<AlgorithmResult, AlgorithmError> {
        let value = if self.expression.evaluate(data)? { 1 } else { 0 };
        Ok(AlgorithmResult::new(json!(value))
            .with_label(self.expression.label())
            .with_data(data.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::expression::Operator;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn news() -> ScoreAlgorithm {
        ScoreAlgorithm::new(
            "Early warning",
            vec![
                Factor::new(
                    "Tachycardia",
                    Expression::compare("hr", Operator::Gt, json!(110)),
                    2.0,
                ),
                Factor::new(
                    "Hypotension",
                    Expression::compare("systolic_bp", Operator::Le, json!(90)),
                    3.0,
                ),
            ],
        )
        .with_ranges(vec![
            ScoreRange {
                label: "low".into(),
                from: None,
                to: Some(2.0),
            },
            ScoreRange {
                label: "high".into(),
                from: Some(3.0),
                to: None,
            },
        ])
        .with_required_fields(["hr"])
    }

    #[test]
    fn test_score_sums_matched_penalties() {
        let algorithm = news();
        let data = record(json!({"hr": 120, "systolic_bp": 85}));
        let result = algorithm.single_result(&data).unwrap();
        assert_eq!(result.value, json!(5.0));
        assert_eq!(result.label.as_deref(), Some("high"));
        assert_eq!(
            result.field("matched_factors").unwrap().as_array().unwrap().len(),
            2
        );
    }

    #[test]
    fn test_score_requires_fields() {
        let err = news()
            .create_input_dataset(record(json!({"hr": null})))
            .unwrap_err();
        assert_eq!(err, AlgorithmError::InvalidInput("field 'hr' is required".into()));
    }

    #[test]
    fn test_expression_algorithm() {
        let algorithm = ExpressionAlgorithm::new(
            "BP check",
            Expression::compare("systolic_bp", Operator::Gt, json!(90)),
        );
        let result = algorithm
            .single_result(&record(json!({"systolic_bp": 92})))
            .unwrap();
        assert_eq!(result.value, json!(1));
        assert_eq!(result.to_value()["label"], json!("systolic_bp > 90"));
        assert!(algorithm
            .single_result(&record(json!({"systolic_bp": null})))
            .is_err());
    }
}
