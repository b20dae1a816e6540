use serde_json::{json, Value};

use crate::algorithm::AlgorithmResult;
use crate::expression::{Expression, ExpressionError, Operator};
use crate::outcome::Outcome;
use crate::step::StepRef;
use crate::types::{display_value, values_equal, Record};

/// Routes on whether one result field equals `positive_value`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryDecision {
    pub true_step: StepRef,
    pub false_step: Option<StepRef>,
    pub input_field: String,
    pub positive_value: Value,
    pub positive_label: String,
    pub negative_label: String,
}

impl BinaryDecision {
    pub fn new(true_step: StepRef, false_step: Option<StepRef>) -> Self {
        Self {
            true_step,
            false_step,
            input_field: "value".into(),
            positive_value: json!(1),
            positive_label: "positive".into(),
            negative_label: "negative".into(),
        }
    }

    pub fn with_input_field(mut self, input_field: impl Into<String>) -> Self {
        self.input_field = input_field.into();
        self
    }

    pub fn with_positive_value(mut self, positive_value: Value) -> Self {
        self.positive_value = positive_value;
        self
    }

    pub fn with_labels(mut self, positive: impl Into<String>, negative: impl Into<String>) -> Self {
        self.positive_label = positive.into();
        self.negative_label = negative.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionCase {
    pub expression: Expression,
    pub step: Option<StepRef>,
    pub title: Option<String>,
}

impl DecisionCase {
    pub fn new(expression: Expression, step: Option<StepRef>) -> Self {
        Self {
            expression,
            step,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    fn link_label(&self) -> String {
        self.title.clone().unwrap_or_else(|| self.expression.label())
    }
}

/// Turns an algorithm result into an [`Outcome`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Binary(BinaryDecision),
    PassThrough {
        next_step: StepRef,
    },
    /// First matching case wins; `default_step` otherwise.
    SelectCase {
        cases: Vec<DecisionCase>,
        default_step: Option<StepRef>,
    },
    CompareInputAndResult {
        input_field: String,
        true_step: StepRef,
        false_step: StepRef,
        input_mapping: Option<Record>,
        result_mapping: Option<Record>,
    },
    /// Next step named by a field of the result.
    StepFromResult {
        step_field: String,
    },
}

impl Decision {
    pub fn binary(true_step: StepRef, false_step: StepRef) -> Self {
        Decision::Binary(BinaryDecision::new(true_step, Some(false_step)))
    }

    pub fn pass_through(next_step: StepRef) -> Self {
        Decision::PassThrough { next_step }
    }

    /// Select-case over equality tests of `input_field` against each rank value.
    pub fn ranked(
        input_field: &str,
        ranks: Vec<(Value, StepRef)>,
        default_step: Option<StepRef>,
    ) -> Self {
        let cases = ranks
            .into_iter()
            .map(|(value, step)| {
                DecisionCase::new(Expression::compare(input_field, Operator::Eq, value), Some(step))
            })
            .collect();
        Decision::SelectCase {
            cases,
            default_step,
        }
    }

    pub fn decide_outcome(
        &self,
        result: AlgorithmResult,
        context: Option<Value>,
        data: &Record,
        step: &str,
    ) -> Result<Outcome, ExpressionError> {
        let input_data = Some(Value::Object(data.clone()));
        let outcome = match self {
            Decision::Binary(binary) => {
                let field = result.field(&binary.input_field).unwrap_or(Value::Null);
                let positive = values_equal(&field, &binary.positive_value);
                let (next_step, reason) = if positive {
                    (Some(&binary.true_step), "positive")
                } else {
                    (binary.false_step.as_ref(), "negative")
                };
                let value = if positive { 1 } else { 0 };
                Outcome::result(
                    step,
                    next_step.map(StepRef::to_name),
                    reason,
                    json!(value),
                    result,
                )
            }
            Decision::PassThrough { next_step } => {
                let value = result.value.clone();
                Outcome::result(step, Some(next_step.to_name()), "next", value, result)
            }
            Decision::SelectCase {
                cases,
                default_step,
            } => {
                let fields = match result.to_value() {
                    Value::Object(map) => map,
                    _ => Record::new(),
                };
                let mut chosen = None;
                for case in cases {
                    if case.expression.evaluate(&fields)? {
                        chosen = Some(case);
                        break;
                    }
                }
                match chosen {
                    Some(case) => Outcome::result(
                        step,
                        case.step.as_ref().map(StepRef::to_name),
                        case.expression.label(),
                        Value::Null,
                        result,
                    ),
                    None => Outcome::result(
                        step,
                        default_step.as_ref().map(StepRef::to_name),
                        "default",
                        Value::Null,
                        result,
                    ),
                }
            }
            Decision::CompareInputAndResult {
                input_field,
                true_step,
                false_step,
                input_mapping,
                result_mapping,
            } => {
                let input_value = remap(
                    data.get(input_field).cloned().unwrap_or(Value::Null),
                    input_mapping.as_ref(),
                );
                let result_value = remap(result.value.clone(), result_mapping.as_ref());
                if values_equal(&input_value, &result_value) {
                    Outcome::result(
                        step,
                        Some(true_step.to_name()),
                        format!("decision '{}' and input match", display_value(&result_value)),
                        json!(1),
                        result,
                    )
                } else {
                    Outcome::result(
                        step,
                        Some(false_step.to_name()),
                        format!(
                            "decision '{}' does not match input '{}'",
                            display_value(&result_value),
                            display_value(&input_value)
                        ),
                        json!(0),
                        result,
                    )
                }
            }
            Decision::StepFromResult { step_field } => {
                let next_step = result
                    .field(step_field)
                    .and_then(|v| v.as_str().map(str::to_string));
                Outcome::routed(step, next_step, "")
            }
        };

        Ok(outcome.with_context(context).with_input_data(input_data))
    }

    /// Reason label to candidate step, for introspection.
    pub fn possible_links(&self) -> Vec<(String, Option<StepRef>)> {
        match self {
            Decision::Binary(binary) => vec![
                (binary.positive_label.clone(), Some(binary.true_step.clone())),
                (binary.negative_label.clone(), binary.false_step.clone()),
            ],
            Decision::PassThrough { next_step } => vec![("next".into(), Some(next_step.clone()))],
            Decision::SelectCase {
                cases,
                default_step,
            } => {
                let mut links: Vec<_> = cases
                    .iter()
                    .map(|case| (case.link_label(), case.step.clone()))
                    .collect();
                if let Some(default_step) = default_step {
                    links.push(("default".into(), Some(default_step.clone())));
                }
                links
            }
            Decision::CompareInputAndResult {
                true_step,
                false_step,
                ..
            } => vec![
                ("match".into(), Some(true_step.clone())),
                ("no match".into(), Some(false_step.clone())),
            ],
            Decision::StepFromResult { .. } => Vec::new(),
        }
    }
}

fn remap(value: Value, mapping: Option<&Record>) -> Value {
    match mapping {
        Some(mapping) => mapping
            .get(&display_value(&value))
            .cloned()
            .unwrap_or(Value::Null),
        None => value,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::outcome::OutcomeKind;

    fn data() -> Record {
        json!({"systolic_bp": 92, "outcome": "died"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_binary_decision_routes_on_value() {
        let decision = Decision::binary(StepRef::new("itu"), StepRef::new("discharge"));
        let positive = decision
            .decide_outcome(AlgorithmResult::new(json!(1)), None, &data(), "check")
            .unwrap();
        assert_eq!(positive.next_step(), Some("itu"));
        assert_eq!(positive.reason(), Some("positive"));
        assert_eq!(positive.value(), Some(&json!(1)));

        let negative = decision
            .decide_outcome(AlgorithmResult::new(json!(0.0)), None, &data(), "check")
            .unwrap();
        assert_eq!(negative.next_step(), Some("discharge"));
        assert_eq!(negative.value(), Some(&json!(0)));
        assert_eq!(
            negative.input_data().unwrap()["systolic_bp"],
            json!(92)
        );
    }

    #[test]
    fn test_binary_without_false_step_has_no_next() {
        let decision = Decision::Binary(BinaryDecision::new(StepRef::new("end"), None));
        let outcome = decision
            .decide_outcome(AlgorithmResult::new(json!(0)), None, &data(), "left")
            .unwrap();
        assert!(outcome.next_step().is_none());
        assert!(outcome.is_successful());
    }

    #[test]
    fn test_ranked_decision_uses_default() {
        let decision = Decision::ranked(
            "label",
            vec![
                (json!("low"), StepRef::new("ward")),
                (json!("high"), StepRef::new("itu")),
            ],
            Some(StepRef::new("review")),
        );
        let high = AlgorithmResult::new(json!(7)).with_label("high");
        let outcome = decision.decide_outcome(high, None, &data(), "score").unwrap();
        assert_eq!(outcome.next_step(), Some("itu"));
        assert_eq!(outcome.reason(), Some("label == high"));

        let unranked = AlgorithmResult::new(json!(4)).with_label("medium");
        let outcome = decision.decide_outcome(unranked, None, &data(), "score").unwrap();
        assert_eq!(outcome.next_step(), Some("review"));
        assert_eq!(outcome.reason(), Some("default"));

        let links = decision.possible_links();
        assert_eq!(links.len(), 3);
        assert_eq!(links[2].0, "default");
    }

    #[test]
    fn test_select_case_without_default_is_terminal() {
        let decision = Decision::SelectCase {
            cases: vec![DecisionCase::new(
                Expression::compare("value", Operator::Gt, json!(10)),
                Some(StepRef::new("itu")),
            )
            .with_title("Severe")],
            default_step: None,
        };
        let outcome = decision
            .decide_outcome(AlgorithmResult::new(json!(3)), None, &data(), "score")
            .unwrap();
        assert!(outcome.next_step().is_none());
        assert_eq!(decision.possible_links()[0].0, "Severe");
    }

    #[test]
    fn test_compare_input_and_result_with_mapping() {
        let mapping = json!({"died": 1, "survived": 0}).as_object().cloned();
        let decision = Decision::CompareInputAndResult {
            input_field: "outcome".into(),
            true_step: StepRef::new("agree"),
            false_step: StepRef::new("disagree"),
            input_mapping: mapping,
            result_mapping: None,
        };
        let agree = decision
            .decide_outcome(AlgorithmResult::new(json!(1)), None, &data(), "cmp")
            .unwrap();
        assert_eq!(agree.next_step(), Some("agree"));
        assert_eq!(agree.reason(), Some("decision '1' and input match"));

        let disagree = decision
            .decide_outcome(AlgorithmResult::new(json!(0)), None, &data(), "cmp")
            .unwrap();
        assert_eq!(
            disagree.reason(),
            Some("decision '0' does not match input '1'")
        );
    }

    #[test]
    fn test_step_from_result() {
        let decision = Decision::StepFromResult {
            step_field: "route".into(),
        };
        let result = AlgorithmResult::new(json!(0)).with_extra("route", json!("ward"));
        let outcome = decision.decide_outcome(result, None, &data(), "router").unwrap();
        assert_eq!(outcome.next_step(), Some("ward"));
        assert_eq!(outcome.kind(), &OutcomeKind::Next);
    }
}
