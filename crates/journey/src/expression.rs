use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::types::{compare_values, display_value, is_empty_value, values_equal, Record};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Data item '{0}' is empty and cannot be ignored")]
    MissingValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
        }
    }

    /// Values that cannot be ordered against each other only satisfy `!=`.
    pub fn test(&self, item: &Value, value: &Value) -> bool {
        match self {
            Operator::Eq => values_equal(item, value),
            Operator::Ne => !values_equal(item, value),
            ordering => match compare_values(item, value) {
                Some(ord) => match ordering {
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Ge => ord != Ordering::Less,
                    Operator::Lt => ord == Ordering::Less,
                    Operator::Le => ord != Ordering::Greater,
                    Operator::Eq | Operator::Ne => false,
                },
                None => false,
            },
        }
    }
}

/// Boolean test over a data record.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Compare {
        input_field: String,
        operator: Operator,
        value: Value,
        ignore_empty: bool,
    },
    Between {
        input_field: String,
        from_value: Value,
        to_value: Value,
        ignore_empty: bool,
    },
    /// True when the field is missing or null.
    Null { input_field: String },
    Empty { input_field: String, negated: bool },
    And(Vec<Expression>),
    Or(Vec<Expression>),
}

impl Expression {
    pub fn compare(input_field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Expression::Compare {
            input_field: input_field.into(),
            operator,
            value,
            ignore_empty: false,
        }
    }

    pub fn between(input_field: impl Into<String>, from_value: Value, to_value: Value) -> Self {
        Expression::Between {
            input_field: input_field.into(),
            from_value,
            to_value,
            ignore_empty: false,
        }
    }

    /// Evaluate to `false` instead of failing when the field is empty.
    pub fn ignoring_empty(mut self) -> Self {
        match &mut self {
            Expression::Compare { ignore_empty, .. } | Expression::Between { ignore_empty, .. } => {
                *ignore_empty = true
            }
            _ => {}
        }
        self
    }

    pub fn evaluate(&self, data: &Record) -> Result<bool, ExpressionError> {
        match self {
            Expression::Compare {
                input_field,
                operator,
                value,
                ignore_empty,
            } => Ok(match field_value(data, input_field, *ignore_empty)? {
                Some(item) => operator.test(item, value),
                None => false,
            }),
            Expression::Between {
                input_field,
                from_value,
                to_value,
                ignore_empty,
            } => Ok(match field_value(data, input_field, *ignore_empty)? {
                Some(item) => {
                    Operator::Ge.test(item, from_value) && Operator::Le.test(item, to_value)
                }
                None => false,
            }),
            Expression::Null { input_field } => {
                Ok(matches!(data.get(input_field), None | Some(Value::Null)))
            }
            Expression::Empty {
                input_field,
                negated,
            } => Ok(is_empty_value(data.get(input_field)) != *negated),
            Expression::And(expressions) => {
                for expression in expressions {
                    if !expression.evaluate(data)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expression::Or(expressions) => {
                // Every branch is evaluated so an empty field fails the whole test.
                let mut matched = false;
                for expression in expressions {
                    matched |= expression.evaluate(data)?;
                }
                Ok(matched)
            }
        }
    }

    pub fn label(&self) -> String {
        match self {
            Expression::Compare {
                input_field,
                operator,
                value,
                ..
            } => format!("{input_field} {} {}", operator.symbol(), display_value(value)),
            Expression::Between {
                input_field,
                from_value,
                to_value,
                ..
            } => format!(
                "{input_field} between {} and {}",
                display_value(from_value),
                display_value(to_value)
            ),
            Expression::Null { input_field } => format!("{input_field} is null"),
            Expression::Empty {
                input_field,
                negated: false,
            } => format!("{input_field} is empty"),
            Expression::Empty {
                input_field,
                negated: true,
            } => format!("{input_field} is not empty"),
            Expression::And(expressions) => join_labels(expressions, " and "),
            Expression::Or(expressions) => join_labels(expressions, " or "),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

fn field_value<'a>(
    data: &'a Record,
    input_field: &str,
    ignore_empty: bool,
) -> Result<Option<&'a Value>, ExpressionError> {
    let item = data.get(input_field);
    if is_empty_value(item) {
        if ignore_empty {
            return Ok(None);
        }
        return Err(ExpressionError::MissingValue(input_field.to_string()));
    }
    Ok(item)
}

fn join_labels(expressions: &[Expression], separator: &str) -> String {
    expressions
        .iter()
        .map(Expression::label)
        .collect::<Vec<_>>()
        .join(separator)
}
