//! Row filters applied between normalization and aggregation, mirroring
//! the subsetting step the source analyses perform before grouping.
//!
//! Null cells never satisfy a condition, so filtered aggregates are always
//! computed over rows that actually carry the compared value.

use anyhow::{Result, anyhow};
use serde::Deserialize;

use crate::{
    data::{FieldType, Value, parse_float_token},
    dataset::{Dataset, Record},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
}

impl ComparisonOperator {
    pub fn token(&self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::NotEq => "!=",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Ge => ">=",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Le => "<=",
            ComparisonOperator::Contains => "contains",
            ComparisonOperator::StartsWith => "startswith",
            ComparisonOperator::EndsWith => "endswith",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct FilterCondition {
    pub field: String,
    pub operator: ComparisonOperator,
    pub raw_value: String,
}

impl TryFrom<String> for FilterCondition {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        parse_filter(&value)
    }
}

impl FilterCondition {
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.field, self.operator.token(), self.raw_value)
    }
}

pub fn parse_filters(filters: &[String]) -> Result<Vec<FilterCondition>> {
    filters.iter().map(|f| parse_filter(f)).collect()
}

fn parse_filter(filter: &str) -> Result<FilterCondition> {
    let trimmed = filter.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Empty filter expression"));
    }

    let lowered = trimmed.to_ascii_lowercase();
    for (needle, op) in [
        (" contains ", ComparisonOperator::Contains),
        (" startswith ", ComparisonOperator::StartsWith),
        (" endswith ", ComparisonOperator::EndsWith),
    ] {
        if let Some(idx) = lowered.find(needle) {
            let (left, right_with_space) = trimmed.split_at(idx);
            let right = right_with_space[needle.len()..].trim();
            return Ok(FilterCondition {
                field: left.trim().to_string(),
                operator: op,
                raw_value: unquote(right)?.to_string(),
            });
        }
    }

    for needle in ["!=", ">=", "<=", "=", ">", "<"] {
        if let Some(idx) = trimmed.find(needle) {
            let op = match needle {
                "=" => ComparisonOperator::Eq,
                "!=" => ComparisonOperator::NotEq,
                ">" => ComparisonOperator::Gt,
                ">=" => ComparisonOperator::Ge,
                "<" => ComparisonOperator::Lt,
                "<=" => ComparisonOperator::Le,
                _ => unreachable!(),
            };
            let left = trimmed[..idx].trim();
            let right = trimmed[idx + needle.len()..].trim();
            return Ok(FilterCondition {
                field: left.to_string(),
                operator: op,
                raw_value: unquote(right)?.to_string(),
            });
        }
    }

    Err(anyhow!("Failed to parse filter expression '{trimmed}'"))
}

fn unquote(value: &str) -> Result<&str> {
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
        {
            return Ok(&value[1..value.len() - 1]);
        }
    }
    Ok(value)
}

/// A condition resolved against a dataset schema: field index plus the
/// operand pre-parsed to the field's type.
#[derive(Debug, Clone)]
pub struct BoundFilter {
    index: usize,
    operator: ComparisonOperator,
    operand: Operand,
}

#[derive(Debug, Clone)]
enum Operand {
    Numeric(f64),
    Text(String),
}

pub fn bind_filters(conditions: &[FilterCondition], dataset: &Dataset) -> Result<Vec<BoundFilter>> {
    conditions
        .iter()
        .map(|condition| {
            let index = dataset
                .field_index(&condition.field)
                .ok_or_else(|| anyhow!("Filter field '{}' not found in schema", condition.field))?;
            let field = &dataset.fields[index];
            let operand = match field.datatype {
                FieldType::Integer | FieldType::Float => {
                    let parsed = parse_float_token(&condition.raw_value).ok_or_else(|| {
                        anyhow!(
                            "Filter value '{}' is not numeric but field '{}' is {}",
                            condition.raw_value,
                            field.name,
                            field.datatype
                        )
                    })?;
                    Operand::Numeric(parsed)
                }
                FieldType::Boolean | FieldType::String => {
                    Operand::Text(condition.raw_value.clone())
                }
            };
            Ok(BoundFilter {
                index,
                operator: condition.operator,
                operand,
            })
        })
        .collect()
}

/// All conditions must hold; a null cell fails its condition.
pub fn record_matches(filters: &[BoundFilter], record: &Record) -> bool {
    filters.iter().all(|filter| {
        let Some(value) = record.get(filter.index) else {
            return false;
        };
        evaluate(filter, value)
    })
}

fn evaluate(filter: &BoundFilter, value: &Value) -> bool {
    use ComparisonOperator::*;
    match &filter.operand {
        Operand::Numeric(operand) => {
            let Some(actual) = value.as_numeric() else {
                return false;
            };
            match filter.operator {
                Eq => actual == *operand,
                NotEq => actual != *operand,
                Gt => actual > *operand,
                Ge => actual >= *operand,
                Lt => actual < *operand,
                Le => actual <= *operand,
                Contains | StartsWith | EndsWith => {
                    text_compare(&value.as_display(), filter.operator, &operand.to_string())
                }
            }
        }
        Operand::Text(operand) => text_compare(&value.as_display(), filter.operator, operand),
    }
}

fn text_compare(actual: &str, operator: ComparisonOperator, operand: &str) -> bool {
    use ComparisonOperator::*;
    match operator {
        Eq => actual == operand,
        NotEq => actual != operand,
        Gt => actual > operand,
        Ge => actual >= operand,
        Lt => actual < operand,
        Le => actual <= operand,
        Contains => actual.contains(operand),
        StartsWith => actual.starts_with(operand),
        EndsWith => actual.ends_with(operand),
    }
}
