use std::borrow::Cow;
use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// One typed cell value. Absence (an empty cell, a placeholder token, or a
/// field a source never had) is represented as `Option<Value> = None`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
}

impl Eq for Value {}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Boolean(b) => b.to_string(),
            Value::String(s) => s.clone(),
        }
    }

    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Boolean(_) | Value::String(_) => None,
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            Value::Integer(_) => 0,
            Value::Float(_) => 1,
            Value::Boolean(_) => 2,
            Value::String(_) => 3,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

/// Wrapper ordering `None` before any present value, so "unknown" groups
/// sort first and deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparableValue(pub Option<Value>);

impl Ord for ComparableValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (&self.0, &other.0) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(left), Some(right)) => left.cmp(right),
        }
    }
}

impl PartialOrd for ComparableValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Inferred type tag for one schema field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Float,
    Boolean,
    String,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::String => "string",
        };
        write!(f, "{label}")
    }
}

const PLACEHOLDER_TOKENS: &[&str] = &["na", "n/a", "null", "none", "-"];

/// Tokens like `NA` or `null` that the source corpus uses for absent cells.
pub fn is_placeholder(value: &str) -> bool {
    let lowered = value.trim().to_ascii_lowercase();
    lowered.is_empty() || PLACEHOLDER_TOKENS.contains(&lowered.as_str())
}

/// Strips one leading `$`, one trailing `%`, and `,` thousands separators
/// so `$1,234.50` and `12%` can be parsed as numbers.
pub fn clean_numeric_token(value: &str) -> Cow<'_, str> {
    let trimmed = value.trim();
    if !trimmed.starts_with('$')
        && !trimmed.ends_with('%')
        && !trimmed.contains(',')
        && trimmed.len() == value.len()
    {
        return Cow::Borrowed(value);
    }
    let stripped = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let stripped = stripped.strip_suffix('%').unwrap_or(stripped);
    Cow::Owned(stripped.trim().replace(',', ""))
}

pub fn parse_integer_token(value: &str) -> Option<i64> {
    clean_numeric_token(value).parse().ok()
}

pub fn parse_float_token(value: &str) -> Option<f64> {
    let cleaned = clean_numeric_token(value);
    let parsed: f64 = cleaned.parse().ok()?;
    parsed.is_finite().then_some(parsed)
}

pub fn parse_boolean_token(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Coerces one verbatim cell to its field's resolved type. Empty and
/// placeholder cells become `None`; a non-placeholder cell that fails to
/// parse is an error, since type resolution already saw every value.
pub fn coerce_value(value: &str, ty: FieldType) -> Result<Option<Value>> {
    if is_placeholder(value) {
        return Ok(None);
    }
    let parsed = match ty {
        FieldType::Integer => match parse_integer_token(value) {
            Some(i) => Value::Integer(i),
            None => bail!("failed to parse '{value}' as integer"),
        },
        FieldType::Float => match parse_float_token(value) {
            Some(f) => Value::Float(f),
            None => bail!("failed to parse '{value}' as float"),
        },
        FieldType::Boolean => match parse_boolean_token(value) {
            Some(b) => Value::Boolean(b),
            None => bail!("failed to parse '{value}' as boolean"),
        },
        FieldType::String => Value::String(value.trim().to_string()),
    };
    Ok(Some(parsed))
}

pub fn normalize_field_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_numeric_token_strips_currency_percent_and_separators() {
        assert_eq!(clean_numeric_token("$1,234.50"), "1234.50");
        assert_eq!(clean_numeric_token("12%"), "12");
        assert_eq!(clean_numeric_token(" 42 "), "42");
        assert_eq!(clean_numeric_token("plain"), "plain");
    }

    #[test]
    fn parse_tokens_handle_cleaned_forms() {
        assert_eq!(parse_integer_token("1,234"), Some(1234));
        assert_eq!(parse_float_token("$3.50"), Some(3.5));
        assert_eq!(parse_float_token("95%"), Some(95.0));
        assert_eq!(parse_integer_token("3.5"), None);
        assert_eq!(parse_float_token("NaN"), None);
    }

    #[test]
    fn boolean_tokens_cover_corpus_spellings() {
        assert_eq!(parse_boolean_token("Yes"), Some(true));
        assert_eq!(parse_boolean_token("0"), Some(false));
        assert_eq!(parse_boolean_token("maybe"), None);
    }

    #[test]
    fn placeholders_normalize_to_null() {
        assert!(is_placeholder(""));
        assert!(is_placeholder("  "));
        assert!(is_placeholder("N/A"));
        assert!(is_placeholder("null"));
        assert!(!is_placeholder("0"));
    }

    #[test]
    fn coerce_value_respects_field_type() {
        assert_eq!(
            coerce_value("$20", FieldType::Float).unwrap(),
            Some(Value::Float(20.0))
        );
        assert_eq!(coerce_value("NA", FieldType::Integer).unwrap(), None);
        assert!(coerce_value("abc", FieldType::Integer).is_err());
    }

    #[test]
    fn comparable_value_orders_none_first() {
        let none = ComparableValue(None);
        let some = ComparableValue(Some(Value::Integer(0)));
        assert!(none < some);
    }

    #[test]
    fn normalize_field_name_replaces_non_alphanumeric() {
        assert_eq!(normalize_field_name("Price per TB"), "price_per_tb");
        assert_eq!(normalize_field_name("$Cost%"), "_cost_");
    }
}
