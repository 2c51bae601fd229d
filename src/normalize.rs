//! Schema normalization: union-schema resolution, per-field type
//! inference, and coercion of verbatim rows into typed records.
//!
//! Inference tries integer, then float (after stripping `$`, `%`, and
//! thousands separators), then boolean, and falls back to string. Types
//! are inferred per source first so cross-source disagreements are
//! visible: a field numeric in one source and textual in another is
//! normalized to string across the merged dataset and the demotion is
//! recorded as a conflict note rather than silently papered over.
//! Integer/float disagreement widens to float without a note.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Serialize;

use crate::{
    data::{self, FieldType},
    dataset::{Dataset, FieldMeta, RawTable, Record},
};

/// A cross-source type disagreement that forced a field to string.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictNote {
    pub field: String,
    pub left: FieldType,
    pub right: FieldType,
}

#[derive(Debug)]
pub struct Normalized {
    pub dataset: Dataset,
    pub conflicts: Vec<ConflictNote>,
}

/// Merges one or more raw tables into a single typed dataset whose schema
/// is the union of all input schemas. Records keep load order: all rows of
/// the first table, then the second, and so on. Fields a source lacks are
/// null in its records.
pub fn normalize(tables: &[RawTable]) -> Result<Normalized> {
    let (fields, conflicts) = resolve_schema(tables);
    debug!(
        "Resolved union schema of {} field(s) across {} source(s)",
        fields.len(),
        tables.len()
    );

    let mut records = Vec::new();
    for table in tables {
        // Map each source column to its position in the union schema.
        let mapping: Vec<usize> = table
            .headers
            .iter()
            .map(|header| {
                let key = data::normalize_field_name(header);
                fields
                    .iter()
                    .position(|f| data::normalize_field_name(&f.name) == key)
                    .expect("every source header is in the union schema")
            })
            .collect();

        for (row_idx, row) in table.rows.iter().enumerate() {
            let mut cells: Vec<Option<crate::data::Value>> = vec![None; fields.len()];
            for (col_idx, raw) in row.iter().enumerate() {
                let target = mapping[col_idx];
                cells[target] = data::coerce_value(raw, fields[target].datatype).with_context(
                    || {
                        format!(
                            "Normalizing field '{}' in row {} of '{}'",
                            fields[target].name,
                            row_idx + 2,
                            table.source
                        )
                    },
                )?;
            }
            records.push(Record(cells));
        }
    }

    Ok(Normalized {
        dataset: Dataset { fields, records },
        conflicts,
    })
}

/// Resolves the union schema: field order is first-seen order across the
/// tables, field identity is the case/punctuation-insensitive normalized
/// name, and the display name is the first spelling observed.
pub fn resolve_schema(tables: &[RawTable]) -> (Vec<FieldMeta>, Vec<ConflictNote>) {
    let mut names: Vec<String> = Vec::new();
    let mut keys: Vec<String> = Vec::new();
    for table in tables {
        for header in &table.headers {
            let key = data::normalize_field_name(header);
            if !keys.contains(&key) {
                keys.push(key);
                names.push(header.trim().to_string());
            }
        }
    }

    let mut fields = Vec::with_capacity(names.len());
    let mut conflicts = Vec::new();
    for (name, key) in names.iter().zip(&keys) {
        let mut resolved: Option<FieldType> = None;
        for table in tables {
            let Some(col_idx) = table
                .headers
                .iter()
                .position(|h| data::normalize_field_name(h) == *key)
            else {
                continue;
            };
            let observed = infer_field_type(table.rows.iter().map(|row| row[col_idx].as_str()));
            resolved = Some(match resolved {
                None => observed,
                Some(current) => merge_types(name, current, observed, &mut conflicts),
            });
        }
        fields.push(FieldMeta {
            name: name.clone(),
            datatype: resolved.unwrap_or(FieldType::String),
        });
    }
    (fields, conflicts)
}

/// Infers the narrowest type every non-null value of a column fits.
/// A column with no non-null values stays string.
pub fn infer_field_type<'a>(values: impl Iterator<Item = &'a str> + Clone) -> FieldType {
    let non_null = || values.clone().filter(|v| !data::is_placeholder(v));
    if non_null().next().is_none() {
        return FieldType::String;
    }
    if non_null().all(|v| data::parse_integer_token(v).is_some()) {
        FieldType::Integer
    } else if non_null().all(|v| data::parse_float_token(v).is_some()) {
        FieldType::Float
    } else if non_null().all(|v| data::parse_boolean_token(v).is_some()) {
        FieldType::Boolean
    } else {
        FieldType::String
    }
}

fn merge_types(
    field: &str,
    left: FieldType,
    right: FieldType,
    conflicts: &mut Vec<ConflictNote>,
) -> FieldType {
    use FieldType::*;
    match (left, right) {
        (a, b) if a == b => a,
        (Integer, Float) | (Float, Integer) => Float,
        (a, b) => {
            warn!("Field '{field}' is {a} in one source and {b} in another; using string");
            conflicts.push(ConflictNote {
                field: field.to_string(),
                left: a,
                right: b,
            });
            String
        }
    }
}
