use serde::Serialize;

use crate::data::{FieldType, Value};

/// One source parsed structurally, values kept verbatim. Produced by the
/// loader; the normalizer is the only consumer.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub source: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// One field of the resolved union schema.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: String,
    pub datatype: FieldType,
}

/// One normalized row, positionally aligned with the owning dataset's
/// schema. `None` marks a null cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(pub Vec<Option<Value>>);

impl Record {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index).and_then(|cell| cell.as_ref())
    }
}

/// The normalized, immutable output of the schema normalizer: the union
/// schema across all sources plus every record in load order.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub fields: Vec<FieldMeta>,
    pub records: Vec<Record>,
}

impl Dataset {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.field_index(name).map(|idx| &self.fields[idx])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
