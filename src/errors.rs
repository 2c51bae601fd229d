use std::path::PathBuf;

use thiserror::Error;

use crate::data::FieldType;

/// Failure taxonomy for a pipeline run.
///
/// Only `NoUsableSources` aborts a run outright. `SourceNotFound`,
/// `SchemaConflict`, and `InsufficientData` are recorded at their
/// component boundary and the run continues; `Serialization` is fatal for
/// a single output target while the remaining targets still attempt to
/// write.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source not found: {path}")]
    SourceNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("field '{field}' is {left} in one source and {right} in another; normalized to string")]
    SchemaConflict {
        field: String,
        left: FieldType,
        right: FieldType,
    },

    #[error("rule '{rule}' skipped: {reason}")]
    InsufficientData { rule: String, reason: String },

    #[error("cannot serialize report to {target}: {reason}")]
    Serialization { target: String, reason: String },

    #[error("none of the configured sources could be read")]
    NoUsableSources,
}
