//! Source loading: structural CSV parsing with per-source failure
//! isolation.
//!
//! The loader never coerces values; every cell in a [`RawTable`] is the
//! verbatim decoded string. A source that cannot be opened or read is
//! recorded as a [`SourceGap`] and the run continues with the remaining
//! sources. Only the case where no source loads at all is fatal.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use log::{info, warn};
use serde::Serialize;

use crate::{
    dataset::RawTable,
    errors::PipelineError,
    io_utils,
};

/// A source that could not be loaded, kept for the report metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SourceGap {
    pub source: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub tables: Vec<RawTable>,
    pub gaps: Vec<SourceGap>,
}

/// Loads every readable source, records a gap for every unreadable one.
///
/// Returns `PipelineError::NoUsableSources` when not a single source could
/// be read; any other per-source failure is downgraded to a gap.
pub fn load_sources(
    paths: &[PathBuf],
    delimiter: Option<u8>,
    encoding: &'static Encoding,
) -> Result<LoadOutcome> {
    let mut tables = Vec::new();
    let mut gaps = Vec::new();
    for path in paths {
        let resolved = io_utils::resolve_input_delimiter(path, delimiter);
        match load_path(path, resolved, encoding) {
            Ok(table) => {
                info!(
                    "Loaded {} row(s) x {} column(s) from '{}'",
                    table.row_count(),
                    table.headers.len(),
                    table.source
                );
                tables.push(table);
            }
            Err(err) => {
                warn!("Skipping source '{}': {err:#}", path.display());
                gaps.push(SourceGap {
                    source: path.display().to_string(),
                    reason: format!("{err:#}"),
                });
            }
        }
    }
    if tables.is_empty() {
        return Err(PipelineError::NoUsableSources.into());
    }
    Ok(LoadOutcome { tables, gaps })
}

pub fn load_path(path: &Path, delimiter: u8, encoding: &'static Encoding) -> Result<RawTable> {
    let mut reader = io_utils::open_csv_reader_from_path(path, delimiter)
        .map_err(|err| source_not_found(path, err))?;
    read_table(path.display().to_string(), &mut reader, encoding)
}

/// Loads from any reader; used for stdin and in-memory sources in tests.
pub fn load_reader<R: Read>(
    name: &str,
    reader: R,
    delimiter: u8,
    encoding: &'static Encoding,
) -> Result<RawTable> {
    let mut reader = io_utils::open_csv_reader(reader, delimiter);
    read_table(name.to_string(), &mut reader, encoding)
}

fn read_table<R: Read>(
    source: String,
    reader: &mut csv::Reader<R>,
    encoding: &'static Encoding,
) -> Result<RawTable> {
    let headers = io_utils::reader_headers(reader, encoding)
        .with_context(|| format!("Reading header row of '{source}'"))?;
    let mut rows = Vec::new();
    for (row_idx, record) in reader.byte_records().enumerate() {
        let record = record.with_context(|| format!("Reading row {} of '{source}'", row_idx + 2))?;
        let mut decoded = io_utils::decode_record(&record, encoding)
            .with_context(|| format!("Decoding row {} of '{source}'", row_idx + 2))?;
        // Flexible reads may yield short rows; pad to the header width so
        // every row aligns with the source schema.
        if decoded.len() < headers.len() {
            decoded.resize(headers.len(), String::new());
        } else {
            decoded.truncate(headers.len());
        }
        rows.push(decoded);
    }
    Ok(RawTable {
        source,
        headers,
        rows,
    })
}

fn source_not_found(path: &Path, err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<std::io::Error>() {
        Ok(io_err) => PipelineError::SourceNotFound {
            path: path.to_path_buf(),
            source: io_err,
        }
        .into(),
        Err(other) => other,
    }
}
