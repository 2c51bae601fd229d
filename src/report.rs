//! Report assembly and serialization to JSON, CSV, and Markdown.
//!
//! The serializer renders whatever the engine computed, in the order it
//! was computed; nothing is re-sorted here. A failure on one output
//! target is recorded and the remaining targets still attempt to write.

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use itertools::Itertools;
use log::{info, warn};
use serde::Serialize;

use crate::{
    aggregate::{AggregationResult, GroupEntry},
    config::{OutputFormat, OutputTarget},
    errors::PipelineError,
    insight::InsightSet,
    io_utils,
    loader::SourceGap,
    normalize::ConflictNote,
    table,
};

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub tool: String,
    pub generated_at: String,
    pub sources: Vec<String>,
    pub gaps: Vec<SourceGap>,
    pub schema_conflicts: Vec<ConflictNote>,
    pub record_count: usize,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub aggregates: AggregationResult,
    pub insights: InsightSet,
}

impl Report {
    pub fn new(
        sources: Vec<String>,
        gaps: Vec<SourceGap>,
        schema_conflicts: Vec<ConflictNote>,
        record_count: usize,
        filters: Vec<String>,
        aggregates: AggregationResult,
        insights: InsightSet,
    ) -> Self {
        Report {
            metadata: ReportMetadata {
                tool: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
                generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                sources,
                gaps,
                schema_conflicts,
                record_count,
                filters,
            },
            aggregates,
            insights,
        }
    }
}

/// Writes the report to every target. Per-target failures are returned,
/// not propagated, so one bad target never blocks the others.
pub fn write_report(report: &Report, targets: &[OutputTarget]) -> (Vec<PathBuf>, Vec<PipelineError>) {
    let mut written = Vec::new();
    let mut failures = Vec::new();
    for target in targets {
        match write_target(report, target) {
            Ok(()) => {
                info!("Wrote {} report to {:?}", describe_target(target), target.path);
                written.push(target.path.clone());
            }
            Err(err) => {
                warn!("Failed to write {:?}: {err:#}", target.path);
                failures.push(PipelineError::Serialization {
                    target: target.path.display().to_string(),
                    reason: format!("{err:#}"),
                });
            }
        }
    }
    (written, failures)
}

fn describe_target(target: &OutputTarget) -> &'static str {
    target
        .resolve_format()
        .map(|format| format.label())
        .unwrap_or("unknown")
}

fn write_target(report: &Report, target: &OutputTarget) -> Result<()> {
    match target.resolve_format()? {
        OutputFormat::Json => write_json(report, target),
        OutputFormat::Csv => write_csv(report, target),
        OutputFormat::Markdown => write_markdown(report, target),
    }
}

fn write_json(report: &Report, target: &OutputTarget) -> Result<()> {
    // serde_json renders non-finite floats as null, which would silently
    // corrupt round-trips; reject them for this target instead.
    if let Some(offender) = first_non_finite(report) {
        return Err(anyhow::anyhow!(
            "non-finite value in {offender}; JSON cannot represent it"
        ));
    }
    let mut writer = io_utils::open_text_writer(&target.path)?;
    serde_json::to_writer_pretty(&mut writer, report)
        .with_context(|| format!("Serializing JSON report to {:?}", target.path))?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

fn first_non_finite(report: &Report) -> Option<String> {
    for entry in &report.aggregates.groups {
        for summary in &entry.metrics {
            let named: [(&str, Option<f64>); 6] = [
                ("sum", Some(summary.sum)),
                ("mean", summary.mean),
                ("median", summary.median),
                ("min", summary.min),
                ("max", summary.max),
                ("stdev", summary.stdev),
            ];
            for (stat, value) in named {
                if value.is_some_and(|v| !v.is_finite()) {
                    return Some(format!("{stat}({})", summary.metric));
                }
            }
            for pv in &summary.percentiles {
                if pv.value.is_some_and(|v| !v.is_finite()) {
                    return Some(format!("p{}({})", pv.p, summary.metric));
                }
            }
        }
        for derived in entry.weighted.iter().chain(&entry.ratios) {
            if derived.value.is_some_and(|v| !v.is_finite()) {
                return Some(derived.name.clone());
            }
        }
    }
    report
        .insights
        .insights
        .iter()
        .find(|insight| !insight.value.is_finite())
        .map(|insight| format!("insight '{}'", insight.label))
}

fn write_csv(report: &Report, target: &OutputTarget) -> Result<()> {
    let delimiter = if target
        .path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("tsv"))
    {
        io_utils::DEFAULT_TSV_DELIMITER
    } else {
        io_utils::DEFAULT_CSV_DELIMITER
    };
    let mut writer = io_utils::open_csv_writer(&target.path, delimiter)?;
    let (headers, rows) = flatten_aggregates(&report.aggregates);
    writer
        .write_record(&headers)
        .with_context(|| format!("Writing CSV header to {:?}", target.path))?;
    for row in rows {
        writer
            .write_record(&row)
            .with_context(|| format!("Writing CSV row to {:?}", target.path))?;
    }
    writer.flush()?;
    Ok(())
}

/// One row per group: key labels first, then `count`, then every
/// statistic column per metric, then weighted means and ratios.
pub fn flatten_aggregates(aggregates: &AggregationResult) -> (Vec<String>, Vec<Vec<String>>) {
    let mut headers: Vec<String> = aggregates.group_by.clone();
    headers.push("count".to_string());
    if let Some(first) = aggregates.groups.first() {
        for summary in &first.metrics {
            let metric = &summary.metric;
            headers.push(format!("{metric}_non_null"));
            for stat in ["sum", "mean", "median", "min", "max", "stdev"] {
                headers.push(format!("{metric}_{stat}"));
            }
            for pv in &summary.percentiles {
                headers.push(format!("{metric}_{}", percentile_label(pv.p)));
            }
        }
        for derived in first.weighted.iter().chain(&first.ratios) {
            headers.push(derived.name.clone());
        }
    }

    let rows = aggregates.groups.iter().map(flatten_group).collect();
    (headers, rows)
}

fn flatten_group(entry: &GroupEntry) -> Vec<String> {
    let mut row = entry.labels();
    row.push(entry.count.to_string());
    for summary in &entry.metrics {
        row.push(summary.non_null.to_string());
        row.push(number_cell(Some(summary.sum)));
        row.push(number_cell(summary.mean));
        row.push(number_cell(summary.median));
        row.push(number_cell(summary.min));
        row.push(number_cell(summary.max));
        row.push(number_cell(summary.stdev));
        for pv in &summary.percentiles {
            row.push(number_cell(pv.value));
        }
    }
    for derived in entry.weighted.iter().chain(&entry.ratios) {
        row.push(number_cell(derived.value));
    }
    row
}

/// Shortest round-trippable decimal form; empty for null.
fn number_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn percentile_label(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("p{p:.0}")
    } else {
        format!("p{p}")
    }
}

fn write_markdown(report: &Report, target: &OutputTarget) -> Result<()> {
    let mut writer = io_utils::open_text_writer(&target.path)?;
    let body = render_markdown(report);
    writer
        .write_all(body.as_bytes())
        .with_context(|| format!("Writing Markdown report to {:?}", target.path))?;
    writer.flush()?;
    Ok(())
}

pub fn render_markdown(report: &Report) -> String {
    let mut body = String::new();
    let meta = &report.metadata;
    body.push_str("# Aggregation report\n\n");
    body.push_str(&format!("- Generated: {} by {}\n", meta.generated_at, meta.tool));
    body.push_str(&format!(
        "- Sources: {}\n",
        meta.sources.iter().join(", ")
    ));
    if !meta.gaps.is_empty() {
        body.push_str(&format!(
            "- Missing sources: {}\n",
            meta.gaps.iter().map(|gap| gap.source.as_str()).join(", ")
        ));
    }
    if !meta.schema_conflicts.is_empty() {
        body.push_str(&format!(
            "- Schema conflicts (normalized to string): {}\n",
            meta.schema_conflicts
                .iter()
                .map(|note| note.field.as_str())
                .join(", ")
        ));
    }
    body.push_str(&format!("- Records: {}\n", meta.record_count));
    body.push_str(&format!(
        "- Grouped by: {}\n",
        report.aggregates.group_by.iter().join(", ")
    ));
    if !meta.filters.is_empty() {
        body.push_str(&format!("- Filters: {}\n", meta.filters.iter().join(" and ")));
    }

    body.push_str("\n## Aggregates\n\n");
    let (headers, rows) = flatten_aggregates(&report.aggregates);
    body.push_str(&table::render_markdown_table(&headers, &rows));

    body.push_str("\n## Insights\n\n");
    if report.insights.insights.is_empty() {
        body.push_str("No insights matched the configured rules.\n");
    } else {
        for insight in &report.insights.insights {
            body.push_str(&format!("- **{}** — {}\n", insight.label, insight.detail));
        }
    }

    if !report.insights.skipped.is_empty() {
        body.push_str("\n## Skipped rules\n\n");
        for skipped in &report.insights.skipped {
            body.push_str(&format!("- {}: {}\n", skipped.rule, skipped.reason));
        }
    }

    body
}
