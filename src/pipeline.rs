//! Pipeline orchestration: one invocation, load to report, no state left
//! behind.

use std::path::PathBuf;

use anyhow::Result;
use log::info;

use crate::{
    aggregate,
    config::PipelineConfig,
    dataset::Dataset,
    errors::PipelineError,
    filter, insight, io_utils, loader, normalize,
    report::{self, Report},
};

/// What one run did: sizes, written targets, and the recoverable
/// failures that were recorded along the way.
#[derive(Debug)]
pub struct RunSummary {
    pub records: usize,
    pub groups: usize,
    pub insights: usize,
    pub gaps: usize,
    pub conflicts: usize,
    pub skipped_rules: usize,
    pub written: Vec<PathBuf>,
    pub output_failures: Vec<PipelineError>,
}

pub fn execute(config: &PipelineConfig) -> Result<RunSummary> {
    config.validate()?;
    let encoding = io_utils::resolve_encoding(config.input_encoding.as_deref())?;

    let outcome = loader::load_sources(&config.sources, config.delimiter, encoding)?;
    let normalized = normalize::normalize(&outcome.tables)?;
    let loaded = normalized.dataset.len();

    let bound = filter::bind_filters(&config.filters, &normalized.dataset)?;
    let dataset = apply_filters(normalized.dataset, &bound);
    if !bound.is_empty() {
        info!(
            "Filters retained {} of {} record(s)",
            dataset.len(),
            loaded
        );
    }

    let aggregates = aggregate::aggregate(&dataset, &config.grouping)?;
    info!(
        "Aggregated {} record(s) into {} group(s)",
        dataset.len(),
        aggregates.groups.len()
    );

    let mut rules = config.rules.clone();
    if let Some(path) = &config.rules_file {
        rules.extend(insight::load_rules(path)?);
    }
    let insights = insight::evaluate_rules(&aggregates, &rules);

    let group_count = aggregates.groups.len();
    let insight_count = insights.insights.len();
    let skipped_count = insights.skipped.len();
    let gap_count = outcome.gaps.len();
    let conflict_count = normalized.conflicts.len();

    let report = Report::new(
        config
            .sources
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
        outcome.gaps,
        normalized.conflicts,
        dataset.len(),
        config.filters.iter().map(|f| f.describe()).collect(),
        aggregates,
        insights,
    );
    let (written, output_failures) = report::write_report(&report, &config.outputs);

    Ok(RunSummary {
        records: report.metadata.record_count,
        groups: group_count,
        insights: insight_count,
        gaps: gap_count,
        conflicts: conflict_count,
        skipped_rules: skipped_count,
        written,
        output_failures,
    })
}

fn apply_filters(dataset: Dataset, filters: &[filter::BoundFilter]) -> Dataset {
    if filters.is_empty() {
        return dataset;
    }
    let Dataset { fields, records } = dataset;
    let records = records
        .into_iter()
        .filter(|record| filter::record_matches(filters, record))
        .collect();
    Dataset { fields, records }
}
