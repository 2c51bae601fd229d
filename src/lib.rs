pub mod aggregate;
pub mod cli;
pub mod config;
pub mod data;
pub mod dataset;
pub mod errors;
pub mod filter;
pub mod insight;
pub mod io_utils;
pub mod loader;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod table;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{LevelFilter, info};

use crate::{
    aggregate::{RatioSpec, WeightedMeanSpec},
    cli::{Cli, Commands, ProbeArgs, ReportArgs},
    config::{OutputTarget, PipelineConfig},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("csv_insights", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Report(args) => handle_report(&args),
        Commands::Probe(args) => handle_probe(&args),
    }
}

fn handle_report(args: &ReportArgs) -> Result<()> {
    let config = build_config(args)?;
    let summary = pipeline::execute(&config)?;
    info!(
        "Aggregated {} record(s) into {} group(s); {} insight(s), {} rule(s) skipped, {} source gap(s)",
        summary.records,
        summary.groups,
        summary.insights,
        summary.skipped_rules,
        summary.gaps
    );
    if summary.written.is_empty() && !summary.output_failures.is_empty() {
        return Err(anyhow!(
            "No report could be written: {}",
            summary
                .output_failures
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        ));
    }
    Ok(())
}

/// Builds the pipeline configuration from an optional YAML config file
/// plus command-line flags. List-valued flags extend the file's lists;
/// scalar flags override.
fn build_config(args: &ReportArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    config.sources.extend(args.inputs.iter().cloned());
    if args.delimiter.is_some() {
        config.delimiter = args.delimiter;
    }
    if args.input_encoding.is_some() {
        config.input_encoding = args.input_encoding.clone();
    }
    if !args.group_by.is_empty() {
        config.grouping.group_by = args.group_by.clone();
    }
    if !args.metrics.is_empty() {
        config.grouping.metrics = args.metrics.clone();
    }
    config.grouping.percentiles.extend(&args.percentiles);
    for spec in &args.ratios {
        config.grouping.ratios.push(parse_ratio_spec(spec)?);
    }
    for spec in &args.weighted {
        config.grouping.weighted.push(parse_weighted_spec(spec)?);
    }
    config
        .filters
        .extend(filter::parse_filters(&args.filters)?);
    if args.rules.is_some() {
        config.rules_file = args.rules.clone();
    }
    for path in &args.outputs {
        config.outputs.push(OutputTarget {
            path: path.clone(),
            format: args.format.map(Into::into),
        });
    }
    if config.outputs.is_empty() {
        // Default to a JSON report on stdout.
        config.outputs.push(OutputTarget {
            path: "-".into(),
            format: Some(args.format.map(Into::into).unwrap_or(config::OutputFormat::Json)),
        });
    }
    Ok(config)
}

fn parse_ratio_spec(spec: &str) -> Result<RatioSpec> {
    let (name, expr) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("Ratio '{spec}' must look like name=numerator/denominator"))?;
    let (numerator, denominator) = expr
        .split_once('/')
        .ok_or_else(|| anyhow!("Ratio '{spec}' must look like name=numerator/denominator"))?;
    Ok(RatioSpec {
        name: name.trim().to_string(),
        numerator: numerator.trim().to_string(),
        denominator: denominator.trim().to_string(),
    })
}

fn parse_weighted_spec(spec: &str) -> Result<WeightedMeanSpec> {
    let (value, weight) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("Weighted mean '{spec}' must look like value:weight"))?;
    Ok(WeightedMeanSpec {
        value: value.trim().to_string(),
        weight: weight.trim().to_string(),
    })
}

fn handle_probe(args: &ProbeArgs) -> Result<()> {
    let encoding = io_utils::resolve_encoding(args.input_encoding.as_deref())?;
    let outcome = loader::load_sources(&args.inputs, args.delimiter, encoding)
        .with_context(|| "Loading sources for probe")?;
    for table in &outcome.tables {
        info!(
            "Source '{}': {} row(s), {} column(s)",
            table.source,
            table.row_count(),
            table.headers.len()
        );
    }
    let normalized = normalize::normalize(&outcome.tables)?;
    let dataset = &normalized.dataset;

    let headers = vec![
        "field".to_string(),
        "type".to_string(),
        "non_null".to_string(),
    ];
    let rows = dataset
        .fields
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let non_null = dataset
                .records
                .iter()
                .filter(|record| record.get(idx).is_some())
                .count();
            vec![
                field.name.clone(),
                field.datatype.to_string(),
                non_null.to_string(),
            ]
        })
        .collect::<Vec<_>>();
    table::print_table(&headers, &rows);

    info!(
        "Union schema has {} field(s) across {} record(s); {} conflict(s), {} gap(s)",
        dataset.fields.len(),
        dataset.len(),
        normalized.conflicts.len(),
        outcome.gaps.len()
    );
    Ok(())
}
