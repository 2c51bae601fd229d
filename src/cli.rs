use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::OutputFormat;

#[derive(Debug, Parser)]
#[command(author, version, about = "Aggregate CSV datasets into statistics and insight reports", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the full pipeline and write one or more report formats
    Report(ReportArgs),
    /// Load and normalize sources, then print the resolved schema
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Input CSV files (repeatable; a missing file is recorded as a gap)
    #[arg(short = 'i', long = "input", action = clap::ArgAction::Append)]
    pub inputs: Vec<PathBuf>,
    /// YAML pipeline configuration; flags extend its lists and override its scalars
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    /// Grouping fields (comma-separated or repeated)
    #[arg(short = 'g', long = "group-by", value_delimiter = ',')]
    pub group_by: Vec<String>,
    /// Metric fields to summarize (comma-separated or repeated)
    #[arg(short = 'm', long = "metric", value_delimiter = ',')]
    pub metrics: Vec<String>,
    /// Extra percentile to compute for every metric, e.g. 95 (repeatable)
    #[arg(long = "percentile", action = clap::ArgAction::Append)]
    pub percentiles: Vec<f64>,
    /// Derived ratio of aggregated sums, as `name=numerator/denominator`
    #[arg(long = "ratio", action = clap::ArgAction::Append)]
    pub ratios: Vec<String>,
    /// Weighted mean, as `value:weight`
    #[arg(long = "weighted-mean", action = clap::ArgAction::Append)]
    pub weighted: Vec<String>,
    /// Row-level filters such as `cost>=100` or `tier = Standard`
    #[arg(long = "filter", action = clap::ArgAction::Append)]
    pub filters: Vec<String>,
    /// YAML rules file driving insight generation
    #[arg(long = "rules")]
    pub rules: Option<PathBuf>,
    /// Report destination; format from extension (.json/.csv/.md), `-` for stdout
    #[arg(short = 'o', long = "output", action = clap::ArgAction::Append)]
    pub outputs: Vec<PathBuf>,
    /// Force the output format for every destination
    #[arg(long = "format")]
    pub format: Option<FormatArg>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Input CSV files to inspect (repeatable)
    #[arg(short = 'i', long = "input", required = true, action = clap::ArgAction::Append)]
    pub inputs: Vec<PathBuf>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum FormatArg {
    Json,
    Csv,
    Markdown,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Csv => OutputFormat::Csv,
            FormatArg::Markdown => OutputFormat::Markdown,
        }
    }
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
