//! The explicit configuration object one pipeline run executes from.
//!
//! Everything a run needs — sources, grouping, metrics, filters, rules,
//! output targets — travels in a [`PipelineConfig`]. A whole run can be
//! described by a YAML file, or the CLI assembles one from flags; nothing
//! is read from process-wide state.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer};

use crate::{aggregate::GroupingSpec, filter::FilterCondition, insight::Rule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Csv,
    Markdown,
}

impl OutputFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Some(OutputFormat::Json),
            Some("csv") | Some("tsv") => Some(OutputFormat::Csv),
            Some("md") | Some("markdown") => Some(OutputFormat::Markdown),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Markdown => "markdown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputTarget {
    pub path: PathBuf,
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

impl OutputTarget {
    /// The effective format: explicit, else derived from the extension.
    pub fn resolve_format(&self) -> Result<OutputFormat> {
        self.format
            .or_else(|| OutputFormat::from_extension(&self.path))
            .ok_or_else(|| {
                anyhow!(
                    "Cannot determine output format for {:?}; use .json/.csv/.md or set format",
                    self.path
                )
            })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PipelineConfig {
    pub sources: Vec<PathBuf>,
    #[serde(default, deserialize_with = "de_delimiter")]
    pub delimiter: Option<u8>,
    #[serde(default)]
    pub input_encoding: Option<String>,
    #[serde(default)]
    pub grouping: GroupingSpec,
    #[serde(default)]
    pub filters: Vec<FilterCondition>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
    #[serde(default)]
    pub outputs: Vec<OutputTarget>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening config file {path:?}"))?;
        let config: PipelineConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Parsing config file {path:?}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("At least one input source is required"));
        }
        if self.grouping.group_by.is_empty() {
            return Err(anyhow!("At least one grouping field is required"));
        }
        if self.grouping.metrics.is_empty()
            && self.grouping.ratios.is_empty()
            && self.grouping.weighted.is_empty()
        {
            return Err(anyhow!(
                "At least one metric, ratio, or weighted mean is required"
            ));
        }
        for target in &self.outputs {
            target.resolve_format()?;
        }
        Ok(())
    }
}

fn de_delimiter<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let token: Option<String> = Option::deserialize(deserializer)?;
    match token {
        None => Ok(None),
        Some(token) => crate::cli::parse_delimiter(&token)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
