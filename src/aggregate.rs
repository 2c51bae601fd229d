//! Grouped aggregation: partitions a dataset by one or more key fields and
//! computes per-group statistics, weighted means, and derived ratios.
//!
//! Groups are keyed and ordered by [`ComparableValue`] tuples, so output
//! order is deterministic and null key components form their own group
//! (rendered as `unknown`) instead of being dropped. Derived ratios are
//! computed from aggregated sums, never as a mean of per-row ratios.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::{
    data::{ComparableValue, FieldType, Value},
    dataset::Dataset,
};

pub const NULL_GROUP_LABEL: &str = "unknown";

/// The tuple of key-field values identifying one group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupKey(pub Vec<ComparableValue>);

impl GroupKey {
    pub fn labels(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|component| match &component.0 {
                Some(value) => value.as_display(),
                None => NULL_GROUP_LABEL.to_string(),
            })
            .collect()
    }
}

/// A percentile requested of every metric, e.g. `p95`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub p: f64,
    pub value: Option<f64>,
}

/// `sum(value*weight) / sum(weight)` over rows where both are non-null.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedMeanSpec {
    pub value: String,
    pub weight: String,
}

impl WeightedMeanSpec {
    pub fn name(&self) -> String {
        format!("{}_weighted_by_{}", self.value, self.weight)
    }
}

/// `sum(numerator) / sum(denominator)` per group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatioSpec {
    pub name: String,
    pub numerator: String,
    pub denominator: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupingSpec {
    pub group_by: Vec<String>,
    pub metrics: Vec<String>,
    #[serde(default)]
    pub percentiles: Vec<f64>,
    #[serde(default)]
    pub weighted: Vec<WeightedMeanSpec>,
    #[serde(default)]
    pub ratios: Vec<RatioSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub metric: String,
    pub non_null: usize,
    pub sum: f64,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub stdev: Option<f64>,
    pub percentiles: Vec<PercentileValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DerivedValue {
    pub name: String,
    pub value: Option<f64>,
}

/// One group's key values (aligned with `group_by`) and statistics.
/// `count` is the number of records in the group; per-metric statistics
/// run over that metric's non-null values only.
#[derive(Debug, Clone, Serialize)]
pub struct GroupEntry {
    pub key: Vec<Option<Value>>,
    pub count: usize,
    pub metrics: Vec<MetricSummary>,
    pub weighted: Vec<DerivedValue>,
    pub ratios: Vec<DerivedValue>,
}

impl GroupEntry {
    pub fn group_key(&self) -> GroupKey {
        GroupKey(self.key.iter().cloned().map(ComparableValue).collect())
    }

    pub fn labels(&self) -> Vec<String> {
        self.group_key().labels()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationResult {
    pub group_by: Vec<String>,
    pub groups: Vec<GroupEntry>,
}

/// A statistic addressable by name in top-N selection and insight rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Stat {
    Count,
    Sum,
    Mean,
    Median,
    Min,
    Max,
    Stdev,
    Percentile(f64),
}

impl Default for Stat {
    fn default() -> Self {
        Stat::Mean
    }
}

impl FromStr for Stat {
    type Err = anyhow::Error;

    fn from_str(token: &str) -> Result<Self> {
        let lowered = token.trim().to_ascii_lowercase();
        Ok(match lowered.as_str() {
            "count" => Stat::Count,
            "sum" => Stat::Sum,
            "mean" => Stat::Mean,
            "median" => Stat::Median,
            "min" => Stat::Min,
            "max" => Stat::Max,
            "stdev" => Stat::Stdev,
            other => {
                let p = other
                    .strip_prefix('p')
                    .and_then(|digits| digits.parse::<f64>().ok())
                    .filter(|p| (0.0..=100.0).contains(p))
                    .ok_or_else(|| anyhow!("Unknown statistic '{token}'"))?;
                Stat::Percentile(p)
            }
        })
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stat::Count => write!(f, "count"),
            Stat::Sum => write!(f, "sum"),
            Stat::Mean => write!(f, "mean"),
            Stat::Median => write!(f, "median"),
            Stat::Min => write!(f, "min"),
            Stat::Max => write!(f, "max"),
            Stat::Stdev => write!(f, "stdev"),
            Stat::Percentile(p) => {
                if p.fract() == 0.0 {
                    write!(f, "p{p:.0}")
                } else {
                    write!(f, "p{p}")
                }
            }
        }
    }
}

impl From<Stat> for String {
    fn from(stat: Stat) -> Self {
        stat.to_string()
    }
}

impl TryFrom<String> for Stat {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Highest,
    Lowest,
}

/// Partitions `dataset` by the grouping fields and computes every
/// requested statistic per group.
pub fn aggregate(dataset: &Dataset, spec: &GroupingSpec) -> Result<AggregationResult> {
    if spec.group_by.is_empty() {
        return Err(anyhow!("At least one grouping field is required"));
    }
    let key_indexes = resolve_fields(dataset, &spec.group_by, false)?;
    let metric_indexes = resolve_fields(dataset, &spec.metrics, true)?;
    let weighted_indexes = spec
        .weighted
        .iter()
        .map(|w| {
            Ok((
                resolve_field(dataset, &w.value, true)?,
                resolve_field(dataset, &w.weight, true)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    let ratio_indexes = spec
        .ratios
        .iter()
        .map(|r| {
            Ok((
                resolve_field(dataset, &r.numerator, true)?,
                resolve_field(dataset, &r.denominator, true)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    for p in &spec.percentiles {
        if !(0.0..=100.0).contains(p) {
            return Err(anyhow!("Percentile {p} outside [0,100]"));
        }
    }

    let mut partitions: BTreeMap<GroupKey, Vec<usize>> = BTreeMap::new();
    for (row_idx, record) in dataset.records.iter().enumerate() {
        let key = GroupKey(
            key_indexes
                .iter()
                .map(|&idx| ComparableValue(record.0[idx].clone()))
                .collect(),
        );
        partitions.entry(key).or_default().push(row_idx);
    }

    let mut groups = Vec::with_capacity(partitions.len());
    for (key, row_indexes) in partitions {
        let metrics = spec
            .metrics
            .iter()
            .zip(&metric_indexes)
            .map(|(name, &idx)| summarize_metric(dataset, name, idx, &row_indexes, &spec.percentiles))
            .collect();
        let weighted = spec
            .weighted
            .iter()
            .zip(&weighted_indexes)
            .map(|(wspec, &(value_idx, weight_idx))| {
                weighted_mean(dataset, wspec, value_idx, weight_idx, &row_indexes)
            })
            .collect();
        let ratios = spec
            .ratios
            .iter()
            .zip(&ratio_indexes)
            .map(|(rspec, &(num_idx, den_idx))| {
                ratio(dataset, rspec, num_idx, den_idx, &row_indexes)
            })
            .collect();
        groups.push(GroupEntry {
            key: key.0.into_iter().map(|c| c.0).collect(),
            count: row_indexes.len(),
            metrics,
            weighted,
            ratios,
        });
    }

    Ok(AggregationResult {
        group_by: spec.group_by.clone(),
        groups,
    })
}

fn resolve_field(dataset: &Dataset, name: &str, numeric: bool) -> Result<usize> {
    let idx = dataset
        .field_index(name)
        .ok_or_else(|| anyhow!("Field '{name}' not found in schema"))?;
    if numeric {
        let field = &dataset.fields[idx];
        if !matches!(field.datatype, FieldType::Integer | FieldType::Float) {
            return Err(anyhow!(
                "Field '{}' is {} and cannot be used as a metric",
                field.name,
                field.datatype
            ));
        }
    }
    Ok(idx)
}

fn resolve_fields(dataset: &Dataset, names: &[String], numeric: bool) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|name| resolve_field(dataset, name, numeric))
        .collect()
}

fn numeric_values(dataset: &Dataset, field_idx: usize, rows: &[usize]) -> Vec<f64> {
    rows.iter()
        .filter_map(|&row| dataset.records[row].get(field_idx))
        .filter_map(Value::as_numeric)
        .collect()
}

fn summarize_metric(
    dataset: &Dataset,
    name: &str,
    field_idx: usize,
    rows: &[usize],
    percentiles: &[f64],
) -> MetricSummary {
    let mut values = numeric_values(dataset, field_idx, rows);
    values.sort_by(f64::total_cmp);
    let non_null = values.len();
    let sum: f64 = values.iter().sum();
    let mean = (non_null > 0).then(|| sum / non_null as f64);
    let percentiles = percentiles
        .iter()
        .map(|&p| PercentileValue {
            p,
            value: percentile(&values, p),
        })
        .collect();
    MetricSummary {
        metric: name.to_string(),
        non_null,
        sum,
        mean,
        median: percentile(&values, 50.0),
        min: values.first().copied(),
        max: values.last().copied(),
        stdev: stdev(&values, mean),
        percentiles,
    }
}

/// Linear interpolation between the two nearest ranks at
/// `p/100 * (n - 1)`; `percentile(&[10,20,30,40], 50.0)` is `25.0`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Sample standard deviation (n−1); undefined below two values.
fn stdev(values: &[f64], mean: Option<f64>) -> Option<f64> {
    let mean = mean?;
    if values.len() < 2 {
        return None;
    }
    let variance = values
        .iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>()
        / (values.len() as f64 - 1.0);
    Some(variance.max(0.0).sqrt())
}

fn weighted_mean(
    dataset: &Dataset,
    spec: &WeightedMeanSpec,
    value_idx: usize,
    weight_idx: usize,
    rows: &[usize],
) -> DerivedValue {
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    for &row in rows {
        let record = &dataset.records[row];
        if let (Some(value), Some(weight)) = (
            record.get(value_idx).and_then(Value::as_numeric),
            record.get(weight_idx).and_then(Value::as_numeric),
        ) {
            weighted_sum += value * weight;
            weight_sum += weight;
        }
    }
    DerivedValue {
        name: spec.name(),
        value: (weight_sum != 0.0).then(|| weighted_sum / weight_sum),
    }
}

/// Sum-of-sums ratio; a zero or missing denominator yields null for the
/// group rather than an error or a non-finite number.
fn ratio(
    dataset: &Dataset,
    spec: &RatioSpec,
    num_idx: usize,
    den_idx: usize,
    rows: &[usize],
) -> DerivedValue {
    let numerator: f64 = numeric_values(dataset, num_idx, rows).iter().sum();
    let denominator: f64 = numeric_values(dataset, den_idx, rows).iter().sum();
    DerivedValue {
        name: spec.name.clone(),
        value: (denominator != 0.0).then(|| numerator / denominator),
    }
}

impl AggregationResult {
    /// Looks up a group by `(field, value-label)` pairs; fields not named
    /// in the selector are unconstrained. Labels compare against the
    /// rendered key component, so `unknown` addresses the null group.
    pub fn find_group(&self, selector: &[(String, String)]) -> Option<&GroupEntry> {
        let positions: Vec<(usize, &String)> = selector
            .iter()
            .filter_map(|(field, label)| {
                self.group_by
                    .iter()
                    .position(|g| g == field)
                    .map(|idx| (idx, label))
            })
            .collect();
        if positions.len() != selector.len() {
            return None;
        }
        self.groups.iter().find(|entry| {
            let labels = entry.labels();
            positions
                .iter()
                .all(|(idx, expected)| labels[*idx] == **expected)
        })
    }

    /// Resolves a named value for a group: a ratio name, a weighted-mean
    /// name, or `stat` over a metric field.
    pub fn value_for(&self, entry: &GroupEntry, metric: &str, stat: Stat) -> Option<f64> {
        if let Some(derived) = entry.ratios.iter().find(|r| r.name == metric) {
            return derived.value;
        }
        if let Some(derived) = entry.weighted.iter().find(|w| w.name == metric) {
            return derived.value;
        }
        if stat == Stat::Count {
            return Some(entry.count as f64);
        }
        let summary = entry.metrics.iter().find(|m| m.metric == metric)?;
        match stat {
            Stat::Count => unreachable!("handled above"),
            Stat::Sum => Some(summary.sum),
            Stat::Mean => summary.mean,
            Stat::Median => summary.median,
            Stat::Min => summary.min,
            Stat::Max => summary.max,
            Stat::Stdev => summary.stdev,
            Stat::Percentile(p) => summary
                .percentiles
                .iter()
                .find(|entry| entry.p == p)
                .and_then(|entry| entry.value),
        }
    }

    /// The `n` groups with the highest (or lowest) value of
    /// `stat(metric)`. Ties keep GroupKey order; groups with a null value
    /// sort last and never displace a group that has one.
    pub fn top_n(
        &self,
        metric: &str,
        stat: Stat,
        direction: Direction,
        n: usize,
    ) -> Vec<(&GroupEntry, f64)> {
        let mut ranked: Vec<(&GroupEntry, f64)> = self
            .groups
            .iter()
            .filter_map(|entry| self.value_for(entry, metric, stat).map(|v| (entry, v)))
            .collect();
        // Stable sort over the key-ordered groups keeps lexical tie-break.
        match direction {
            Direction::Highest => ranked.sort_by(|a, b| b.1.total_cmp(&a.1)),
            Direction::Lowest => ranked.sort_by(|a, b| a.1.total_cmp(&b.1)),
        }
        ranked.truncate(n);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{FieldMeta, Record};

    fn vendor_cost_dataset() -> Dataset {
        let fields = vec![
            FieldMeta {
                name: "vendor".into(),
                datatype: FieldType::String,
            },
            FieldMeta {
                name: "cost".into(),
                datatype: FieldType::Float,
            },
            FieldMeta {
                name: "volume".into(),
                datatype: FieldType::Float,
            },
        ];
        let rows: Vec<(Option<&str>, Option<f64>, Option<f64>)> = vec![
            (Some("A"), Some(10.0), Some(1.0)),
            (Some("A"), None, Some(3.0)),
            (Some("B"), Some(20.0), Some(2.0)),
        ];
        let records = rows
            .into_iter()
            .map(|(vendor, cost, volume)| {
                Record(vec![
                    vendor.map(|v| Value::String(v.into())),
                    cost.map(Value::Float),
                    volume.map(Value::Float),
                ])
            })
            .collect();
        Dataset { fields, records }
    }

    fn spec() -> GroupingSpec {
        GroupingSpec {
            group_by: vec!["vendor".into()],
            metrics: vec!["cost".into()],
            percentiles: vec![],
            weighted: vec![],
            ratios: vec![],
        }
    }

    #[test]
    fn null_metrics_count_toward_group_count_but_not_stats() {
        let result = aggregate(&vendor_cost_dataset(), &spec()).unwrap();
        assert_eq!(result.groups.len(), 2);

        let a = &result.groups[0];
        assert_eq!(a.labels(), ["A"]);
        assert_eq!(a.count, 2);
        assert_eq!(a.metrics[0].non_null, 1);
        assert_eq!(a.metrics[0].mean, Some(10.0));

        let b = &result.groups[1];
        assert_eq!(b.count, 1);
        assert_eq!(b.metrics[0].mean, Some(20.0));
    }

    #[test]
    fn group_counts_partition_the_dataset() {
        let ds = vendor_cost_dataset();
        let result = aggregate(&ds, &spec()).unwrap();
        let total: usize = result.groups.iter().map(|g| g.count).sum();
        assert_eq!(total, ds.len());
    }

    #[test]
    fn percentile_uses_linear_interpolation() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 50.0), Some(25.0));
        assert_eq!(percentile(&values, 0.0), Some(10.0));
        assert_eq!(percentile(&values, 100.0), Some(40.0));
        assert_eq!(percentile(&values, 25.0), Some(17.5));
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[7.0], 95.0), Some(7.0));
    }

    #[test]
    fn ratio_is_sum_of_sums_not_mean_of_ratios() {
        let mut spec = spec();
        spec.group_by = vec!["vendor".into()];
        spec.ratios = vec![RatioSpec {
            name: "cost_per_volume".into(),
            numerator: "cost".into(),
            denominator: "volume".into(),
        }];
        let result = aggregate(&vendor_cost_dataset(), &spec).unwrap();

        // Group A: sum(cost)=10 over sum(volume)=4 (the null-cost row still
        // contributes its volume), not mean(10/1) = 10.
        let a = &result.groups[0];
        assert_eq!(a.ratios[0].value, Some(2.5));
    }

    #[test]
    fn weighted_mean_is_sum_of_products_over_sum_of_weights() {
        let mut spec = spec();
        spec.weighted = vec![WeightedMeanSpec {
            value: "cost".into(),
            weight: "volume".into(),
        }];
        let result = aggregate(&vendor_cost_dataset(), &spec).unwrap();

        // Group A: the row with null cost is excluded entirely, so
        // (10*1)/1 = 10.
        assert_eq!(result.groups[0].weighted[0].value, Some(10.0));
        assert_eq!(result.groups[0].weighted[0].name, "cost_weighted_by_volume");
    }

    #[test]
    fn null_group_key_forms_its_own_group() {
        let mut ds = vendor_cost_dataset();
        ds.records.push(Record(vec![None, Some(Value::Float(5.0)), None]));
        let result = aggregate(&ds, &spec()).unwrap();

        assert_eq!(result.groups.len(), 3);
        // Null keys sort first.
        assert_eq!(result.groups[0].labels(), [NULL_GROUP_LABEL]);
        assert_eq!(result.groups[0].count, 1);
    }

    #[test]
    fn top_n_breaks_ties_by_key_order() {
        let ds = Dataset {
            fields: vec![
                FieldMeta {
                    name: "vendor".into(),
                    datatype: FieldType::String,
                },
                FieldMeta {
                    name: "cost".into(),
                    datatype: FieldType::Float,
                },
            ],
            records: vec![
                Record(vec![
                    Some(Value::String("zeta".into())),
                    Some(Value::Float(10.0)),
                ]),
                Record(vec![
                    Some(Value::String("alpha".into())),
                    Some(Value::Float(10.0)),
                ]),
                Record(vec![
                    Some(Value::String("mid".into())),
                    Some(Value::Float(5.0)),
                ]),
            ],
        };
        let result = aggregate(
            &ds,
            &GroupingSpec {
                group_by: vec!["vendor".into()],
                metrics: vec!["cost".into()],
                ..Default::default()
            },
        )
        .unwrap();
        let top = result.top_n("cost", Stat::Mean, Direction::Highest, 2);
        assert_eq!(top[0].0.labels(), ["alpha"]);
        assert_eq!(top[1].0.labels(), ["zeta"]);
    }

    #[test]
    fn stat_parses_percentile_tokens() {
        assert_eq!("p95".parse::<Stat>().unwrap(), Stat::Percentile(95.0));
        assert_eq!("median".parse::<Stat>().unwrap(), Stat::Median);
        assert!("p200".parse::<Stat>().is_err());
        assert!("avg".parse::<Stat>().is_err());
    }

    #[test]
    fn zero_denominator_ratio_is_null() {
        let ds = Dataset {
            fields: vec![
                FieldMeta {
                    name: "vendor".into(),
                    datatype: FieldType::String,
                },
                FieldMeta {
                    name: "cost".into(),
                    datatype: FieldType::Float,
                },
                FieldMeta {
                    name: "volume".into(),
                    datatype: FieldType::Float,
                },
            ],
            records: vec![Record(vec![
                Some(Value::String("A".into())),
                Some(Value::Float(10.0)),
                Some(Value::Float(0.0)),
            ])],
        };
        let spec = GroupingSpec {
            group_by: vec!["vendor".into()],
            metrics: vec!["cost".into()],
            ratios: vec![RatioSpec {
                name: "cost_per_volume".into(),
                numerator: "cost".into(),
                denominator: "volume".into(),
            }],
            ..Default::default()
        };
        let result = aggregate(&ds, &spec).unwrap();
        assert_eq!(result.groups[0].ratios[0].value, None);
    }
}
