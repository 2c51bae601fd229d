//! Declarative insight rules evaluated over an aggregation result.
//!
//! Rules are data, not code: a YAML rules file (or programmatic
//! construction) describes which findings to look for, and evaluation
//! yields the same ordered list of insights for the same input. A rule
//! whose referenced groups or metrics are absent is skipped and the skip
//! recorded, so callers can tell "no finding" apart from "not enough
//! data".

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationResult, Direction, GroupEntry, Stat};
use crate::errors::PipelineError;

fn default_top_n() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Rule {
    /// The N best (or worst) groups by a statistic.
    Top {
        label: String,
        metric: String,
        #[serde(default)]
        stat: Stat,
        #[serde(default)]
        direction: Direction,
        #[serde(default = "default_top_n")]
        n: usize,
    },
    /// Percentage delta (or multiplier) of a comparison group over a
    /// baseline group, emitted when it clears a minimum.
    Premium {
        label: String,
        metric: String,
        #[serde(default)]
        stat: Stat,
        baseline: BTreeMap<String, String>,
        comparison: BTreeMap<String, String>,
        #[serde(default)]
        min_delta_pct: f64,
        #[serde(default)]
        as_multiplier: bool,
    },
    /// Every group whose statistic is above (or below) a constant.
    Threshold {
        label: String,
        metric: String,
        #[serde(default)]
        stat: Stat,
        op: ThresholdOp,
        value: f64,
    },
    /// Max/min multiplier of a statistic across all groups.
    Spread {
        label: String,
        metric: String,
        #[serde(default)]
        stat: Stat,
    },
}

impl Rule {
    pub fn label(&self) -> &str {
        match self {
            Rule::Top { label, .. }
            | Rule::Premium { label, .. }
            | Rule::Threshold { label, .. }
            | Rule::Spread { label, .. } => label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOp {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Comparison {
    Multiplier,
    PercentDelta,
    Absolute,
    Rank,
}

/// One finding: a labeled, typed value scoped to the groups and metric it
/// was computed from.
#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    pub label: String,
    pub scope: String,
    pub value: f64,
    pub comparison: Comparison,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRule {
    pub rule: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InsightSet {
    pub insights: Vec<Insight>,
    pub skipped: Vec<SkippedRule>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<Rule>,
}

pub fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    let file = File::open(path).with_context(|| format!("Opening rules file {path:?}"))?;
    let parsed: RuleFile = serde_yaml::from_reader(file)
        .with_context(|| format!("Parsing rules file {path:?}"))?;
    Ok(parsed.rules)
}

/// Evaluates every rule in order. Per-rule failures become skips, never
/// aborts.
pub fn evaluate_rules(result: &AggregationResult, rules: &[Rule]) -> InsightSet {
    let mut set = InsightSet::default();
    for rule in rules {
        match evaluate_rule(result, rule) {
            Ok(insights) => set.insights.extend(insights),
            Err(err) => {
                warn!("{err}");
                set.skipped.push(SkippedRule {
                    rule: rule.label().to_string(),
                    reason: skip_reason(&err),
                });
            }
        }
    }
    set
}

fn skip_reason(err: &PipelineError) -> String {
    match err {
        PipelineError::InsufficientData { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

fn insufficient(rule: &Rule, reason: impl Into<String>) -> PipelineError {
    PipelineError::InsufficientData {
        rule: rule.label().to_string(),
        reason: reason.into(),
    }
}

fn evaluate_rule(
    result: &AggregationResult,
    rule: &Rule,
) -> std::result::Result<Vec<Insight>, PipelineError> {
    match rule {
        Rule::Top {
            label,
            metric,
            stat,
            direction,
            n,
        } => {
            let ranked = result.top_n(metric, *stat, *direction, *n);
            if ranked.is_empty() {
                return Err(insufficient(
                    rule,
                    format!("no group has a value for {stat}({metric})"),
                ));
            }
            Ok(ranked
                .into_iter()
                .enumerate()
                .map(|(rank, (entry, value))| {
                    let scope = scope_of(result, entry);
                    Insight {
                        label: label.clone(),
                        scope: scope.clone(),
                        value,
                        comparison: Comparison::Rank,
                        detail: format!(
                            "#{place} {scope}: {stat}({metric}) = {value}",
                            place = rank + 1,
                            value = format_number(value)
                        ),
                    }
                })
                .collect())
        }
        Rule::Premium {
            label,
            metric,
            stat,
            baseline,
            comparison,
            min_delta_pct,
            as_multiplier,
        } => {
            let base_entry = find_group(result, rule, baseline)?;
            let cmp_entry = find_group(result, rule, comparison)?;
            let base = result
                .value_for(base_entry, metric, *stat)
                .ok_or_else(|| missing_value(rule, metric, *stat, baseline))?;
            let cmp = result
                .value_for(cmp_entry, metric, *stat)
                .ok_or_else(|| missing_value(rule, metric, *stat, comparison))?;
            if base == 0.0 {
                return Err(insufficient(rule, "baseline value is zero"));
            }
            let multiplier = cmp / base;
            let delta_pct = (multiplier - 1.0) * 100.0;
            if delta_pct.abs() < *min_delta_pct {
                return Ok(Vec::new());
            }
            let scope = format!(
                "{} vs {} on {stat}({metric})",
                selector_label(comparison),
                selector_label(baseline)
            );
            Ok(vec![if *as_multiplier {
                Insight {
                    label: label.clone(),
                    scope: scope.clone(),
                    value: multiplier,
                    comparison: Comparison::Multiplier,
                    detail: format!("{scope}: {}x", format_number(multiplier)),
                }
            } else {
                Insight {
                    label: label.clone(),
                    scope: scope.clone(),
                    value: delta_pct,
                    comparison: Comparison::PercentDelta,
                    detail: format!("{scope}: {:+.1}%", delta_pct),
                }
            }])
        }
        Rule::Threshold {
            label,
            metric,
            stat,
            op,
            value,
        } => {
            let mut insights = Vec::new();
            let mut any_value = false;
            for entry in &result.groups {
                let Some(actual) = result.value_for(entry, metric, *stat) else {
                    continue;
                };
                any_value = true;
                let passes = match op {
                    ThresholdOp::Above => actual > *value,
                    ThresholdOp::Below => actual < *value,
                };
                if passes {
                    let scope = scope_of(result, entry);
                    insights.push(Insight {
                        label: label.clone(),
                        scope: scope.clone(),
                        value: actual,
                        comparison: Comparison::Absolute,
                        detail: format!(
                            "{scope}: {stat}({metric}) = {} ({} {})",
                            format_number(actual),
                            match op {
                                ThresholdOp::Above => "above",
                                ThresholdOp::Below => "below",
                            },
                            format_number(*value)
                        ),
                    });
                }
            }
            if !any_value {
                return Err(insufficient(
                    rule,
                    format!("no group has a value for {stat}({metric})"),
                ));
            }
            Ok(insights)
        }
        Rule::Spread { label, metric, stat } => {
            let values: Vec<(&GroupEntry, f64)> = result
                .groups
                .iter()
                .filter_map(|entry| result.value_for(entry, metric, *stat).map(|v| (entry, v)))
                .collect();
            if values.len() < 2 {
                return Err(insufficient(
                    rule,
                    format!("need at least two groups with {stat}({metric})"),
                ));
            }
            let (min_entry, min_value) = values
                .iter()
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .copied()
                .expect("non-empty");
            let (max_entry, max_value) = values
                .iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .copied()
                .expect("non-empty");
            if min_value == 0.0 {
                return Err(insufficient(rule, "smallest value is zero"));
            }
            let multiplier = max_value / min_value;
            let scope = format!(
                "{} vs {} on {stat}({metric})",
                scope_of(result, max_entry),
                scope_of(result, min_entry)
            );
            Ok(vec![Insight {
                label: label.clone(),
                scope: scope.clone(),
                value: multiplier,
                comparison: Comparison::Multiplier,
                detail: format!("{scope}: {}x spread", format_number(multiplier)),
            }])
        }
    }
}

fn find_group<'a>(
    result: &'a AggregationResult,
    rule: &Rule,
    selector: &BTreeMap<String, String>,
) -> std::result::Result<&'a GroupEntry, PipelineError> {
    let pairs: Vec<(String, String)> = selector
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    result
        .find_group(&pairs)
        .ok_or_else(|| insufficient(rule, format!("group {} not present", selector_label(selector))))
}

fn missing_value(
    rule: &Rule,
    metric: &str,
    stat: Stat,
    selector: &BTreeMap<String, String>,
) -> PipelineError {
    insufficient(
        rule,
        format!(
            "group {} has no value for {stat}({metric})",
            selector_label(selector)
        ),
    )
}

fn selector_label(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(field, value)| format!("{field}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn scope_of(result: &AggregationResult, entry: &GroupEntry) -> String {
    result
        .group_by
        .iter()
        .zip(entry.labels())
        .map(|(field, label)| format!("{field}={label}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.4}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{GroupingSpec, aggregate};
    use crate::data::{FieldType, Value};
    use crate::dataset::{Dataset, FieldMeta, Record};

    fn result() -> AggregationResult {
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
                    Some(Value::String("aws".into())),
                    Some(Value::Float(10.0)),
                ]),
                Record(vec![
                    Some(Value::String("gcp".into())),
                    Some(Value::Float(15.0)),
                ]),
                Record(vec![
                    Some(Value::String("azure".into())),
                    Some(Value::Float(40.0)),
                ]),
            ],
        };
        aggregate(
            &ds,
            &GroupingSpec {
                group_by: vec!["vendor".into()],
                metrics: vec!["cost".into()],
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn selector(value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("vendor".to_string(), value.to_string())])
    }

    #[test]
    fn top_rule_emits_ranked_insights() {
        let rules = vec![Rule::Top {
            label: "most expensive vendors".into(),
            metric: "cost".into(),
            stat: Stat::Mean,
            direction: Direction::Highest,
            n: 2,
        }];
        let set = evaluate_rules(&result(), &rules);
        assert_eq!(set.insights.len(), 2);
        assert_eq!(set.insights[0].scope, "vendor=azure");
        assert_eq!(set.insights[0].comparison, Comparison::Rank);
        assert_eq!(set.insights[1].scope, "vendor=gcp");
        assert!(set.skipped.is_empty());
    }

    #[test]
    fn premium_rule_computes_percent_delta() {
        let rules = vec![Rule::Premium {
            label: "gcp premium over aws".into(),
            metric: "cost".into(),
            stat: Stat::Mean,
            baseline: selector("aws"),
            comparison: selector("gcp"),
            min_delta_pct: 10.0,
            as_multiplier: false,
        }];
        let set = evaluate_rules(&result(), &rules);
        assert_eq!(set.insights.len(), 1);
        assert_eq!(set.insights[0].comparison, Comparison::PercentDelta);
        assert!((set.insights[0].value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn premium_below_minimum_is_no_finding_not_a_skip() {
        let rules = vec![Rule::Premium {
            label: "gcp premium over aws".into(),
            metric: "cost".into(),
            stat: Stat::Mean,
            baseline: selector("aws"),
            comparison: selector("gcp"),
            min_delta_pct: 80.0,
            as_multiplier: false,
        }];
        let set = evaluate_rules(&result(), &rules);
        assert!(set.insights.is_empty());
        assert!(set.skipped.is_empty());
    }

    #[test]
    fn missing_group_is_recorded_as_skip() {
        let rules = vec![Rule::Premium {
            label: "oracle premium".into(),
            metric: "cost".into(),
            stat: Stat::Mean,
            baseline: selector("aws"),
            comparison: selector("oracle"),
            min_delta_pct: 0.0,
            as_multiplier: false,
        }];
        let set = evaluate_rules(&result(), &rules);
        assert!(set.insights.is_empty());
        assert_eq!(set.skipped.len(), 1);
        assert_eq!(set.skipped[0].rule, "oracle premium");
        assert!(set.skipped[0].reason.contains("vendor=oracle"));
    }

    #[test]
    fn spread_rule_reports_max_over_min_multiplier() {
        let rules = vec![Rule::Spread {
            label: "cost spread".into(),
            metric: "cost".into(),
            stat: Stat::Mean,
        }];
        let set = evaluate_rules(&result(), &rules);
        assert_eq!(set.insights.len(), 1);
        assert_eq!(set.insights[0].comparison, Comparison::Multiplier);
        assert!((set.insights[0].value - 4.0).abs() < 1e-9);
    }

    #[test]
    fn threshold_rule_selects_passing_groups_in_key_order() {
        let rules = vec![Rule::Threshold {
            label: "over budget".into(),
            metric: "cost".into(),
            stat: Stat::Mean,
            op: ThresholdOp::Above,
            value: 12.0,
        }];
        let set = evaluate_rules(&result(), &rules);
        assert_eq!(set.insights.len(), 2);
        assert_eq!(set.insights[0].scope, "vendor=azure");
        assert_eq!(set.insights[1].scope, "vendor=gcp");
    }

    #[test]
    fn rules_parse_from_yaml() {
        let yaml = r#"
rules:
  - kind: top
    label: cheapest tiers
    metric: price_per_tb_month
    stat: mean
    direction: lowest
    n: 5
  - kind: premium
    label: regional premium
    metric: price_per_tb_month
    stat: mean
    baseline: { region: us-east-1 }
    comparison: { region: eu-west-1 }
    min_delta_pct: 5
  - kind: spread
    label: archive vs standard
    metric: price_per_tb_month
    stat: p50
"#;
        let parsed: RuleFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.rules.len(), 3);
        assert_eq!(parsed.rules[0].label(), "cheapest tiers");
        match &parsed.rules[2] {
            Rule::Spread { stat, .. } => assert_eq!(*stat, Stat::Percentile(50.0)),
            other => panic!("expected spread rule, got {other:?}"),
        }
    }
}
