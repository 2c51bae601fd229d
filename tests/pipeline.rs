use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use serde_json::Value as Json;

mod common;
use common::{TestWorkspace, fixture_path};

fn read_json(path: &std::path::Path) -> Json {
    let raw = fs::read_to_string(path).expect("read report");
    serde_json::from_str(&raw).expect("parse report JSON")
}

#[test]
fn report_merges_sources_and_groups_by_vendor() {
    let workspace = TestWorkspace::new();
    let out = workspace.path().join("report.json");

    cargo_bin_cmd!("csv-insights")
        .args([
            "report",
            "-i",
            fixture_path("storage_pricing_aws.csv").to_str().unwrap(),
            "-i",
            fixture_path("storage_pricing_gcp.csv").to_str().unwrap(),
            "-g",
            "vendor",
            "-m",
            "price_per_tb_month",
            "-o",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();

    let report = read_json(&out);
    assert_eq!(report["metadata"]["record_count"], 7);
    assert_eq!(report["metadata"]["gaps"].as_array().unwrap().len(), 0);

    let groups = report["aggregates"]["groups"].as_array().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["key"][0], "AWS");
    assert_eq!(groups[0]["count"], 4);
    let aws_mean = groups[0]["metrics"][0]["mean"].as_f64().unwrap();
    assert!((aws_mean - 15.9).abs() < 1e-9);
    assert_eq!(groups[1]["key"][0], "GCP");
    assert_eq!(groups[1]["count"], 3);
}

#[test]
fn missing_source_is_reported_as_gap_and_run_completes() {
    let workspace = TestWorkspace::new();
    let out = workspace.path().join("report.json");
    let missing = workspace.path().join("does_not_exist.csv");

    cargo_bin_cmd!("csv-insights")
        .args([
            "report",
            "-i",
            fixture_path("storage_pricing_aws.csv").to_str().unwrap(),
            "-i",
            fixture_path("storage_pricing_gcp.csv").to_str().unwrap(),
            "-i",
            missing.to_str().unwrap(),
            "-g",
            "vendor",
            "-m",
            "price_per_tb_month",
            "-o",
            out.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stderr(contains("Skipping source"));

    let report = read_json(&out);
    let gaps = report["metadata"]["gaps"].as_array().unwrap();
    assert_eq!(gaps.len(), 1);
    assert!(
        gaps[0]["source"]
            .as_str()
            .unwrap()
            .contains("does_not_exist.csv")
    );
    // The two readable sources still contribute every record.
    assert_eq!(report["metadata"]["record_count"], 7);
}

#[test]
fn run_fails_when_no_source_is_readable() {
    let workspace = TestWorkspace::new();
    let out = workspace.path().join("report.json");

    cargo_bin_cmd!("csv-insights")
        .args([
            "report",
            "-i",
            workspace.path().join("nope.csv").to_str().unwrap(),
            "-g",
            "vendor",
            "-m",
            "price_per_tb_month",
            "-o",
            out.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(contains("none of the configured sources"));
}

#[test]
fn filters_subset_rows_before_aggregation() {
    let workspace = TestWorkspace::new();
    let out = workspace.path().join("report.json");

    cargo_bin_cmd!("csv-insights")
        .args([
            "report",
            "-i",
            fixture_path("storage_pricing_aws.csv").to_str().unwrap(),
            "-i",
            fixture_path("storage_pricing_gcp.csv").to_str().unwrap(),
            "-g",
            "vendor",
            "-m",
            "price_per_tb_month",
            "--filter",
            "tier = Standard",
            "-o",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();

    let report = read_json(&out);
    assert_eq!(report["metadata"]["record_count"], 3);
    let groups = report["aggregates"]["groups"].as_array().unwrap();
    assert_eq!(groups[0]["count"], 2);
    assert_eq!(groups[1]["count"], 1);
    assert_eq!(report["metadata"]["filters"][0], "tier = Standard");
}

#[test]
fn rules_file_drives_insights_and_records_skips() {
    let workspace = TestWorkspace::new();
    let out = workspace.path().join("report.json");
    let rules = workspace.write(
        "rules.yml",
        r#"
rules:
  - kind: top
    label: priciest vendors
    metric: price_per_tb_month
    stat: mean
    n: 2
  - kind: premium
    label: aws premium over gcp
    metric: price_per_tb_month
    baseline: { vendor: GCP }
    comparison: { vendor: AWS }
  - kind: premium
    label: azure premium
    metric: price_per_tb_month
    baseline: { vendor: GCP }
    comparison: { vendor: Azure }
"#,
    );

    cargo_bin_cmd!("csv-insights")
        .args([
            "report",
            "-i",
            fixture_path("storage_pricing_aws.csv").to_str().unwrap(),
            "-i",
            fixture_path("storage_pricing_gcp.csv").to_str().unwrap(),
            "-g",
            "vendor",
            "-m",
            "price_per_tb_month",
            "--rules",
            rules.to_str().unwrap(),
            "-o",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();

    let report = read_json(&out);
    let insights = report["insights"]["insights"].as_array().unwrap();
    assert_eq!(insights.len(), 3);
    assert_eq!(insights[0]["comparison"], "rank");
    assert_eq!(insights[0]["scope"], "vendor=AWS");

    let premium = insights
        .iter()
        .find(|i| i["label"] == "aws premium over gcp")
        .expect("premium insight");
    assert_eq!(premium["comparison"], "percent-delta");
    let delta = premium["value"].as_f64().unwrap();
    assert!((delta - 40.294117647058826).abs() < 1e-9);

    let skipped = report["insights"]["skipped"].as_array().unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0]["rule"], "azure premium");
}

#[test]
fn csv_and_markdown_targets_are_written_alongside_json() {
    let workspace = TestWorkspace::new();
    let json_out = workspace.path().join("report.json");
    let csv_out = workspace.path().join("report.csv");
    let md_out = workspace.path().join("report.md");

    cargo_bin_cmd!("csv-insights")
        .args([
            "report",
            "-i",
            fixture_path("storage_pricing_aws.csv").to_str().unwrap(),
            "-g",
            "vendor,tier",
            "-m",
            "price_per_tb_month",
            "-o",
            json_out.to_str().unwrap(),
            "-o",
            csv_out.to_str().unwrap(),
            "-o",
            md_out.to_str().unwrap(),
        ])
        .assert()
        .success();

    let csv_text = fs::read_to_string(&csv_out).expect("read csv report");
    let mut lines = csv_text.lines();
    let header = lines.next().expect("csv header");
    assert!(header.starts_with("vendor,tier,count,"));
    assert!(header.contains("price_per_tb_month_mean"));
    // One row per (vendor, tier) group.
    assert_eq!(lines.count(), 3);

    let md_text = fs::read_to_string(&md_out).expect("read markdown report");
    assert!(md_text.starts_with("# Aggregation report"));
    assert!(md_text.contains("| vendor |"));
    assert!(md_text.contains("## Insights"));
}

#[test]
fn aggregates_and_insights_are_deterministic_across_runs() {
    let workspace = TestWorkspace::new();
    let first = workspace.path().join("first.json");
    let second = workspace.path().join("second.json");

    for out in [&first, &second] {
        cargo_bin_cmd!("csv-insights")
            .args([
                "report",
                "-i",
                fixture_path("storage_pricing_aws.csv").to_str().unwrap(),
                "-i",
                fixture_path("storage_pricing_gcp.csv").to_str().unwrap(),
                "-g",
                "vendor",
                "-m",
                "price_per_tb_month",
                "--percentile",
                "95",
                "-o",
                out.to_str().unwrap(),
            ])
            .assert()
            .success();
    }

    let a = read_json(&first);
    let b = read_json(&second);
    // generated_at is the one field allowed to differ.
    assert_eq!(a["aggregates"], b["aggregates"]);
    assert_eq!(a["insights"], b["insights"]);
}

#[test]
fn weighted_mean_and_ratio_flags_reach_the_report() {
    let workspace = TestWorkspace::new();
    let out = workspace.path().join("report.json");

    cargo_bin_cmd!("csv-insights")
        .args([
            "report",
            "-i",
            fixture_path("storage_pricing_aws.csv").to_str().unwrap(),
            "-g",
            "vendor",
            "-m",
            "price_per_tb_month",
            "--ratio",
            "price_per_capacity=price_per_tb_month/capacity_tb",
            "--weighted-mean",
            "price_per_tb_month:capacity_tb",
            "-o",
            out.to_str().unwrap(),
        ])
        .assert()
        .success();

    let report = read_json(&out);
    let group = &report["aggregates"]["groups"][0];
    assert_eq!(group["ratios"][0]["name"], "price_per_capacity");
    let ratio = group["ratios"][0]["value"].as_f64().unwrap();
    // sum(price) / sum(capacity) = 63.6 / 800
    assert!((ratio - 63.6 / 800.0).abs() < 1e-12);

    let weighted = group["weighted"][0]["value"].as_f64().unwrap();
    // (23*100 + 12.5*100 + 3.6*500 + 24.5*100) / 800
    assert!((weighted - 9.75).abs() < 1e-9);
}
