//! Reconciles two tabular datasets through an LLM-proposed column mapping:
//! both sides are projected onto the mapping's common names, grouped,
//! summed and counted, then compared group by group.

use chrono::{Duration, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};

use crate::error::AppError;
use crate::models::mapping::Side;
use crate::models::{ColumnMapping, NamedDataset, Row};
use crate::services::completion::CompletionSource;
use crate::services::prompts;

/// Sums further apart than this are a mismatch.
pub const SUM_TOLERANCE: f64 = 0.01;

pub const TOTAL_GROUP: &str = "Total";

const MS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationRequest {
    #[serde(default)]
    pub grouping_keys: Vec<String>,
    #[serde(default)]
    pub sum_columns: Vec<String>,
    #[serde(default)]
    pub count_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationGroup {
    pub group_key: String,
    pub sums: BTreeMap<String, f64>,
    pub counts: BTreeMap<String, usize>,
    pub row_count: usize,
    pub source_rows: Vec<Row>,
}

impl AggregationGroup {
    fn empty(group_key: &str, request: &AggregationRequest) -> Self {
        Self {
            group_key: group_key.to_string(),
            sums: request.sum_columns.iter().map(|c| (c.clone(), 0.0)).collect(),
            counts: request.count_columns.iter().map(|c| (c.clone(), 0)).collect(),
            row_count: 0,
            source_rows: Vec::new(),
        }
    }

    fn add(&mut self, row: Row, request: &AggregationRequest) {
        for col in &request.sum_columns {
            *self.sums.entry(col.clone()).or_default() += numeric_value(row.get(col));
        }
        for col in &request.count_columns {
            if is_countable(row.get(col)) {
                *self.counts.entry(col.clone()).or_default() += 1;
            }
        }
        self.row_count += 1;
        self.source_rows.push(row);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupComparison {
    pub group_key: String,
    pub first: AggregationGroup,
    pub second: AggregationGroup,
    pub has_mismatch: bool,
}

impl GroupComparison {
    fn new(first: AggregationGroup, second: AggregationGroup, request: &AggregationRequest) -> Self {
        let sum_mismatch = request.sum_columns.iter().any(|col| {
            let a = first.sums.get(col).copied().unwrap_or_default();
            let b = second.sums.get(col).copied().unwrap_or_default();
            (a - b).abs() > SUM_TOLERANCE
        });
        let count_mismatch = request
            .count_columns
            .iter()
            .any(|col| first.counts.get(col) != second.counts.get(col));

        Self {
            group_key: first.group_key.clone(),
            first,
            second,
            has_mismatch: sum_mismatch || count_mismatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonOverview {
    pub dataset1_name: String,
    pub dataset2_name: String,
    pub mapped_columns: usize,
    pub dataset1_rows: usize,
    pub dataset2_rows: usize,
    pub row_counts_match: bool,
}

pub fn overview(first: &NamedDataset, second: &NamedDataset, mapping: &ColumnMapping) -> ComparisonOverview {
    ComparisonOverview {
        dataset1_name: first.name.clone(),
        dataset2_name: second.name.clone(),
        mapped_columns: mapping.mapped_on_both_sides().count(),
        dataset1_rows: first.rows.len(),
        dataset2_rows: second.rows.len(),
        row_counts_match: first.rows.len() == second.rows.len(),
    }
}

/// Renders an Excel serial day number as a calendar date. Only numbers
/// strictly between 1 and 100000 are treated as serials.
pub fn excel_serial_to_date(serial: f64) -> Option<String> {
    if !(serial > 1.0 && serial < 100_000.0) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let offset = Duration::milliseconds((serial * MS_PER_DAY).round() as i64);
    let date = epoch.checked_add_signed(offset)?.date();
    Some(date.format("%-m/%-d/%Y").to_string())
}

fn normalize_date(value: &Value) -> Value {
    match value.as_f64().and_then(excel_serial_to_date) {
        Some(date) if value.is_number() => Value::String(date),
        _ => value.clone(),
    }
}

/// Re-keys one row by common name. Columns the row lacks stay absent.
pub fn project_row(row: &Row, mapping: &ColumnMapping, side: Side) -> Row {
    let mut projected = Map::new();
    for entry in &mapping.mappings {
        let Some(source) = entry.source_column(side) else {
            continue;
        };
        let Some(value) = row.get(source) else {
            continue;
        };
        let value = if entry.is_date() {
            normalize_date(value)
        } else {
            value.clone()
        };
        projected.insert(entry.common_name.clone(), value);
    }
    projected
}

pub fn project(rows: &[Row], mapping: &ColumnMapping, side: Side) -> Vec<Row> {
    rows.par_iter().map(|row| project_row(row, mapping, side)).collect()
}

fn key_part(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Some(other) => other.to_string(),
    }
}

pub fn group_key(row: &Row, keys: &[String]) -> String {
    if keys.is_empty() {
        return TOTAL_GROUP.to_string();
    }
    let parts: SmallVec<[String; 4]> = keys.iter().map(|k| key_part(row.get(k))).collect();
    parts.join("|")
}

/// Longest leading decimal literal of `text`, the way lenient spreadsheet
/// tools read "12.5 kg" as 12.5.
fn parse_leading_float(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;
    let mut best = None;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => best = Some(end + 1),
            b'.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end += 1;
    }
    let mut last = best?;

    // optional exponent
    if matches!(bytes.get(last), Some(b'e' | b'E')) {
        let mut exp_end = last + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while matches!(bytes.get(exp_end), Some(b'0'..=b'9')) {
            exp_end += 1;
        }
        if exp_end > digits_start {
            last = exp_end;
        }
    }

    text[..last].parse::<f64>().ok()
}

/// Contribution of a cell to a sum. Non-numeric cells count as zero.
fn numeric_value(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => parse_leading_float(s),
        _ => None,
    };
    parsed.filter(|f| f.is_finite()).unwrap_or(0.0)
}

fn is_countable(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null)) && value != Some(&Value::String(String::new()))
}

/// Groups rows in order of first appearance.
pub fn summarize(rows: Vec<Row>, request: &AggregationRequest) -> Vec<AggregationGroup> {
    let mut groups: Vec<AggregationGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let key = group_key(&row, &request.grouping_keys);
        let idx = match index.get(&key) {
            Some(idx) => *idx,
            None => {
                groups.push(AggregationGroup::empty(&key, request));
                index.insert(key, groups.len() - 1);
                groups.len() - 1
            }
        };
        groups[idx].add(row, request);
    }
    groups
}

/// Projects, aggregates and compares both datasets. Groups are listed in
/// first-seen order on the first side, then groups only the second has.
pub fn compare(
    first: &[Row],
    second: &[Row],
    mapping: &ColumnMapping,
    request: &AggregationRequest,
) -> Result<Vec<GroupComparison>, AppError> {
    if request.sum_columns.is_empty() && request.count_columns.is_empty() {
        return Err(AppError::Validation(
            "Please select at least one sum or count column".to_string(),
        ));
    }

    let (projected1, projected2) = rayon::join(
        || project(first, mapping, Side::First),
        || project(second, mapping, Side::Second),
    );
    let groups1 = summarize(projected1, request);
    let mut groups2: HashMap<String, AggregationGroup> = HashMap::new();
    let mut order2: Vec<String> = Vec::new();
    for group in summarize(projected2, request) {
        order2.push(group.group_key.clone());
        groups2.insert(group.group_key.clone(), group);
    }

    let mut comparisons = Vec::with_capacity(groups1.len());
    for group in groups1 {
        let other = groups2
            .remove(&group.group_key)
            .unwrap_or_else(|| AggregationGroup::empty(&group.group_key, request));
        comparisons.push(GroupComparison::new(group, other, request));
    }
    for key in order2 {
        if let Some(group) = groups2.remove(&key) {
            let missing = AggregationGroup::empty(&key, request);
            comparisons.push(GroupComparison::new(missing, group, request));
        }
    }

    tracing::debug!(
        "Compared {} groups, {} mismatched",
        comparisons.len(),
        comparisons.iter().filter(|c| c.has_mismatch).count()
    );
    Ok(comparisons)
}

/// LLM narration of one compared group. Failures come back as text so the
/// comparison itself is never affected.
pub async fn explain_group(
    source: &dyn CompletionSource,
    model: &str,
    names: (&str, &str),
    comparison: &GroupComparison,
) -> String {
    let system = prompts::discrepancy_system(comparison.has_mismatch);
    let user = prompts::discrepancy_user(names, comparison);
    match source.complete(model, system, &user).await {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            tracing::warn!("Group narration failed for '{}': {}", comparison.group_key, e);
            format!("Analysis failed: {}", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::completion::scripted::ScriptedSource;
    use serde_json::json;

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn mapping() -> ColumnMapping {
        ColumnMapping::from_json(
            r#"{"mappings": [
                {"dataset1_column": "id", "dataset2_column": "ID", "common_name": "id", "data_type": "number"},
                {"dataset1_column": "amt", "dataset2_column": "Amount", "common_name": "amount", "data_type": "number"},
                {"dataset1_column": "day", "dataset2_column": "Day", "common_name": "day", "data_type": "date"}
            ]}"#,
        )
        .unwrap()
    }

    fn request(keys: &[&str], sums: &[&str], counts: &[&str]) -> AggregationRequest {
        let owned = |cols: &[&str]| cols.iter().map(|c| c.to_string()).collect();
        AggregationRequest {
            grouping_keys: owned(keys),
            sum_columns: owned(sums),
            count_columns: owned(counts),
        }
    }

    #[test]
    fn string_amounts_aggregate_to_matching_group() {
        let a = rows(json!([{"id": 1, "amt": "10"}, {"id": 1, "amt": "5"}]));
        let b = rows(json!([{"ID": 1, "Amount": "15"}]));
        let result = compare(&a, &b, &mapping(), &request(&["id"], &["amount"], &[])).unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].group_key, "1");
        assert_eq!(result[0].first.sums["amount"], 15.0);
        assert_eq!(result[0].second.sums["amount"], 15.0);
        assert_eq!(result[0].first.row_count, 2);
        assert!(!result[0].has_mismatch);
    }

    #[test]
    fn sums_within_tolerance_match() {
        let m = mapping();
        let req = request(&[], &["amount"], &[]);
        let close = compare(
            &rows(json!([{"amt": 100.00}])),
            &rows(json!([{"Amount": 100.009}])),
            &m,
            &req,
        )
        .unwrap();
        assert!(!close[0].has_mismatch);
        assert_eq!(close[0].group_key, TOTAL_GROUP);

        let far = compare(
            &rows(json!([{"amt": 100.00}])),
            &rows(json!([{"Amount": 100.02}])),
            &m,
            &req,
        )
        .unwrap();
        assert!(far[0].has_mismatch);
    }

    #[test]
    fn excel_serials_convert_only_inside_range() {
        assert_eq!(excel_serial_to_date(45932.0).as_deref(), Some("10/2/2025"));
        assert_eq!(excel_serial_to_date(45658.0).as_deref(), Some("1/1/2025"));
        assert_eq!(excel_serial_to_date(5.0).as_deref(), Some("1/4/1900"));
        assert_eq!(excel_serial_to_date(100_000.0), None);
        assert_eq!(excel_serial_to_date(250_000.0), None);
        assert_eq!(excel_serial_to_date(1.0), None);
    }

    #[test]
    fn projection_converts_date_columns_and_skips_missing() {
        let row = rows(json!([{"id": 7, "day": 45658, "other": "x"}])).remove(0);
        let projected = project_row(&row, &mapping(), Side::First);
        assert_eq!(Value::Object(projected), json!({"id": 7, "day": "1/1/2025"}));

        let raw = rows(json!([{"day": "45658"}])).remove(0);
        let projected = project_row(&raw, &mapping(), Side::First);
        assert_eq!(projected["day"], json!("45658"));
    }

    #[test]
    fn counts_skip_null_and_empty() {
        let a = rows(json!([{"id": 1}, {"id": null}, {"id": ""}, {"amt": 3}, {"id": 0}]));
        let groups = summarize(project(&a, &mapping(), Side::First), &request(&[], &[], &["id"]));
        assert_eq!(groups[0].counts["id"], 2);
        assert_eq!(groups[0].row_count, 5);
    }

    #[test]
    fn group_keys_stringify_values() {
        let row = rows(json!([{"a": null, "b": 2.0, "c": "x", "d": 1.5, "e": 0}])).remove(0);
        let keys: Vec<String> = ["a", "b", "c", "d", "e", "missing"].iter().map(|s| s.to_string()).collect();
        assert_eq!(group_key(&row, &keys), "|2|x|1.5|0|");
    }

    #[test]
    fn groups_from_either_side_are_unioned_in_order() {
        let a = rows(json!([{"id": 2, "amt": 1}, {"id": 1, "amt": 1}]));
        let b = rows(json!([{"ID": 3, "Amount": 4}, {"ID": 1, "Amount": 1}]));
        let result = compare(&a, &b, &mapping(), &request(&["id"], &["amount"], &["amount"])).unwrap();
        let keys: Vec<&str> = result.iter().map(|c| c.group_key.as_str()).collect();
        assert_eq!(keys, vec!["2", "1", "3"]);
        assert!(result[0].has_mismatch);
        assert_eq!(result[0].second.counts["amount"], 0);
        assert!(!result[1].has_mismatch);
        assert_eq!(result[2].first.sums["amount"], 0.0);
        assert_eq!(result[2].second.source_rows.len(), 1);
    }

    #[test]
    fn non_numeric_cells_contribute_zero() {
        let a = rows(json!([{"amt": "abc"}, {"amt": true}, {"amt": "12.5 kg"}, {"amt": "1e2"}]));
        let groups = summarize(project(&a, &mapping(), Side::First), &request(&[], &["amount"], &[]));
        assert_eq!(groups[0].sums["amount"], 112.5);
    }

    #[test]
    fn empty_selection_is_rejected() {
        let err = compare(&[], &[], &mapping(), &request(&["id"], &[], &[])).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn narration_failure_is_reported_inline() {
        let comparison = compare(
            &rows(json!([{"amt": 1}])),
            &rows(json!([{"Amount": 2}])),
            &mapping(),
            &request(&[], &["amount"], &[]),
        )
        .unwrap()
        .remove(0);

        let failing = ScriptedSource::default().replying(Err("quota exceeded"));
        let text = tokio_test::block_on(explain_group(&failing, "m", ("A", "B"), &comparison));
        assert_eq!(text, "Analysis failed: LLM API error: quota exceeded");

        let working = ScriptedSource::default().replying(Ok("  Amounts differ by 1.  "));
        let text = tokio_test::block_on(explain_group(&working, "m", ("A", "B"), &comparison));
        assert_eq!(text, "Amounts differ by 1.");
    }
}
