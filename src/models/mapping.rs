use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    String,
    Number,
    Date,
    Boolean,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset1_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset2_column: Option<String>,
    pub common_name: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub suitable_for_sum: bool,
    #[serde(default)]
    pub suitable_for_count: bool,
    #[serde(default)]
    pub is_excel_date_serial: bool,
}

impl Mapping {
    pub fn source_column(&self, side: Side) -> Option<&str> {
        let column = match side {
            Side::First => self.dataset1_column.as_deref(),
            Side::Second => self.dataset2_column.as_deref(),
        };
        column.filter(|name| !name.is_empty())
    }

    pub fn is_mapped_on_both_sides(&self) -> bool {
        self.source_column(Side::First).is_some() && self.source_column(Side::Second).is_some()
    }

    pub fn is_date(&self) -> bool {
        self.data_type == DataType::Date || self.is_excel_date_serial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    First,
    Second,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateColumns {
    #[serde(default)]
    pub dataset1: Vec<String>,
    #[serde(default)]
    pub dataset2: Vec<String>,
    #[serde(default)]
    pub mapped: Vec<String>,
}

/// Column correspondence between two datasets as proposed by the LLM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub mappings: Vec<Mapping>,
    #[serde(default)]
    pub dataset1_only: Vec<String>,
    #[serde(default)]
    pub dataset2_only: Vec<String>,
    #[serde(default)]
    pub suggested_grouping_columns: Vec<String>,
    #[serde(default)]
    pub suggested_sum_columns: Vec<String>,
    #[serde(default)]
    pub suggested_count_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_columns: Option<DateColumns>,
}

/// Suggested aggregation columns restricted to common names both datasets map.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationOptions {
    pub grouping_columns: Vec<String>,
    pub sum_columns: Vec<String>,
    pub count_columns: Vec<String>,
}

impl ColumnMapping {
    pub fn from_json(json: &str) -> Result<Self, AppError> {
        let mapping: ColumnMapping = serde_json::from_str(json)?;
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let mut seen = HashSet::new();
        for mapping in &self.mappings {
            if mapping.common_name.trim().is_empty() {
                return Err(AppError::ParseError("Column mapping entry without common_name".into()));
            }
            if !seen.insert(mapping.common_name.as_str()) {
                return Err(AppError::ParseError(format!(
                    "Duplicate common_name '{}' in column mapping",
                    mapping.common_name
                )));
            }
            if mapping.source_column(Side::First).is_none() && mapping.source_column(Side::Second).is_none() {
                return Err(AppError::ParseError(format!(
                    "Mapping '{}' names no source column",
                    mapping.common_name
                )));
            }
        }
        Ok(())
    }

    pub fn mapped_on_both_sides(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.iter().filter(|m| m.is_mapped_on_both_sides())
    }

    pub fn aggregation_options(&self) -> AggregationOptions {
        let mapped: HashSet<&str> = self
            .mapped_on_both_sides()
            .map(|m| m.common_name.as_str())
            .collect();
        let keep = |cols: &[String]| -> Vec<String> {
            cols.iter().filter(|c| mapped.contains(c.as_str())).cloned().collect()
        };

        AggregationOptions {
            grouping_columns: keep(&self.suggested_grouping_columns),
            sum_columns: keep(&self.suggested_sum_columns),
            count_columns: keep(&self.suggested_count_columns),
        }
    }
}
