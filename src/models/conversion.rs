//! Python ingestion scripts generated from a schema.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::lenient;

pub const SOURCE_SCRIPT_NAME: &str = "convert_to_source.py";
pub const DEST_SCRIPT_NAME: &str = "convert_to_destination.py";

/// File formats a conversion script can read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Csv,
    Excel,
    Sqlite3,
    Parquet,
    Json,
}

impl DataFormat {
    pub fn label(self) -> &'static str {
        match self {
            DataFormat::Csv => "CSV File",
            DataFormat::Excel => "Excel File",
            DataFormat::Sqlite3 => "SQLite Database",
            DataFormat::Parquet => "Parquet File",
            DataFormat::Json => "JSON File",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            DataFormat::Csv => "csv",
            DataFormat::Excel => "excel",
            DataFormat::Sqlite3 => "sqlite3",
            DataFormat::Parquet => "parquet",
            DataFormat::Json => "json",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConversionRequest {
    #[serde(default)]
    pub source_type: Option<DataFormat>,
    #[serde(default)]
    pub dest_type: Option<DataFormat>,
    /// Free-form filters or transformations to apply.
    #[serde(default)]
    pub parameters: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionScripts {
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub source_script: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub dest_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ScriptUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptUsage {
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub source_script: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub dest_script: Option<String>,
}

impl ConversionScripts {
    /// Script text by download name. Blank scripts count as missing.
    pub fn script(&self, file_name: &str) -> Option<&str> {
        let script = match file_name {
            SOURCE_SCRIPT_NAME => self.source_script.as_deref(),
            DEST_SCRIPT_NAME => self.dest_script.as_deref(),
            _ => None,
        };
        script.filter(|s| !s.trim().is_empty())
    }

    pub fn is_complete(&self) -> bool {
        self.script(SOURCE_SCRIPT_NAME).is_some() && self.script(DEST_SCRIPT_NAME).is_some()
    }
}
