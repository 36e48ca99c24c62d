pub mod conversion;
pub mod dataset;
pub mod dbt;
pub mod mapping;
pub mod schema;

pub use conversion::{ConversionRequest, ConversionScripts, DataFormat};
pub use dataset::{FileData, NamedDataset, Row, SheetData, TabularDataset};
pub use dbt::{ChangeSet, ColumnTests, DbtRuleSet, RulePatch, TableRule, TestSpec};
pub use mapping::{ColumnMapping, DataType, Mapping};
pub use schema::SchemaModel;

/// LLM responses are loosely typed: a confidence may arrive as `"high"`,
/// `0.9` or `true`. Scalars are accepted and rendered as text.
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn scalar_text(value: Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }

    pub fn text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Value>::deserialize(deserializer)?.and_then(scalar_text))
    }

    /// A list of strings, also accepting a single string, mixed scalars or
    /// objects (kept as their JSON text). `null` entries are skipped.
    pub fn text_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(items.into_iter().filter_map(scalar_text).collect()),
            Some(other) => scalar_text(other).map(|text| vec![text]),
        })
    }

    /// `true`, `"true"`, `"yes"` and non-zero numbers are set; anything
    /// else, `null` included, is not.
    pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => {
                let s = s.trim();
                s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("yes")
            }
            Some(Value::Number(n)) => n.as_f64().map_or(false, |n| n != 0.0),
            _ => false,
        })
    }
}
