//! Schema inferred by the LLM. Every field is optional because the same
//! types describe partial snapshots taken mid-stream.

use serde::{Deserialize, Serialize};

use super::lenient;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Vec<TableSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Vec<Relationship>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_joins: Option<Vec<SuggestedJoin>>,
    #[serde(default, deserialize_with = "lenient::text_list", skip_serializing_if = "Option::is_none")]
    pub modeling_recommendations: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    #[serde(default)]
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<PrimaryKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnSchema>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimaryKey {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub is_primary_key: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub is_foreign_key: bool,
    #[serde(rename = "isPII", default, deserialize_with = "lenient::flag")]
    pub is_pii: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key_reference: Option<ForeignKeyReference>,
    #[serde(default, deserialize_with = "lenient::text_list", skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient::text_list", skip_serializing_if = "Option::is_none")]
    pub quality_observations: Option<Vec<String>>,
}

impl ColumnSchema {
    /// Badge labels shown next to a column, without duplicates.
    pub fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.is_primary_key {
            flags.push("PK".to_string());
        }
        if self.is_foreign_key {
            flags.push("FK".to_string());
        }
        if self.is_pii {
            flags.push("PII".to_string());
        }
        if let Some(class) = &self.data_classification {
            if !class.is_empty() && !flags.contains(class) {
                flags.push(class.clone());
            }
        }
        flags
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyReference {
    #[serde(default)]
    pub referenced_table: String,
    #[serde(default)]
    pub referenced_column: String,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    #[serde(default)]
    pub from_table: String,
    #[serde(default)]
    pub from_column: String,
    #[serde(default)]
    pub to_table: String,
    #[serde(default)]
    pub to_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedJoin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_case: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_pattern: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_snapshot_deserializes() {
        let partial = json!({
            "schemas": [{"tableName": "orders", "columns": [{"name": "id", "isPrimaryKey": true}]}]
        });
        let model: SchemaModel = serde_json::from_value(partial).unwrap();
        let schemas = model.schemas.unwrap();
        assert_eq!(schemas[0].table_name, "orders");
        assert!(schemas[0].description.is_none());
        assert!(model.relationships.is_none());
    }

    #[test]
    fn loose_column_fields_are_accepted() {
        let col: ColumnSchema = serde_json::from_value(json!({
            "name": "email",
            "isPrimaryKey": null,
            "isForeignKey": "yes",
            "isPII": true,
            "constraints": "unique",
            "qualityObservations": ["3 nulls", null, {"duplicates": 2}]
        }))
        .unwrap();
        assert!(!col.is_primary_key);
        assert!(col.is_foreign_key);
        assert_eq!(col.constraints, Some(vec!["unique".to_string()]));
        assert_eq!(
            col.quality_observations,
            Some(vec!["3 nulls".to_string(), r#"{"duplicates":2}"#.to_string()])
        );
    }

    #[test]
    fn numeric_confidence_is_accepted() {
        let rel: Relationship = serde_json::from_value(json!({
            "fromTable": "orders", "fromColumn": "customer_id",
            "toTable": "customers", "toColumn": "id", "confidence": 0.9
        }))
        .unwrap();
        assert_eq!(rel.confidence.as_deref(), Some("0.9"));
    }

    #[test]
    fn flags_skip_duplicate_classification() {
        let col = ColumnSchema {
            name: "email".into(),
            is_pii: true,
            data_classification: Some("PII".into()),
            ..Default::default()
        };
        assert_eq!(col.flags(), vec!["PII".to_string()]);
    }
}
