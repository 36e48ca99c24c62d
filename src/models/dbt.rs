//! DBT rule sets and the patches chat turns apply to them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::lenient;
use crate::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbtRuleSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbt_rules: Option<Vec<TableRule>>,
    #[serde(default, deserialize_with = "lenient::text_list", skip_serializing_if = "Option::is_none")]
    pub global_recommendations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DbtRuleSet {
    pub fn rules(&self) -> &[TableRule] {
        self.dbt_rules.as_deref().unwrap_or_default()
    }

    pub fn find_rule(&self, table_name: &str) -> Option<&TableRule> {
        self.rules().iter().find(|rule| rule.table_name == table_name)
    }

    /// Text used wherever a one-paragraph description of the rules is needed.
    pub fn rules_summary(&self) -> String {
        match &self.global_recommendations {
            Some(recs) if !recs.is_empty() => recs.join("\n\n"),
            _ => "No DBT rules summary available.".to_string(),
        }
    }
}

/// A generated model for one table. `table_name` is the identity key used
/// by patches; fields the LLM adds beyond the known ones survive in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRule {
    #[serde(default)]
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yaml_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<ColumnTests>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Vec<RuleRelationship>>,
    #[serde(default, deserialize_with = "lenient::text_list", skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableRule {
    /// Shallow overwrite: fields present in `patch` replace ours, absent
    /// fields are left alone. Nested arrays are replaced wholesale.
    pub fn apply(&mut self, patch: TableRule) {
        let TableRule {
            table_name: _,
            model_sql,
            yaml_config,
            materialization,
            tests,
            relationships,
            recommendations,
            extra,
        } = patch;

        if model_sql.is_some() {
            self.model_sql = model_sql;
        }
        if yaml_config.is_some() {
            self.yaml_config = yaml_config;
        }
        if materialization.is_some() {
            self.materialization = materialization;
        }
        if tests.is_some() {
            self.tests = tests;
        }
        if relationships.is_some() {
            self.relationships = relationships;
        }
        if recommendations.is_some() {
            self.recommendations = recommendations;
        }
        self.extra.extend(extra);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnTests {
    #[serde(default)]
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<TestSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationships: Option<Vec<RelationshipTest>>,
}

/// Either a bare test name (`"not_null"`) or a configured test
/// (`{"accepted_values": {"values": ["a", "b"]}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestSpec {
    Named(String),
    Configured(Map<String, Value>),
}

impl fmt::Display for TestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestSpec::Named(name) => write!(f, "{}", name),
            TestSpec::Configured(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(name, args)| format!("{}: {}", name, args))
                    .collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipTest {
    #[serde(default)]
    pub test: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub field: String,
}

/// Either a plain sentence (`"orders.customer_id joins customers.id"`) or a
/// described join with its SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleRelationship {
    Text(String),
    Detailed(JoinDescription),
}

impl RuleRelationship {
    pub fn description(&self) -> &str {
        match self {
            RuleRelationship::Text(text) => text,
            RuleRelationship::Detailed(join) => join.description.as_deref().unwrap_or(""),
        }
    }

    pub fn join_logic(&self) -> Option<&str> {
        match self {
            RuleRelationship::Text(_) => None,
            RuleRelationship::Detailed(join) => join.join_logic.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDescription {
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub join_logic: Option<String>,
}

/// One `dbtRules` entry of a ChangeSet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    #[serde(default, deserialize_with = "lenient_flag", skip_serializing_if = "Option::is_none")]
    pub is_new_rule: Option<bool>,
    #[serde(flatten)]
    pub rule: TableRule,
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    lenient::flag(deserializer).map(Some)
}

impl RulePatch {
    pub fn is_new_rule(&self) -> bool {
        self.is_new_rule == Some(true)
    }
}

/// Structured payload following the `DBT_RULE_JSON:` sentinel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbt_rules: Option<Vec<RulePatch>>,
    #[serde(default, deserialize_with = "lenient::text_list", skip_serializing_if = "Option::is_none")]
    pub global_recommendations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ChangeSet {
    pub fn from_json(json: &str) -> Result<Self, AppError> {
        let changes: ChangeSet = serde_json::from_str(json)?;
        changes.validate()?;
        Ok(changes)
    }

    fn validate(&self) -> Result<(), AppError> {
        for (idx, patch) in self.dbt_rules.iter().flatten().enumerate() {
            if patch.rule.table_name.trim().is_empty() {
                return Err(AppError::ParseError(format!(
                    "dbtRules entry {} has no tableName",
                    idx
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_overwrites_present_fields_only() {
        let mut rule: TableRule = serde_json::from_value(json!({
            "tableName": "orders",
            "modelSql": "select 1",
            "materialization": "view",
            "tests": [{"column": "id", "tests": ["unique", "not_null"]}]
        }))
        .unwrap();
        let patch: TableRule = serde_json::from_value(json!({
            "tableName": "orders",
            "materialization": "table",
            "tests": [{"column": "id", "tests": ["unique"]}],
            "owner": "finance"
        }))
        .unwrap();

        rule.apply(patch);

        assert_eq!(rule.model_sql.as_deref(), Some("select 1"));
        assert_eq!(rule.materialization.as_deref(), Some("table"));
        assert_eq!(rule.tests.as_ref().unwrap()[0].tests.as_ref().unwrap().len(), 1);
        assert_eq!(rule.extra.get("owner"), Some(&json!("finance")));
    }

    #[test]
    fn change_set_reads_new_rule_flag_outside_rule_fields() {
        let changes = ChangeSet::from_json(
            r#"{"dbtRules": [{"tableName": "orders", "isNewRule": true, "modelSql": "select 2"}]}"#,
        )
        .unwrap();
        let patch = &changes.dbt_rules.unwrap()[0];
        assert!(patch.is_new_rule());
        assert_eq!(patch.rule.table_name, "orders");
        assert!(patch.rule.extra.is_empty());
    }

    #[test]
    fn change_set_without_table_name_is_rejected() {
        let err = ChangeSet::from_json(r#"{"dbtRules": [{"modelSql": "select 2"}]}"#).unwrap_err();
        assert!(err.to_string().contains("no tableName"));
    }

    #[test]
    fn change_set_accepts_loose_llm_shapes() {
        let changes = ChangeSet::from_json(
            r#"{
                "dbtRules": [{
                    "tableName": "orders",
                    "isNewRule": null,
                    "relationships": [
                        "orders.customer_id joins customers.id",
                        {"description": "Order lines", "joinLogic": "orders.id = lines.order_id"}
                    ],
                    "recommendations": "Partition by order date"
                }],
                "globalRecommendations": ["Add freshness checks", null]
            }"#,
        )
        .unwrap();

        let patch = &changes.dbt_rules.as_ref().unwrap()[0];
        assert!(!patch.is_new_rule());
        let relationships = patch.rule.relationships.as_ref().unwrap();
        assert_eq!(relationships[0].description(), "orders.customer_id joins customers.id");
        assert_eq!(relationships[0].join_logic(), None);
        assert_eq!(relationships[1].description(), "Order lines");
        assert_eq!(relationships[1].join_logic(), Some("orders.id = lines.order_id"));
        assert_eq!(
            patch.rule.recommendations,
            Some(vec!["Partition by order date".to_string()])
        );
        assert_eq!(
            changes.global_recommendations,
            Some(vec!["Add freshness checks".to_string()])
        );
    }

    #[test]
    fn configured_tests_render_with_arguments() {
        let spec: TestSpec =
            serde_json::from_value(json!({"accepted_values": {"values": ["a"]}})).unwrap();
        assert_eq!(spec.to_string(), r#"accepted_values: {"values":["a"]}"#);
        assert_eq!(TestSpec::Named("unique".into()).to_string(), "unique");
    }

    #[test]
    fn summary_falls_back_when_no_recommendations() {
        assert_eq!(DbtRuleSet::default().rules_summary(), "No DBT rules summary available.");
        let rules = DbtRuleSet {
            global_recommendations: Some(vec!["a".into(), "b".into()]),
            ..Default::default()
        };
        assert_eq!(rules.rules_summary(), "a\n\nb");
    }
}
