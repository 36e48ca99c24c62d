//! Markdown renderings of schema and rule documents.
//!
//! Views are re-rendered from scratch on every tick. A field the LLM has not
//! reached yet renders as a neutral placeholder while streaming; a field that
//! arrived empty renders its own "nothing here" text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt::Write;

use crate::models::dbt::{ColumnTests, TableRule};
use crate::models::schema::{ColumnSchema, Relationship, SuggestedJoin, TableSchema};
use crate::models::conversion::{DEST_SCRIPT_NAME, SOURCE_SCRIPT_NAME};
use crate::models::{ConversionScripts, DbtRuleSet, SchemaModel};
use crate::services::reconciler::{Phase, StreamedDocument};

static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"([.!?])\s+").unwrap());
static LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[-*] ").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaViews {
    pub overview: String,
    pub columns: String,
    pub relationships: String,
    pub joins: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleViews {
    pub summary: String,
    pub recommendations: String,
    pub rules: String,
}

impl StreamedDocument for SchemaModel {
    type Views = SchemaViews;

    fn render(&self, phase: Phase) -> SchemaViews {
        SchemaViews {
            overview: render_overview(self, phase),
            columns: render_column_details(self, phase),
            relationships: render_relationships(self, phase),
            joins: render_joins(self, phase),
        }
    }

    fn settle(mut self) -> Self {
        if self.relationships.is_none() {
            self.relationships = Some(Vec::new());
        }
        self
    }
}

impl StreamedDocument for DbtRuleSet {
    type Views = RuleViews;

    fn render(&self, phase: Phase) -> RuleViews {
        RuleViews {
            summary: render_summary(self, phase),
            recommendations: render_recommendations(self, phase),
            rules: render_rules(self, phase),
        }
    }

    fn settle(mut self) -> Self {
        if self.summary.is_none() {
            if let Some(recs) = self.global_recommendations.as_ref().filter(|r| !r.is_empty()) {
                self.summary = Some(recs.join("\n\n"));
            }
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionViews {
    pub status: String,
    pub source_script: String,
    pub dest_script: String,
    pub usage: String,
}

impl StreamedDocument for ConversionScripts {
    type Views = ConversionViews;

    fn render(&self, phase: Phase) -> ConversionViews {
        let source = self.script(SOURCE_SCRIPT_NAME);
        let dest = self.script(DEST_SCRIPT_NAME);
        let status = match (phase, source.is_some(), dest.is_some()) {
            (Phase::Final, true, true) => "Conversion scripts generated successfully!",
            (Phase::Final, _, _) => "Conversion scripts are incomplete.",
            (Phase::Streaming, true, true) => "Finalizing both conversion scripts...",
            (Phase::Streaming, true, false) => "Source script generated, working on destination script...",
            (Phase::Streaming, false, true) => "Destination script generated, working on source script...",
            (Phase::Streaming, false, false) => "Generating conversion scripts...",
        };
        ConversionViews {
            status: status.to_string(),
            source_script: script_view(source, phase, "Generating source script...", "No source script generated."),
            dest_script: script_view(dest, phase, "Generating destination script...", "No destination script generated."),
            usage: render_usage(self, phase),
        }
    }
}

fn script_view(script: Option<&str>, phase: Phase, streaming: &str, settled: &str) -> String {
    match script {
        Some(script) => script.to_string(),
        None => pending(phase, streaming, settled),
    }
}

fn render_usage(scripts: &ConversionScripts, phase: Phase) -> String {
    let usage = match &scripts.usage {
        Some(usage) => usage,
        None => return pending(phase, "Generating usage...", "No usage instructions provided."),
    };
    let mut out = String::new();
    for (name, command) in [
        (SOURCE_SCRIPT_NAME, &usage.source_script),
        (DEST_SCRIPT_NAME, &usage.dest_script),
    ] {
        if let Some(command) = command.as_deref().filter(|c| !c.is_empty()) {
            let _ = writeln!(out, "- `{}`: `{}`", name, command);
        }
    }
    if out.is_empty() {
        return pending(phase, "Generating usage...", "No usage instructions provided.");
    }
    out
}

/// Placeholder while streaming, settled text once the document is final.
fn pending(phase: Phase, streaming: &str, settled: &str) -> String {
    match phase {
        Phase::Streaming => streaming.to_string(),
        Phase::Final => settled.to_string(),
    }
}

fn description(text: Option<&str>, phase: Phase) -> String {
    match text {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => pending(phase, "Generating description...", "No description available"),
    }
}

/// Markdown table cells cannot hold pipes or line breaks.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\r', '\n'], " ")
}

fn bullet_list(out: &mut String, items: &[String]) {
    for item in items {
        let _ = writeln!(out, "- {}", item);
    }
}

/// Splits prose into one bullet per sentence unless it is already a list.
pub fn bulletize(summary: &str) -> String {
    if LIST_ITEM.is_match(summary) {
        return summary.to_string();
    }
    SENTENCE_END
        .replace_all(summary, "$1\n")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| format!("- {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_overview(model: &SchemaModel, phase: Phase) -> String {
    let schemas = match &model.schemas {
        None => return pending(phase, "Generating schema information...", "No tables detected."),
        Some(schemas) if schemas.is_empty() => return "No tables detected.".to_string(),
        Some(schemas) => schemas,
    };

    let mut out = String::new();
    for schema in schemas {
        render_table_overview(&mut out, schema, phase);
    }
    out
}

fn render_table_overview(out: &mut String, schema: &TableSchema, phase: Phase) {
    let _ = write!(out, "## {}", schema.table_name);
    if let Some(table_type) = &schema.table_type {
        let _ = write!(out, " `{}`", table_type);
    }
    let _ = writeln!(out, "\n\n{}\n", description(schema.description.as_deref(), phase));

    if let Some(pk) = &schema.primary_key {
        let _ = write!(out, "**Primary Key:** {}", pk.columns.join(", "));
        let details: Vec<String> = [
            pk.key_type.clone(),
            pk.confidence.as_ref().map(|c| format!("{} confidence", c)),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !details.is_empty() {
            let _ = write!(out, " ({})", details.join(", "));
        }
        out.push_str("\n\n");
    }

    match &schema.columns {
        None => {
            let _ = writeln!(out, "{}\n", pending(phase, "Loading column information...", "No columns reported."));
        }
        Some(columns) if columns.is_empty() => out.push_str("No columns reported.\n\n"),
        Some(columns) => {
            out.push_str("| Name | Type | Description | Flags |\n|------|------|-------------|-------|\n");
            for col in columns {
                let _ = writeln!(
                    out,
                    "| {} | `{}` | {} | {} |",
                    cell(&col.name),
                    cell(col.data_type.as_deref().unwrap_or("")),
                    cell(&description(col.description.as_deref(), phase)),
                    col.flags().join(", ")
                );
            }
            out.push('\n');
        }
    }
}

fn render_column_details(model: &SchemaModel, phase: Phase) -> String {
    let schemas = match &model.schemas {
        None => return pending(phase, "Generating column descriptions...", "No tables detected."),
        Some(schemas) if schemas.is_empty() => return "No tables detected.".to_string(),
        Some(schemas) => schemas,
    };

    let mut out = String::new();
    for schema in schemas {
        let _ = writeln!(out, "## {}\n", schema.table_name);
        match &schema.columns {
            None => {
                let _ = writeln!(out, "{}\n", pending(phase, "Loading column details...", "No columns reported."));
            }
            Some(columns) if columns.is_empty() => out.push_str("No columns reported.\n\n"),
            Some(columns) => {
                for col in columns {
                    render_column(&mut out, col, phase);
                }
            }
        }
    }
    out
}

fn render_column(out: &mut String, col: &ColumnSchema, phase: Phase) {
    let _ = write!(out, "### {}", col.name);
    if let Some(data_type) = &col.data_type {
        let _ = write!(out, " `{}`", data_type);
    }
    let flags = col.flags();
    if !flags.is_empty() {
        let _ = write!(out, " [{}]", flags.join(", "));
    }
    let _ = writeln!(out, "\n\n{}\n", description(col.description.as_deref(), phase));

    if let Some(fk) = &col.foreign_key_reference {
        let _ = write!(out, "**References:** `{}.{}`", fk.referenced_table, fk.referenced_column);
        if let Some(confidence) = &fk.confidence {
            let _ = write!(out, " ({} confidence)", confidence);
        }
        out.push_str("\n\n");
    }
    if let Some(observations) = col.quality_observations.as_ref().filter(|o| !o.is_empty()) {
        out.push_str("**Data Quality Observations**\n\n");
        bullet_list(out, observations);
        out.push('\n');
    }
    if let Some(constraints) = col.constraints.as_ref().filter(|c| !c.is_empty()) {
        out.push_str("**Constraints**\n\n");
        bullet_list(out, constraints);
        out.push('\n');
    }
}

fn render_relationships(model: &SchemaModel, phase: Phase) -> String {
    let relationships = match &model.relationships {
        None => {
            return pending(
                phase,
                "Analyzing relationships between tables...",
                "No relationships detected.",
            )
        }
        Some(rels) if rels.is_empty() => return "No relationships detected.".to_string(),
        Some(rels) => rels,
    };

    let mut out = String::from("## Table Relationships\n\n");
    for rel in relationships {
        render_relationship(&mut out, rel, phase);
    }
    out
}

fn render_relationship(out: &mut String, rel: &Relationship, phase: Phase) {
    let _ = write!(out, "### {} → {}", rel.from_table, rel.to_table);
    if let Some(kind) = &rel.relationship_type {
        let _ = write!(out, " `{}`", kind);
    }
    if let Some(confidence) = &rel.confidence {
        let _ = write!(out, " ({} confidence)", confidence);
    }
    let _ = writeln!(
        out,
        "\n\n**Join:** `{}.{}` → `{}.{}`\n",
        rel.from_table, rel.from_column, rel.to_table, rel.to_column
    );
    if let Some(join_type) = &rel.join_type {
        let _ = writeln!(out, "**Recommended Join Type:** {}\n", join_type.to_uppercase());
    }
    let _ = writeln!(out, "{}\n", description(rel.description.as_deref(), phase));
}

fn render_joins(model: &SchemaModel, phase: Phase) -> String {
    if model.suggested_joins.is_none() && model.modeling_recommendations.is_none() {
        return pending(
            phase,
            "Analyzing join patterns and modeling recommendations...",
            "No join patterns or modeling recommendations suggested.",
        );
    }

    let mut out = String::new();
    if let Some(joins) = model.suggested_joins.as_ref().filter(|j| !j.is_empty()) {
        out.push_str("## Suggested Join Patterns\n\n");
        for join in joins {
            render_join(&mut out, join);
        }
    }
    if let Some(recs) = model.modeling_recommendations.as_ref().filter(|r| !r.is_empty()) {
        out.push_str("## Data Modeling Recommendations\n\n");
        bullet_list(&mut out, recs);
    }
    if out.is_empty() {
        out.push_str("No join patterns or modeling recommendations suggested.");
    }
    out
}

fn render_join(out: &mut String, join: &SuggestedJoin) {
    let _ = writeln!(out, "### {}\n", join.description.as_deref().unwrap_or("Join"));
    if let Some(use_case) = &join.use_case {
        let _ = writeln!(out, "**Use Case:** {}\n", use_case);
    }
    if !join.tables.is_empty() {
        let _ = writeln!(out, "**Tables:** {}\n", join.tables.join(", "));
    }
    if let Some(sql) = &join.sql_pattern {
        let _ = writeln!(out, "```sql\n{}\n```\n", sql);
    }
}

fn render_summary(rules: &DbtRuleSet, phase: Phase) -> String {
    match &rules.summary {
        Some(summary) => bulletize(summary),
        None => pending(phase, "Generating summary...", "No DBT rules summary available."),
    }
}

fn render_recommendations(rules: &DbtRuleSet, phase: Phase) -> String {
    match &rules.global_recommendations {
        None => pending(phase, "Generating recommendations...", "No global recommendations."),
        Some(recs) if recs.is_empty() => "No global recommendations.".to_string(),
        Some(recs) => {
            let mut out = String::from("## Global DBT Project Recommendations\n\n");
            bullet_list(&mut out, recs);
            out
        }
    }
}

fn render_rules(rules: &DbtRuleSet, phase: Phase) -> String {
    let table_rules = match &rules.dbt_rules {
        None => return pending(phase, "Generating DBT rules...", "No DBT rules generated."),
        Some(table_rules) if table_rules.is_empty() => return "No DBT rules generated.".to_string(),
        Some(table_rules) => table_rules,
    };

    let mut out = String::new();
    for rule in table_rules {
        render_rule(&mut out, rule, phase);
    }
    out
}

fn render_rule(out: &mut String, rule: &TableRule, phase: Phase) {
    let _ = write!(out, "## {}", rule.table_name);
    if let Some(materialization) = &rule.materialization {
        let _ = write!(out, " `{}`", materialization);
    }
    out.push_str("\n\n### SQL\n\n");
    match &rule.model_sql {
        Some(sql) => {
            let _ = writeln!(out, "```sql\n{}\n```\n", sql);
        }
        None => {
            let _ = writeln!(out, "{}\n", pending(phase, "Generating SQL...", "No SQL provided."));
        }
    }

    out.push_str("### YAML\n\n");
    match &rule.yaml_config {
        Some(yaml) => {
            let _ = writeln!(out, "```yaml\n{}\n```\n", yaml);
        }
        None => {
            let _ = writeln!(out, "{}\n", pending(phase, "Generating YAML config...", "No YAML config provided."));
        }
    }

    out.push_str("### Tests\n\n");
    match &rule.tests {
        None => {
            let _ = writeln!(out, "{}\n", pending(phase, "Generating tests...", "No tests defined."));
        }
        Some(tests) if tests.is_empty() => out.push_str("No tests defined.\n\n"),
        Some(tests) => {
            out.push_str("| Column | Tests | Relationships |\n|--------|-------|---------------|\n");
            for column in tests {
                render_column_tests(out, column, phase);
            }
            out.push('\n');
        }
    }

    if let Some(relationships) = rule.relationships.as_ref().filter(|r| !r.is_empty()) {
        out.push_str("### Relationships\n\n");
        for rel in relationships {
            let _ = writeln!(out, "**Description:** {}\n", rel.description());
            if let Some(join_logic) = rel.join_logic() {
                let _ = writeln!(out, "```sql\n{}\n```\n", join_logic);
            }
        }
    }

    if let Some(recs) = rule.recommendations.as_ref().filter(|r| !r.is_empty()) {
        out.push_str("### Model-Specific Recommendations\n\n");
        bullet_list(out, recs);
        out.push('\n');
    }
}

fn render_column_tests(out: &mut String, column: &ColumnTests, phase: Phase) {
    let tests = match &column.tests {
        None => pending(phase, "Loading tests...", "None"),
        Some(tests) if tests.is_empty() => "None".to_string(),
        Some(tests) => tests.iter().map(|t| t.to_string()).collect::<Vec<_>>().join("; "),
    };
    let relationships = match &column.relationships {
        Some(rels) if !rels.is_empty() => rels
            .iter()
            .map(|r| format!("`{}` → {} ({})", r.test, r.to, r.field))
            .collect::<Vec<_>>()
            .join("; "),
        _ => "None".to_string(),
    };
    let _ = writeln!(
        out,
        "| {} | {} | {} |",
        cell(&column.column),
        cell(&tests),
        cell(&relationships)
    );
}
