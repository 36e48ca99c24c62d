use std::fmt::Write;

use super::markers;
use crate::error::AppError;
use crate::models::{ChangeSet, DbtRuleSet, TableRule};

pub const NO_RULES_MESSAGE: &str =
    "Error: No existing DBT rules found. Please generate DBT rules first.";

/// Outcome of applying a ChangeSet to a copy of the current rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub rules: DbtRuleSet,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub last_modified_table: Option<String>,
}

impl MergeReport {
    /// Markdown changelog followed by the machine-readable markers.
    pub fn changelog(&self) -> Result<String, AppError> {
        let mut out = String::from("### DBT Rules Updated\n\n");
        for (title, lines) in [("Added", &self.added), ("Modified", &self.modified)] {
            if lines.is_empty() {
                continue;
            }
            let _ = writeln!(out, "**{}:**", title);
            let items: Vec<String> = lines.iter().map(|line| format!("- {}", line)).collect();
            out.push_str(&items.join("\n"));
            out.push_str("\n\n");
        }
        out.push_str("\n\n");
        out.push_str(&markers::updated_rules_marker(&self.rules)?);
        out.push_str("\n\n");
        out.push_str(&markers::last_modified_marker(
            self.last_modified_table.as_deref().unwrap_or_default(),
        ));
        Ok(out)
    }
}

/// Applies `changes` to a deep copy of `current`; `current` itself is never
/// touched. Fails when there is no generated rule set to patch.
pub fn merge_change_set(
    current: Option<&DbtRuleSet>,
    changes: ChangeSet,
) -> Result<MergeReport, AppError> {
    let current = current
        .filter(|rules| rules.dbt_rules.is_some())
        .ok_or_else(|| AppError::Validation(NO_RULES_MESSAGE.to_string()))?;

    let mut rules = current.clone();
    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut last_modified_table = None;

    let table_rules = rules.dbt_rules.get_or_insert_with(Vec::new);
    for patch in changes.dbt_rules.into_iter().flatten() {
        let flagged = patch.is_new_rule();
        let mut rule = patch.rule;
        let existing = table_rules.iter().position(|r| r.table_name == rule.table_name);

        match existing {
            Some(idx) if !flagged => {
                let name = rule.table_name.clone();
                table_rules[idx].apply(rule);
                tracing::debug!("Patched rule for table '{}'", name);
                modified.push(format!("Modified rule for table '{}'", name));
                last_modified_table = Some(name);
            }
            _ => {
                if existing.is_some() {
                    rule.table_name = additional_name(&rule.table_name, table_rules);
                }
                tracing::debug!("Appending rule for table '{}'", rule.table_name);
                added.push(format!("Added new rule for table '{}'", rule.table_name));
                last_modified_table = Some(rule.table_name.clone());
                table_rules.push(rule);
            }
        }
    }

    if let Some(recs) = changes.global_recommendations {
        rules.global_recommendations = Some(recs);
        modified.push("Updated global recommendations".to_string());
    }
    if let Some(summary) = changes.summary {
        rules.summary = Some(summary);
        modified.push("Updated summary".to_string());
    }

    Ok(MergeReport {
        rules,
        added,
        modified,
        last_modified_table,
    })
}

/// Name for a flagged rule whose table already has one. Names already marked
/// `_new` or `_additional` are kept unless taken, in which case a numeric
/// suffix makes them unique.
fn additional_name(name: &str, rules: &[TableRule]) -> String {
    let taken = |candidate: &str| rules.iter().any(|r| r.table_name == candidate);
    let base = if name.contains("_new") || name.contains("_additional") {
        name.to_string()
    } else {
        format!("{}_additional", name)
    };
    if !taken(&base) {
        return base;
    }

    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
