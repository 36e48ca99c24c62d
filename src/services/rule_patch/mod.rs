//! Chat-driven rule editing. While a turn streams, [`TurnClassifier`]
//! decides whether the text is shown as-is or hidden behind a processing
//! indicator; once it ends, [`resolve_turn`] extracts the ChangeSet and
//! merges it into the current rule set.

pub mod markers;
pub mod merge;

use crate::models::{ChangeSet, DbtRuleSet};

pub use merge::{merge_change_set, MergeReport};

pub const PROCESSING_INDICATOR: &str = "Generating DBT rule modifications...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnMode {
    #[default]
    PlainText,
    PatchPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    /// Cumulative assistant text to display.
    Text(String),
    /// The turn carries a ChangeSet; show the indicator instead of text.
    Processing,
}

/// Tracks one chat turn. Once the sentinel shows up the turn stays in
/// [`TurnMode::PatchPending`] whatever later ticks contain.
#[derive(Debug, Default)]
pub struct TurnClassifier {
    mode: TurnMode,
}

impl TurnClassifier {
    pub fn mode(&self) -> TurnMode {
        self.mode
    }

    /// What to show for this tick; `None` when the indicator is already up.
    pub fn on_tick(&mut self, content: &str) -> Option<TurnUpdate> {
        match self.mode {
            TurnMode::PatchPending => None,
            TurnMode::PlainText if markers::contains_sentinel(content) => {
                tracing::debug!("Chat turn switched to structured patch mode");
                self.mode = TurnMode::PatchPending;
                Some(TurnUpdate::Processing)
            }
            TurnMode::PlainText => Some(TurnUpdate::Text(content.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Assistant message, markers included when rules changed.
    pub message: String,
    pub updated_rules: Option<DbtRuleSet>,
}

impl TurnOutcome {
    fn unchanged(message: String) -> Self {
        Self { message, updated_rules: None }
    }
}

/// Post-processes the complete text of a turn. Plain turns pass through;
/// patch turns become a changelog, or a diagnostic with the raw text when
/// the ChangeSet cannot be read. `current` is never modified.
pub fn resolve_turn(full_text: &str, current: Option<&DbtRuleSet>) -> TurnOutcome {
    if !markers::contains_sentinel(full_text) {
        return TurnOutcome::unchanged(full_text.to_string());
    }

    let raw_failure = |message: String| {
        tracing::warn!("Could not apply rule changes: {}", message);
        TurnOutcome::unchanged(format!(
            "Error processing DBT rule changes: {}. Here's the raw response:\n\n{}",
            message, full_text
        ))
    };

    let Some(json) = markers::extract_change_set_json(full_text) else {
        return raw_failure(format!("no complete JSON object after {}", markers::SENTINEL));
    };
    let changes = match ChangeSet::from_json(json) {
        Ok(changes) => changes,
        Err(e) => return raw_failure(e.to_string()),
    };

    let report = match merge_change_set(current, changes) {
        Ok(report) => report,
        Err(e) => return TurnOutcome::unchanged(e.to_string()),
    };
    match report.changelog() {
        Ok(message) => {
            tracing::info!(
                "Applied rule changes: {} added, {} modified",
                report.added.len(),
                report.modified.len()
            );
            TurnOutcome { message, updated_rules: Some(report.rules) }
        }
        Err(e) => raw_failure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> DbtRuleSet {
        serde_json::from_value(json!({"dbtRules": [{"tableName": "orders", "modelSql": "select 1"}]})).unwrap()
    }

    #[test]
    fn classifier_switches_once_and_never_back() {
        let mut turn = TurnClassifier::default();
        assert_eq!(turn.on_tick("I will"), Some(TurnUpdate::Text("I will".into())));
        assert_eq!(turn.on_tick("I will add DBT_RULE"), Some(TurnUpdate::Text("I will add DBT_RULE".into())));
        assert_eq!(turn.on_tick("I will add DBT_RULE_JSON: {"), Some(TurnUpdate::Processing));
        assert_eq!(turn.on_tick("I will add DBT_RULE_JSON: {\"summary\""), None);
        assert_eq!(turn.mode(), TurnMode::PatchPending);
    }

    #[test]
    fn plain_turn_passes_through() {
        let outcome = resolve_turn("Orders has 3 columns.", Some(&rules()));
        assert_eq!(outcome.message, "Orders has 3 columns.");
        assert!(outcome.updated_rules.is_none());
    }

    #[test]
    fn patch_turn_produces_changelog_and_rules() {
        let text = "Updating.\nDBT_RULE_JSON: {\"dbtRules\": [{\"tableName\": \"orders\", \"materialization\": \"table\"}]}";
        let outcome = resolve_turn(text, Some(&rules()));
        let updated = outcome.updated_rules.unwrap();
        assert_eq!(updated.rules()[0].materialization.as_deref(), Some("table"));
        assert!(outcome.message.starts_with("### DBT Rules Updated"));
        assert_eq!(markers::parse_last_modified_table(&outcome.message).as_deref(), Some("orders"));
    }

    #[test]
    fn malformed_change_set_returns_raw_text() {
        let text = "DBT_RULE_JSON: {\"dbtRules\": \"oops\"}";
        let outcome = resolve_turn(text, Some(&rules()));
        assert!(outcome.message.starts_with("Error processing DBT rule changes: "));
        assert!(outcome.message.ends_with(text));
        assert!(outcome.updated_rules.is_none());
    }

    #[test]
    fn missing_rules_reports_precondition() {
        let outcome = resolve_turn("DBT_RULE_JSON: {\"summary\": \"X\"}", None);
        assert_eq!(outcome.message, merge::NO_RULES_MESSAGE);
        assert!(outcome.updated_rules.is_none());
    }
}
