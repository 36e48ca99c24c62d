//! Grammar of the in-band control text exchanged with the LLM and the
//! browser: the `DBT_RULE_JSON:` sentinel and the HTML comment markers that
//! carry the merged rule set and the last touched table.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AppError;
use crate::models::DbtRuleSet;

pub const SENTINEL: &str = "DBT_RULE_JSON:";

static UPDATED_RULES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!-- UPDATED_DBT_RULES:(.+?) -->").unwrap());
static LAST_MODIFIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!-- LAST_MODIFIED_TABLE:(\S*) -->").unwrap());
static CHANGELOG_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:Added new rule|Modified rule) for table ['‘’]([^'‘’]+)['‘’]").unwrap()
});

pub fn contains_sentinel(text: &str) -> bool {
    text.contains(SENTINEL)
}

/// The JSON object following the sentinel, if one is complete.
pub fn extract_change_set_json(text: &str) -> Option<&str> {
    let start = text.find(SENTINEL)? + SENTINEL.len();
    extract_first_json_object(&text[start..])
}

/// First brace-balanced `{...}` substring. Braces inside JSON strings do not
/// count; returns `None` when the object never closes.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// `<!-- UPDATED_DBT_RULES:{json} -->`. A literal `-->` inside the JSON
/// would close the comment early, so its `>` is written as a `\u003e` escape.
pub fn updated_rules_marker(rules: &DbtRuleSet) -> Result<String, AppError> {
    let json = serde_json::to_string(rules)?.replace("-->", "--\\u003e");
    Ok(format!("<!-- UPDATED_DBT_RULES:{} -->", json))
}

pub fn last_modified_marker(table_name: &str) -> String {
    format!("<!-- LAST_MODIFIED_TABLE:{} -->", table_name)
}

/// Rule set carried by the first UPDATED_DBT_RULES marker.
pub fn parse_updated_rules(text: &str) -> Option<Result<DbtRuleSet, AppError>> {
    let captures = UPDATED_RULES.captures(text)?;
    Some(serde_json::from_str(&captures[1]).map_err(AppError::from))
}

pub fn parse_last_modified_table(text: &str) -> Option<String> {
    LAST_MODIFIED
        .captures(text)
        .map(|c| c[1].to_string())
        .filter(|name| !name.is_empty())
}

/// Table named on the first "Added new rule / Modified rule" changelog line.
pub fn changelog_table(text: &str) -> Option<String> {
    CHANGELOG_TABLE.captures(text).map(|c| c[1].to_string())
}

/// Text shown to the user: both markers removed.
pub fn strip_markers(text: &str) -> String {
    let text = UPDATED_RULES.replace_all(text, "");
    let text = LAST_MODIFIED.replace_all(&text, "");
    text.trim_end().to_string()
}
