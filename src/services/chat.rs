use futures::StreamExt;
use serde::Serialize;

use crate::error::AppError;
use crate::models::{DbtRuleSet, FileData};
use crate::services::completion::{ChatMessage, ChatRequest, CompletionSource};
use crate::services::prompts;
use crate::services::rule_patch::{self, markers, TurnClassifier, TurnUpdate};
use crate::services::session::SharedSession;

/// Messages that mention rules go through the rule-patch path.
pub fn is_rule_request(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rule") || lower.contains("dbt")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurnResult {
    /// Final assistant text as produced, markers included.
    #[serde(skip)]
    pub raw: String,
    /// What the user sees.
    pub message: String,
    pub updated_rules: Option<DbtRuleSet>,
    /// Rule to bring into view after an edit.
    pub scroll_target: Option<String>,
}

/// Reads the control markers out of a finished assistant message.
pub fn present_turn(raw: &str) -> ChatTurnResult {
    let updated_rules = match markers::parse_updated_rules(raw) {
        Some(Ok(rules)) => Some(rules),
        Some(Err(e)) => {
            tracing::warn!("Ignoring unreadable rule marker: {}", e);
            None
        }
        None => None,
    };
    let scroll_target = markers::parse_last_modified_table(raw).or_else(|| markers::changelog_table(raw));
    ChatTurnResult {
        raw: raw.to_string(),
        message: markers::strip_markers(raw),
        updated_rules,
        scroll_target,
    }
}

/// Runs one chat turn. `on_update` receives cumulative text, or a single
/// processing notice once a rule patch starts; an error from it stops the
/// turn. Rule changes and both messages are recorded in the session.
pub async fn run_chat_turn<F>(
    source: &dyn CompletionSource,
    session: &SharedSession,
    message: &str,
    attached: Option<&FileData>,
    mut on_update: F,
) -> Result<ChatTurnResult, AppError>
where
    F: FnMut(TurnUpdate) -> Result<(), AppError>,
{
    if message.trim().is_empty() {
        return Err(AppError::InvalidInput("Message cannot be empty".to_string()));
    }
    let rule_path = is_rule_request(message);

    let (request, epoch) = {
        let mut state = session.lock();
        let context = state.chat_context(attached);
        let messages = if rule_path {
            vec![
                ChatMessage::system(prompts::dbt_chat_system(&context)),
                ChatMessage::user(message),
            ]
        } else {
            let system = prompts::general_chat_system(attached, Some(&context))?;
            let mut messages = vec![ChatMessage::system(system)];
            messages.extend(state.history.iter().cloned());
            messages.push(ChatMessage::user(message));
            messages
        };
        state.history.push(ChatMessage::user(message));
        (ChatRequest::new(state.settings.model.clone(), messages), state.epoch())
    };
    tracing::info!(
        "Chat turn on {} path",
        if rule_path { "rule" } else { "general" }
    );

    let full_text = stream_turn(source, request, &mut on_update)
        .await
        .map_err(AppError::during("Chat response"))?;

    let mut state = session.lock();
    let outcome = rule_patch::resolve_turn(&full_text, state.rules.as_ref());
    let result = present_turn(&outcome.message);

    if state.epoch() != epoch {
        tracing::warn!("File changed during chat turn, result not stored");
        return Ok(result);
    }
    if let Some(rules) = &result.updated_rules {
        state.rules = Some(rules.clone());
    }
    state.history.push(ChatMessage::assistant(result.message.clone()));
    Ok(result)
}

async fn stream_turn<F>(
    source: &dyn CompletionSource,
    request: ChatRequest,
    on_update: &mut F,
) -> Result<String, AppError>
where
    F: FnMut(TurnUpdate) -> Result<(), AppError>,
{
    let mut classifier = TurnClassifier::default();
    let mut ticks = source.stream(request);
    let mut buffer = String::new();
    while let Some(tick) = ticks.next().await {
        buffer = tick?.content;
        if let Some(update) = classifier.on_tick(&buffer) {
            on_update(update)?;
        }
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::completion::scripted::ScriptedSource;
    use crate::services::session::Session;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn session() -> SharedSession {
        let mut session = Session::new("s".into(), "gpt-4.1-mini");
        session.rules = Some(
            serde_json::from_value(json!({"dbtRules": [{"tableName": "orders", "modelSql": "select 1"}]}))
                .unwrap(),
        );
        Arc::new(Mutex::new(session))
    }

    #[test]
    fn rule_requests_are_detected_case_insensitively() {
        assert!(is_rule_request("Add a DBT test"));
        assert!(is_rule_request("change the Rules for orders"));
        assert!(!is_rule_request("How many rows are there?"));
    }

    #[tokio::test]
    async fn plain_turn_streams_text_and_records_history() {
        let source = ScriptedSource::new(["There are ", "3 tables."]);
        let session = session();
        let mut updates = Vec::new();

        let result = run_chat_turn(&source, &session, "How many tables?", None, |u| {
            updates.push(u);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(
            updates,
            vec![
                TurnUpdate::Text("There are ".into()),
                TurnUpdate::Text("There are 3 tables.".into())
            ]
        );
        assert_eq!(result.message, "There are 3 tables.");
        assert!(result.updated_rules.is_none());
        let state = session.lock();
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1], ChatMessage::assistant("There are 3 tables."));
    }

    #[tokio::test]
    async fn general_path_sends_history() {
        let source = ScriptedSource::new(["ok"]);
        let session = session();
        session.lock().history.push(ChatMessage::user("earlier"));

        run_chat_turn(&source, &session, "hello", None, |_| Ok(())).await.unwrap();

        let requests = source.requests.lock();
        let sent = &requests[0].messages;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].content, "earlier");
        assert!(!requests[0].json_response);
    }

    #[tokio::test]
    async fn rule_turn_hides_patch_and_updates_rules() {
        let source = ScriptedSource::chunked(
            "Switching orders to a table.\nDBT_RULE_JSON: {\"dbtRules\": [{\"tableName\": \"orders\", \"materialization\": \"table\"}]}",
            6,
        );
        let session = session();
        let mut updates = Vec::new();

        let result = run_chat_turn(&source, &session, "Make the orders rule a table", None, |u| {
            updates.push(u);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(updates.iter().filter(|u| **u == TurnUpdate::Processing).count(), 1);
        assert_eq!(updates.last(), Some(&TurnUpdate::Processing));
        assert!(result.message.starts_with("### DBT Rules Updated"));
        assert!(!result.message.contains("<!--"));
        assert_eq!(result.scroll_target.as_deref(), Some("orders"));

        let state = session.lock();
        let rules = state.rules.as_ref().unwrap();
        assert_eq!(rules.rules()[0].materialization.as_deref(), Some("table"));
        assert_eq!(rules.rules()[0].model_sql.as_deref(), Some("select 1"));

        let requests = source.requests.lock();
        assert_eq!(requests[0].messages.len(), 2);
        assert!(requests[0].messages[0].content.contains("orders"));
    }

    #[tokio::test]
    async fn rule_turn_without_rules_reports_precondition() {
        let source = ScriptedSource::new(["DBT_RULE_JSON: {\"summary\": \"X\"}"]);
        let session = session();
        session.lock().rules = None;

        let result = run_chat_turn(&source, &session, "update the dbt summary", None, |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(result.message, rule_patch::merge::NO_RULES_MESSAGE);
        assert!(session.lock().rules.is_none());
    }

    #[tokio::test]
    async fn failures_name_the_operation() {
        let source = ScriptedSource::new(["Hel"]).failing_after("stream closed");
        let session = session();
        let err = run_chat_turn(&source, &session, "hi", None, |_| Ok(())).await.unwrap_err();
        assert_eq!(err.to_string(), "Chat response failed: LLM API error: stream closed");
    }

    #[test]
    fn scroll_target_falls_back_to_changelog() {
        let result = present_turn("### DBT Rules Updated\n\n**Added:**\n- Added new rule for table 'orders_additional'");
        assert_eq!(result.scroll_target.as_deref(), Some("orders_additional"));
        assert!(result.updated_rules.is_none());
    }
}
