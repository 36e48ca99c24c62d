use futures::StreamExt;

use crate::error::AppError;
use crate::models::{ConversionRequest, ConversionScripts, DbtRuleSet, SchemaModel};
use crate::services::completion::{ChatMessage, ChatRequest, CompletionSource};
use crate::services::prompts;
use crate::services::reconciler::{Reconciler, StreamedDocument};
use crate::services::session::SharedSession;
use crate::services::views::{ConversionViews, RuleViews, SchemaViews};

/// Drives one streamed completion through a [`Reconciler`]. `on_views` sees
/// the placeholder views first, then every change; an error from it (a gone
/// client) stops the stream.
pub async fn stream_document<T, F>(
    source: &dyn CompletionSource,
    request: ChatRequest,
    mut on_views: F,
) -> Result<(T, T::Views), AppError>
where
    T: StreamedDocument,
    F: FnMut(&T::Views) -> Result<(), AppError>,
{
    let mut reconciler = Reconciler::<T>::new();
    on_views(reconciler.views())?;

    let mut ticks = source.stream(request);
    let mut buffer = String::new();
    while let Some(tick) = ticks.next().await {
        buffer = tick?.content;
        if let Some(views) = reconciler.on_tick(&buffer) {
            on_views(views)?;
        }
    }
    reconciler.finalize(&buffer)
}

/// Streams a schema for the session's file and stores it.
pub async fn generate_schema<F>(
    source: &dyn CompletionSource,
    session: &SharedSession,
    on_views: F,
) -> Result<(SchemaModel, SchemaViews), AppError>
where
    F: FnMut(&SchemaViews) -> Result<(), AppError>,
{
    let (request, epoch) = {
        let state = session.lock();
        let file = state
            .file
            .as_ref()
            .ok_or_else(|| AppError::Validation("Please upload a file first".to_string()))?;
        let prompt = prompts::schema_prompt(
            state.settings.schema_template(),
            file,
            &state.settings.global_table_rules,
        );
        let messages = vec![
            ChatMessage::system(prompts::SCHEMA_SYSTEM),
            ChatMessage::user(prompt),
        ];
        (ChatRequest::new(state.settings.model.clone(), messages).json(), state.epoch())
    };

    let (schema, views) = stream_document::<SchemaModel, _>(source, request, on_views)
        .await
        .map_err(AppError::during("Schema generation"))?;

    let mut state = session.lock();
    if state.epoch() == epoch {
        tracing::info!("Stored schema with {} tables", schema.schemas.as_deref().map_or(0, <[_]>::len));
        state.schema = Some(schema.clone());
    } else {
        tracing::warn!("File changed during schema generation, result not stored");
    }
    Ok((schema, views))
}

/// Streams DBT rules for the session's schema and stores them.
pub async fn generate_dbt_rules<F>(
    source: &dyn CompletionSource,
    session: &SharedSession,
    on_views: F,
) -> Result<(DbtRuleSet, RuleViews), AppError>
where
    F: FnMut(&RuleViews) -> Result<(), AppError>,
{
    let (request, epoch) = {
        let state = session.lock();
        let schema = state
            .schema
            .as_ref()
            .ok_or_else(|| AppError::Validation("Please generate a schema first".to_string()))?;
        let prompt = prompts::dbt_rules_prompt(state.settings.dbt_rules_template(), schema)?;
        let messages = vec![ChatMessage::system(prompts::DBT_SYSTEM), ChatMessage::user(prompt)];
        (ChatRequest::new(state.settings.model.clone(), messages).json(), state.epoch())
    };

    let (rules, views) = stream_document::<DbtRuleSet, _>(source, request, on_views)
        .await
        .map_err(AppError::during("DBT rules generation"))?;

    let mut state = session.lock();
    if state.epoch() == epoch {
        tracing::info!("Stored {} DBT rules", rules.rules().len());
        state.rules = Some(rules.clone());
    } else {
        tracing::warn!("File changed during DBT rules generation, result not stored");
    }
    Ok((rules, views))
}

/// Streams a pair of Python scripts that move the session's data from the
/// source format into the destination format, and stores them.
pub async fn generate_conversion_scripts<F>(
    source: &dyn CompletionSource,
    session: &SharedSession,
    request: &ConversionRequest,
    on_views: F,
) -> Result<(ConversionScripts, ConversionViews), AppError>
where
    F: FnMut(&ConversionViews) -> Result<(), AppError>,
{
    let (from, to) = match (request.source_type, request.dest_type) {
        (Some(from), Some(to)) => (from, to),
        _ => {
            return Err(AppError::Validation(
                "Please select both source and destination formats.".to_string(),
            ))
        }
    };

    let (chat, epoch) = {
        let state = session.lock();
        let schema = state
            .schema
            .as_ref()
            .ok_or_else(|| AppError::Validation("Please generate a schema first".to_string()))?;
        let prompt = prompts::conversion_prompt(schema, from, to, request.parameters.as_deref())?;
        let messages = vec![
            ChatMessage::system(prompts::CONVERSION_SYSTEM),
            ChatMessage::user(prompt),
        ];
        (ChatRequest::new(state.settings.model.clone(), messages).json(), state.epoch())
    };
    tracing::info!("Generating {} to {} conversion scripts", from.label(), to.label());

    let (scripts, views) = stream_document::<ConversionScripts, _>(source, chat, on_views)
        .await
        .map_err(AppError::during("Conversion script generation"))?;

    let mut state = session.lock();
    if state.epoch() == epoch {
        if !scripts.is_complete() {
            tracing::warn!("Conversion scripts are missing a script");
        }
        state.scripts = Some(scripts.clone());
    } else {
        tracing::warn!("File changed during conversion script generation, result not stored");
    }
    Ok((scripts, views))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataFormat, FileData};
    use crate::services::completion::scripted::ScriptedSource;
    use crate::services::session::Session;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const SCHEMA: &str = r#"{"schemas": [{"tableName": "orders", "description": "Orders placed", "columns": [{"name": "id", "dataType": "integer"}]}], "relationships": []}"#;

    fn session_with_file() -> SharedSession {
        let mut session = Session::new("s".into(), "gpt-4.1-mini");
        session.load_file(FileData {
            name: "orders.csv".into(),
            file_type: "csv".into(),
            sheets: vec![],
            tables: vec![],
        });
        Arc::new(Mutex::new(session))
    }

    #[tokio::test]
    async fn schema_views_stream_then_schema_is_stored() {
        let source = ScriptedSource::chunked(SCHEMA, 7);
        let session = session_with_file();
        let mut seen = Vec::new();

        let (schema, views) = generate_schema(&source, &session, |v| {
            seen.push(v.clone());
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(seen[0].overview, "Generating schema information...");
        assert!(seen.len() > 2);
        assert!(views.overview.contains("orders"));
        assert_eq!(session.lock().schema.as_ref(), Some(&schema));

        let requests = source.requests.lock();
        assert!(requests[0].json_response);
        assert!(requests[0].messages[1].content.contains("orders.csv"));
    }

    #[tokio::test]
    async fn transport_failure_names_the_operation() {
        let source = ScriptedSource::new(["{\"schemas\": ["]).failing_after("connection reset");
        let session = session_with_file();

        let err = generate_schema(&source, &session, |_| Ok(())).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Schema generation failed: LLM API error: connection reset"
        );
        assert!(session.lock().schema.is_none());
    }

    #[tokio::test]
    async fn truncated_output_fails_the_final_parse() {
        let source = ScriptedSource::new(["{\"schemas\": [{\"tableName\": \"orders\""]);
        let session = session_with_file();

        let err = generate_schema(&source, &session, |_| Ok(())).await.unwrap_err();
        assert!(err.to_string().starts_with("Schema generation failed: Parse error"));
    }

    #[tokio::test]
    async fn a_closed_receiver_stops_the_stream() {
        let source = ScriptedSource::chunked(SCHEMA, 5);
        let session = session_with_file();

        let err = generate_schema(&source, &session, |_| Err(AppError::Cancelled))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn rules_need_a_schema() {
        let source = ScriptedSource::new(["{}"]);
        let session = session_with_file();
        let err = generate_dbt_rules(&source, &session, |_| Ok(())).await.unwrap_err();
        assert_eq!(err.to_string(), "Please generate a schema first");
    }

    #[tokio::test]
    async fn rules_summary_falls_back_to_recommendations() {
        let source = ScriptedSource::chunked(
            r#"{"dbtRules": [{"tableName": "orders", "materialization": "table"}], "globalRecommendations": ["Add tests.", "Use staging."]}"#,
            9,
        );
        let session = session_with_file();
        session.lock().schema = Some(serde_json::from_str(SCHEMA).unwrap());

        let (rules, _) = generate_dbt_rules(&source, &session, |_| Ok(())).await.unwrap();
        assert_eq!(rules.summary.as_deref(), Some("Add tests.\n\nUse staging."));
        assert_eq!(session.lock().rules.as_ref().unwrap().rules()[0].table_name, "orders");
    }

    #[tokio::test]
    async fn results_for_a_replaced_file_are_dropped() {
        let source = ScriptedSource::new([SCHEMA]);
        let session = session_with_file();
        let replaced = session.clone();

        generate_schema(&source, &session, move |_| {
            if let Some(mut state) = replaced.try_lock() {
                if state.epoch() == 1 {
                    let file = state.file.clone().unwrap();
                    state.load_file(file);
                }
            }
            Ok(())
        })
        .await
        .unwrap();
        assert!(session.lock().schema.is_none());
    }

    fn conversion(source: Option<DataFormat>, dest: Option<DataFormat>) -> ConversionRequest {
        ConversionRequest {
            source_type: source,
            dest_type: dest,
            parameters: Some("only rows after 2024".into()),
        }
    }

    #[tokio::test]
    async fn conversion_scripts_stream_and_are_stored() {
        let reply = r#"{"sourceScript": "import pandas as pd\nprint('src')", "destScript": "import sqlite3", "usage": {"sourceScript": "uv run convert_to_source.py in.csv"}}"#;
        let source = ScriptedSource::chunked(reply, 6);
        let session = session_with_file();
        session.lock().schema = Some(serde_json::from_str(SCHEMA).unwrap());
        let mut statuses = Vec::new();

        let (scripts, views) = generate_conversion_scripts(
            &source,
            &session,
            &conversion(Some(DataFormat::Csv), Some(DataFormat::Sqlite3)),
            |v| {
                statuses.push(v.status.clone());
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(statuses[0], "Generating conversion scripts...");
        assert!(statuses.iter().any(|s| s == "Source script generated, working on destination script..."));
        assert_eq!(views.status, "Conversion scripts generated successfully!");
        assert_eq!(scripts.dest_script.as_deref(), Some("import sqlite3"));
        assert_eq!(session.lock().scripts.as_ref(), Some(&scripts));

        let requests = source.requests.lock();
        assert!(requests[0].json_response);
        assert_eq!(requests[0].messages[0].content, prompts::CONVERSION_SYSTEM);
        let prompt = &requests[0].messages[1].content;
        assert!(prompt.contains("**Source Format**: csv"));
        assert!(prompt.contains("**Additional Parameters**: only rows after 2024"));
        assert!(prompt.contains(r#""tableName": "orders""#));
    }

    #[tokio::test]
    async fn conversion_needs_both_formats_and_a_schema() {
        let source = ScriptedSource::new(["{}"]);
        let session = session_with_file();

        let err = generate_conversion_scripts(&source, &session, &conversion(Some(DataFormat::Csv), None), |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Please select both source and destination formats.");

        let request = conversion(Some(DataFormat::Csv), Some(DataFormat::Json));
        let err = generate_conversion_scripts(&source, &session, &request, |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Please generate a schema first");
        assert!(source.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_scripts_fail_the_final_parse() {
        let source = ScriptedSource::new([r#"{"sourceScript": "import pandas"#]);
        let session = session_with_file();
        session.lock().schema = Some(serde_json::from_str(SCHEMA).unwrap());
        let request = conversion(Some(DataFormat::Excel), Some(DataFormat::Parquet));

        let err = generate_conversion_scripts(&source, &session, &request, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Conversion script generation failed: Parse error"));
        assert!(session.lock().scripts.is_none());
    }
}
