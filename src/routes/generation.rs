use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use super::{stream_operation, EventStream};
use crate::{
    error::AppError,
    models::{
        conversion::{DEST_SCRIPT_NAME, SOURCE_SCRIPT_NAME},
        ConversionRequest,
    },
    services::{
        generation,
        session::{Lane, OperationGuard},
    },
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/:id/schema", post(generate_schema))
        .route("/sessions/:id/dbt-rules", post(generate_dbt_rules))
        .route("/sessions/:id/conversion-scripts", post(generate_conversion_scripts))
        .route("/sessions/:id/conversion-scripts/:file", get(download_script))
}

async fn generate_schema(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<EventStream, AppError> {
    let session = state.sessions.get(&id)?;
    let guard = OperationGuard::claim(&session, Lane::Schema)?;
    let llm = state.llm.clone();
    tracing::info!("Starting schema generation for session {}", id);

    Ok(stream_operation("Schema generation", move |sink| async move {
        let (schema, views) =
            generation::generate_schema(llm.as_ref(), guard.session(), |views| sink.send("views", views))
                .await?;
        Ok(json!({ "schema": schema, "views": views }))
    }))
}

async fn generate_dbt_rules(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<EventStream, AppError> {
    let session = state.sessions.get(&id)?;
    let guard = OperationGuard::claim(&session, Lane::Rules)?;
    let llm = state.llm.clone();
    tracing::info!("Starting DBT rules generation for session {}", id);

    Ok(stream_operation("DBT rules generation", move |sink| async move {
        let (rules, views) =
            generation::generate_dbt_rules(llm.as_ref(), guard.session(), |views| sink.send("views", views))
                .await?;
        let summary = rules.rules_summary();
        Ok(json!({ "dbtRules": rules, "views": views, "rulesSummary": summary }))
    }))
}

async fn generate_conversion_scripts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ConversionRequest>,
) -> Result<EventStream, AppError> {
    let session = state.sessions.get(&id)?;
    let guard = OperationGuard::claim(&session, Lane::Ingestion)?;
    let llm = state.llm.clone();
    tracing::info!("Starting conversion script generation for session {}", id);

    Ok(stream_operation("Conversion script generation", move |sink| async move {
        let (scripts, views) = generation::generate_conversion_scripts(
            llm.as_ref(),
            guard.session(),
            &request,
            |views| sink.send("views", views),
        )
        .await?;
        Ok(json!({ "scripts": scripts, "views": views }))
    }))
}

/// Serves `convert_to_source.py` or `convert_to_destination.py` as a download.
async fn download_script(
    State(state): State<Arc<AppState>>,
    Path((id, file)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    if file != SOURCE_SCRIPT_NAME && file != DEST_SCRIPT_NAME {
        return Err(AppError::InvalidInput(format!("Unknown script '{}'", file)));
    }
    let session = state.sessions.get(&id)?;
    let script = {
        let state = session.lock();
        state
            .scripts
            .as_ref()
            .filter(|scripts| scripts.is_complete())
            .and_then(|scripts| scripts.script(&file))
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation("Please generate conversion scripts first.".to_string()))?
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/x-python; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", file)),
        ],
        script,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::ConversionScripts;
    use crate::services::completion::scripted::ScriptedSource;
    use crate::services::session::SessionStore;
    use axum::http::StatusCode;
    use std::time::Duration;

    fn app_state() -> Arc<AppState> {
        Arc::new(AppState {
            config: Config {
                max_file_size: 1024,
                openai_key: String::new(),
                llm_base_url: String::new(),
                default_model: "gpt-4.1-mini".into(),
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                session_ttl: Duration::from_secs(60),
            },
            sessions: SessionStore::new(Duration::from_secs(60)),
            llm: Arc::new(ScriptedSource::new(["{}"])),
        })
    }

    async fn download(state: &Arc<AppState>, id: &str, file: &str) -> Result<axum::response::Response, AppError> {
        download_script(State(state.clone()), Path((id.to_string(), file.to_string())))
            .await
            .map(IntoResponse::into_response)
    }

    #[tokio::test]
    async fn scripts_download_once_both_exist() {
        let state = app_state();
        let session = state.sessions.create("gpt-4.1-mini");
        let id = session.lock().id.clone();

        let err = download(&state, &id, SOURCE_SCRIPT_NAME).await.err().unwrap();
        assert_eq!(err.to_string(), "Please generate conversion scripts first.");

        session.lock().scripts = Some(ConversionScripts {
            source_script: Some("import pandas".into()),
            dest_script: Some("import sqlite3".into()),
            usage: None,
        });
        let response = download(&state, &id, DEST_SCRIPT_NAME).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"convert_to_destination.py\""
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"import sqlite3");
    }

    #[tokio::test]
    async fn unknown_script_names_are_rejected() {
        let state = app_state();
        let id = state.sessions.create("gpt-4.1-mini").lock().id.clone();
        let err = download(&state, &id, "../secrets.py").await.err().unwrap();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }
}
