use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use crate::{
    error::AppError,
    models::FileData,
    services::{
        file_parser,
        session::{SessionSettings, SessionSnapshot},
    },
    AppState,
};

pub fn routes(max_file_size: usize) -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/settings", put(update_settings))
        .route(
            "/sessions/:id/file",
            post(upload_file).layer(DefaultBodyLimit::max(max_file_size.saturating_add(1))),
        )
        .route("/sessions/:id/file/url", post(load_file_from_url))
        .route("/sessions/:id/chat/reset", post(reset_chat))
}

#[derive(Debug, Serialize)]
pub struct CreatedSession {
    session_id: String,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<CreatedSession>) {
    let session = state.sessions.create(&state.config.default_model);
    let session_id = session.lock().id.clone();
    (StatusCode::CREATED, Json(CreatedSession { session_id }))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let session = state.sessions.get(&id)?;
    let snapshot = session.lock().snapshot();
    Ok(Json(snapshot))
}

/// Present-but-null is kept apart from absent: `Some(None)` resets a prompt.
fn explicit_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    model: Option<String>,
    #[serde(default, deserialize_with = "explicit_null")]
    schema_prompt: Option<Option<String>>,
    #[serde(default, deserialize_with = "explicit_null")]
    dbt_rules_prompt: Option<Option<String>>,
    #[serde(default)]
    global_table_rules: Option<String>,
}

impl SettingsUpdate {
    fn apply(self, settings: &mut SessionSettings) {
        let custom = |prompt: Option<String>| prompt.filter(|p| !p.trim().is_empty());
        if let Some(model) = self.model.filter(|m| !m.trim().is_empty()) {
            settings.model = model;
        }
        if let Some(prompt) = self.schema_prompt {
            settings.schema_prompt = custom(prompt);
        }
        if let Some(prompt) = self.dbt_rules_prompt {
            settings.dbt_rules_prompt = custom(prompt);
        }
        if let Some(rules) = self.global_table_rules {
            settings.global_table_rules = rules;
        }
    }
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<SessionSettings>, AppError> {
    let session = state.sessions.get(&id)?;
    let mut session = session.lock();
    update.apply(&mut session.settings);
    tracing::info!("Session {} now uses model {}", id, session.settings.model);
    Ok(Json(session.settings.clone()))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    name: String,
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<FileData>, AppError> {
    let session = state.sessions.get(&id)?;
    let max_file_size = state.config.max_file_size;
    let name = query.name;

    tracing::info!("Upload of {} for session {}, size: {}KB", name, id, body.len() / 1024);
    let file = tokio::task::spawn_blocking(move || file_parser::parse_file(&name, &body, max_file_size))
        .await
        .map_err(|e| AppError::Internal(format!("File parsing task failed: {}", e)))??;

    session.lock().load_file(file.clone());
    Ok(Json(file))
}

#[derive(Debug, Deserialize)]
pub struct UrlUpload {
    url: String,
    name: String,
}

async fn load_file_from_url(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UrlUpload>,
) -> Result<Json<FileData>, AppError> {
    let session = state.sessions.get(&id)?;
    tracing::info!("Fetching {} for session {}", request.name, id);
    let file = file_parser::fetch_file(&request.url, &request.name, state.config.max_file_size).await?;
    session.lock().load_file(file.clone());
    Ok(Json(file))
}

async fn reset_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let session = state.sessions.get(&id)?;
    let mut session = session.lock();
    tracing::info!("Clearing {} chat messages for session {}", session.history.len(), id);
    session.history.clear();
    Ok(StatusCode::NO_CONTENT)
}
