use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{stream_operation, EventStream};
use crate::{
    error::AppError,
    models::FileData,
    services::{
        chat,
        rule_patch::{TurnUpdate, PROCESSING_INDICATOR},
        session::{Lane, OperationGuard},
    },
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/sessions/:id/chat", post(send_message))
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    message: String,
    /// File attached to this message only.
    #[serde(default)]
    attached_file: Option<FileData>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ChatBody>,
) -> Result<EventStream, AppError> {
    let session = state.sessions.get(&id)?;
    let guard = OperationGuard::claim(&session, Lane::Rules)?;
    let llm = state.llm.clone();

    Ok(stream_operation("Chat response", move |sink| async move {
        chat::run_chat_turn(
            llm.as_ref(),
            guard.session(),
            &body.message,
            body.attached_file.as_ref(),
            |update| match update {
                TurnUpdate::Text(content) => sink.send("text", &json!({ "content": content })),
                TurnUpdate::Processing => {
                    sink.send("processing", &json!({ "message": PROCESSING_INDICATOR }))
                }
            },
        )
        .await
    }))
}
