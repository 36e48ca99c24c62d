use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    error::AppError,
    models::NamedDataset,
    services::{
        column_mapping::{self, MappingAnalysis},
        comparator::{AggregationRequest, GroupComparison},
        session::{Lane, OperationGuard},
    },
    AppState,
};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/:id/compare/mapping", post(analyze_mapping))
        .route("/sessions/:id/compare", post(run_comparison))
        .route("/sessions/:id/compare/explain", post(explain_group))
}

#[derive(Debug, Default, Deserialize)]
pub struct MappingBody {
    #[serde(default)]
    dataset1: Option<NamedDataset>,
    #[serde(default)]
    dataset2: Option<NamedDataset>,
}

async fn analyze_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<MappingBody>>,
) -> Result<Json<MappingAnalysis>, AppError> {
    let session = state.sessions.get(&id)?;
    let guard = OperationGuard::claim(&session, Lane::Comparison)?;

    let body = body.map(|Json(body)| body).unwrap_or_default();
    let supplied = match (body.dataset1, body.dataset2) {
        (Some(first), Some(second)) => Some((first, second)),
        (None, None) => None,
        _ => {
            return Err(AppError::InvalidInput(
                "Supply both dataset1 and dataset2, or neither".to_string(),
            ))
        }
    };

    let analysis = column_mapping::analyze_datasets(state.llm.as_ref(), guard.session(), supplied).await?;
    Ok(Json(analysis))
}

#[derive(Debug, Serialize)]
pub struct ComparisonResponse {
    groups: Vec<GroupComparison>,
    mismatches: usize,
}

async fn run_comparison(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<AggregationRequest>,
) -> Result<Json<ComparisonResponse>, AppError> {
    let session = state.sessions.get(&id)?;
    let start = std::time::Instant::now();

    let groups = tokio::task::spawn_blocking(move || column_mapping::run_comparison(&session, &request))
        .await
        .map_err(|e| AppError::Internal(format!("Comparison task failed: {}", e)))??;

    let mismatches = groups.iter().filter(|g| g.has_mismatch).count();
    tracing::info!(
        "Compared {} groups for session {} in {:?}, {} mismatched",
        groups.len(),
        id,
        start.elapsed(),
        mismatches
    );
    Ok(Json(ComparisonResponse { groups, mismatches }))
}

#[derive(Debug, Deserialize)]
pub struct ExplainBody {
    #[serde(flatten)]
    request: AggregationRequest,
    group_key: String,
}

#[derive(Debug, Serialize)]
pub struct Explanation {
    group_key: String,
    analysis: String,
}

async fn explain_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ExplainBody>,
) -> Result<Json<Explanation>, AppError> {
    let session = state.sessions.get(&id)?;
    let analysis =
        column_mapping::explain(state.llm.as_ref(), &session, &body.request, &body.group_key).await?;
    Ok(Json(Explanation {
        group_key: body.group_key,
        analysis,
    }))
}
