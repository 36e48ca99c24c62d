//! Dataset comparison flow: the LLM proposes a column mapping, the session
//! keeps it with both datasets, and aggregation runs against that context.

use serde::Serialize;
use std::sync::Arc;

use crate::error::AppError;
use crate::models::mapping::AggregationOptions;
use crate::models::{ColumnMapping, NamedDataset};
use crate::services::comparator::{self, AggregationRequest, ComparisonOverview, GroupComparison};
use crate::services::completion::CompletionSource;
use crate::services::prompts;
use crate::services::rule_patch::markers;
use crate::services::session::{ComparisonContext, SharedSession};

#[derive(Debug, Clone, Serialize)]
pub struct MappingAnalysis {
    pub mapping: ColumnMapping,
    pub overview: ComparisonOverview,
    pub options: AggregationOptions,
}

/// Asks the LLM for a column mapping and validates the first JSON object in
/// its reply.
pub async fn suggest_mapping(
    source: &dyn CompletionSource,
    model: &str,
    first: &NamedDataset,
    second: &NamedDataset,
) -> Result<ColumnMapping, AppError> {
    let run = async {
        let user = prompts::column_mapping_user(first, second)?;
        let reply = source.complete(model, prompts::COLUMN_MAPPING_SYSTEM, &user).await?;
        let json = markers::extract_first_json_object(&reply).ok_or_else(|| {
            AppError::ParseError("No JSON object found in the column mapping response".to_string())
        })?;
        ColumnMapping::from_json(json)
    };
    let mapping = run.await.map_err(AppError::during("LLM analysis"))?;
    tracing::info!(
        "Mapped {} columns between '{}' and '{}'",
        mapping.mappings.len(),
        first.name,
        second.name
    );
    Ok(mapping)
}

/// Maps the supplied datasets, or the first two sheets of the session's
/// file, and keeps the result as the session's comparison context.
pub async fn analyze_datasets(
    source: &dyn CompletionSource,
    session: &SharedSession,
    supplied: Option<(NamedDataset, NamedDataset)>,
) -> Result<MappingAnalysis, AppError> {
    let (model, epoch, (first, second)) = {
        let state = session.lock();
        let datasets = match supplied {
            Some(pair) => pair,
            None => state
                .file
                .as_ref()
                .and_then(|file| file.first_two_tables())
                .map(|(a, b)| (a.clone(), b.clone()))
                .ok_or_else(|| {
                    AppError::Validation(
                        "Comparison needs a file with at least two sheets, or two datasets".to_string(),
                    )
                })?,
        };
        (state.settings.model.clone(), state.epoch(), datasets)
    };

    let mapping = suggest_mapping(source, &model, &first, &second).await?;
    let analysis = MappingAnalysis {
        overview: comparator::overview(&first, &second, &mapping),
        options: mapping.aggregation_options(),
        mapping: mapping.clone(),
    };

    let mut state = session.lock();
    if state.epoch() == epoch {
        state.comparison = Some(Arc::new(ComparisonContext { first, second, mapping }));
    } else {
        tracing::warn!("File changed during column mapping, result not stored");
    }
    Ok(analysis)
}

fn comparison_context(session: &SharedSession) -> Result<Arc<ComparisonContext>, AppError> {
    session
        .lock()
        .comparison
        .clone()
        .ok_or_else(|| AppError::Validation("Please analyze the column mapping first".to_string()))
}

/// Aggregates both datasets of the session's comparison context.
pub fn run_comparison(
    session: &SharedSession,
    request: &AggregationRequest,
) -> Result<Vec<GroupComparison>, AppError> {
    let context = comparison_context(session)?;
    comparator::compare(&context.first.rows, &context.second.rows, &context.mapping, request)
}

/// Narrates why one group matches or differs.
pub async fn explain(
    source: &dyn CompletionSource,
    session: &SharedSession,
    request: &AggregationRequest,
    group_key: &str,
) -> Result<String, AppError> {
    let context = comparison_context(session)?;
    let model = session.lock().settings.model.clone();
    let comparisons = comparator::compare(
        &context.first.rows,
        &context.second.rows,
        &context.mapping,
        request,
    )?;
    let group = comparisons
        .iter()
        .find(|c| c.group_key == group_key)
        .ok_or_else(|| AppError::InvalidInput(format!("Unknown group '{}'", group_key)))?;

    let names = (context.first.name.as_str(), context.second.name.as_str());
    Ok(comparator::explain_group(source, &model, names, group).await)
}
