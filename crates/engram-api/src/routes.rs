use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use std::path::Path as FsPath;

use engram_index::NodeFilter;
use engram_types::{InsightType, NodeId, UserFeedback};

use crate::error::{ApiError, ApiResult, success};
use crate::server::AppState;

fn db(state: &AppState) -> std::sync::MutexGuard<'_, engram_index::Database> {
    state
        .handle
        .db
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub async fn stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.handle.stats().map_err(ApiError::from)?;
    Ok(success(stats))
}

pub async fn status(State(state): State<AppState>) -> ApiResult {
    let status = state.handle.status().map_err(ApiError::from)?;
    Ok(success(status))
}

#[derive(Deserialize)]
pub struct NodeListQuery {
    pub project: Option<String>,
    pub outcome: Option<String>,
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub needs_review: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_nodes(
    State(state): State<AppState>,
    Query(query): Query<NodeListQuery>,
) -> ApiResult {
    let filter = NodeFilter {
        project: query.project,
        outcome: query.outcome,
        node_type: query.node_type,
        needs_review: query.needs_review,
        since: None,
        until: None,
        limit: query.limit.unwrap_or(50).min(500),
        offset: query.offset.unwrap_or(0),
    };
    let rows = db(&state).list_node_rows(&filter)?;
    Ok(success(rows))
}

pub async fn get_node(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let node_id =
        NodeId::from_stored(id).map_err(|e| ApiError::SchemaInvalid(e.to_string()))?;

    let node = state
        .handle
        .store
        .load_current(&node_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound("node".to_string()))?;
    let edges = db(&state).edges_for_node(&node_id)?;

    Ok(success(serde_json::json!({
        "node": node,
        "edges": edges,
    })))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub project: Option<String>,
    pub limit: Option<usize>,
}

pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(20).min(100);
    let hits = db(&state).search_nodes_in_project(&query.q, query.project.as_deref(), limit)?;
    Ok(success(hits))
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn list_decisions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let decisions = db(&state).list_decisions(query.limit.unwrap_or(50).min(500))?;
    Ok(success(decisions))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionUpdate {
    pub user_feedback: Option<String>,
}

pub async fn update_decision(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<DecisionUpdate>,
) -> ApiResult {
    let feedback = match update.user_feedback.as_deref() {
        None | Some("") => None,
        Some(value) => Some(
            UserFeedback::parse(value)
                .ok_or_else(|| ApiError::SchemaInvalid(format!("unknown feedback '{}'", value)))?,
        ),
    };
    db(&state)
        .set_decision_feedback(id, feedback)
        .map_err(|_| ApiError::NotFound("decision".to_string()))?;
    Ok(success(serde_json::json!({ "id": id })))
}

#[derive(Deserialize)]
pub struct InsightListQuery {
    pub included: Option<bool>,
}

pub async fn list_insights(
    State(state): State<AppState>,
    Query(query): Query<InsightListQuery>,
) -> ApiResult {
    let insights = db(&state).list_insights(query.included.unwrap_or(false))?;
    Ok(success(insights))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightUpdate {
    pub prompt_included: bool,
    pub prompt_text: Option<String>,
}

pub async fn update_insight(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<InsightUpdate>,
) -> ApiResult {
    db(&state)
        .set_insight_prompt_included(id, update.prompt_included, update.prompt_text.as_deref())
        .map_err(|_| ApiError::NotFound("insight".to_string()))?;
    Ok(success(serde_json::json!({ "id": id })))
}

pub async fn insight_effectiveness(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult {
    let history = db(&state).effectiveness_history(id)?;
    Ok(success(history))
}

fn insights_of(state: &AppState, types: &[InsightType]) -> Result<Vec<engram_types::Insight>, ApiError> {
    let all = db(state).list_insights(false)?;
    Ok(all
        .into_iter()
        .filter(|i| types.contains(&i.insight_type))
        .collect())
}

pub async fn failure_patterns(State(state): State<AppState>) -> ApiResult {
    let insights = insights_of(&state, &[InsightType::Failure, InsightType::ToolError])?;
    Ok(success(insights))
}

pub async fn lesson_patterns(State(state): State<AppState>) -> ApiResult {
    let insights = insights_of(&state, &[InsightType::Lesson, InsightType::Win])?;
    Ok(success(insights))
}

pub async fn model_patterns(State(state): State<AppState>) -> ApiResult {
    let insights = insights_of(&state, &[InsightType::Quirk])?;
    Ok(success(insights))
}

pub async fn get_config(State(state): State<AppState>) -> ApiResult {
    Ok(success(state.handle.config_snapshot()))
}

pub async fn put_config(
    State(state): State<AppState>,
    Json(config): Json<engram_runtime::Config>,
) -> ApiResult {
    state.handle.update_config(config).map_err(|e| match e {
        engram_runtime::Error::Config(msg) => ApiError::SchemaInvalid(msg),
        other => ApiError::from(other),
    })?;
    Ok(success(state.handle.config_snapshot()))
}

pub async fn providers(State(state): State<AppState>) -> ApiResult {
    let config = state.handle.config_snapshot();
    Ok(success(serde_json::json!({
        "analyzer": {
            "binary": config.analyzer_binary,
            "provider": config.analyzer_provider,
            "model": config.analyzer_model,
            "available": engram_runtime::resolve_binary(&config.analyzer_binary).is_some(),
        },
        "embedding": {
            "provider": config.embedding_provider,
            "model": config.embedding_model,
            "baseUrl": config.embedding_base_url,
            "dimensions": config.embedding_dimensions,
        },
    })))
}

#[derive(Deserialize)]
pub struct QueryBody {
    pub question: String,
    pub project: Option<String>,
    pub limit: Option<usize>,
}

pub async fn query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> ApiResult {
    if body.question.trim().is_empty() {
        return Err(ApiError::SchemaInvalid("question must not be empty".to_string()));
    }

    let request = engram_runtime::QueryRequest {
        question: body.question,
        project: body.project,
        limit: body.limit.unwrap_or(8).min(50),
    };
    let outcome = state
        .handle
        .query
        .query(&request, &state.handle.cancel)
        .await
        .map_err(ApiError::from)?;

    Ok(success(serde_json::json!({
        "answer": outcome.answer,
        "sources": outcome.sources,
    })))
}

#[derive(Deserialize)]
pub struct HealthQuery {
    pub roundtrip: Option<bool>,
}

pub async fn health(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> ApiResult {
    let results = state
        .handle
        .run_health_checks(query.roundtrip.unwrap_or(false))
        .await;
    let available = !engram_runtime::any_fatal(&results);
    let message = if available {
        "all checks passed".to_string()
    } else {
        results
            .iter()
            .filter(|r| !r.passed && r.fatal)
            .map(|r| format!("{}: {}", r.name, r.message))
            .collect::<Vec<_>>()
            .join("; ")
    };
    Ok(success(serde_json::json!({
        "available": available,
        "message": message,
        "checks": results,
    })))
}

pub async fn list_clusters(State(state): State<AppState>) -> ApiResult {
    let clusters = db(&state).list_clusters()?;
    let clusters: Vec<serde_json::Value> = clusters
        .into_iter()
        .map(|(label, members)| {
            serde_json::json!({
                "label": label,
                "members": members,
            })
        })
        .collect();
    Ok(success(clusters))
}

/// Direct pointer from the node row to its canonical JSON file, for
/// debugging and the dashboard's raw view.
pub async fn get_node_raw(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let node_id =
        NodeId::from_stored(id).map_err(|e| ApiError::SchemaInvalid(e.to_string()))?;
    let row = db(&state)
        .get_node_row(&node_id)?
        .ok_or_else(|| ApiError::NotFound("node".to_string()))?;

    let raw = std::fs::read_to_string(FsPath::new(&row.json_path))
        .map_err(|e| ApiError::Internal(format!("canonical file unreadable: {}", e)))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(success(value))
}
