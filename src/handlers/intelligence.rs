//! Hub HTTP surface: submission, queries, statistics and rating.

use axum::http::HeaderMap;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::hub::stats::HubCounters;
use crate::middleware::AccessRole;
use crate::models::requests::{
    GetIntelligenceQuery, QueryRequest, QueryResponse, RatingRequest, SubmitResponse,
    VectorSearchRequest, VectorSearchHit,
};
use crate::queries::intelligence::QueryParams;
use crate::state::AppState;
use crate::vector::metadata::SearchFilter;

fn body_token(value: &serde_json::Value) -> Option<&str> {
    value.get("token").and_then(|t| t.as_str())
}

fn to_document(value: serde_json::Value) -> Result<bson::Document> {
    match &value {
        serde_json::Value::Object(_) => {
            bson::to_document(&value).map_err(|e| Error::Validation(e.to_string()))
        }
        _ => Err(Error::Validation(
            "Request body must be a JSON object".to_string(),
        )),
    }
}

/// `POST /submit/collected`, collector role.
pub async fn submit_collected(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<SubmitResponse>> {
    state
        .access
        .verify(AccessRole::Collector, &headers, body_token(&body))?;
    let document = match to_document(body) {
        Ok(document) => document,
        Err(e) => return Ok(Json(SubmitResponse::fail(vec![e.to_string()]))),
    };
    Ok(Json(state.hub.submit_collected(document).await))
}

/// `POST /submit/archived`, processor role.
pub async fn submit_archived(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<SubmitResponse>> {
    state
        .access
        .verify(AccessRole::Processor, &headers, body_token(&body))?;
    let document = match to_document(body) {
        Ok(document) => document,
        Err(e) => return Ok(Json(SubmitResponse::fail(vec![e.to_string()]))),
    };
    Ok(Json(state.hub.submit_archived(document).await))
}

/// `GET /intelligence/{id}?db=archive|cache`, RPC role.
pub async fn get_intelligence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<GetIntelligenceQuery>,
) -> Result<Json<serde_json::Value>> {
    state.access.verify(AccessRole::RpcApi, &headers, None)?;
    let items = state.hub.get_intelligence(&[id.clone()], query.db).await?;
    items
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("No intelligence record for {}", id)))
}

/// `POST /query`, RPC role.
pub async fn query_intelligence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>> {
    state
        .access
        .verify(AccessRole::RpcApi, &headers, request.token.as_deref())?;

    let params = QueryParams {
        period: request.period,
        locations: request.locations,
        peoples: request.peoples,
        organizations: request.organizations,
        keywords: request.keywords,
        threshold: Some(request.threshold),
        skip: request.skip,
        limit: request.limit,
    };
    let (items, total) = state.hub.query_intelligence(request.db, params).await?;
    Ok(Json(QueryResponse { items, total }))
}

/// `POST /vector-search`, RPC role.
pub async fn vector_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<VectorSearchRequest>,
) -> Result<Json<Vec<VectorSearchHit>>> {
    state
        .access
        .verify(AccessRole::RpcApi, &headers, request.token.as_deref())?;

    let hits = state
        .hub
        .vector_search(
            &request.text,
            request.in_summary,
            request.in_fulltext,
            request.top_n,
            request.score_threshold,
            SearchFilter::default(),
        )
        .await?;
    Ok(Json(hits))
}

/// `GET /recommendations`, RPC role.
pub async fn recommendations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<serde_json::Value>>> {
    state.access.verify(AccessRole::RpcApi, &headers, None)?;
    Ok(Json(state.hub.get_recommendations().await?))
}

#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub waiting_process: usize,
    pub post_process: usize,
    #[serde(flatten)]
    pub counters: HubCounters,
    pub ai_clients: Vec<crate::ai::manager::ClientStatus>,
}

/// `GET /statistics`, RPC role.
pub async fn statistics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatisticsResponse>> {
    state.access.verify(AccessRole::RpcApi, &headers, None)?;
    let stats = state.hub.statistics();
    Ok(Json(StatisticsResponse {
        waiting_process: stats.waiting_process,
        post_process: stats.post_process,
        counters: stats.counters,
        ai_clients: state.hub.clients.snapshot(),
    }))
}

/// `POST /rating/{id}`, RPC role.
pub async fn submit_rating(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<RatingRequest>,
) -> Result<Json<SubmitResponse>> {
    state
        .access
        .verify(AccessRole::RpcApi, &headers, request.token.as_deref())?;
    state.hub.submit_manual_rating(&id, request.rating).await?;
    Ok(Json(SubmitResponse::ok()))
}
