//! Vector service HTTP surface. Runs in-process here, but the contract is
//! split-process capable: everything the hub needs goes through these
//! routes. While the engine is initializing, mutating and querying routes
//! answer 503 with a retry hint.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{Error, Result};
use crate::models::requests::{
    CollectionSearchRequest, CreateCollectionRequest, ListDocumentsQuery, UpsertDocumentRequest,
};
use crate::state::AppState;
use crate::vector::{FilterClause, VectorEngine};

fn engine(state: &AppState) -> Result<Arc<VectorEngine>> {
    state
        .vector_engine
        .clone()
        .ok_or_else(|| Error::ServiceUnavailable("Vector service is disabled".to_string()))
}

/// `GET /api/status`
pub async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let engine = engine(&state)?;
    Ok(Json(serde_json::to_value(engine.status_report())?))
}

/// `GET /api/health`
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "VectorDBService" }))
}

/// `POST /api/collections`: creates a collection or updates its chunking
/// config.
pub async fn create_collection(
    State(state): State<AppState>,
    Json(request): Json<CreateCollectionRequest>,
) -> Result<Json<serde_json::Value>> {
    if request.name.trim().is_empty() {
        return Err(Error::Validation("Collection name is required".to_string()));
    }
    let engine = engine(&state)?;
    let repo = engine
        .ensure_repository(&request.name, request.chunk_size, request.chunk_overlap)
        .await?;
    let (chunk_size, chunk_overlap) = repo.chunk_config();
    Ok(Json(json!({
        "status": "success",
        "message": format!("Collection '{}' ready.", request.name),
        "config": { "chunk_size": chunk_size, "chunk_overlap": chunk_overlap },
    })))
}

/// `GET /api/collections`
pub async fn list_collections(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let engine = engine(&state)?;
    Ok(Json(json!({ "collections": engine.list_collections() })))
}

/// `POST /api/collections/{name}/upsert`
pub async fn upsert_document(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<UpsertDocumentRequest>,
) -> Result<Json<serde_json::Value>> {
    if request.doc_id.trim().is_empty() {
        return Err(Error::Validation("doc_id is required".to_string()));
    }
    let engine = engine(&state)?;
    let chunk_ids = engine
        .upsert(&name, &request.doc_id, &request.text, request.metadata)
        .await?;
    Ok(Json(json!({
        "status": "success",
        "doc_id": request.doc_id,
        "chunks_created": chunk_ids.len(),
    })))
}

/// `POST /api/collections/{name}/search`
pub async fn search(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<CollectionSearchRequest>,
) -> Result<Json<Vec<crate::vector::SearchHit>>> {
    if request.query.trim().is_empty() {
        return Err(Error::Validation("query string is required".to_string()));
    }
    let filter = match &request.filter_criteria {
        Some(criteria) => FilterClause::parse(criteria)?,
        None => Vec::new(),
    };
    let engine = engine(&state)?;
    let hits = engine
        .search(
            &name,
            &request.query,
            request.top_n,
            request.score_threshold,
            filter,
        )
        .await?;
    Ok(Json(hits))
}

/// `DELETE /api/collections/{name}/documents/{doc_id}`
pub async fn delete_document(
    State(state): State<AppState>,
    Path((name, doc_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    let engine = engine(&state)?;
    if engine.delete(&name, &doc_id)? {
        Ok(Json(json!({ "status": "success", "doc_id": doc_id })))
    } else {
        Err(Error::NotFound("Document not found".to_string()))
    }
}

/// `POST /api/collections/{name}/clear`
pub async fn clear_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let engine = engine(&state)?;
    engine.clear(&name)?;
    Ok(Json(json!({ "status": "cleared", "collection": name })))
}

/// `GET /api/collections/{name}/stats`
pub async fn collection_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let engine = engine(&state)?;
    let chunk_count = engine.stats(&name)?;
    Ok(Json(json!({ "collection": name, "chunk_count": chunk_count })))
}

/// `GET /api/collections/{name}/documents?limit&offset`
pub async fn list_documents(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ListDocumentsQuery>,
) -> Result<Json<serde_json::Value>> {
    let engine = engine(&state)?;
    let documents: Vec<serde_json::Value> = engine
        .list_documents(&name, query.limit, query.offset)?
        .into_iter()
        .map(|(doc_id, chunks)| json!({ "doc_id": doc_id, "chunks": chunks }))
        .collect();
    Ok(Json(json!({
        "documents": documents,
        "limit": query.limit,
        "offset": query.offset,
    })))
}

/// `GET /api/admin/backup`: downloads a zip of the index directory.
pub async fn backup(State(state): State<AppState>) -> Result<Response> {
    let engine = engine(&state)?;
    let path = engine.backup().await?;
    let bytes = tokio::fs::read(&path).await?;
    // The archive was staged in the temp dir; best-effort cleanup
    let _ = tokio::fs::remove_file(&path).await;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "vector_backup.zip".to_string());
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// `POST /api/admin/restore`: multipart zip upload replacing the index.
pub async fn restore(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let engine = engine(&state)?;

    let mut payload: Option<axum::body::Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("Invalid multipart body: {}", e)))?
    {
        let is_file_field = matches!(field.name(), Some("file")) || field.file_name().is_some();
        if is_file_field {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| Error::Validation(format!("Upload read failed: {}", e)))?;
            payload = Some(bytes);
            break;
        }
    }
    let payload = payload.ok_or_else(|| Error::Validation("No file part".to_string()))?;
    if payload.is_empty() {
        return Err(Error::Validation("Uploaded archive is empty".to_string()));
    }

    let temp_path = std::env::temp_dir().join(format!("vector_restore_{}.zip", uuid::Uuid::new_v4()));
    tokio::fs::write(&temp_path, &payload).await?;
    let result = engine.restore(&temp_path).await;
    let _ = tokio::fs::remove_file(&temp_path).await;
    result?;

    Ok(Json(json!({
        "status": "success",
        "message": "Database restored and reloaded.",
    })))
}
