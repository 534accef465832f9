//! Request and response DTOs for the hub and vector-service HTTP surfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Two-field submission result. Submission endpoints never raise; domain
/// failures come back as `{ok: false, errors: [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl SubmitResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
        }
    }

    pub fn fail(errors: Vec<String>) -> Self {
        Self { ok: false, errors }
    }
}

/// Which logical store a read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbSelector {
    Cache,
    #[default]
    Archive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetIntelligenceQuery {
    #[serde(default)]
    pub db: DbSelector,
}

/// Structured archive query filter. All present filters combine with AND.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    #[serde(default)]
    pub locations: Option<Vec<String>>,
    #[serde(default)]
    pub peoples: Option<Vec<String>>,
    #[serde(default)]
    pub organizations: Option<Vec<String>>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default = "QueryRequest::default_threshold")]
    pub threshold: i64,
    #[serde(default)]
    pub skip: u64,
    #[serde(default = "QueryRequest::default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub db: DbSelector,
    #[serde(default)]
    pub token: Option<String>,
}

impl QueryRequest {
    fn default_threshold() -> i64 {
        4
    }

    fn default_limit() -> i64 {
        100
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub items: Vec<serde_json::Value>,
    pub total: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorSearchRequest {
    pub text: String,
    #[serde(default = "default_true")]
    pub in_summary: bool,
    #[serde(default)]
    pub in_fulltext: bool,
    #[serde(default = "VectorSearchRequest::default_top_n")]
    pub top_n: usize,
    #[serde(default = "VectorSearchRequest::default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default)]
    pub token: Option<String>,
}

impl VectorSearchRequest {
    fn default_top_n() -> usize {
        10
    }

    fn default_score_threshold() -> f32 {
        0.5
    }
}

fn default_true() -> bool {
    true
}

/// One merged vector search hit: unique per archived item, carrying the
/// best-scoring chunk.
#[derive(Debug, Clone, Serialize)]
pub struct VectorSearchHit {
    pub id: String,
    pub score: f32,
    pub chunk_text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RatingRequest {
    pub rating: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub token: Option<String>,
}

// --- Vector service surface ---

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,
    #[serde(default = "CreateCollectionRequest::default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "CreateCollectionRequest::default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl CreateCollectionRequest {
    fn default_chunk_size() -> usize {
        512
    }

    fn default_chunk_overlap() -> usize {
        50
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertDocumentRequest {
    pub doc_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionSearchRequest {
    pub query: String,
    #[serde(default = "CollectionSearchRequest::default_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub score_threshold: f32,
    #[serde(default)]
    pub filter_criteria: Option<serde_json::Value>,
}

impl CollectionSearchRequest {
    fn default_top_n() -> usize {
        5
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListDocumentsQuery {
    #[serde(default = "ListDocumentsQuery::default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl ListDocumentsQuery {
    fn default_limit() -> usize {
        20
    }
}
