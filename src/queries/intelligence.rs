//! Structured queries over an intelligence store (cache or archive).

use std::sync::Arc;

use bson::{Bson, Document, doc};
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::intelligence::{
    APPENDIX_MAX_RATE_SCORE, APPENDIX_TIME_ARCHIVED, FIELD_APPENDIX, FIELD_EVENT_BRIEF,
    FIELD_EVENT_LOCATIONS, FIELD_EVENT_ORGANIZATIONS, FIELD_EVENT_PEOPLES, FIELD_EVENT_TEXT,
    FIELD_EVENT_TITLE, FIELD_PUB_TIME, FIELD_UUID,
};
use crate::storage::DocumentStore;
use crate::storage::datetime::document_to_local_json;

/// Filter parameters for [`IntelligenceQueryEngine::query`]. All present
/// filters are AND-combined.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub locations: Option<Vec<String>>,
    pub peoples: Option<Vec<String>>,
    pub organizations: Option<Vec<String>>,
    pub keywords: Option<String>,
    pub threshold: Option<i64>,
    pub skip: u64,
    pub limit: i64,
}

pub struct IntelligenceQueryEngine {
    store: Arc<DocumentStore>,
}

impl IntelligenceQueryEngine {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Fetches records by UUID. A single id yields at most one record.
    pub async fn get(&self, uuids: &[String]) -> Result<Vec<serde_json::Value>> {
        let filter = match uuids {
            [] => return Ok(Vec::new()),
            [single] => doc! { FIELD_UUID: single },
            many => doc! { FIELD_UUID: { "$in": many.to_vec() } },
        };
        let documents = self.store.find_many(filter, None, 0, 0).await?;
        Ok(documents.iter().map(document_to_local_json).collect())
    }

    /// Structured query with total count for pagination.
    pub async fn query(&self, params: QueryParams) -> Result<(Vec<serde_json::Value>, u64)> {
        let filter = build_query_filter(&params);
        let total = self.store.count(filter.clone()).await?;
        let documents = self
            .store
            .find_many(filter, Some(doc! { FIELD_PUB_TIME: -1 }), params.skip, params.limit)
            .await?;
        let items = documents.iter().map(document_to_local_json).collect();
        Ok((items, total))
    }

    /// Structured query returning raw documents, for internal consumers.
    pub async fn query_documents(&self, params: QueryParams) -> Result<Vec<Document>> {
        let filter = build_query_filter(&params);
        self.store
            .find_many(filter, Some(doc! { FIELD_PUB_TIME: -1 }), params.skip, params.limit)
            .await
    }

    /// Combines field conditions under one logical operator (`$or`/`$and`)
    /// and returns the first match. The operator clause is built even for a
    /// single condition, preserving the legacy wire shape.
    pub async fn common_query(
        &self,
        conditions: Document,
        operator: &str,
    ) -> Result<Option<Document>> {
        let clauses: Vec<Bson> = conditions
            .into_iter()
            .map(|(key, value)| Bson::Document(doc! { key: value }))
            .collect();
        if clauses.is_empty() {
            return Ok(None);
        }
        self.store.find_one(doc! { operator: clauses }).await
    }

    /// Returns `(total_count, base_uuid)` where the base UUID belongs to the
    /// oldest archived record.
    pub async fn summary(&self) -> Result<(u64, String)> {
        let total = self.store.count(doc! {}).await?;
        let oldest = self
            .store
            .find_one_sorted(
                doc! {},
                doc! { format!("{}.{}", FIELD_APPENDIX, APPENDIX_TIME_ARCHIVED): 1 },
            )
            .await?;
        let base_uuid = oldest
            .as_ref()
            .and_then(|doc| doc.get_str(FIELD_UUID).ok())
            .unwrap_or_default()
            .to_string();
        Ok((total, base_uuid))
    }
}

fn build_query_filter(params: &QueryParams) -> Document {
    let mut filter = Document::new();

    if let Some((start, end)) = params.period {
        filter.insert(
            FIELD_PUB_TIME,
            doc! {
                "$gte": bson::DateTime::from_chrono(start),
                "$lte": bson::DateTime::from_chrono(end),
            },
        );
    }

    for (field, values) in [
        (FIELD_EVENT_LOCATIONS, &params.locations),
        (FIELD_EVENT_PEOPLES, &params.peoples),
        (FIELD_EVENT_ORGANIZATIONS, &params.organizations),
    ] {
        if let Some(values) = values {
            if !values.is_empty() {
                filter.insert(field, doc! { "$in": values.clone() });
            }
        }
    }

    if let Some(keywords) = params.keywords.as_deref() {
        let keywords = keywords.trim();
        if !keywords.is_empty() {
            let pattern = regex::escape(keywords);
            let clause = |field: &str| {
                doc! { field: { "$regex": pattern.clone(), "$options": "i" } }
            };
            filter.insert(
                "$or",
                vec![
                    clause(FIELD_EVENT_TITLE),
                    clause(FIELD_EVENT_BRIEF),
                    clause(FIELD_EVENT_TEXT),
                ],
            );
        }
    }

    if let Some(threshold) = params.threshold {
        filter.insert(
            format!("{}.{}", FIELD_APPENDIX, APPENDIX_MAX_RATE_SCORE),
            doc! { "$gte": threshold },
        );
    }

    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_build_query_filter_empty() {
        let filter = build_query_filter(&QueryParams::default());
        assert!(filter.is_empty());
    }

    #[test]
    fn test_build_query_filter_period_and_threshold() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let params = QueryParams {
            period: Some((start, end)),
            threshold: Some(4),
            ..QueryParams::default()
        };
        let filter = build_query_filter(&params);

        let range = filter.get_document("PUB_TIME").unwrap();
        assert!(range.contains_key("$gte"));
        assert!(range.contains_key("$lte"));
        let rate = filter
            .get_document("APPENDIX.__MAX_RATE_SCORE__")
            .unwrap();
        assert_eq!(rate.get_i64("$gte").unwrap(), 4);
    }

    #[test]
    fn test_build_query_filter_keywords_escapes_regex() {
        let params = QueryParams {
            keywords: Some("a.b(c)".to_string()),
            ..QueryParams::default()
        };
        let filter = build_query_filter(&params);
        let or = filter.get_array("$or").unwrap();
        assert_eq!(or.len(), 3);
        let first = or[0].as_document().unwrap();
        let pattern = first
            .get_document("EVENT_TITLE")
            .unwrap()
            .get_str("$regex")
            .unwrap();
        assert_eq!(pattern, regex::escape("a.b(c)"));
    }

    #[test]
    fn test_build_query_filter_entity_lists() {
        let params = QueryParams {
            locations: Some(vec!["Berlin".to_string()]),
            peoples: Some(vec![]),
            ..QueryParams::default()
        };
        let filter = build_query_filter(&params);
        assert!(filter.contains_key("EVENT_LOCATIONS"));
        // Empty lists add no clause
        assert!(!filter.contains_key("EVENT_PEOPLES"));
    }
}
