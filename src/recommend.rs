//! Periodic recommendation digests over recent archives.

use std::sync::Arc;
use std::time::Duration;

use bson::doc;
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::ai::AiClientManager;
use crate::analyzer::generate_recommendation_by_ai;
use crate::conversation::ConversationRecorder;
use crate::error::{Error, Result};
use crate::models::recommendation::{Recommendation, RecommendationItem};
use crate::prompts::RECOMMENDATION_PROMPT;
use crate::queries::IntelligenceQueryEngine;
use crate::queries::intelligence::QueryParams;
use crate::storage::DocumentStore;
use crate::storage::datetime::document_to_local_json;

/// How long to keep retrying for a free client before giving up on a digest.
const CLIENT_WAIT_ATTEMPTS: u32 = 60;

pub struct RecommendationManager {
    archive_engine: Arc<IntelligenceQueryEngine>,
    store: Option<Arc<DocumentStore>>,
    clients: Arc<AiClientManager>,
    recorder: Arc<ConversationRecorder>,
}

impl RecommendationManager {
    pub fn new(
        archive_engine: Arc<IntelligenceQueryEngine>,
        store: Option<Arc<DocumentStore>>,
        clients: Arc<AiClientManager>,
        recorder: Arc<ConversationRecorder>,
    ) -> Self {
        Self {
            archive_engine,
            store,
            clients,
            recorder,
        }
    }

    /// Generates and stores one digest over archives in the period whose
    /// max rating clears the threshold. Returns `None` when the period
    /// holds nothing to recommend.
    pub async fn generate(
        &self,
        period: (DateTime<Utc>, DateTime<Utc>),
        threshold: i64,
        limit: i64,
    ) -> Result<Option<Recommendation>> {
        let candidates = self
            .archive_engine
            .query_documents(QueryParams {
                period: Some(period),
                threshold: Some(threshold),
                limit,
                ..QueryParams::default()
            })
            .await?;

        if candidates.is_empty() {
            tracing::info!("No archives above threshold in period, skipping digest");
            return Ok(None);
        }

        let lease = self.wait_for_client().await?;
        let (value, record_file) = generate_recommendation_by_ai(
            lease.client(),
            &self.recorder,
            RECOMMENDATION_PROMPT,
            &candidates,
        )
        .await
        .map_err(|e| Error::AiProvider(e.to_string()))?;
        drop(lease);

        let items = parse_items(&value);
        if items.is_empty() {
            tracing::warn!(%record_file, "Recommendation response carried no items");
            return Ok(None);
        }

        let recommendation = Recommendation {
            uuid: uuid::Uuid::new_v4().to_string(),
            time: Utc::now(),
            items,
        };

        if let Some(store) = &self.store {
            let document = bson::to_document(&recommendation)?;
            store.insert(document).await?;
        }
        tracing::info!(
            count = recommendation.items.len(),
            %record_file,
            "Recommendation digest stored"
        );
        Ok(Some(recommendation))
    }

    /// The most recently generated digest, if any.
    pub async fn latest(&self) -> Result<Vec<serde_json::Value>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let documents = store
            .find_many(doc! {}, Some(doc! { "TIME": -1 }), 0, 1)
            .await?;
        Ok(documents.iter().map(document_to_local_json).collect())
    }

    async fn wait_for_client(&self) -> Result<crate::ai::ClientLease> {
        for attempt in 1..=CLIENT_WAIT_ATTEMPTS {
            if let Some(lease) = self.clients.get_available_client("RecommendationManager") {
                return Ok(lease);
            }
            if attempt % 10 == 0 {
                tracing::warn!(attempt, "Recommendation digest still waiting for an AI client");
            }
            let jitter_ms = rand::rng().random_range(0..500);
            tokio::time::sleep(Duration::from_millis(1000 + jitter_ms)).await;
        }
        Err(Error::AiProvider(
            "No AI client became available for the digest".to_string(),
        ))
    }
}

/// Accepts `[{"UUID": ..., "REASON": ...}]` and the degenerate
/// `["uuid", ...]` shape some models produce.
fn parse_items(value: &serde_json::Value) -> Vec<RecommendationItem> {
    let Some(entries) = value.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry {
            serde_json::Value::String(uuid) => Some(RecommendationItem {
                uuid: uuid.clone(),
                reason: String::new(),
            }),
            serde_json::Value::Object(map) => {
                let uuid = map.get("UUID").and_then(|v| v.as_str())?;
                Some(RecommendationItem {
                    uuid: uuid.to_string(),
                    reason: map
                        .get("REASON")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_items_object_shape() {
        let value = json!([
            { "UUID": "a", "REASON": "broad impact" },
            { "UUID": "b" },
        ]);
        let items = parse_items(&value);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].uuid, "a");
        assert_eq!(items[0].reason, "broad impact");
        assert_eq!(items[1].reason, "");
    }

    #[test]
    fn test_parse_items_string_shape() {
        let items = parse_items(&json!(["a", "b"]));
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].uuid, "b");
    }

    #[test]
    fn test_parse_items_rejects_non_arrays() {
        assert!(parse_items(&json!({"UUID": "a"})).is_empty());
        assert!(parse_items(&json!([42, null])).is_empty());
    }
}
