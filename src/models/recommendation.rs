use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One ranked reference inside a recommendation set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationItem {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "REASON", default)]
    pub reason: String,
}

/// A stored recommendation digest: an ordered list of archived-item
/// references with rationale, produced by the hourly digest task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "TIME", with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub time: DateTime<Utc>,
    #[serde(rename = "ITEMS")]
    pub items: Vec<RecommendationItem>,
}
