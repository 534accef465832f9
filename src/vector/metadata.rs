//! Projection of archived intelligence records into vector-store text and
//! metadata, and the typed search filters the hub exposes.

use bson::Document;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde_json::json;

use crate::config::FulltextSource;
use crate::models::intelligence::{
    APPENDIX_MAX_RATE_CLASS, APPENDIX_MAX_RATE_SCORE, APPENDIX_TIME_ARCHIVED, FIELD_APPENDIX,
    FIELD_CONTENT, FIELD_EVENT_BRIEF, FIELD_EVENT_TEXT, FIELD_EVENT_TITLE, FIELD_INFORMANT,
    FIELD_PUB_TIME, FIELD_RAW_DATA, parse_flexible_time, str_field,
};
use crate::vector::index::FilterClause;

/// Title, brief and event text joined into the summary projection.
pub fn summary_text(doc: &Document) -> String {
    [FIELD_EVENT_TITLE, FIELD_EVENT_BRIEF, FIELD_EVENT_TEXT]
        .iter()
        .map(|field| str_field(doc, field))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The full-text projection, per the configured source.
pub fn fulltext_text(doc: &Document, source: FulltextSource) -> String {
    match source {
        FulltextSource::Raw => doc
            .get_document(FIELD_RAW_DATA)
            .map(|raw| str_field(raw, FIELD_CONTENT))
            .unwrap_or_default(),
        FulltextSource::Enriched => str_field(doc, FIELD_EVENT_TEXT),
    }
}

/// Chunk metadata for an archived record.
///
/// `archived_timestamp` is always present (the ingest instant when the
/// record lacks one). `pub_timestamp` is OMITTED when the upstream value
/// cannot be parsed, so event-period filters silently exclude the record.
pub fn build_metadata(
    doc: &Document,
    now: DateTime<Utc>,
) -> serde_json::Map<String, serde_json::Value> {
    let appendix = doc.get_document(FIELD_APPENDIX).ok();

    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "informant".to_string(),
        json!(str_field(doc, FIELD_INFORMANT)),
    );
    metadata.insert(
        "max_rate_class".to_string(),
        json!(
            appendix
                .map(|a| str_field(a, APPENDIX_MAX_RATE_CLASS))
                .unwrap_or_default()
        ),
    );
    let max_rate_score = appendix
        .and_then(|a| a.get(APPENDIX_MAX_RATE_SCORE))
        .and_then(bson_as_f64)
        .unwrap_or(0.0);
    metadata.insert("max_rate_score".to_string(), json!(max_rate_score));

    let archived_ts = appendix
        .and_then(|a| a.get(APPENDIX_TIME_ARCHIVED))
        .and_then(parse_flexible_time)
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or_else(|| now.timestamp() as f64);
    metadata.insert("archived_timestamp".to_string(), json!(archived_ts));

    if let Some(pub_ts) = doc.get(FIELD_PUB_TIME).and_then(parse_flexible_time) {
        metadata.insert(
            "pub_timestamp".to_string(),
            json!(pub_ts.timestamp() as f64),
        );
    }

    metadata
}

fn bson_as_f64(value: &bson::Bson) -> Option<f64> {
    match value {
        bson::Bson::Double(v) => Some(*v),
        bson::Bson::Int32(v) => Some(f64::from(*v)),
        bson::Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

/// Typed metadata filter for intelligence searches. All present criteria
/// combine with logical AND.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub event_period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub archive_period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub rate_class: Option<String>,
    pub rate_threshold: Option<f64>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.event_period.is_none()
            && self.archive_period.is_none()
            && self.rate_class.is_none()
            && self.rate_threshold.is_none()
    }

    pub fn to_clauses(&self) -> Vec<FilterClause> {
        let mut clauses = Vec::new();
        if let Some((start, end)) = self.event_period {
            clauses.push(FilterClause::Gte(
                "pub_timestamp".to_string(),
                start.timestamp() as f64,
            ));
            clauses.push(FilterClause::Lte(
                "pub_timestamp".to_string(),
                end.timestamp() as f64,
            ));
        }
        if let Some((start, end)) = self.archive_period {
            clauses.push(FilterClause::Gte(
                "archived_timestamp".to_string(),
                start.timestamp() as f64,
            ));
            clauses.push(FilterClause::Lte(
                "archived_timestamp".to_string(),
                end.timestamp() as f64,
            ));
        }
        if let Some(rate_class) = &self.rate_class {
            clauses.push(FilterClause::Eq(
                "max_rate_class".to_string(),
                Value::Text(rate_class.clone()),
            ));
        }
        if let Some(threshold) = self.rate_threshold {
            clauses.push(FilterClause::Gte("max_rate_score".to_string(), threshold));
        }
        clauses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use chrono::TimeZone;

    fn archived_doc() -> Document {
        doc! {
            "UUID": "a",
            "INFORMANT": "https://x/1",
            "EVENT_TITLE": "Title",
            "EVENT_BRIEF": "Brief",
            "EVENT_TEXT": "Body text",
            "PUB_TIME": bson::DateTime::from_chrono(
                Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
            ),
            "RAW_DATA": { "content": "raw scraped content" },
            "APPENDIX": {
                "__MAX_RATE_CLASS__": "MILITARY",
                "__MAX_RATE_SCORE__": 7,
                "__TIME_ARCHIVED__": bson::DateTime::from_chrono(
                    Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap()
                ),
            },
        }
    }

    #[test]
    fn test_summary_text_joins_non_empty_parts() {
        let text = summary_text(&archived_doc());
        assert_eq!(text, "Title\n\nBrief\n\nBody text");

        let sparse = doc! { "EVENT_TITLE": "Only title" };
        assert_eq!(summary_text(&sparse), "Only title");
    }

    #[test]
    fn test_fulltext_source_selection() {
        let doc = archived_doc();
        assert_eq!(fulltext_text(&doc, FulltextSource::Raw), "raw scraped content");
        assert_eq!(fulltext_text(&doc, FulltextSource::Enriched), "Body text");
    }

    #[test]
    fn test_metadata_carries_rating_and_timestamps() {
        let now = Utc::now();
        let metadata = build_metadata(&archived_doc(), now);
        assert_eq!(metadata["informant"], "https://x/1");
        assert_eq!(metadata["max_rate_class"], "MILITARY");
        assert_eq!(metadata["max_rate_score"], 7.0);
        assert!(metadata.contains_key("pub_timestamp"));
        let expected = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        assert_eq!(metadata["archived_timestamp"], expected.timestamp() as f64);
    }

    #[test]
    fn test_metadata_omits_unparseable_pub_time() {
        let mut doc = archived_doc();
        doc.insert("PUB_TIME", "sometime last week");
        let metadata = build_metadata(&doc, Utc::now());
        assert!(!metadata.contains_key("pub_timestamp"));
    }

    #[test]
    fn test_metadata_defaults_archived_timestamp_to_now() {
        let mut doc = archived_doc();
        doc.remove("APPENDIX");
        let now = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
        let metadata = build_metadata(&doc, now);
        assert_eq!(metadata["archived_timestamp"], now.timestamp() as f64);
    }

    #[test]
    fn test_search_filter_clauses() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let filter = SearchFilter {
            event_period: Some((start, end)),
            rate_class: Some("ECONOMY".to_string()),
            rate_threshold: Some(5.0),
            ..SearchFilter::default()
        };
        let clauses = filter.to_clauses();
        assert_eq!(clauses.len(), 4);
        assert!(clauses.contains(&FilterClause::Gte(
            "pub_timestamp".to_string(),
            start.timestamp() as f64
        )));
        assert!(clauses.contains(&FilterClause::Gte("max_rate_score".to_string(), 5.0)));
    }
}
