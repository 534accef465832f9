//! Timezone normalization for documents crossing the store boundary.
//!
//! Everything persisted is UTC. On the way in, datetime values anywhere in a
//! document, filter, or pipeline are normalized: BSON datetimes are already
//! instants; datetime-shaped strings with an offset are shifted to UTC and
//! naive ones are interpreted in the local zone first. On the way out,
//! instants are rendered back into the local zone.

use bson::{Bson, Document};
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Recursively normalizes every datetime value of a BSON tree to UTC.
///
/// Strings are converted only when they strictly parse as a full datetime,
/// so free text passes through untouched.
pub fn normalize_to_utc(value: Bson) -> Bson {
    match value {
        Bson::Document(doc) => Bson::Document(normalize_document(doc)),
        Bson::Array(items) => Bson::Array(items.into_iter().map(normalize_to_utc).collect()),
        Bson::DateTime(dt) => Bson::DateTime(dt),
        Bson::String(s) => match parse_datetime_str(&s) {
            Some(instant) => Bson::DateTime(bson::DateTime::from_chrono(instant)),
            None => Bson::String(s),
        },
        other => other,
    }
}

/// Document form of [`normalize_to_utc`].
pub fn normalize_document(doc: Document) -> Document {
    doc.into_iter()
        .map(|(key, value)| (key, normalize_to_utc(value)))
        .collect()
}

/// Parses a datetime-shaped string. Offset-carrying values are shifted to
/// UTC; naive values are interpreted in the local zone.
pub fn parse_datetime_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Local
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    None
}

/// Renders a stored document for callers: instants become RFC 3339 strings
/// in the local zone, object ids become hex strings.
pub fn document_to_local_json(doc: &Document) -> serde_json::Value {
    serde_json::Value::Object(
        doc.iter()
            .map(|(key, value)| (key.clone(), bson_to_local_json(value)))
            .collect(),
    )
}

fn bson_to_local_json(value: &Bson) -> serde_json::Value {
    match value {
        Bson::Document(doc) => document_to_local_json(doc),
        Bson::Array(items) => {
            serde_json::Value::Array(items.iter().map(bson_to_local_json).collect())
        }
        Bson::DateTime(dt) => serde_json::Value::String(
            dt.to_chrono()
                .with_timezone(&Local)
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        Bson::ObjectId(oid) => serde_json::Value::String(oid.to_hex()),
        Bson::String(s) => serde_json::Value::String(s.clone()),
        Bson::Boolean(b) => serde_json::Value::Bool(*b),
        Bson::Int32(v) => serde_json::Value::from(*v),
        Bson::Int64(v) => serde_json::Value::from(*v),
        Bson::Double(v) => serde_json::Value::from(*v),
        Bson::Null => serde_json::Value::Null,
        other => serde_json::Value::String(other.to_string()),
    }
}

/// Reads a nested value via dot notation (e.g. `APPENDIX.__TIME_ARCHIVED__`).
pub fn nested_value<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let value = current.get(part)?;
        if parts.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_normalize_converts_aware_strings() {
        let doc = doc! { "event_time": "2025-10-18T15:00:00+08:00" };
        let normalized = normalize_document(doc);
        let Bson::DateTime(dt) = normalized.get("event_time").unwrap() else {
            panic!("expected a datetime");
        };
        let expected = Utc.with_ymd_and_hms(2025, 10, 18, 7, 0, 0).unwrap();
        assert_eq!(dt.to_chrono(), expected);
    }

    #[test]
    fn test_normalize_interprets_naive_strings_as_local() {
        let doc = doc! { "event_time": "2025-10-18 15:00:00" };
        let normalized = normalize_document(doc);
        let Bson::DateTime(dt) = normalized.get("event_time").unwrap() else {
            panic!("expected a datetime");
        };
        let naive = chrono::NaiveDate::from_ymd_opt(2025, 10, 18)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap();
        let expected = Local
            .from_local_datetime(&naive)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(dt.to_chrono(), expected);
    }

    #[test]
    fn test_normalize_descends_into_nested_structures() {
        let doc = doc! {
            "APPENDIX": { "when": "2025-01-02T03:04:05Z" },
            "times": ["2025-01-02T03:04:05Z", "free text"],
        };
        let normalized = normalize_document(doc);
        let appendix = normalized.get_document("APPENDIX").unwrap();
        assert!(matches!(appendix.get("when"), Some(Bson::DateTime(_))));
        let times = normalized.get_array("times").unwrap();
        assert!(matches!(times[0], Bson::DateTime(_)));
        assert!(matches!(times[1], Bson::String(_)));
    }

    #[test]
    fn test_normalize_leaves_prose_alone() {
        let doc = doc! { "content": "meeting on 2025-01-02 was postponed" };
        let normalized = normalize_document(doc);
        assert!(matches!(normalized.get("content"), Some(Bson::String(_))));
    }

    #[test]
    fn test_round_trip_to_local() {
        let instant = Utc.with_ymd_and_hms(2025, 3, 15, 12, 0, 0).unwrap();
        let doc = doc! { "t": bson::DateTime::from_chrono(instant) };
        let json = document_to_local_json(&doc);
        let rendered = json["t"].as_str().unwrap();
        let parsed = DateTime::parse_from_rfc3339(rendered).unwrap();
        assert_eq!(parsed.with_timezone(&Utc), instant);
    }

    #[test]
    fn test_object_id_rendered_as_hex() {
        let oid = bson::oid::ObjectId::new();
        let doc = doc! { "_id": oid };
        let json = document_to_local_json(&doc);
        assert_eq!(json["_id"].as_str().unwrap(), oid.to_hex());
    }

    #[test]
    fn test_nested_value_dot_path() {
        let doc = doc! { "APPENDIX": { "__TIME_ARCHIVED__": 42i64 } };
        assert_eq!(
            nested_value(&doc, "APPENDIX.__TIME_ARCHIVED__"),
            Some(&Bson::Int64(42))
        );
        assert_eq!(nested_value(&doc, "APPENDIX.missing"), None);
        assert_eq!(nested_value(&doc, "missing.path"), None);
    }
}
