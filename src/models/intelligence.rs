//! Intelligence record shapes and field contracts.
//!
//! Items travel through the pipeline as `bson::Document`s so that fields the
//! schema does not know about are carried through untouched. The constants
//! and helpers here are the single source of truth for the wire field names
//! and the appendix envelope.

use bson::{Bson, Document};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{Error, Result};

// Top-level wire fields
pub const FIELD_UUID: &str = "UUID";
pub const FIELD_INFORMANT: &str = "INFORMANT";
pub const FIELD_EVENT_TITLE: &str = "EVENT_TITLE";
pub const FIELD_EVENT_BRIEF: &str = "EVENT_BRIEF";
pub const FIELD_EVENT_TEXT: &str = "EVENT_TEXT";
pub const FIELD_EVENT_LOCATIONS: &str = "EVENT_LOCATIONS";
pub const FIELD_EVENT_PEOPLES: &str = "EVENT_PEOPLES";
pub const FIELD_EVENT_ORGANIZATIONS: &str = "EVENT_ORGANIZATIONS";
pub const FIELD_RATE: &str = "RATE";
pub const FIELD_PUB_TIME: &str = "PUB_TIME";
pub const FIELD_RAW_DATA: &str = "RAW_DATA";
pub const FIELD_APPENDIX: &str = "APPENDIX";
pub const FIELD_SUBMITTER: &str = "SUBMITTER";
/// Collected-form fields use the submitter's lowercase names
pub const FIELD_CONTENT: &str = "content";
pub const FIELD_COLLECTED_INFORMANT: &str = "informant";
/// Transport token carried inside submit bodies; stripped before enqueue
pub const FIELD_TOKEN: &str = "token";
/// Epoch-seconds receipt stamp set on accepted collected items
pub const FIELD_TIME_GOT: &str = "__TIME_GOT__";

// Appendix envelope keys
pub const APPENDIX_ARCHIVED_FLAG: &str = "__ARCHIVED__";
pub const APPENDIX_TIME_ARCHIVED: &str = "__TIME_ARCHIVED__";
pub const APPENDIX_MAX_RATE_CLASS: &str = "__MAX_RATE_CLASS__";
pub const APPENDIX_MAX_RATE_SCORE: &str = "__MAX_RATE_SCORE__";
pub const APPENDIX_MANUAL_RATING: &str = "__MANUAL_RATING__";
pub const APPENDIX_PARENT_ITEM: &str = "__PARENT_ITEM__";
pub const APPENDIX_CHILD_ITEMS: &str = "__CHILD_ITEMS__";

/// Rating key excluded from the max-rate computation. A self-assessment
/// column would otherwise dominate the class argmax.
pub const RATE_CLASS_EXCLUDED: &str = "CONFIDENCE";

// Document store collections
pub const COLLECTION_CACHED: &str = "intelligence_cached";
pub const COLLECTION_ARCHIVED: &str = "intelligence_archived";
pub const COLLECTION_RECOMMENDATION: &str = "intelligence_recommendation";

// Vector collections and their chunking profiles
pub const VECTOR_COLLECTION_SUMMARY: &str = "intelligence_summary";
pub const VECTOR_COLLECTION_FULL_TEXT: &str = "intelligence_full_text";
pub const SUMMARY_CHUNK_SIZE: usize = 256;
pub const SUMMARY_CHUNK_OVERLAP: usize = 30;
pub const FULL_TEXT_CHUNK_SIZE: usize = 512;
pub const FULL_TEXT_CHUNK_OVERLAP: usize = 50;

/// Terminal archival state of a cache item.
///
/// `Error` is the only state a later re-analysis may overwrite (E -> A);
/// the other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFlag {
    /// Successfully analyzed and archived
    Archived,
    /// Duplicate or judged to have no value
    Dropped,
    /// Analysis or post-processing failed; eligible for re-analysis
    Error,
    /// Permanently refused by the provider (HTTP 400)
    Sensitive,
}

impl ArchiveFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFlag::Archived => "A",
            ArchiveFlag::Dropped => "D",
            ArchiveFlag::Error => "E",
            ArchiveFlag::Sensitive => "S",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "A" => Some(ArchiveFlag::Archived),
            "D" => Some(ArchiveFlag::Dropped),
            "E" => Some(ArchiveFlag::Error),
            "S" => Some(ArchiveFlag::Sensitive),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ArchiveFlag::Error)
    }
}

impl std::fmt::Display for ArchiveFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns the trimmed string value of a document field, or an empty string.
pub fn str_field(doc: &Document, key: &str) -> String {
    match doc.get(key) {
        Some(Bson::String(s)) => s.trim().to_string(),
        _ => String::new(),
    }
}

/// The informant of a document, checking the archived-form field first and
/// falling back to the collected-form lowercase field.
pub fn informant_of(doc: &Document) -> String {
    let informant = str_field(doc, FIELD_INFORMANT);
    if informant.is_empty() {
        str_field(doc, FIELD_COLLECTED_INFORMANT)
    } else {
        informant
    }
}

/// Validates a collected item before it is accepted into the pipeline.
pub fn validate_collected(doc: &Document) -> Result<()> {
    let mut errors = Vec::new();

    if str_field(doc, FIELD_CONTENT).is_empty() {
        errors.push("Field 'content' is required and must be a non-empty string".to_string());
    }
    if informant_of(doc).is_empty() {
        errors.push("Field 'informant' is required".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors.join("; ")))
    }
}

/// Validates an enriched record against the archived schema.
pub fn validate_archived(doc: &Document) -> Result<()> {
    let mut errors = Vec::new();

    for field in [FIELD_UUID, FIELD_EVENT_TITLE, FIELD_EVENT_BRIEF, FIELD_EVENT_TEXT] {
        if str_field(doc, field).is_empty() {
            errors.push(format!("Field '{}' is required", field));
        }
    }
    match doc.get(FIELD_RATE) {
        Some(Bson::Document(_)) => {}
        Some(_) => errors.push("Field 'RATE' must be a mapping".to_string()),
        None => errors.push("Field 'RATE' is required".to_string()),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors.join("; ")))
    }
}

/// Numeric coercion for rating values. Non-numeric entries contribute
/// nothing (neither error nor value).
fn rate_value(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        Bson::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Computes the maximum-rating class of a `RATE` mapping.
///
/// The excluded key is skipped entirely; ties keep the first-encountered
/// entry (document insertion order). Returns `("N/A", 0)` when nothing
/// numeric remains.
pub fn compute_max_rate(rate: &Document) -> (String, i64) {
    let mut best: Option<(&str, i64)> = None;
    for (key, value) in rate.iter() {
        if key == RATE_CLASS_EXCLUDED {
            continue;
        }
        let Some(score) = rate_value(value) else {
            continue;
        };
        match best {
            Some((_, current)) if current >= score => {}
            _ => best = Some((key.as_str(), score)),
        }
    }
    match best {
        Some((key, score)) => (key.to_string(), score),
        None => ("N/A".to_string(), 0),
    }
}

/// Parses an upstream publication time in any of the shapes feeders send.
/// Naive values are interpreted in the local zone.
pub fn parse_flexible_time(value: &Bson) -> Option<DateTime<Utc>> {
    match value {
        Bson::DateTime(dt) => Some(dt.to_chrono()),
        Bson::Double(ts) => Utc.timestamp_opt(*ts as i64, 0).single(),
        Bson::Int64(ts) => Utc.timestamp_opt(*ts, 0).single(),
        Bson::Int32(ts) => Utc.timestamp_opt(i64::from(*ts), 0).single(),
        Bson::String(s) => parse_time_str(s),
        _ => None,
    }
}

fn parse_time_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return local_to_utc(naive);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return local_to_utc(date.and_hms_opt(0, 0, 0)?);
    }
    None
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
