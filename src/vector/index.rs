//! On-disk chunk index for one vector collection.
//!
//! Each collection owns a sqlite database under its own subdirectory of the
//! engine's data directory, holding chunk text, the embedding, and the
//! searchable metadata columns. Metadata filters are applied at the SQL
//! level so similarity scoring only sees eligible candidates. Records
//! without a `pub_timestamp` are excluded by any filter that references it
//! (NULL never satisfies a comparison), which is the intended policy for
//! untrusted upstream dates.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, params_from_iter, types::Value};

use crate::error::{Error, Result};

/// One stored chunk row.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub parent_doc_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A candidate row pulled for similarity scoring.
#[derive(Debug, Clone)]
pub struct CandidateRow {
    pub chunk_id: String,
    pub parent_doc_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Comparison applied to one metadata column.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterClause {
    Eq(String, Value),
    Gte(String, f64),
    Lte(String, f64),
}

/// Metadata columns that filters may reference.
const FILTERABLE_TEXT: [&str; 2] = ["parent_doc_id", "informant"];
const FILTERABLE_NUMERIC: [&str; 3] = ["max_rate_score", "pub_timestamp", "archived_timestamp"];
const FILTERABLE_CLASS: &str = "max_rate_class";

impl FilterClause {
    /// Parses a MongoDB-style filter document:
    /// `{"field": value}`, `{"field": {"$gte": x, "$lte": y}}`,
    /// `{"$and": [clause, ...]}`.
    pub fn parse(criteria: &serde_json::Value) -> Result<Vec<FilterClause>> {
        let mut clauses = Vec::new();
        collect_clauses(criteria, &mut clauses)?;
        Ok(clauses)
    }

    fn column(&self) -> &str {
        match self {
            FilterClause::Eq(column, _) => column,
            FilterClause::Gte(column, _) => column,
            FilterClause::Lte(column, _) => column,
        }
    }
}

fn collect_clauses(criteria: &serde_json::Value, out: &mut Vec<FilterClause>) -> Result<()> {
    let Some(object) = criteria.as_object() else {
        return Err(Error::Validation(
            "filter_criteria must be an object".to_string(),
        ));
    };
    for (key, value) in object {
        if key == "$and" {
            let Some(items) = value.as_array() else {
                return Err(Error::Validation("$and expects an array".to_string()));
            };
            for item in items {
                collect_clauses(item, out)?;
            }
            continue;
        }
        if !is_filterable(key) {
            return Err(Error::Validation(format!(
                "Unknown filter field '{}'",
                key
            )));
        }
        match value {
            serde_json::Value::Object(range) => {
                for (op, bound) in range {
                    let bound = bound.as_f64().ok_or_else(|| {
                        Error::Validation(format!("Range bound for '{}' must be numeric", key))
                    })?;
                    match op.as_str() {
                        "$gte" => out.push(FilterClause::Gte(key.clone(), bound)),
                        "$lte" => out.push(FilterClause::Lte(key.clone(), bound)),
                        other => {
                            return Err(Error::Validation(format!(
                                "Unsupported filter operator '{}'",
                                other
                            )));
                        }
                    }
                }
            }
            serde_json::Value::String(s) => {
                out.push(FilterClause::Eq(key.clone(), Value::Text(s.clone())));
            }
            serde_json::Value::Number(n) => {
                let n = n
                    .as_f64()
                    .ok_or_else(|| Error::Validation("Invalid number in filter".to_string()))?;
                out.push(FilterClause::Eq(key.clone(), Value::Real(n)));
            }
            other => {
                return Err(Error::Validation(format!(
                    "Unsupported filter value for '{}': {}",
                    key, other
                )));
            }
        }
    }
    Ok(())
}

fn is_filterable(field: &str) -> bool {
    field == FILTERABLE_CLASS
        || FILTERABLE_TEXT.contains(&field)
        || FILTERABLE_NUMERIC.contains(&field)
}

pub struct ChunkIndex {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl ChunkIndex {
    /// Opens (creating if needed) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS chunks (
                 chunk_id            TEXT PRIMARY KEY,
                 parent_doc_id       TEXT NOT NULL,
                 chunk_index         INTEGER NOT NULL,
                 total_chunks        INTEGER NOT NULL,
                 content             TEXT NOT NULL,
                 embedding           BLOB NOT NULL,
                 informant           TEXT,
                 max_rate_class      TEXT,
                 max_rate_score      REAL,
                 pub_timestamp       REAL,
                 archived_timestamp  REAL,
                 metadata_json       TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_chunks_parent ON chunks(parent_doc_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces every chunk of a parent document in one transaction:
    /// delete first, then insert, so a shrinking document cannot leave
    /// orphan chunks behind.
    pub fn replace_parent(&self, parent_doc_id: &str, records: &[ChunkRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM chunks WHERE parent_doc_id = ?1",
            [parent_doc_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (chunk_id, parent_doc_id, chunk_index, total_chunks,
                                     content, embedding, informant, max_rate_class,
                                     max_rate_score, pub_timestamp, archived_timestamp,
                                     metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for record in records {
                let metadata_json = serde_json::to_string(&record.metadata)?;
                stmt.execute(rusqlite::params![
                    record.chunk_id,
                    record.parent_doc_id,
                    record.chunk_index as i64,
                    record.total_chunks as i64,
                    record.content,
                    encode_embedding(&record.embedding),
                    meta_text(&record.metadata, "informant"),
                    meta_text(&record.metadata, "max_rate_class"),
                    meta_number(&record.metadata, "max_rate_score"),
                    meta_number(&record.metadata, "pub_timestamp"),
                    meta_number(&record.metadata, "archived_timestamp"),
                    metadata_json,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Deletes all chunks of a parent. Returns the removed chunk count.
    pub fn delete_parent(&self, parent_doc_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM chunks WHERE parent_doc_id = ?1",
            [parent_doc_id],
        )?;
        Ok(removed)
    }

    pub fn exists(&self, parent_doc_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE parent_doc_id = ?1 LIMIT 1",
            [parent_doc_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Total chunk count.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM chunks", [])?;
        Ok(())
    }

    /// Paginated listing of parent documents with their chunk counts.
    pub fn list_parents(&self, limit: usize, offset: usize) -> Result<Vec<(String, usize)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT parent_doc_id, COUNT(*) FROM chunks
             GROUP BY parent_doc_id ORDER BY parent_doc_id LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map([limit as i64, offset as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        let mut parents = Vec::new();
        for row in rows {
            parents.push(row?);
        }
        Ok(parents)
    }

    /// Fetches every chunk row satisfying the metadata filter. Similarity
    /// scoring happens above this layer.
    pub fn candidates(&self, filter: &[FilterClause]) -> Result<Vec<CandidateRow>> {
        let mut sql = String::from(
            "SELECT chunk_id, parent_doc_id, content, embedding, metadata_json FROM chunks",
        );
        let mut params: Vec<Value> = Vec::new();
        if !filter.is_empty() {
            let mut conditions = Vec::new();
            for (i, clause) in filter.iter().enumerate() {
                if !is_filterable(clause.column()) {
                    return Err(Error::Validation(format!(
                        "Unknown filter field '{}'",
                        clause.column()
                    )));
                }
                let placeholder = i + 1;
                match clause {
                    FilterClause::Eq(column, value) => {
                        conditions.push(format!("{} = ?{}", column, placeholder));
                        params.push(value.clone());
                    }
                    FilterClause::Gte(column, bound) => {
                        conditions.push(format!("{} >= ?{}", column, placeholder));
                        params.push(Value::Real(*bound));
                    }
                    FilterClause::Lte(column, bound) => {
                        conditions.push(format!("{} <= ?{}", column, placeholder));
                        params.push(Value::Real(*bound));
                    }
                }
            }
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            let metadata_json: String = row.get(4)?;
            Ok(CandidateRow {
                chunk_id: row.get(0)?,
                parent_doc_id: row.get(1)?,
                content: row.get(2)?,
                embedding: decode_embedding(&row.get::<_, Vec<u8>>(3)?),
                metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            })
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        Ok(candidates)
    }
}

fn meta_text(metadata: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    metadata.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn meta_number(metadata: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<f64> {
    metadata.get(key).and_then(|v| v.as_f64())
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
