//! Per-collection repository: chunking, embedding, upsert-by-parent and
//! metadata-filtered similarity search.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::vector::embedder::Embedder;
use crate::vector::index::{ChunkIndex, ChunkRecord, FilterClause};
use crate::vector::splitter::TextSplitter;

/// One search result, already collapsed to parent-document granularity.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub chunk_id: String,
    pub score: f32,
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

pub struct CollectionRepo {
    name: String,
    splitter: RwLock<TextSplitter>,
    index: ChunkIndex,
    embedder: Arc<dyn Embedder>,
}

impl CollectionRepo {
    pub fn new(
        name: &str,
        index: ChunkIndex,
        embedder: Arc<dyn Embedder>,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            splitter: RwLock::new(TextSplitter::new(chunk_size, chunk_overlap)),
            index,
            embedder,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_config(&self) -> (usize, usize) {
        let splitter = self.splitter.read();
        (splitter.chunk_size(), splitter.chunk_overlap())
    }

    /// Reconfigures the chunking profile. Existing chunks keep the profile
    /// they were written with until their parent is re-ingested.
    pub fn set_chunk_config(&self, chunk_size: usize, chunk_overlap: usize) {
        *self.splitter.write() = TextSplitter::new(chunk_size, chunk_overlap);
    }

    /// Fully replaces a document: all previous chunks with this parent id
    /// are deleted first, so a shorter re-ingest cannot leave orphans.
    /// Returns the generated chunk ids.
    pub fn upsert(
        &self,
        doc_id: &str,
        text: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<String>> {
        let chunks = self.splitter.read().split_text(text);
        if chunks.is_empty() {
            // Still clear old chunks so an emptied document disappears
            self.index.delete_parent(doc_id)?;
            tracing::warn!(
                collection = %self.name,
                doc_id,
                "Document produced no chunks"
            );
            return Ok(Vec::new());
        }

        let embeddings = self.embedder.embed(&chunks)?;
        let total = chunks.len();
        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (content, embedding))| {
                let mut chunk_metadata = metadata.clone();
                chunk_metadata.insert("parent_doc_id".into(), doc_id.into());
                chunk_metadata.insert("chunk_index".into(), i.into());
                chunk_metadata.insert("total_chunks".into(), total.into());
                ChunkRecord {
                    chunk_id: format!("{}#chunk_{}", doc_id, i),
                    parent_doc_id: doc_id.to_string(),
                    chunk_index: i,
                    total_chunks: total,
                    content,
                    embedding,
                    metadata: chunk_metadata,
                }
            })
            .collect();

        self.index.replace_parent(doc_id, &records)?;
        Ok(records.into_iter().map(|r| r.chunk_id).collect())
    }

    /// Semantic search with metadata filtering and per-parent deduplication.
    ///
    /// Fetches `top_n * 3` chunk candidates (several may share a parent),
    /// converts cosine distance to similarity as `1 - d`, drops rows below
    /// the threshold, keeps the best chunk per parent, and returns the
    /// `top_n` best parents ordered by descending score.
    pub fn search(
        &self,
        query: &str,
        top_n: usize,
        score_threshold: f32,
        filter: &[FilterClause],
    ) -> Result<Vec<SearchHit>> {
        let query_embedding = self
            .embedder
            .embed(std::slice::from_ref(&query.to_string()))?
            .into_iter()
            .next()
            .unwrap_or_default();

        let fetch_k = top_n.saturating_mul(3).max(1);
        let mut candidates = self.index.candidates(filter)?;

        let mut scored: Vec<SearchHit> = candidates
            .drain(..)
            .map(|row| {
                let score = cosine_similarity(&query_embedding, &row.embedding);
                SearchHit {
                    doc_id: row.parent_doc_id,
                    chunk_id: row.chunk_id,
                    score,
                    content: row.content,
                    metadata: row.metadata,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(fetch_k);
        scored.retain(|hit| hit.score >= score_threshold);

        // Collapse to the highest-scoring chunk per parent document
        let mut best: Vec<SearchHit> = Vec::new();
        for hit in scored {
            match best.iter_mut().find(|b| b.doc_id == hit.doc_id) {
                Some(existing) => {
                    if hit.score > existing.score {
                        *existing = hit;
                    }
                }
                None => best.push(hit),
            }
        }

        best.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        best.truncate(top_n);
        Ok(best)
    }

    pub fn exists(&self, doc_id: &str) -> Result<bool> {
        self.index.exists(doc_id)
    }

    /// Deletes all chunks of a document. Returns whether anything existed.
    pub fn delete(&self, doc_id: &str) -> Result<bool> {
        Ok(self.index.delete_parent(doc_id)? > 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.index.clear()
    }

    /// Total chunk count.
    pub fn count(&self) -> Result<u64> {
        self.index.count()
    }

    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<(String, usize)>> {
        self.index.list_parents(limit, offset)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::embedder::HashEmbedder;

    fn temp_repo(chunk_size: usize, overlap: usize) -> (tempfile::TempDir, CollectionRepo) {
        let dir = tempfile::tempdir().unwrap();
        let index = ChunkIndex::open(&dir.path().join("chunks.db")).unwrap();
        let repo = CollectionRepo::new(
            "test",
            index,
            Arc::new(HashEmbedder::default()),
            chunk_size,
            overlap,
        );
        (dir, repo)
    }

    #[test]
    fn test_upsert_assigns_chunk_ids() {
        let (_dir, repo) = temp_repo(20, 0);
        let ids = repo
            .upsert("doc1", "alpha beta gamma delta epsilon zeta eta theta", Default::default())
            .unwrap();
        assert!(!ids.is_empty());
        assert_eq!(ids[0], "doc1#chunk_0");
        assert!(repo.exists("doc1").unwrap());
    }

    #[test]
    fn test_upsert_shrinking_document_leaves_no_orphans() {
        let (_dir, repo) = temp_repo(30, 5);
        let long_text = "sentence one here. ".repeat(20);
        let first = repo.upsert("c", &long_text, Default::default()).unwrap();
        assert!(first.len() >= 3);

        let second = repo.upsert("c", "tiny text", Default::default()).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(repo.count().unwrap(), 1);
    }

    #[test]
    fn test_upsert_empty_text_clears_previous_chunks() {
        let (_dir, repo) = temp_repo(30, 5);
        repo.upsert("c", "some persistent text", Default::default())
            .unwrap();
        assert!(repo.exists("c").unwrap());

        let ids = repo.upsert("c", "", Default::default()).unwrap();
        assert!(ids.is_empty());
        assert!(!repo.exists("c").unwrap());
    }

    #[test]
    fn test_search_collapses_chunks_of_same_parent() {
        let (_dir, repo) = temp_repo(25, 5);
        // One document whose every chunk matches the query tokens
        let text = "rocket launch site. rocket launch pad. rocket launch crew. rocket launch fuel.";
        let ids = repo.upsert("d", text, Default::default()).unwrap();
        assert!(ids.len() >= 2);

        let hits = repo.search("rocket launch", 5, 0.0, &[]).unwrap();
        let d_rows: Vec<_> = hits.iter().filter(|h| h.doc_id == "d").collect();
        assert_eq!(d_rows.len(), 1, "parent must appear at most once");
    }

    #[test]
    fn test_search_sorted_descending_and_limited() {
        let (_dir, repo) = temp_repo(100, 0);
        repo.upsert("a", "solar panel efficiency report", Default::default())
            .unwrap();
        repo.upsert("b", "solar panel maintenance guide", Default::default())
            .unwrap();
        repo.upsert("c", "unrelated cooking recipe", Default::default())
            .unwrap();

        let hits = repo.search("solar panel", 2, 0.0, &[]).unwrap();
        assert!(hits.len() <= 2);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_search_respects_threshold() {
        let (_dir, repo) = temp_repo(100, 0);
        repo.upsert("a", "completely different topic", Default::default())
            .unwrap();
        let hits = repo.search("quantum cryptography", 5, 0.99, &[]).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_delete_document() {
        let (_dir, repo) = temp_repo(100, 0);
        repo.upsert("a", "to be removed", Default::default()).unwrap();
        assert!(repo.delete("a").unwrap());
        assert!(!repo.delete("a").unwrap());
        assert!(!repo.exists("a").unwrap());
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
