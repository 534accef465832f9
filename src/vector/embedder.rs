//! Embedding backends.
//!
//! Exactly one embedding model is loaded per engine. The ONNX-backed
//! fastembed model is the default backend; a deterministic token-hash
//! embedder serves as the fallback and as the test backend.

use crate::error::Result;

/// A text embedding model. Implementations are blocking; callers hop onto a
/// blocking thread for batch work.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;
    fn dimension(&self) -> usize;
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic hashed bag-of-tokens embedding. No model download, stable
/// across runs, good enough for relative similarity of overlapping texts.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash-embedder"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

impl HashEmbedder {
    fn embed_one(&self, text: &str) -> Vec<f32> {
        use std::hash::{DefaultHasher, Hash, Hasher};

        let mut vector = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let hash = hasher.finish();
            let bucket = (hash % self.dimension as u64) as usize;
            // Half the hash bits decide the sign so antonym buckets cancel
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(feature = "fastembed-embeddings")]
pub use fastembed_backend::FastEmbedder;

#[cfg(feature = "fastembed-embeddings")]
mod fastembed_backend {
    use super::{Embedder, Result};
    use crate::error::Error;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use parking_lot::Mutex;

    /// ONNX-backed embedding model. Construction downloads and loads the
    /// model and is therefore heavy; do it inside the engine initializer.
    pub struct FastEmbedder {
        model: Mutex<TextEmbedding>,
        model_name: String,
        dimension: usize,
    }

    impl FastEmbedder {
        pub fn load(model_name: &str) -> Result<Self> {
            let model_kind = resolve_model(model_name);
            let mut model = TextEmbedding::try_new(
                InitOptions::new(model_kind).with_show_download_progress(false),
            )
            .map_err(|e| Error::VectorDb(format!("Failed to load embedding model: {}", e)))?;

            // Probe once to learn the output dimension
            let probe = model
                .embed(vec!["dimension probe"], None)
                .map_err(|e| Error::VectorDb(format!("Embedding probe failed: {}", e)))?;
            let dimension = probe.first().map(|v| v.len()).unwrap_or(0);

            Ok(Self {
                model: Mutex::new(model),
                model_name: model_name.to_string(),
                dimension,
            })
        }
    }

    impl Embedder for FastEmbedder {
        fn name(&self) -> &str {
            &self.model_name
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            let mut model = self.model.lock();
            model
                .embed(texts.to_vec(), None)
                .map_err(|e| Error::VectorDb(format!("Embedding failed: {}", e)))
        }
    }

    fn resolve_model(name: &str) -> EmbeddingModel {
        match name {
            "all-MiniLM-L6-v2" | "sentence-transformers/all-MiniLM-L6-v2" => {
                EmbeddingModel::AllMiniLML6V2
            }
            "BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            "intfloat/multilingual-e5-small" => EmbeddingModel::MultilingualE5Small,
            other => {
                tracing::warn!(
                    model = other,
                    "Unknown embedding model name, falling back to all-MiniLM-L6-v2"
                );
                EmbeddingModel::AllMiniLML6V2
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed(&["alpha beta".to_string()]).unwrap();
        let b = embedder.embed(&["alpha beta".to_string()]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_embedder_output_is_normalized() {
        let embedder = HashEmbedder::default();
        let vectors = embedder.embed(&["one two three".to_string()]).unwrap();
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_similar_texts_score_higher() {
        let embedder = HashEmbedder::default();
        let vectors = embedder
            .embed(&[
                "the quick brown fox".to_string(),
                "the quick brown fox jumps".to_string(),
                "completely unrelated words here".to_string(),
            ])
            .unwrap();
        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&vectors[0], &vectors[1]) > dot(&vectors[0], &vectors[2]));
    }

    #[test]
    fn test_empty_input() {
        let embedder = HashEmbedder::default();
        assert!(embedder.embed(&[]).unwrap().is_empty());
    }
}
