pub mod embedder;
pub mod engine;
pub mod index;
pub mod metadata;
pub mod repo;
pub mod splitter;

pub use embedder::Embedder;
pub use engine::{EngineState, VectorEngine};
pub use index::FilterClause;
pub use repo::SearchHit;
