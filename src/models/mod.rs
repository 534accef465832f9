pub mod intelligence;
pub mod recommendation;
pub mod requests;

pub use intelligence::ArchiveFlag;
pub use recommendation::{Recommendation, RecommendationItem};
