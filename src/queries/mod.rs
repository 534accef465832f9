pub mod intelligence;

pub use intelligence::IntelligenceQueryEngine;
