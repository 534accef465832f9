pub mod datetime;
pub mod export;
pub mod store;

pub use export::SplitBy;
pub use store::DocumentStore;
