pub mod auth;

pub use auth::{AccessManager, AccessRole};
