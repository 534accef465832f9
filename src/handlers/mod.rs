pub mod health;
pub mod intelligence;
pub mod vector_service;
