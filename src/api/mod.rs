//! HTTP API module
//!
//! Thin axum surface over the application services.

pub mod middleware;
pub mod routes;

pub use routes::{create_router, AppState};
