//! Thin HTTP harness exposing the pipeline over `axum`. Glue, not core.
//!
//! - [`api`]: routes, `AppState`, SSE token streaming

pub mod api;
