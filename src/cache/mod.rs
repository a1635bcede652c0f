//! Per-pipeline KV cache.
//!
//! - [`kv_cache`]: per-layer K/V storage with Contiguous/Paged/SlidingWindow layouts
//! - [`snapshot`]: immutable clone/apply of a cache's contents across pipelines

pub mod kv_cache;
pub mod snapshot;
