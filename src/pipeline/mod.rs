//! Per-model inference pipelines.
//!
//! - [`state`]: mutable pipeline state (weights, KV cache, RoPE tables, stats)
//! - [`generator`]: prefill/decode state machine and prefix-KV variants
//! - [`handle`]: public pipeline surface (load/generate/snapshot/reset/unload)
//! - [`pool`]: multi-pipeline registry with per-model-id FIFO serialization

pub mod generator;
pub mod handle;
pub mod pool;
pub mod state;
