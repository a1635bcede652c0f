//! Core inference pipeline for a client-side transformer runtime: quantized
//! weight streaming, tiered decode buffers, MoE routing and prefix-KV reuse
//! over a GPU compute abstraction.
//!
//! - [`gpu`]: device handle, buffer pool, decode ring, ping-pong scratch buffers
//! - [`cache`]: per-layer KV cache and cross-pipeline snapshotting
//! - [`weights`]: manifest parsing and streaming weight loading
//! - [`moe`]: Mixture-of-Experts top-k gating
//! - [`tokenizer`]: bundled/sentencepiece/bpe tokenizer backends
//! - [`sampling`]: temperature/top-k/top-p/repetition-penalty sampling
//! - [`pipeline`]: pipeline state, the prefill/decode generator, the public
//!   pipeline handle, and the multi-pipeline pool
//! - [`config`]: CLI/runtime configuration
//! - [`error`]: crate-wide error type

pub mod cache;
pub mod config;
pub mod error;
pub mod gpu;
pub mod moe;
pub mod pipeline;
pub mod sampling;
pub mod server;
pub mod tokenizer;
pub mod weights;
