//! Top-level error type for the inference pipeline.
//!
//! Component-local error enums (see `gpu`, `cache`, `weights`, `moe`) convert
//! into this one at the pipeline boundary via `#[from]`.

use thiserror::Error;

use crate::cache::kv_cache::KvCacheError;
use crate::gpu::buffer_pool::BufferPoolError;
use crate::gpu::decode_buffers::ScratchError;
use crate::gpu::decode_ring::RingError;
use crate::moe::router::RouterError;
use crate::tokenizer::TokenizerError;
use crate::weights::loader::LoaderError;
use crate::weights::manifest::ManifestError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("requested buffer exceeds device limits: {0}")]
    BufferTooLarge(String),

    #[error("shard fetch failed: {0}")]
    ShardFetchFailed(String),

    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("tokenizer unavailable: {0}")]
    TokenizerUnavailable(String),

    #[error("context overflow: seqLen would exceed max_seq_len ({max_seq_len})")]
    ContextOverflow { max_seq_len: usize },

    #[error("sampling degenerate: all candidate logits were masked")]
    SamplingDegenerate,

    #[error("device lost")]
    DeviceLost,

    #[error("generation cancelled")]
    Cancelled,

    #[error("hot-swap manifest rejected: {0}")]
    HotSwapRejected(String),

    #[error(transparent)]
    BufferPool(#[from] BufferPoolError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Scratch(#[from] ScratchError),

    #[error(transparent)]
    KvCache(#[from] KvCacheError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
