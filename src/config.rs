//! Runtime configuration for the inference pipeline.
//!
//! A `clap` CLI for the harness plus a `serde`-backed `Config` for everything
//! the pipeline itself needs, with `Config::load` falling back to defaults
//! when the file is absent.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments for the CLI harness.
#[derive(Parser, Debug, Clone)]
#[command(name = "gpu-infer-pipeline", about = "Runs a quantized transformer model through the core inference pipeline")]
pub struct Cli {
    /// Path to the model manifest (JSON).
    #[arg(short, long, default_value = "manifest.json")]
    pub manifest: PathBuf,

    /// Path to a runtime configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Prompt text to generate from.
    #[arg(short, long, default_value = "Hello")]
    pub prompt: String,

    /// Maximum tokens to generate.
    #[arg(long, default_value_t = 64)]
    pub max_tokens: usize,

    /// Serve the HTTP harness instead of running one generation.
    #[arg(long)]
    pub serve: bool,

    /// HTTP listen address (used with --serve).
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level runtime configuration (not the model's own hyperparameters,
/// which come from the manifest — see [`crate::weights::manifest::Manifest`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub buffers: BufferConfig,
    pub decode_ring: DecodeRingConfig,
    pub sampling: SamplingDefaults,
    pub loader: LoaderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            buffers: BufferConfig::default(),
            decode_ring: DecodeRingConfig::default(),
            sampling: SamplingDefaults::default(),
            loader: LoaderConfig::default(),
        }
    }
}

/// Weight-loader settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Per-shard fetch timeout; a fetch that exceeds this raises `ShardTimeout`.
    pub shard_fetch_timeout_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            shard_fetch_timeout_secs: 30,
        }
    }
}

impl LoaderConfig {
    pub fn shard_fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shard_fetch_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for a
    /// missing file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

/// HTTP harness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 4,
            request_timeout_secs: 300,
        }
    }
}

/// Buffer-pool sizing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Device buffer-size classes, in bytes, that the pool rounds requests up to.
    pub size_classes: Vec<usize>,
    /// Prefill chunk size in tokens, to respect GPU buffer caps.
    pub prefill_chunk_tokens: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size_classes: vec![
                4 * 1024,
                64 * 1024,
                1024 * 1024,
                16 * 1024 * 1024,
                256 * 1024 * 1024,
            ],
            prefill_chunk_tokens: 512,
        }
    }
}

/// Decode-ring sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecodeRingConfig {
    pub ring_tokens: usize,
    pub ring_stop: usize,
    pub ring_staging: usize,
    pub tokens_per_interval: usize,
    pub stop_check_mode: StopCheckMode,
}

impl Default for DecodeRingConfig {
    fn default() -> Self {
        Self {
            ring_tokens: 2,
            ring_stop: 2,
            ring_staging: 2,
            tokens_per_interval: 16,
            stop_check_mode: StopCheckMode::Batch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCheckMode {
    Batch,
    PerToken,
}

/// Default sampling parameters, overridable per-call by [`GenerationOptions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingDefaults {
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub repetition_penalty: f32,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
        }
    }
}

/// Per-call generation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub repetition_penalty: f32,
    pub stop_tokens: Vec<u32>,
    pub stop_check_mode: StopCheckMode,
    pub seed: Option<u64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 64,
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
            stop_tokens: Vec::new(),
            stop_check_mode: StopCheckMode::Batch,
            seed: None,
        }
    }
}

/// Model hyperparameters resolved from a manifest.
///
/// Immutable after `loadModel` — see [`crate::pipeline::handle::Pipeline::load_model`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub n_layers: usize,
    pub hidden_size: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub rope_theta: f32,
    pub rope_scaling: Option<RopeScaling>,
    pub local_rope_theta: Option<f32>,
    pub moe: Option<MoeConfig>,
    pub sliding_window: Option<usize>,
    pub tie_embeddings: bool,
}

impl ModelConfig {
    /// Number of GQA/MQA groups sharing one KV head.
    pub fn kv_groups(&self) -> usize {
        if self.n_kv_heads == 0 {
            1
        } else {
            self.n_heads / self.n_kv_heads
        }
    }

    /// Bytes for one layer's K (or V) cache at the given layout, FP16.
    pub fn kv_layer_bytes(&self, capacity_positions: usize) -> usize {
        capacity_positions * self.n_kv_heads * self.head_dim * 2
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RopeScaling {
    pub factor: f32,
    pub original_max_position_embeddings: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MoeConfig {
    pub n_experts: usize,
    pub top_k: usize,
    /// Softmax over all experts then select top-k, vs. top-k then softmax.
    pub normalize_after_topk: bool,
}
