//! Pipeline state container.
//!
//! Mutated only by the initializer and by [`crate::pipeline::generator`].
//! Holds everything a decode step touches: resolved configuration, weight
//! map, KV cache, optional MoE router, RoPE tables, buffer-pool handle,
//! stats, and the ping-pong/ring bookkeeping carried between steps.

use crate::cache::kv_cache::KvCache;
use crate::config::{DecodeRingConfig, ModelConfig};
use crate::gpu::buffer_pool::BufferPool;
use crate::gpu::decode_buffers::DecodeBuffers;
use crate::gpu::decode_ring::DecodeRing;
use crate::moe::router::Router;
use crate::weights::manifest::EosTokenId;
use crate::weights::weight::{GlobalWeights, LayerWeights};

/// One step of a resolved layer pipeline plan: the ordered dispatch of
/// attention, (dense or MoE) MLP, residual-add and norm a layer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStep {
    Attention,
    Mlp,
    MoeMlp,
    ResidualAdd,
    Norm,
}

/// RoPE cos/sin tables, plus an optional second pair for local-attention
/// layers that use a different theta.
pub struct RopeTables {
    pub cos: Vec<f32>,
    pub sin: Vec<f32>,
    pub local_cos: Option<Vec<f32>>,
    pub local_sin: Option<Vec<f32>>,
}

impl RopeTables {
    /// Precompute `(cos, sin)` tables for `max_seq_len` positions and
    /// `head_dim` dimensions, at the given base frequency.
    pub fn build(max_seq_len: usize, head_dim: usize, theta: f32) -> Vec<f32> {
        let half = head_dim / 2;
        let mut table = Vec::with_capacity(max_seq_len * half);
        for pos in 0..max_seq_len {
            for i in 0..half {
                let freq = 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32);
                table.push(pos as f32 * freq);
            }
        }
        table
    }

    pub fn new(config: &ModelConfig) -> Self {
        let angles = Self::build(config.max_seq_len, config.head_dim, config.rope_theta);
        let cos = angles.iter().map(|a| a.cos()).collect();
        let sin = angles.iter().map(|a| a.sin()).collect();

        let (local_cos, local_sin) = match config.local_rope_theta {
            Some(local_theta) => {
                let local_angles = Self::build(config.max_seq_len, config.head_dim, local_theta);
                (
                    Some(local_angles.iter().map(|a| a.cos()).collect()),
                    Some(local_angles.iter().map(|a| a.sin()).collect()),
                )
            }
            None => (None, None),
        };

        Self { cos, sin, local_cos, local_sin }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub tokens_generated: u64,
    pub prefill_time_ms: f64,
    pub decode_time_ms: f64,
    pub gpu_timestamp_ns: Option<u64>,
}

/// A low-rank adaptation adapter. The concrete tensors are out of scope;
/// this just models the single-writer swap contract.
#[derive(Debug, Clone)]
pub struct LoRAAdapter {
    pub name: String,
    pub rank: usize,
}

/// Resolves which dispatch order a given layer follows, based on whether
/// it is an MoE layer.
pub fn layer_pipeline_plan(is_moe_layer: bool) -> Vec<LayerStep> {
    vec![
        LayerStep::Attention,
        LayerStep::ResidualAdd,
        LayerStep::Norm,
        if is_moe_layer { LayerStep::MoeMlp } else { LayerStep::Mlp },
        LayerStep::ResidualAdd,
        LayerStep::Norm,
    ]
}

/// Mutable pipeline state, owned exclusively by one [`crate::pipeline::handle::Pipeline`].
pub struct PipelineState {
    pub config: ModelConfig,
    pub layer_weights: Vec<LayerWeights>,
    pub global_weights: GlobalWeights,
    pub kv_cache: KvCache,
    pub router: Option<Router>,
    pub rope: RopeTables,
    pub lora: Option<LoRAAdapter>,
    pub buffer_pool: BufferPool,
    pub decode_ring: DecodeRing,
    pub decode_ring_config: DecodeRingConfig,
    pub decode_buffers: DecodeBuffers,
    pub stats: PipelineStats,
    pub decode_step: u64,
    pub layer_plan: Vec<Vec<LayerStep>>,
    /// Terminating token id(s), merged from the manifest's `eos_token_id`
    /// and the tokenizer's `eos` special token. Checked by
    /// [`crate::pipeline::generator::Generator`] in addition to a call's
    /// own `stop_tokens`.
    pub eos_token_id: Option<EosTokenId>,
}

impl PipelineState {
    pub fn new(
        config: ModelConfig,
        layer_weights: Vec<LayerWeights>,
        global_weights: GlobalWeights,
        kv_cache: KvCache,
        buffer_pool: BufferPool,
    ) -> Self {
        Self::with_decode_ring_config(config, layer_weights, global_weights, kv_cache, buffer_pool, DecodeRingConfig::default())
    }

    pub fn with_decode_ring_config(
        config: ModelConfig,
        layer_weights: Vec<LayerWeights>,
        global_weights: GlobalWeights,
        kv_cache: KvCache,
        buffer_pool: BufferPool,
        decode_ring_config: DecodeRingConfig,
    ) -> Self {
        let router = config.moe.map(Router::new);
        let rope = RopeTables::new(&config);
        let layer_plan = (0..config.n_layers)
            .map(|_| layer_pipeline_plan(config.moe.is_some()))
            .collect();

        Self {
            config,
            layer_weights,
            global_weights,
            kv_cache,
            router,
            rope,
            lora: None,
            buffer_pool,
            decode_ring: DecodeRing::new(),
            decode_ring_config,
            decode_buffers: DecodeBuffers::new(),
            stats: PipelineStats::default(),
            decode_step: 0,
            layer_plan,
            eos_token_id: None,
        }
    }

    pub fn reset(&mut self) {
        self.kv_cache.clear();
        self.decode_step = 0;
        self.stats = PipelineStats::default();
        self.decode_buffers.reset_ping_pong();
    }
}
