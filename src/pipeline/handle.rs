//! Public pipeline surface.
//!
//! A `Pipeline` wraps [`PipelineState`] plus the tokenizer and exposes a
//! simple lifecycle: *uninitialized* -> `load_model` -> *loaded* (immutable
//! except KV cache/stats/adapter/ring state) -> `unload` back to
//! *initialized*.

use tracing::info;

use crate::cache::kv_cache::{KvCache, KvLayout};
use crate::cache::snapshot::{KvCacheSnapshot, clone_cache};
use crate::config::GenerationOptions;
use crate::error::{PipelineError, Result};
use crate::gpu::buffer_pool::BufferPool;
use crate::pipeline::generator::{generate_with_prefix_kv, prefill_kv_only, Generator};
use crate::pipeline::state::{LoRAAdapter, PipelineState, PipelineStats};
use crate::tokenizer::Tokenizer;
use crate::weights::loader::LoadedWeights;
use crate::weights::manifest::{EosTokenId, Manifest};

/// Union of the manifest's declared `eos_token_id` and the tokenizer's own
/// `eos` special token, so either source terminates generation.
fn resolve_eos_token_ids(manifest: &Manifest, tokenizer: &Tokenizer) -> Option<EosTokenId> {
    let mut ids: Vec<u32> = match &manifest.eos_token_id {
        Some(EosTokenId::Single(id)) => vec![*id],
        Some(EosTokenId::Multiple(ids)) => ids.clone(),
        None => Vec::new(),
    };
    if let Some(&eos) = tokenizer.get_special_tokens().get("eos") {
        if !ids.contains(&eos) {
            ids.push(eos);
        }
    }
    if ids.is_empty() {
        None
    } else {
        Some(EosTokenId::Multiple(ids))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KvMemoryStatsView {
    pub allocated_bytes: u64,
    pub used_bytes: u64,
    pub seq_len: usize,
    pub max_seq_len: usize,
}

/// A loaded, ready-to-generate model pipeline. `None` state means the
/// pipeline is in the *initialized* (pre-`loadModel`) state.
pub struct Pipeline {
    state: Option<PipelineState>,
    tokenizer: Option<Tokenizer>,
    kv_layout: KvLayout,
}

impl Pipeline {
    /// `initialize(contexts)` — binds the device/buffer-pool collaborators.
    /// Here those are process-wide singletons (see [`crate::gpu::device`]),
    /// so initialization just fixes the KV cache layout this instance will
    /// use once a model is loaded.
    pub fn initialize(kv_layout: KvLayout) -> Self {
        Self {
            state: None,
            tokenizer: None,
            kv_layout,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    fn state_mut(&mut self) -> Result<&mut PipelineState> {
        self.state
            .as_mut()
            .ok_or(PipelineError::NotInitialized("pipeline has no loaded model"))
    }

    fn state(&self) -> Result<&PipelineState> {
        self.state
            .as_ref()
            .ok_or(PipelineError::NotInitialized("pipeline has no loaded model"))
    }

    fn tokenizer(&self) -> Result<&Tokenizer> {
        self.tokenizer
            .as_ref()
            .ok_or(PipelineError::TokenizerUnavailable("no tokenizer initialized".into()))
    }

    /// `loadModel(manifest)`: resolves the manifest, streams weights and
    /// constructs the KV cache, RoPE tables and (if MoE) router.
    pub fn load_model(
        &mut self,
        manifest: &Manifest,
        weights: LoadedWeights,
        bundled_tokenizer_json: Option<&str>,
        size_classes: &[u64],
        decode_ring_config: crate::config::DecodeRingConfig,
    ) -> Result<()> {
        let config = manifest.config.resolve()?;
        let tokenizer = Tokenizer::initialize(manifest, bundled_tokenizer_json)?;

        let kv_cache = KvCache::new(&config, self.resolve_layout(&config));
        let buffer_pool = BufferPool::new(size_classes.to_vec());

        let mut state = PipelineState::with_decode_ring_config(
            config,
            weights.layers,
            weights.global,
            kv_cache,
            buffer_pool,
            decode_ring_config,
        );
        state.eos_token_id = resolve_eos_token_ids(manifest, &tokenizer);

        self.state = Some(state);
        self.tokenizer = Some(tokenizer);

        info!("Model loaded");
        Ok(())
    }

    /// Bypass the loader entirely with already-resolved weights.
    pub fn set_preloaded_weights(&mut self, weights: LoadedWeights) -> Result<()> {
        let state = self.state_mut()?;
        state.layer_weights = weights.layers;
        state.global_weights = weights.global;
        Ok(())
    }

    fn resolve_layout(&self, config: &crate::config::ModelConfig) -> KvLayout {
        match (self.kv_layout, config.sliding_window) {
            (KvLayout::SlidingWindow { .. }, Some(window)) => KvLayout::SlidingWindow { window },
            (layout, _) => layout,
        }
    }

    /// `generate(prompt, options)`: runs the full prefill/decode state
    /// machine to completion, returning every emitted chunk.
    pub fn generate(&mut self, prompt: &str, options: GenerationOptions) -> Result<Vec<String>> {
        let tokenizer = self.tokenizer()?.clone();
        let state = self.state_mut()?;
        let mut generator = Generator::new(state, &tokenizer, prompt, options)?;
        generator.run_to_completion()
    }

    /// `prefillKVOnly(prompt, options) -> snapshot`.
    pub fn prefill_kv_only(&mut self, prompt: &str) -> Result<(KvCacheSnapshot, usize)> {
        let tokenizer = self.tokenizer()?.clone();
        let state = self.state_mut()?;
        prefill_kv_only(state, &tokenizer, prompt)
    }

    /// `applyKVCacheSnapshot(snapshot) -> void`.
    pub fn apply_kv_cache_snapshot(&mut self, snapshot: &KvCacheSnapshot) -> Result<()> {
        let state = self.state_mut()?;
        let config = state.config.clone();
        let global_weights = state.global_weights.clone();
        crate::cache::snapshot::apply_snapshot(&mut state.kv_cache, &config, &global_weights, snapshot)?;
        Ok(())
    }

    /// `generateWithPrefixKV(snapshot, prompt, options) -> lazy sequence of string`.
    pub fn generate_with_prefix_kv(
        &mut self,
        snapshot: &KvCacheSnapshot,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<Vec<String>> {
        let tokenizer = self.tokenizer()?.clone();
        let state = self.state_mut()?;
        let mut generator = generate_with_prefix_kv(state, &tokenizer, snapshot, prompt, options)?;
        generator.run_to_completion()
    }

    /// `setLoRAAdapter(adapter | null) -> void`. Single-writer: takes
    /// effect from the next decode step.
    pub fn set_lora_adapter(&mut self, adapter: Option<LoRAAdapter>) -> Result<()> {
        self.state_mut()?.lora = adapter;
        Ok(())
    }

    /// `reset() -> void`: clears the KV cache and per-step counters.
    pub fn reset(&mut self) -> Result<()> {
        self.state_mut()?.reset();
        Ok(())
    }

    /// `unload() -> void`: frees weights and returns to *initialized*.
    pub fn unload(&mut self) {
        self.state = None;
        self.tokenizer = None;
    }

    pub fn get_stats(&self) -> Result<PipelineStats> {
        Ok(self.state()?.stats)
    }

    pub fn get_memory_stats(&self) -> Result<KvMemoryStatsView> {
        let stats = self.state()?.kv_cache.memory_stats();
        Ok(KvMemoryStatsView {
            allocated_bytes: stats.allocated_bytes,
            used_bytes: stats.used_bytes,
            seq_len: stats.seq_len,
            max_seq_len: stats.max_seq_len,
        })
    }

    pub fn get_kv_cache_stats(&self) -> Result<crate::cache::kv_cache::KvMemoryStats> {
        Ok(self.state()?.kv_cache.memory_stats())
    }

    /// `router.getUtilizationStats()`: per-expert `(expertIdx, count,
    /// percentage)`, or an empty vec for dense (non-MoE) models.
    pub fn get_expert_utilization(&self) -> Result<Vec<(usize, u64, f32)>> {
        Ok(self
            .state()?
            .router
            .as_ref()
            .map(|r| r.utilization().stats())
            .unwrap_or_default())
    }

    /// Deep-clone the current KV cache into a standalone snapshot, for
    /// callers that want to share a prefix at the pool level.
    pub fn snapshot_kv_cache(&self) -> Result<KvCacheSnapshot> {
        let state = self.state()?;
        Ok(clone_cache(&state.kv_cache, &state.config, &state.global_weights))
    }

    #[cfg(test)]
    pub fn new_for_test(config: crate::config::ModelConfig, layout: KvLayout, tokenizer: Tokenizer) -> Self {
        let kv_cache = KvCache::new(&config, layout);
        let pool = BufferPool::new(vec![1024, 4096, 16384, 65536, 262144]);
        let n_layers = config.n_layers;
        let state = PipelineState::new(
            config,
            (0..n_layers).map(|_| Default::default()).collect(),
            Default::default(),
            kv_cache,
            pool,
        );
        Self {
            state: Some(state),
            tokenizer: Some(tokenizer),
            kv_layout: layout,
        }
    }
}
