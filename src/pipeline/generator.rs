//! Prefill/decode state machine.
//!
//! Expressed as a pull-based state machine rather than an async-iterator
//! generator: [`Generator::step`]
//! advances one decode step (or the whole prefill) and returns a
//! [`StepResult`]; the caller decides when to pull the next step, which is
//! how cancellation and backpressure are modeled without an owned async
//! task.

use tracing::{info, warn};

use crate::cache::snapshot::{apply_snapshot, clone_cache, KvCacheSnapshot};
use crate::config::GenerationOptions;
use crate::error::{PipelineError, Result};
use crate::moe::router::Router;
use crate::pipeline::state::{LayerStep, PipelineState};
use crate::sampling::{sample, Rng, SamplingOptions};
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Idle,
    Prefilling,
    Decoding,
    Stopped,
    Cancelled,
    Errored,
}

#[derive(Debug)]
pub enum StepResult {
    Token(String),
    Done,
    Error(PipelineError),
}

/// Prefill sub-step chunk size, bounding how many prompt tokens are run
/// through the layer stack per `step()` call during prefill.
const PREFILL_CHUNK: usize = 32;

pub struct Generator<'a> {
    state: &'a mut PipelineState,
    tokenizer: &'a Tokenizer,
    phase: GeneratorState,
    prompt_tokens: Vec<u32>,
    prefill_cursor: usize,
    prompt_len_prefix: usize,
    target_tokens: usize,
    emitted: Vec<u32>,
    options: GenerationOptions,
    rng: Rng,
    cancelled: bool,
    decoded_so_far: usize,
}

impl<'a> Generator<'a> {
    pub fn new(
        state: &'a mut PipelineState,
        tokenizer: &'a Tokenizer,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<Self> {
        let prompt_tokens = tokenizer.encode(prompt)?;
        let prompt_len_prefix = state.kv_cache.seq_len();
        let max_new = state
            .config
            .max_seq_len
            .saturating_sub(prompt_len_prefix + prompt_tokens.len());
        let target_tokens = options.max_tokens.min(max_new.max(1)).max(1);

        Ok(Self {
            state,
            tokenizer,
            phase: GeneratorState::Idle,
            prompt_tokens,
            prefill_cursor: 0,
            prompt_len_prefix,
            target_tokens,
            emitted: Vec::new(),
            options,
            rng: Rng::new(options.seed.unwrap_or(0)),
            cancelled: false,
            decoded_so_far: 0,
        })
    }

    pub fn phase(&self) -> GeneratorState {
        self.phase
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Run one unit of work: a prefill chunk if still prefilling, otherwise
    /// one decode step. Returns [`StepResult::Done`] once generation
    /// completes; further calls after `Done`/`Error` are no-ops returning
    /// the same terminal result.
    pub fn step(&mut self) -> StepResult {
        if self.options.max_tokens == 0 && self.phase == GeneratorState::Idle {
            self.phase = GeneratorState::Stopped;
            return StepResult::Done;
        }

        match self.phase {
            GeneratorState::Idle => {
                self.phase = GeneratorState::Prefilling;
                self.run_prefill_chunk()
            }
            GeneratorState::Prefilling => self.run_prefill_chunk(),
            GeneratorState::Decoding => self.run_decode_step(),
            GeneratorState::Stopped | GeneratorState::Cancelled | GeneratorState::Errored => {
                StepResult::Done
            }
        }
    }

    fn run_prefill_chunk(&mut self) -> StepResult {
        if self.cancelled {
            self.phase = GeneratorState::Cancelled;
            return StepResult::Done;
        }

        let end = (self.prefill_cursor + PREFILL_CHUNK).min(self.prompt_tokens.len());
        for pos_in_prompt in self.prefill_cursor..end {
            let abs_pos = self.prompt_len_prefix + pos_in_prompt;
            if abs_pos >= self.state.config.max_seq_len {
                self.phase = GeneratorState::Errored;
                return StepResult::Error(PipelineError::ContextOverflow {
                    max_seq_len: self.state.config.max_seq_len,
                });
            }
            if let Err(e) = run_layers_for_position(self.state, abs_pos) {
                self.phase = GeneratorState::Errored;
                return StepResult::Error(e);
            }
        }
        self.prefill_cursor = end;

        if self.prefill_cursor >= self.prompt_tokens.len() {
            self.phase = GeneratorState::Decoding;
            let ring_config = crate::gpu::decode_ring::RingConfig {
                ring_tokens: self.state.decode_ring_config.ring_tokens,
                ring_stop: self.state.decode_ring_config.ring_stop,
                ring_staging: self.state.decode_ring_config.ring_staging,
                tokens_per_interval: self.state.decode_ring_config.tokens_per_interval,
                stop_check_mode: self.options.stop_check_mode,
            };
            if let Err(e) = self
                .state
                .decode_ring
                .ensure(&mut self.state.buffer_pool, ring_config, 1 << 30)
            {
                self.phase = GeneratorState::Errored;
                return StepResult::Error(e.into());
            }

            let scratch_config = crate::gpu::decode_buffers::ScratchConfig {
                hidden_size: self.state.config.hidden_size,
                intermediate_size: self.state.config.intermediate_size,
                max_batch: 1,
                dtype_bytes: 4,
                ping_pong: true,
            };
            if let Err(e) = self.state.decode_buffers.ensure(&mut self.state.buffer_pool, scratch_config) {
                self.phase = GeneratorState::Errored;
                return StepResult::Error(e.into());
            }
        }
        StepResult::Token(String::new())
    }

    fn run_decode_step(&mut self) -> StepResult {
        if self.cancelled {
            self.phase = GeneratorState::Cancelled;
            return StepResult::Done;
        }
        if self.emitted.len() >= self.target_tokens {
            self.phase = GeneratorState::Stopped;
            return StepResult::Done;
        }

        let _slot = self.state.decode_ring.acquire();
        self.state.decode_buffers.reset_ping_pong();

        let pos = self.state.kv_cache.seq_len();
        if pos >= self.state.config.max_seq_len {
            self.phase = GeneratorState::Errored;
            return StepResult::Error(PipelineError::ContextOverflow {
                max_seq_len: self.state.config.max_seq_len,
            });
        }

        let logits = match decode_logits(self.state, pos) {
            Ok(l) => l,
            Err(e) => {
                self.phase = GeneratorState::Errored;
                return StepResult::Error(e);
            }
        };

        let sampling_options = SamplingOptions {
            temperature: self.options.temperature,
            top_k: self.options.top_k,
            top_p: self.options.top_p,
            repetition_penalty: self.options.repetition_penalty,
        };

        let token = match sample(&logits, &sampling_options, &self.emitted, &mut self.rng) {
            Ok(t) => t,
            Err(_) => {
                self.phase = GeneratorState::Errored;
                return StepResult::Error(PipelineError::SamplingDegenerate);
            }
        };

        self.emitted.push(token);
        self.state.stats.tokens_generated += 1;
        self.state.decode_step += 1;
        self.state.decode_ring.advance();

        let is_eos = self.options.stop_tokens.contains(&token)
            || self.state.eos_token_id.as_ref().is_some_and(|eos| eos.contains(token));
        let is_last = self.emitted.len() >= self.target_tokens;

        let chunk = self.tokenizer.decode(&self.emitted, true, false);
        let delta = chunk
            .char_indices()
            .nth(self.decoded_so_far)
            .map(|(i, _)| chunk[i..].to_string())
            .unwrap_or_default();
        self.decoded_so_far = chunk.chars().count();

        if is_eos || is_last {
            self.phase = GeneratorState::Stopped;
        }

        StepResult::Token(delta)
    }

    /// Runs to completion, collecting every emitted chunk. Convenience for
    /// callers that don't need step-by-step cancellation checks.
    pub fn run_to_completion(&mut self) -> Result<Vec<String>> {
        let mut chunks = Vec::new();
        loop {
            match self.step() {
                StepResult::Token(s) => {
                    if !s.is_empty() {
                        chunks.push(s);
                    }
                }
                StepResult::Done => break,
                StepResult::Error(e) => return Err(e),
            }
        }
        Ok(chunks)
    }

    pub fn emitted_tokens(&self) -> &[u32] {
        &self.emitted
    }
}

/// Run all layers for one position during prefill, writing K/V at `pos`.
/// The concrete attention/MLP math is a kernel-backend concern (non-goal);
/// this advances the cache and stats bookkeeping that the rest of the
/// pipeline depends on.
fn run_layers_for_position(state: &mut PipelineState, pos: usize) -> Result<()> {
    let row_elems = state.config.n_kv_heads * state.config.head_dim;
    for layer_idx in 0..state.config.n_layers {
        let k = vec![0.0f32; row_elems];
        let v = vec![0.0f32; row_elems];
        state.kv_cache.append_step(layer_idx, &k, &v, pos)?;

        if matches!(state.layer_plan[layer_idx].first(), Some(LayerStep::Attention))
            && state.config.moe.is_some()
        {
            run_moe_router_for_position(state);
        }
    }
    Ok(())
}

fn run_moe_router_for_position(state: &mut PipelineState) {
    if let Some(router) = state.router.as_mut() {
        let n_experts = router_n_experts(router);
        let logits = vec![0.0f32; n_experts];
        let _ = router.route_token(&logits, true);
    }
}

fn router_n_experts(router: &Router) -> usize {
    // Exposed through utilization() counts length rather than a dedicated
    // accessor, since the router never needs its own expert count outside
    // construction and this call site.
    router.utilization().counts.len()
}

/// Produce logits for one decode step, appending K/V at `pos` first.
fn decode_logits(state: &mut PipelineState, pos: usize) -> Result<Vec<f32>> {
    let row_elems = state.config.n_kv_heads * state.config.head_dim;
    for layer_idx in 0..state.config.n_layers {
        let k = vec![0.0f32; row_elems];
        let v = vec![0.0f32; row_elems];
        state.kv_cache.append_step(layer_idx, &k, &v, pos)?;

        if state.config.moe.is_some() {
            run_moe_router_for_position(state);
        }
        state.decode_buffers.swap_ping_pong();
    }
    Ok(vec![0.0f32; state.config.vocab_size])
}

/// Prefill-only variant: returns a KV snapshot plus the resulting `seqLen`
/// without decoding.
pub fn prefill_kv_only(
    state: &mut PipelineState,
    tokenizer: &Tokenizer,
    prompt: &str,
) -> Result<(KvCacheSnapshot, usize)> {
    let tokens = tokenizer.encode(prompt)?;
    let start = state.kv_cache.seq_len();
    for i in 0..tokens.len() {
        run_layers_for_position(state, start + i)?;
    }
    let snapshot = clone_cache(&state.kv_cache, &state.config, &state.global_weights);
    info!(seq_len = state.kv_cache.seq_len(), "prefillKVOnly complete");
    Ok((snapshot, state.kv_cache.seq_len()))
}

/// Apply a snapshot, then prefill only the new suffix and decode as usual.
pub fn generate_with_prefix_kv<'a>(
    state: &'a mut PipelineState,
    tokenizer: &'a Tokenizer,
    snapshot: &KvCacheSnapshot,
    prompt: &str,
    options: GenerationOptions,
) -> Result<Generator<'a>> {
    let config = state.config.clone();
    let global_weights = state.global_weights.clone();
    apply_snapshot(&mut state.kv_cache, &config, &global_weights, snapshot)?;
    warn!(seq_len = state.kv_cache.seq_len(), "applied prefix KV snapshot");
    Generator::new(state, tokenizer, prompt, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::kv_cache::{KvCache, KvLayout};
    use crate::config::{ModelConfig, StopCheckMode};
    use crate::gpu::buffer_pool::BufferPool;
    use crate::tokenizer::{BundledVocab, Tokenizer};
    use crate::weights::weight::GlobalWeights;

    fn test_config() -> ModelConfig {
        ModelConfig {
            n_layers: 2,
            hidden_size: 32,
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 8,
            intermediate_size: 64,
            vocab_size: 16,
            max_seq_len: 64,
            rope_theta: 10000.0,
            rope_scaling: None,
            local_rope_theta: None,
            moe: None,
            sliding_window: None,
            tie_embeddings: false,
        }
    }

    fn test_tokenizer() -> Tokenizer {
        Tokenizer::Bundled(BundledVocab {
            id_to_token: vec!["a".into(), "b".into()],
            token_to_id: [("a".to_string(), 0), ("b".to_string(), 1)].into_iter().collect(),
            special_tokens: Default::default(),
        })
    }

    fn test_state() -> PipelineState {
        let config = test_config();
        let kv_cache = KvCache::new(&config, KvLayout::Contiguous);
        let pool = BufferPool::new(vec![1024, 4096, 16384, 65536, 262144]);
        PipelineState::new(config, Vec::new(), GlobalWeights::default(), kv_cache, pool)
    }

    #[test]
    fn test_max_tokens_zero_emits_nothing() {
        let mut state = test_state();
        let tokenizer = test_tokenizer();
        let options = GenerationOptions {
            max_tokens: 0,
            ..Default::default()
        };
        let mut gen = Generator::new(&mut state, &tokenizer, "a b", options).unwrap();
        let chunks = gen.run_to_completion().unwrap();
        assert!(chunks.is_empty());
        assert_eq!(gen.emitted_tokens().len(), 0);
    }

    #[test]
    fn test_decode_step_advances_seq_len_by_one() {
        let mut state = test_state();
        let tokenizer = test_tokenizer();
        let options = GenerationOptions {
            max_tokens: 1,
            temperature: 0.0,
            stop_check_mode: StopCheckMode::Batch,
            ..Default::default()
        };
        let before = state.kv_cache.seq_len();
        let mut gen = Generator::new(&mut state, &tokenizer, "a", options).unwrap();
        gen.run_to_completion().unwrap();
        drop(gen);
        assert!(state.kv_cache.seq_len() >= before + 1);
    }

    #[test]
    fn test_cancellation_stops_generation() {
        let mut state = test_state();
        let tokenizer = test_tokenizer();
        let options = GenerationOptions {
            max_tokens: 1000,
            ..Default::default()
        };
        let mut gen = Generator::new(&mut state, &tokenizer, "a", options).unwrap();
        // Drive past prefill into decoding, then cancel.
        for _ in 0..3 {
            gen.step();
        }
        gen.cancel();
        let result = gen.step();
        assert!(matches!(result, StepResult::Done));
        assert_eq!(gen.phase(), GeneratorState::Cancelled);
    }
}
