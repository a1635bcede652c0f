//! Decode-ring-reuse and cancellation scenarios.

mod common;

use gpu_infer_pipeline::cache::kv_cache::{KvCache, KvLayout};
use gpu_infer_pipeline::config::{DecodeRingConfig, GenerationOptions, StopCheckMode};
use gpu_infer_pipeline::gpu::buffer_pool::BufferPool;
use gpu_infer_pipeline::gpu::decode_ring::{DecodeRing, RingConfig};
use gpu_infer_pipeline::pipeline::generator::{Generator, GeneratorState, StepResult};
use gpu_infer_pipeline::pipeline::state::PipelineState;
use gpu_infer_pipeline::tokenizer::Tokenizer;
use gpu_infer_pipeline::weights::manifest::{EosTokenId, Manifest};

/// With `ringTokens = ringStop = ringStaging = 2`, driving 10 decode steps
/// through the ring only ever touches 2 distinct token buffers — the ring
/// round-robins rather than allocating a fresh buffer per step.
#[test]
fn decode_ring_reuses_exactly_two_buffers_across_ten_steps() {
    let mut pool = BufferPool::new(vec![64, 256, 1024]);
    let mut ring = DecodeRing::new();
    let config = RingConfig {
        ring_tokens: 2,
        ring_stop: 2,
        ring_staging: 2,
        tokens_per_interval: 16,
        stop_check_mode: StopCheckMode::Batch,
    };
    ring.ensure(&mut pool, config, 1 << 20).unwrap();

    let mut seen_ids = std::collections::HashSet::new();
    for _ in 0..10 {
        let slot = ring.acquire();
        seen_ids.insert(slot.tokens.id);
        ring.advance();
    }

    assert_eq!(seen_ids.len(), 2);
    assert_eq!(pool.stats().active_buffers, 4); // 2 tokens + 2 staging_tokens, batch mode has no stop rings
}

#[tokio::test]
async fn cancelling_after_five_tokens_stops_within_one_more_step() {
    let spec = common::ManifestSpec::default();
    let manifest = Manifest::parse(&common::manifest_json(&spec)).unwrap();
    let model_config = manifest.config.resolve().unwrap();

    let kv_cache = KvCache::new(&model_config, KvLayout::Contiguous);
    let pool = BufferPool::new(vec![4096, 65536, 1024 * 1024]);
    let mut state = PipelineState::with_decode_ring_config(
        model_config,
        Vec::new(),
        Default::default(),
        kv_cache,
        pool,
        DecodeRingConfig::default(),
    );

    let tokenizer_json = common::bundled_tokenizer_json(spec.vocab_size);
    let tokenizer = Tokenizer::initialize(&manifest, Some(&tokenizer_json)).unwrap();

    let options = GenerationOptions {
        max_tokens: 1000,
        temperature: 0.0,
        ..Default::default()
    };
    let mut generator = Generator::new(&mut state, &tokenizer, "tok0", options).unwrap();

    let mut tokens_seen = 0;
    loop {
        match generator.step() {
            StepResult::Token(chunk) => {
                if !chunk.is_empty() {
                    tokens_seen += 1;
                }
                if tokens_seen >= 5 {
                    generator.cancel();
                }
            }
            StepResult::Done => break,
            StepResult::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(generator.phase(), GeneratorState::Cancelled);
    assert!(generator.emitted_tokens().len() <= 6);
}

/// A token matching the manifest/tokenizer-resolved EOS set stops
/// generation on its own, well short of `max_tokens`.
#[tokio::test]
async fn sampling_eos_stops_generation_before_max_tokens() {
    let spec = common::ManifestSpec::default();
    let manifest = Manifest::parse(&common::manifest_json(&spec)).unwrap();
    let model_config = manifest.config.resolve().unwrap();

    let kv_cache = KvCache::new(&model_config, KvLayout::Contiguous);
    let pool = BufferPool::new(vec![4096, 65536, 1024 * 1024]);
    let mut state = PipelineState::with_decode_ring_config(
        model_config,
        Vec::new(),
        Default::default(),
        kv_cache,
        pool,
        DecodeRingConfig::default(),
    );
    state.eos_token_id = Some(EosTokenId::Single(0));

    // No tokenizer-level "eos" declared: termination here comes solely from
    // the manifest-resolved id threaded onto `PipelineState`.
    let tokenizer_json = common::bundled_tokenizer_json(spec.vocab_size);
    let tokenizer = Tokenizer::initialize(&manifest, Some(&tokenizer_json)).unwrap();

    let options = GenerationOptions {
        max_tokens: 1000,
        temperature: 0.0,
        ..Default::default()
    };
    let mut generator = Generator::new(&mut state, &tokenizer, "tok0", options).unwrap();
    generator.run_to_completion().unwrap();

    assert_eq!(generator.phase(), GeneratorState::Stopped);
    assert_eq!(generator.emitted_tokens(), &[0]);
}
