//! Shared scaffolding for the integration tests: builds a fully-loaded
//! `Pipeline` through the real manifest/loader public API, with empty
//! (zero-byte) shards, since the placeholder attention/MLP math never
//! reads weight contents.

use std::pin::Pin;

use gpu_infer_pipeline::cache::kv_cache::KvLayout;
use gpu_infer_pipeline::config::DecodeRingConfig;
use gpu_infer_pipeline::pipeline::handle::Pipeline;
use gpu_infer_pipeline::weights::loader::load_weights;
use gpu_infer_pipeline::weights::manifest::Manifest;

pub struct ManifestSpec {
    pub n_layers: usize,
    pub hidden_size: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub sliding_window: Option<usize>,
    pub moe: Option<(usize, usize)>,
}

impl Default for ManifestSpec {
    fn default() -> Self {
        Self {
            n_layers: 2,
            hidden_size: 32,
            n_heads: 4,
            n_kv_heads: 2,
            intermediate_size: 64,
            vocab_size: 32,
            max_seq_len: 256,
            sliding_window: None,
            moe: None,
        }
    }
}

pub fn manifest_json(spec: &ManifestSpec) -> String {
    let sliding_window = spec
        .sliding_window
        .map(|w| format!(r#""sliding_window": {w},"#))
        .unwrap_or_default();
    let moe = spec
        .moe
        .map(|(n_experts, top_k)| format!(r#""num_experts": {n_experts}, "num_experts_per_tok": {top_k},"#))
        .unwrap_or_default();

    format!(
        r#"{{
            "architecture": "llama",
            "config": {{
                "vocab_size": {vocab_size},
                "hidden_size": {hidden_size},
                "num_hidden_layers": {n_layers},
                "num_attention_heads": {n_heads},
                "num_key_value_heads": {n_kv_heads},
                "intermediate_size": {intermediate_size},
                "max_position_embeddings": {max_seq_len},
                "rope_theta": 10000.0,
                {sliding_window}
                {moe}
                "tie_word_embeddings": false
            }},
            "tokenizer": {{"type": "bundled", "file": "tokenizer.json"}},
            "shards": [{{"filename": "shard0.bin", "size": 0, "weights": []}}]
        }}"#,
        vocab_size = spec.vocab_size,
        hidden_size = spec.hidden_size,
        n_layers = spec.n_layers,
        n_heads = spec.n_heads,
        n_kv_heads = spec.n_kv_heads,
        intermediate_size = spec.intermediate_size,
        max_seq_len = spec.max_seq_len,
    )
}

/// `eos` is pinned one past the last real vocab id, outside the range the
/// placeholder zero-logit decode step ever samples, so callers exercising
/// generic decode/cancellation behavior don't trip EOS termination
/// incidentally. Tests that want to exercise EOS termination build their
/// own tokenizer JSON with a reachable id instead.
pub fn bundled_tokenizer_json(vocab_size: usize) -> String {
    let vocab: Vec<String> = (0..vocab_size).map(|i| format!(r#""tok{i}": {i}"#)).collect();
    format!(
        r#"{{"vocab": {{{}}}, "special_tokens": {{"eos": {vocab_size}}}}}"#,
        vocab.join(", ")
    )
}

pub async fn build_pipeline(spec: &ManifestSpec) -> Pipeline {
    let manifest = Manifest::parse(&manifest_json(spec)).expect("manifest parses");
    let tokenizer_json = bundled_tokenizer_json(spec.vocab_size);

    let load_shard = |_idx: usize| -> Pin<Box<dyn std::future::Future<Output = Result<Vec<u8>, String>> + Send>> {
        Box::pin(async { Ok(Vec::new()) })
    };
    let on_progress = |_p| {};
    let weights = load_weights(&manifest, &load_shard, &on_progress, std::time::Duration::from_secs(5))
        .await
        .expect("weights load");

    let kv_layout = match spec.sliding_window {
        Some(window) => KvLayout::SlidingWindow { window },
        None => KvLayout::Contiguous,
    };

    let mut pipeline = Pipeline::initialize(kv_layout);
    pipeline
        .load_model(
            &manifest,
            weights,
            Some(&tokenizer_json),
            &[4 * 1024, 64 * 1024, 1024 * 1024],
            DecodeRingConfig::default(),
        )
        .expect("load_model succeeds");
    pipeline
}
