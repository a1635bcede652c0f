//! With a sliding window of 128, a 200-token prompt followed by 50 decode
//! steps keeps allocated KV memory bounded by the window rather than by the
//! full sequence length.

mod common;

use gpu_infer_pipeline::config::GenerationOptions;

#[tokio::test]
async fn sliding_window_bounds_allocated_kv_memory() {
    let spec = common::ManifestSpec {
        max_seq_len: 512,
        sliding_window: Some(128),
        ..Default::default()
    };
    let mut pipeline = common::build_pipeline(&spec).await;

    let prompt: String = (0..200).map(|i| format!("tok{} ", i % spec.vocab_size)).collect();
    let options = GenerationOptions {
        max_tokens: 50,
        temperature: 0.0,
        ..Default::default()
    };
    pipeline.generate(prompt.trim(), options).unwrap();

    let stats = pipeline.get_kv_cache_stats().unwrap();
    assert_eq!(stats.seq_len, 250);

    let row_elems = spec.n_kv_heads * (spec.hidden_size / spec.n_heads);
    let expected_allocated_bytes =
        (2 * 128 * row_elems * spec.n_layers * std::mem::size_of::<f32>()) as u64;
    assert_eq!(stats.allocated_bytes, expected_allocated_bytes);
}
