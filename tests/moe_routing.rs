//! With `E=8, k=2`, after decoding 1,000 tokens the per-expert utilization
//! counts sum to `1000 * k` and each percentage lies in `[0, 100]`.

mod common;

use gpu_infer_pipeline::config::GenerationOptions;

#[tokio::test]
async fn moe_utilization_sums_to_tokens_times_top_k() {
    let spec = common::ManifestSpec {
        n_layers: 1,
        moe: Some((8, 2)),
        max_seq_len: 2048,
        ..Default::default()
    };
    let mut pipeline = common::build_pipeline(&spec).await;

    let options = GenerationOptions {
        max_tokens: 1000,
        temperature: 1.0,
        ..Default::default()
    };
    // Empty prompt: every routed token comes from the 1,000 decode steps,
    // none from prefill (n_layers=1, so each decode step routes once).
    pipeline.generate("", options).unwrap();

    let utilization = pipeline.get_expert_utilization().unwrap();
    assert_eq!(utilization.len(), 8);

    let total_count: u64 = utilization.iter().map(|&(_, count, _)| count).sum();
    assert_eq!(total_count, 1000 * 2);

    for &(_, _, percentage) in &utilization {
        assert!((0.0..=100.0).contains(&percentage));
    }
}
