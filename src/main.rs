//! gpu-infer-pipeline: core inference pipeline for a client-side transformer
//! runtime — quantized weight streaming, tiered decode buffers, MoE routing
//! and prefix-KV reuse over a GPU compute abstraction.
//!
//! This binary is glue, not core: it wires configuration, the
//! process-wide device handle and a `MultiPipelinePool` around the library,
//! then either drives one `generate` call to completion or serves the SSE
//! HTTP harness.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use gpu_infer_pipeline::cache::kv_cache::KvLayout;
use gpu_infer_pipeline::config::{Cli, Config, GenerationOptions};
use gpu_infer_pipeline::error::{PipelineError, Result};
use gpu_infer_pipeline::gpu::device::{self, DeviceFeatures};
use gpu_infer_pipeline::pipeline::handle::Pipeline;
use gpu_infer_pipeline::pipeline::pool::MultiPipelinePool;
use gpu_infer_pipeline::server::api::{build_router, AppState};
use gpu_infer_pipeline::weights::loader::{load_weights, LoadProgress};
use gpu_infer_pipeline::weights::manifest::{Manifest, TokenizerDescriptor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "gpu_infer_pipeline=debug,tower_http=debug"
    } else {
        "gpu_infer_pipeline=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_target(true)
        .init();

    info!("gpu-infer-pipeline v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    device::init(DeviceFeatures::default())?;

    let manifest_path = cli.manifest.clone();
    let loader_config = config.clone();
    let pool = Arc::new(MultiPipelinePool::new(Arc::new(move |_model_id: &str| {
        let manifest_path = manifest_path.clone();
        let config = loader_config.clone();
        Box::pin(async move { load_pipeline(&manifest_path, &config).await })
    })));

    if cli.serve {
        let state = Arc::new(AppState {
            pool,
            start_time: Instant::now(),
        });
        let app = build_router(state);
        let listener = TcpListener::bind(&cli.listen).await?;
        info!(addr = %cli.listen, "Listening");
        axum::serve(listener, app).await?;
    } else {
        let options = GenerationOptions {
            max_tokens: cli.max_tokens,
            temperature: config.sampling.temperature,
            top_k: config.sampling.top_k,
            top_p: config.sampling.top_p,
            repetition_penalty: config.sampling.repetition_penalty,
            ..Default::default()
        };
        let chunks = pool.execute("cli", &cli.prompt, options, None).await?;
        print!("{}", chunks.join(""));
    }

    Ok(())
}

/// Loads a manifest and streams its shards from local disk, relative to the
/// manifest's directory — the CLI harness's transport, where the HTTP
/// harness would instead fetch shards over range requests.
async fn load_pipeline(manifest_path: &Path, config: &Config) -> Result<Pipeline> {
    let manifest_dir = manifest_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let manifest_json = std::fs::read_to_string(manifest_path)
        .map_err(|e| PipelineError::ManifestInvalid(e.to_string()))?;
    let manifest = Manifest::parse(&manifest_json)?;

    let bundled_tokenizer = match &manifest.tokenizer {
        TokenizerDescriptor::Bundled { file } | TokenizerDescriptor::Huggingface { file } => Some(
            std::fs::read_to_string(manifest_dir.join(file))
                .map_err(|e| PipelineError::TokenizerUnavailable(e.to_string()))?,
        ),
        _ => None,
    };

    let shard_dir = manifest_dir.clone();
    let shards = manifest.shards.clone();
    let load_shard = move |idx: usize| -> std::pin::Pin<Box<dyn std::future::Future<Output = std::result::Result<Vec<u8>, String>> + Send>> {
        let shard_dir = shard_dir.clone();
        let shards = shards.clone();
        Box::pin(async move {
            let shard = shards.get(idx).ok_or_else(|| "shard index out of range".to_string())?;
            tokio::fs::read(shard_dir.join(&shard.filename)).await.map_err(|e| e.to_string())
        })
    };

    let on_progress = |p: LoadProgress| {
        info!(phase = ?p.phase, completed = p.completed, total = p.total, "loading weights");
    };
    let weights = load_weights(&manifest, &load_shard, &on_progress, config.loader.shard_fetch_timeout()).await?;

    let kv_layout = match manifest.config.sliding_window {
        Some(window) => KvLayout::SlidingWindow { window },
        None => KvLayout::Contiguous,
    };

    let mut pipeline = Pipeline::initialize(kv_layout);
    let size_classes: Vec<u64> = config.buffers.size_classes.iter().map(|&s| s as u64).collect();
    pipeline.load_model(&manifest, weights, bundled_tokenizer.as_deref(), &size_classes, config.decode_ring)?;
    Ok(pipeline)
}
