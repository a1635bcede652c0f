//! Streaming weight loader.
//!
//! A cooperative, phase-reporting load over a manifest's shard list: shards
//! are fetched through a host-supplied callback so the loader stays agnostic
//! to the actual transport (local file, HTTP range request, OPFS).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tracing::{debug, info};

use crate::weights::manifest::{Manifest, ManifestError, ShardDescriptor};
use crate::weights::weight::{GlobalWeights, LayerWeights, WeightDType, WeightHandle};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("shard fetch failed for {0}: {1}")]
    ShardFetchFailed(String, String),

    #[error("shard fetch timed out after {0:?}")]
    ShardTimeout(std::time::Duration),
}

/// Progress phases reported during a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Shards,
    Layers,
    Finalize,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadProgress {
    pub phase: LoadPhase,
    pub completed: usize,
    pub total: usize,
}

pub type ProgressCallback<'a> = dyn Fn(LoadProgress) + Send + Sync + 'a;

/// Host-supplied shard fetcher: given a shard index, returns its raw bytes.
pub type ShardLoader<'a> =
    dyn Fn(usize) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>> + Send + Sync + 'a;

pub struct LoadedWeights {
    pub layers: Vec<LayerWeights>,
    pub global: GlobalWeights,
}

/// Streams shards through `load_shard`, slicing out each declared weight by
/// its manifest offset/length, and assembles per-layer and global weight
/// maps. Reports progress via `on_progress`. Each shard fetch is bounded by
/// `shard_timeout`; a fetch that doesn't resolve in time raises
/// `ShardTimeout` and leaves the pipeline unloaded rather than partially
/// initialized.
pub async fn load_weights(
    manifest: &Manifest,
    load_shard: &ShardLoader<'_>,
    on_progress: &ProgressCallback<'_>,
    shard_timeout: std::time::Duration,
) -> Result<LoadedWeights, LoaderError> {
    let n_layers = manifest.config.num_hidden_layers;
    let mut layers: Vec<LayerWeights> = (0..n_layers).map(|_| LayerWeights::default()).collect();
    let mut global = GlobalWeights::default();

    let total_shards = manifest.shards.len();
    for (idx, shard) in manifest.shards.iter().enumerate() {
        on_progress(LoadProgress {
            phase: LoadPhase::Shards,
            completed: idx,
            total: total_shards,
        });

        let bytes = tokio::time::timeout(shard_timeout, load_shard(idx))
            .await
            .map_err(|_| LoaderError::ShardTimeout(shard_timeout))?
            .map_err(|e| LoaderError::ShardFetchFailed(shard.filename.clone(), e))?;

        place_shard_weights(shard, &bytes, &mut layers, &mut global)?;

        debug!(shard = %shard.filename, bytes = bytes.len(), "Shard loaded");
    }
    on_progress(LoadProgress {
        phase: LoadPhase::Shards,
        completed: total_shards,
        total: total_shards,
    });

    on_progress(LoadProgress {
        phase: LoadPhase::Layers,
        completed: 0,
        total: n_layers,
    });
    for (i, layer) in layers.iter_mut().enumerate() {
        layer.fuse_qkv();
        on_progress(LoadProgress {
            phase: LoadPhase::Layers,
            completed: i + 1,
            total: n_layers,
        });
    }

    on_progress(LoadProgress {
        phase: LoadPhase::Finalize,
        completed: 0,
        total: 1,
    });
    if manifest.config.tie_word_embeddings.unwrap_or(false) {
        global.tie_embeddings();
    }
    on_progress(LoadProgress {
        phase: LoadPhase::Finalize,
        completed: 1,
        total: 1,
    });

    info!(n_layers, "Weight load complete");
    Ok(LoadedWeights { layers, global })
}

fn place_shard_weights(
    shard: &ShardDescriptor,
    bytes: &[u8],
    layers: &mut [LayerWeights],
    global: &mut GlobalWeights,
) -> Result<(), LoaderError> {
    for w in &shard.weights {
        let start = w.offset as usize;
        let end = start + w.length as usize;
        if end > bytes.len() {
            return Err(LoaderError::ShardFetchFailed(
                shard.filename.clone(),
                format!("weight {} range {}..{} exceeds shard size {}", w.name, start, end, bytes.len()),
            ));
        }

        let handle = WeightHandle {
            name: w.name.clone(),
            dtype: WeightDType::from_manifest_str(&w.dtype),
            shape: w.shape.clone(),
            data: bytes[start..end].to_vec().into(),
        };

        if let Some((layer_idx, local_name)) = parse_layer_name(&w.name) {
            if let Some(layer) = layers.get_mut(layer_idx) {
                layer.insert(WeightHandle {
                    name: local_name.to_string(),
                    ..handle
                });
            }
        } else {
            match w.name.as_str() {
                "embed" | "embed_tokens" | "tok_embeddings" => global.embed = Some(handle),
                "lm_head" | "output" => global.lm_head = Some(handle),
                "final_norm" | "norm" => global.final_norm = Some(handle),
                _ => {}
            }
        }
    }
    Ok(())
}

/// Parses names of the form `layer.<idx>.<rest>`, the convention this
/// spec's manifest uses for per-layer weights.
fn parse_layer_name(name: &str) -> Option<(usize, &str)> {
    let rest = name.strip_prefix("layer.")?;
    let (idx_str, local) = rest.split_once('.')?;
    let idx = idx_str.parse::<usize>().ok()?;
    Some((idx, local))
}

/// Bypass the loader entirely with already-resolved weights.
pub fn from_preloaded(layers: Vec<LayerWeights>, global: GlobalWeights) -> LoadedWeights {
    LoadedWeights { layers, global }
}

#[allow(dead_code)]
fn _assert_progress_map_is_sendable(_: HashMap<String, WeightHandle>) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with_weight() -> Manifest {
        let json = r#"{
            "architecture": "llama",
            "config": {
                "vocab_size": 32,
                "hidden_size": 8,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "num_key_value_heads": 2,
                "intermediate_size": 16,
                "max_position_embeddings": 64,
                "rope_theta": 10000.0
            },
            "tokenizer": {"type": "bundled", "file": "tokenizer.json"},
            "shards": [{
                "filename": "shard0.bin",
                "size": 8,
                "weights": [{"name": "layer.0.q_proj", "dtype": "f16", "shape": [2, 4], "offset": 0, "length": 8}]
            }]
        }"#;
        Manifest::parse(json).unwrap()
    }

    #[tokio::test]
    async fn test_load_weights_places_layer_tensor() {
        let manifest = manifest_with_weight();
        let load_shard = |_idx: usize| -> Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>> {
            Box::pin(async { Ok(vec![0u8; 8]) })
        };
        let progress_calls = std::sync::Mutex::new(Vec::new());
        let on_progress = |p: LoadProgress| progress_calls.lock().unwrap().push(p.phase);

        let loaded = load_weights(&manifest, &load_shard, &on_progress, std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(loaded.layers.len(), 1);
        assert!(loaded.layers[0].get("q_proj").is_some());

        let phases = progress_calls.into_inner().unwrap();
        assert!(phases.contains(&LoadPhase::Shards));
        assert!(phases.contains(&LoadPhase::Layers));
        assert!(phases.contains(&LoadPhase::Finalize));
    }

    #[tokio::test]
    async fn test_shard_fetch_failure_propagates() {
        let manifest = manifest_with_weight();
        let load_shard = |_idx: usize| -> Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>> {
            Box::pin(async { Err("network error".to_string()) })
        };
        let on_progress = |_: LoadProgress| {};

        let result = load_weights(&manifest, &load_shard, &on_progress, std::time::Duration::from_secs(5)).await;
        assert!(matches!(result, Err(LoaderError::ShardFetchFailed(_, _))));
    }

    #[tokio::test]
    async fn test_shard_fetch_exceeding_timeout_raises_shard_timeout() {
        let manifest = manifest_with_weight();
        let load_shard = |_idx: usize| -> Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(vec![0u8; 8])
            })
        };
        let on_progress = |_: LoadProgress| {};

        let result = load_weights(&manifest, &load_shard, &on_progress, std::time::Duration::from_millis(5)).await;
        assert!(matches!(result, Err(LoaderError::ShardTimeout(_))));
    }
}
