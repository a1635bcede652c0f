//! Immutable KV cache snapshots.
//!
//! A snapshot is a value: a configuration fingerprint plus per-layer K/V
//! bytes and `seqLen`. It can be cloned out of one cache and applied into
//! another, as long as the fingerprints match.

use serde::{Deserialize, Serialize};

use crate::cache::kv_cache::{KvCache, KvCacheError, KvLayout};
use crate::config::ModelConfig;
use crate::weights::weight::{GlobalWeights, WeightDType};

/// A geometry-plus-dtype fingerprint cheap enough to compare before
/// attempting to apply a snapshot across pipelines. Both must match: a
/// snapshot captured under one compute dtype isn't guaranteed to decode
/// sensibly under another, even with identical layer shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryFingerprint {
    pub n_layers: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub max_seq_len: usize,
    pub quant_dtype: Option<WeightDType>,
}

impl GeometryFingerprint {
    pub fn of(config: &ModelConfig, global_weights: &GlobalWeights) -> Self {
        Self {
            n_layers: config.n_layers,
            n_kv_heads: config.n_kv_heads,
            head_dim: config.head_dim,
            max_seq_len: config.max_seq_len,
            quant_dtype: global_weights.embed.as_ref().map(|w| w.dtype),
        }
    }
}

/// Immutable capture of a KV cache's contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheSnapshot {
    fingerprint: GeometryFingerprint,
    layout: SnapshotLayout,
    seq_len: usize,
    /// Per-layer, flattened (k, v) row buffers for positions `[0, seqLen)`.
    layers: Vec<(Vec<f32>, Vec<f32>)>,
}

/// Serializable mirror of [`KvLayout`] (the live type holds no `Serialize`
/// bound so it can stay free of derive requirements elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotLayout {
    Contiguous,
    Paged { page_tokens: usize },
    SlidingWindow { window: usize },
}

impl From<KvLayout> for SnapshotLayout {
    fn from(layout: KvLayout) -> Self {
        match layout {
            KvLayout::Contiguous => SnapshotLayout::Contiguous,
            KvLayout::Paged { page_tokens } => SnapshotLayout::Paged { page_tokens },
            KvLayout::SlidingWindow { window } => SnapshotLayout::SlidingWindow { window },
        }
    }
}

impl KvCacheSnapshot {
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn fingerprint(&self) -> GeometryFingerprint {
        self.fingerprint
    }
}

/// Produce a deep snapshot of `cache`'s current contents.
pub fn clone_cache(cache: &KvCache, config: &ModelConfig, global_weights: &GlobalWeights) -> KvCacheSnapshot {
    let seq_len = cache.seq_len();
    let layers = (0..config.n_layers)
        .map(|layer_idx| {
            cache
                .read_range(layer_idx, 0, seq_len)
                .expect("layer index within range")
        })
        .collect();

    KvCacheSnapshot {
        fingerprint: GeometryFingerprint::of(config, global_weights),
        layout: cache.layout().into(),
        seq_len,
        layers,
    }
}

/// Replace `cache`'s contents with `snapshot`'s, rejecting a snapshot whose
/// geometry or quantization dtype doesn't match the destination cache.
pub fn apply_snapshot(
    cache: &mut KvCache,
    config: &ModelConfig,
    global_weights: &GlobalWeights,
    snapshot: &KvCacheSnapshot,
) -> Result<(), KvCacheError> {
    let expected = GeometryFingerprint::of(config, global_weights);
    if snapshot.fingerprint != expected {
        return Err(KvCacheError::GeometryMismatch(format!(
            "expected {:?}, snapshot has {:?}",
            expected, snapshot.fingerprint
        )));
    }

    cache.clear();
    for (layer_idx, (k, v)) in snapshot.layers.iter().enumerate() {
        let row_elems = config.n_kv_heads * config.head_dim;
        for (pos, (k_row, v_row)) in k.chunks(row_elems).zip(v.chunks(row_elems)).enumerate() {
            cache.append_step(layer_idx, k_row, v_row, pos)?;
        }
    }

    debug_assert_eq!(cache.seq_len(), snapshot.seq_len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_config() -> ModelConfig {
        ModelConfig {
            n_layers: 2,
            hidden_size: 64,
            n_heads: 4,
            n_kv_heads: 2,
            head_dim: 8,
            intermediate_size: 128,
            vocab_size: 32,
            max_seq_len: 16,
            rope_theta: 10000.0,
            rope_scaling: None,
            local_rope_theta: None,
            moe: None,
            sliding_window: None,
            tie_embeddings: false,
        }
    }

    #[test]
    fn test_clone_then_apply_is_noop() {
        let cfg = model_config();
        let globals = GlobalWeights::default();
        let row_elems = cfg.n_kv_heads * cfg.head_dim;
        let mut cache = KvCache::new(&cfg, KvLayout::Contiguous);
        cache
            .append_step(0, &vec![1.0; row_elems], &vec![2.0; row_elems], 0)
            .unwrap();
        cache
            .append_step(1, &vec![3.0; row_elems], &vec![4.0; row_elems], 0)
            .unwrap();

        let snapshot = clone_cache(&cache, &cfg, &globals);
        assert_eq!(snapshot.seq_len(), 1);

        apply_snapshot(&mut cache, &cfg, &globals, &snapshot).unwrap();
        assert_eq!(cache.seq_len(), 1);

        let (k, _) = cache.read_range(0, 0, 1).unwrap();
        assert_eq!(k[0], 1.0);
    }

    #[test]
    fn test_apply_rejects_mismatched_geometry() {
        let cfg = model_config();
        let globals = GlobalWeights::default();
        let cache_src = KvCache::new(&cfg, KvLayout::Contiguous);
        let snapshot = clone_cache(&cache_src, &cfg, &globals);

        let mut other_cfg = cfg.clone();
        other_cfg.n_kv_heads = 4;
        let mut cache_dst = KvCache::new(&other_cfg, KvLayout::Contiguous);

        assert!(apply_snapshot(&mut cache_dst, &other_cfg, &globals, &snapshot).is_err());
    }

    #[test]
    fn test_apply_rejects_mismatched_quant_dtype() {
        let cfg = model_config();
        let cache_src = KvCache::new(&cfg, KvLayout::Contiguous);
        let f32_globals = GlobalWeights {
            embed: Some(crate::weights::weight::WeightHandle {
                name: "embed".into(),
                dtype: WeightDType::F32,
                shape: vec![cfg.vocab_size, cfg.hidden_size],
                data: std::sync::Arc::from(Vec::new().into_boxed_slice()),
            }),
            lm_head: None,
            final_norm: None,
        };
        let snapshot = clone_cache(&cache_src, &cfg, &f32_globals);

        let mut q4_globals = f32_globals.clone();
        q4_globals.embed.as_mut().unwrap().dtype = WeightDType::Q4;
        let mut cache_dst = KvCache::new(&cfg, KvLayout::Contiguous);

        assert!(apply_snapshot(&mut cache_dst, &cfg, &q4_globals, &snapshot).is_err());
    }
}
