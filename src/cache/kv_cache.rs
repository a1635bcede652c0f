//! Per-layer key/value storage for a single pipeline.
//!
//! No tiered storage or migration across devices: each layer's K and V live
//! in one GPU-resident buffer for the lifetime of the cache, in one of three
//! fixed layouts chosen at construction time.

use thiserror::Error;
use tracing::debug;

use crate::config::ModelConfig;

#[derive(Error, Debug)]
pub enum KvCacheError {
    #[error("layer index {0} out of range")]
    LayerOutOfRange(usize),

    #[error("position {pos} exceeds max sequence length {max}")]
    PositionOutOfRange { pos: usize, max: usize },

    #[error("snapshot geometry does not match this cache: {0}")]
    GeometryMismatch(String),
}

/// Storage layout for a KV cache, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvLayout {
    /// One contiguous buffer per layer, indexed directly by position.
    Contiguous,
    /// Fixed-capacity pages stitched together; a fresh page is allocated
    /// whenever the current page fills up.
    Paged { page_tokens: usize },
    /// Only the last `window` positions are retained; older positions are
    /// overwritten using modular (ring) indexing.
    SlidingWindow { window: usize },
}

/// One layer's K and V storage, as flat `(capacity * n_kv_heads * head_dim)`
/// element buffers. Element type is left abstract (spec's kernel backend is
/// out of scope) — bytes are tracked for memory-stats purposes only.
struct LayerStore {
    k: Vec<f32>,
    v: Vec<f32>,
    capacity_positions: usize,
    /// For `Paged`, the number of pages currently allocated.
    pages_allocated: usize,
}

impl LayerStore {
    fn new(capacity_positions: usize, row_elems: usize) -> Self {
        Self {
            k: vec![0.0; capacity_positions * row_elems],
            v: vec![0.0; capacity_positions * row_elems],
            capacity_positions,
            pages_allocated: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KvMemoryStats {
    pub allocated_bytes: u64,
    pub used_bytes: u64,
    pub seq_len: usize,
    pub max_seq_len: usize,
}

/// Per-layer key/value cache for one pipeline.
pub struct KvCache {
    layout: KvLayout,
    n_layers: usize,
    n_kv_heads: usize,
    head_dim: usize,
    max_seq_len: usize,
    layers: Vec<LayerStore>,
    seq_len: usize,
}

impl KvCache {
    pub fn new(config: &ModelConfig, layout: KvLayout) -> Self {
        let row_elems = config.n_kv_heads * config.head_dim;
        let per_layer_capacity = match layout {
            KvLayout::Contiguous => config.max_seq_len,
            KvLayout::Paged { page_tokens } => {
                // Capacity grows page-by-page; start with enough for one page.
                page_tokens.max(1)
            }
            KvLayout::SlidingWindow { window } => window.min(config.max_seq_len).max(1),
        };

        let layers = (0..config.n_layers)
            .map(|_| LayerStore::new(per_layer_capacity, row_elems))
            .collect();

        Self {
            layout,
            n_layers: config.n_layers,
            n_kv_heads: config.n_kv_heads,
            head_dim: config.head_dim,
            max_seq_len: config.max_seq_len,
            layers,
            seq_len: 0,
        }
    }

    pub fn layout(&self) -> KvLayout {
        self.layout
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    fn row_elems(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    fn check_layer(&self, layer_idx: usize) -> Result<(), KvCacheError> {
        if layer_idx >= self.n_layers {
            Err(KvCacheError::LayerOutOfRange(layer_idx))
        } else {
            Ok(())
        }
    }

    /// Append one position's key/value rows for `layer_idx`.
    ///
    /// `k` and `v` must each contain exactly `n_kv_heads * head_dim`
    /// elements. `pos` is the logical sequence position; for
    /// [`KvLayout::SlidingWindow`] positions `>= window` wrap modularly and
    /// overwrite the oldest retained slot. For [`KvLayout::Paged`], a fresh
    /// page is appended whenever the layer's current capacity is exhausted.
    pub fn append_step(
        &mut self,
        layer_idx: usize,
        k: &[f32],
        v: &[f32],
        pos: usize,
    ) -> Result<(), KvCacheError> {
        self.check_layer(layer_idx)?;
        if pos >= self.max_seq_len {
            return Err(KvCacheError::PositionOutOfRange {
                pos,
                max: self.max_seq_len,
            });
        }

        let row_elems = self.row_elems();
        let layout = self.layout;
        let layer = &mut self.layers[layer_idx];

        let slot = match layout {
            KvLayout::Contiguous => pos,
            KvLayout::SlidingWindow { window } => pos % window.max(1),
            KvLayout::Paged { page_tokens } => {
                let needed = pos + 1;
                if needed > layer.capacity_positions {
                    let pages = needed.div_ceil(page_tokens.max(1));
                    let new_capacity = pages * page_tokens.max(1);
                    layer.k.resize(new_capacity * row_elems, 0.0);
                    layer.v.resize(new_capacity * row_elems, 0.0);
                    layer.capacity_positions = new_capacity;
                    layer.pages_allocated = pages;
                }
                pos
            }
        };

        let start = slot * row_elems;
        layer.k[start..start + row_elems].copy_from_slice(k);
        layer.v[start..start + row_elems].copy_from_slice(v);

        if pos + 1 > self.seq_len {
            self.seq_len = pos + 1;
        }

        Ok(())
    }

    /// Read the `[start, end)` K/V rows for a layer. For sliding-window
    /// caches the range is saturated to `[max(0, seqLen - window), seqLen)`
    /// before reading
    pub fn read_range(
        &self,
        layer_idx: usize,
        start: usize,
        end: usize,
    ) -> Result<(Vec<f32>, Vec<f32>), KvCacheError> {
        self.check_layer(layer_idx)?;
        let row_elems = self.row_elems();
        let layer = &self.layers[layer_idx];

        let (start, end) = match self.layout {
            KvLayout::SlidingWindow { window } => {
                let lo = self.seq_len.saturating_sub(window);
                (start.max(lo), end.min(self.seq_len))
            }
            _ => (start, end.min(self.seq_len)),
        };

        let mut k_out = Vec::with_capacity((end.saturating_sub(start)) * row_elems);
        let mut v_out = Vec::with_capacity((end.saturating_sub(start)) * row_elems);

        for pos in start..end {
            let slot = match self.layout {
                KvLayout::Contiguous | KvLayout::Paged { .. } => pos,
                KvLayout::SlidingWindow { window } => pos % window.max(1),
            };
            let s = slot * row_elems;
            k_out.extend_from_slice(&layer.k[s..s + row_elems]);
            v_out.extend_from_slice(&layer.v[s..s + row_elems]);
        }

        Ok((k_out, v_out))
    }

    /// Drop all stored state, returning the cache to `seqLen = 0`. Allocated
    /// capacity is retained (only contents are cleared) to avoid churn on
    /// the next prefill.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.k.fill(0.0);
            layer.v.fill(0.0);
        }
        self.seq_len = 0;
        debug!("KV cache cleared");
    }

    pub fn memory_stats(&self) -> KvMemoryStats {
        let used_positions = self.seq_len;
        let row_elems = self.row_elems();
        let allocated_elems: usize = self.layers.iter().map(|l| 2 * l.capacity_positions * row_elems).sum();
        let used_elems = 2 * used_positions * row_elems * self.n_layers;

        KvMemoryStats {
            allocated_bytes: (allocated_elems * std::mem::size_of::<f32>()) as u64,
            used_bytes: (used_elems * std::mem::size_of::<f32>()) as u64,
            seq_len: self.seq_len,
            max_seq_len: self.max_seq_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_config(sliding_window: Option<usize>) -> ModelConfig {
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
            sliding_window,
            tie_embeddings: false,
        }
    }

    fn row(val: f32, len: usize) -> Vec<f32> {
        vec![val; len]
    }

    #[test]
    fn test_contiguous_append_and_read() {
        let cfg = model_config(None);
        let mut cache = KvCache::new(&cfg, KvLayout::Contiguous);
        let row_elems = cfg.n_kv_heads * cfg.head_dim;

        cache.append_step(0, &row(1.0, row_elems), &row(2.0, row_elems), 0).unwrap();
        cache.append_step(0, &row(3.0, row_elems), &row(4.0, row_elems), 1).unwrap();
        assert_eq!(cache.seq_len(), 2);

        let (k, _v) = cache.read_range(0, 0, 2).unwrap();
        assert_eq!(k.len(), 2 * row_elems);
        assert_eq!(k[0], 1.0);
        assert_eq!(k[row_elems], 3.0);
    }

    #[test]
    fn test_sliding_window_overwrites_oldest() {
        let cfg = model_config(Some(2));
        let mut cache = KvCache::new(&cfg, KvLayout::SlidingWindow { window: 2 });
        let row_elems = cfg.n_kv_heads * cfg.head_dim;

        cache.append_step(0, &row(1.0, row_elems), &row(1.0, row_elems), 0).unwrap();
        cache.append_step(0, &row(2.0, row_elems), &row(2.0, row_elems), 1).unwrap();
        cache.append_step(0, &row(3.0, row_elems), &row(3.0, row_elems), 2).unwrap();

        assert_eq!(cache.seq_len(), 3);
        let (k, _v) = cache.read_range(0, 0, 3).unwrap();
        // Window of 2 retained: positions 1 and 2 (value 2.0, 3.0).
        assert_eq!(k.len(), 2 * row_elems);
        assert_eq!(k[0], 2.0);
        assert_eq!(k[row_elems], 3.0);
    }

    #[test]
    fn test_paged_grows_on_demand() {
        let cfg = model_config(None);
        let mut cache = KvCache::new(&cfg, KvLayout::Paged { page_tokens: 4 });
        let row_elems = cfg.n_kv_heads * cfg.head_dim;

        for pos in 0..6 {
            cache
                .append_step(0, &row(pos as f32, row_elems), &row(pos as f32, row_elems), pos)
                .unwrap();
        }
        assert_eq!(cache.seq_len(), 6);
        assert!(cache.layers[0].capacity_positions >= 6);
    }

    #[test]
    fn test_clear_resets_seq_len() {
        let cfg = model_config(None);
        let mut cache = KvCache::new(&cfg, KvLayout::Contiguous);
        let row_elems = cfg.n_kv_heads * cfg.head_dim;
        cache.append_step(0, &row(1.0, row_elems), &row(1.0, row_elems), 0).unwrap();
        cache.clear();
        assert_eq!(cache.seq_len(), 0);
    }

    #[test]
    fn test_position_out_of_range_errors() {
        let cfg = model_config(None);
        let mut cache = KvCache::new(&cfg, KvLayout::Contiguous);
        let row_elems = cfg.n_kv_heads * cfg.head_dim;
        assert!(cache
            .append_step(0, &row(1.0, row_elems), &row(1.0, row_elems), 100)
            .is_err());
    }
}
