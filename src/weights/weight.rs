//! Resolved, in-memory weight storage.
//!
//! An enum-of-storage-kinds for weight dtypes, mirroring how the rest of
//! this crate represents small closed sets of physical layouts.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightDType {
    F32,
    F16,
    Q8,
    Q4,
}

impl WeightDType {
    pub fn from_manifest_str(s: &str) -> Self {
        match s {
            "f32" | "fp32" => WeightDType::F32,
            "q8" | "int8" => WeightDType::Q8,
            "q4" | "int4" => WeightDType::Q4,
            _ => WeightDType::F16,
        }
    }
}

/// A single resolved weight tensor. Dequantization into a GPU-ready layout
/// is a kernel-backend concern (non-goal); this holds host-side bytes plus
/// enough metadata for the loader and pipeline to reason about shape.
#[derive(Debug, Clone)]
pub struct WeightHandle {
    pub name: String,
    pub dtype: WeightDType,
    pub shape: Vec<usize>,
    pub data: Arc<[u8]>,
}

impl WeightHandle {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// All weights belonging to one transformer layer.
#[derive(Debug, Clone, Default)]
pub struct LayerWeights {
    pub tensors: HashMap<String, WeightHandle>,
}

impl LayerWeights {
    pub fn get(&self, name: &str) -> Option<&WeightHandle> {
        self.tensors.get(name)
    }

    pub fn insert(&mut self, weight: WeightHandle) {
        self.tensors.insert(weight.name.clone(), weight);
    }

    /// Fuse separate `q_proj`/`k_proj`/`v_proj` weights into a single
    /// `qkv_proj` tensor when all three share the input dimension.
    /// One-shot: a no-op if already fused or if any of the three is absent.
    pub fn fuse_qkv(&mut self) {
        if self.tensors.contains_key("qkv_proj") {
            return;
        }
        let (q, k, v) = match (
            self.tensors.get("q_proj"),
            self.tensors.get("k_proj"),
            self.tensors.get("v_proj"),
        ) {
            (Some(q), Some(k), Some(v)) => (q.clone(), k.clone(), v.clone()),
            _ => return,
        };

        if q.shape.first() != k.shape.first() || q.shape.first() != v.shape.first() {
            return;
        }

        let mut fused_shape = q.shape.clone();
        if let Some(last) = fused_shape.last_mut() {
            *last += k.shape.last().copied().unwrap_or(0) + v.shape.last().copied().unwrap_or(0);
        }

        let mut data = Vec::with_capacity(q.data.len() + k.data.len() + v.data.len());
        data.extend_from_slice(&q.data);
        data.extend_from_slice(&k.data);
        data.extend_from_slice(&v.data);

        self.tensors.insert(
            "qkv_proj".to_string(),
            WeightHandle {
                name: "qkv_proj".to_string(),
                dtype: q.dtype,
                shape: fused_shape,
                data: data.into(),
            },
        );
        self.tensors.remove("q_proj");
        self.tensors.remove("k_proj");
        self.tensors.remove("v_proj");
    }
}

/// Global (non-per-layer) weights: embeddings, LM head, final norm.
#[derive(Debug, Clone, Default)]
pub struct GlobalWeights {
    pub embed: Option<WeightHandle>,
    pub lm_head: Option<WeightHandle>,
    pub final_norm: Option<WeightHandle>,
}

impl GlobalWeights {
    /// Tie `lm_head` to `embed`: an alias,
    /// not a copy, of the transpose of `embed`. Since this is host-side
    /// metadata rather than a GPU tensor, the "transpose" is represented by
    /// sharing the same byte buffer and letting the consuming kernel
    /// interpret the strides — we only need to record that the two names
    /// refer to the same underlying weight.
    pub fn tie_embeddings(&mut self) {
        if let Some(embed) = &self.embed {
            self.lm_head = Some(WeightHandle {
                name: "lm_head".to_string(),
                dtype: embed.dtype,
                shape: embed.shape.iter().rev().copied().collect(),
                data: Arc::clone(&embed.data),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight(name: &str, shape: Vec<usize>, byte_len: usize) -> WeightHandle {
        WeightHandle {
            name: name.to_string(),
            dtype: WeightDType::F16,
            shape,
            data: vec![0u8; byte_len].into(),
        }
    }

    #[test]
    fn test_fuse_qkv_combines_matching_dims() {
        let mut layer = LayerWeights::default();
        layer.insert(weight("q_proj", vec![256, 256], 256 * 256 * 2));
        layer.insert(weight("k_proj", vec![256, 64], 256 * 64 * 2));
        layer.insert(weight("v_proj", vec![256, 64], 256 * 64 * 2));
        layer.fuse_qkv();

        assert!(layer.get("q_proj").is_none());
        let fused = layer.get("qkv_proj").unwrap();
        assert_eq!(fused.shape, vec![256, 384]);
    }

    #[test]
    fn test_fuse_qkv_is_noop_without_all_three() {
        let mut layer = LayerWeights::default();
        layer.insert(weight("q_proj", vec![256, 256], 256 * 256 * 2));
        layer.fuse_qkv();
        assert!(layer.get("q_proj").is_some());
        assert!(layer.get("qkv_proj").is_none());
    }

    #[test]
    fn test_tie_embeddings_shares_buffer() {
        let mut global = GlobalWeights {
            embed: Some(weight("embed", vec![32000, 256], 32000 * 256 * 2)),
            ..Default::default()
        };
        global.tie_embeddings();
        let lm_head = global.lm_head.unwrap();
        assert_eq!(lm_head.shape, vec![256, 32000]);
        assert!(Arc::ptr_eq(&lm_head.data, &global.embed.unwrap().data));
    }
}
