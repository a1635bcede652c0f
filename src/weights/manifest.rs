//! Model manifest schema.
//!
//! `serde` + `thiserror` deserialization of the shard/weight descriptor
//! format a weight loader consumes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ModelConfig;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest is missing required field: {0}")]
    MissingField(&'static str),

    #[error("manifest declares no shards")]
    NoShards,

    #[error("tokenizer descriptor is incomplete: {0}")]
    InvalidTokenizer(String),

    #[error("failed to parse manifest JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub architecture: String,
    pub config: ManifestModelConfig,
    pub tokenizer: TokenizerDescriptor,
    pub shards: Vec<ShardDescriptor>,
    pub quantization_info: Option<QuantizationInfo>,
    pub eos_token_id: Option<EosTokenId>,
    pub draft_model: Option<String>,
    pub optimizations: Option<Optimizations>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    pub fn contains(&self, token: u32) -> bool {
        match self {
            EosTokenId::Single(id) => *id == token,
            EosTokenId::Multiple(ids) => ids.contains(&token),
        }
    }
}

/// Manifest-side model hyperparameters, using the manifest's own field
/// names; converted into [`ModelConfig`] by [`ManifestModelConfig::resolve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub rope_theta: f32,
    pub rope_scaling_factor: Option<f32>,
    pub local_rope_theta: Option<f32>,
    pub sliding_window: Option<usize>,
    pub tie_word_embeddings: Option<bool>,
    pub num_experts: Option<usize>,
    pub num_experts_per_tok: Option<usize>,
    pub normalize_expert_weights: Option<bool>,
}

impl ManifestModelConfig {
    pub fn resolve(&self) -> Result<ModelConfig, ManifestError> {
        if self.num_attention_heads == 0 {
            return Err(ManifestError::MissingField("num_attention_heads"));
        }
        let head_dim = self.hidden_size / self.num_attention_heads;

        let moe = match (self.num_experts, self.num_experts_per_tok) {
            (Some(n_experts), Some(top_k)) => Some(crate::config::MoeConfig {
                n_experts,
                top_k,
                normalize_after_topk: self.normalize_expert_weights.unwrap_or(true),
            }),
            _ => None,
        };

        Ok(ModelConfig {
            n_layers: self.num_hidden_layers,
            hidden_size: self.hidden_size,
            n_heads: self.num_attention_heads,
            n_kv_heads: self.num_key_value_heads,
            head_dim,
            intermediate_size: self.intermediate_size,
            vocab_size: self.vocab_size,
            max_seq_len: self.max_position_embeddings,
            rope_theta: self.rope_theta,
            rope_scaling: self.rope_scaling_factor.map(|factor| crate::config::RopeScaling {
                factor,
                original_max_position_embeddings: self.max_position_embeddings,
            }),
            local_rope_theta: self.local_rope_theta,
            moe,
            sliding_window: self.sliding_window,
            tie_embeddings: self.tie_word_embeddings.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenizerDescriptor {
    Bundled { file: String },
    Huggingface { file: String },
    SentencePiece { sentencepiece_model: String },
    Bpe { vocab: String, merges: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub filename: String,
    pub size: u64,
    pub weights: Vec<WeightDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightDescriptor {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub offset: u64,
    pub length: u64,
    pub quant_block: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub weights: String,
    pub compute: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Optimizations {
    pub kernel_path: Option<String>,
}

impl Manifest {
    pub fn parse(json: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.shards.is_empty() {
            return Err(ManifestError::NoShards);
        }
        match &self.tokenizer {
            TokenizerDescriptor::Bundled { file } | TokenizerDescriptor::Huggingface { file }
                if file.is_empty() =>
            {
                Err(ManifestError::InvalidTokenizer(
                    "bundled/huggingface tokenizer requires a file path".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "architecture": "llama",
            "config": {
                "vocab_size": 32000,
                "hidden_size": 256,
                "num_hidden_layers": 2,
                "num_attention_heads": 8,
                "num_key_value_heads": 2,
                "intermediate_size": 512,
                "max_position_embeddings": 4096,
                "rope_theta": 10000.0
            },
            "tokenizer": {"type": "bundled", "file": "tokenizer.json"},
            "shards": [{"filename": "shard0.bin", "size": 1024, "weights": []}]
        }"#
    }

    #[test]
    fn test_parse_and_resolve() {
        let manifest = Manifest::parse(sample_json()).unwrap();
        let resolved = manifest.config.resolve().unwrap();
        assert_eq!(resolved.head_dim, 32);
        assert_eq!(resolved.n_layers, 2);
    }

    #[test]
    fn test_no_shards_rejected() {
        let json = sample_json().replace(r#""shards": [{"filename": "shard0.bin", "size": 1024, "weights": []}]"#, r#""shards": []"#);
        assert!(Manifest::parse(&json).is_err());
    }

    #[test]
    fn test_eos_token_id_single_and_multiple() {
        let single = EosTokenId::Single(2);
        assert!(single.contains(2));
        let multi = EosTokenId::Multiple(vec![2, 3]);
        assert!(multi.contains(3));
        assert!(!multi.contains(4));
    }
}
