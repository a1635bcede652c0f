//! Tokenizer backend polymorphism.
//!
//! Expressed as a sum-type over backends rather than a trait object: the
//! pipeline holds one `Tokenizer` enum value, each variant carrying its own
//! vocabulary state.

use std::collections::HashMap;

use thiserror::Error;

use crate::weights::manifest::{Manifest, TokenizerDescriptor};

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("tokenizer unavailable: {0}")]
    Unavailable(String),

    #[error("decode encountered an incomplete byte fragment")]
    IncompleteFragment,
}

/// A minimal bundled-JSON-style vocabulary: a direct token <-> id table plus
/// a small set of special tokens.
#[derive(Debug, Clone, Default)]
pub struct BundledVocab {
    pub id_to_token: Vec<String>,
    pub token_to_id: HashMap<String, u32>,
    pub special_tokens: HashMap<String, u32>,
}

/// SentencePiece-style vocabulary: pieces with scores, no explicit merges.
#[derive(Debug, Clone, Default)]
pub struct SentencePieceVocab {
    pub pieces: Vec<String>,
    pub piece_to_id: HashMap<String, u32>,
}

/// BPE vocab + merge-rank table.
#[derive(Debug, Clone, Default)]
pub struct BpeVocab {
    pub vocab: HashMap<String, u32>,
    pub id_to_token: Vec<String>,
    pub merges: Vec<(String, String)>,
}

/// Backend-polymorphic tokenizer. Each variant implements the same
/// `encode`/`decode` contract over its own vocabulary representation.
#[derive(Clone)]
pub enum Tokenizer {
    Bundled(BundledVocab),
    SentencePiece(SentencePieceVocab),
    Bpe(BpeVocab),
}

impl Tokenizer {
    /// Select a backend from `manifest.tokenizer`. Bundled/huggingface
    /// descriptors both resolve to the bundled backend when a file is
    /// declared; sentencepiece and bpe require their own descriptor shape.
    pub fn initialize(manifest: &Manifest, bundled_json: Option<&str>) -> Result<Self, TokenizerError> {
        match &manifest.tokenizer {
            TokenizerDescriptor::Bundled { file } | TokenizerDescriptor::Huggingface { file } => {
                let json = bundled_json.ok_or_else(|| {
                    TokenizerError::Unavailable(format!("no bundled tokenizer file content supplied for {file}"))
                })?;
                Ok(Tokenizer::Bundled(parse_bundled_json(json)?))
            }
            TokenizerDescriptor::SentencePiece { sentencepiece_model } => {
                Err(TokenizerError::Unavailable(format!(
                    "sentencepiece model '{sentencepiece_model}' loading requires a binary model reader"
                )))
            }
            TokenizerDescriptor::Bpe { vocab, merges } => Err(TokenizerError::Unavailable(format!(
                "bpe vocab '{vocab}' / merges '{merges}' loading requires raw file content"
            ))),
        }
    }

    pub fn get_vocab_size(&self) -> usize {
        match self {
            Tokenizer::Bundled(v) => v.id_to_token.len(),
            Tokenizer::SentencePiece(v) => v.pieces.len(),
            Tokenizer::Bpe(v) => v.id_to_token.len(),
        }
    }

    pub fn get_special_tokens(&self) -> HashMap<String, u32> {
        match self {
            Tokenizer::Bundled(v) => v.special_tokens.clone(),
            _ => HashMap::new(),
        }
    }

    /// Whitespace-delimited lookup encode, sufficient for the bundled
    /// backend's exact-token vocabulary; the sentencepiece/bpe backends
    /// are not yet file-backed (see [`Tokenizer::initialize`]) and return
    /// `Unavailable` until a concrete vocab is constructed directly.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        match self {
            Tokenizer::Bundled(v) => Ok(text
                .split_whitespace()
                .map(|tok| *v.token_to_id.get(tok).unwrap_or(&0))
                .collect()),
            Tokenizer::SentencePiece(v) => Ok(text
                .split_whitespace()
                .map(|tok| *v.piece_to_id.get(tok).unwrap_or(&0))
                .collect()),
            Tokenizer::Bpe(v) => Ok(text
                .split_whitespace()
                .map(|tok| *v.vocab.get(tok).unwrap_or(&0))
                .collect()),
        }
    }

    /// Decode `ids` to text. `trim` controls whether a leading space is
    /// stripped — streaming callers disable it on intermediate chunks so
    /// word-boundary spaces are not silently dropped mid-stream.
    pub fn decode(&self, ids: &[u32], skip_special: bool, trim: bool) -> String {
        let tokens: Vec<&str> = match self {
            Tokenizer::Bundled(v) => ids
                .iter()
                .filter(|&&id| !skip_special || !v.special_tokens.values().any(|&s| s == id))
                .map(|&id| v.id_to_token.get(id as usize).map(String::as_str).unwrap_or(""))
                .collect(),
            Tokenizer::SentencePiece(v) => ids
                .iter()
                .map(|&id| v.pieces.get(id as usize).map(String::as_str).unwrap_or(""))
                .collect(),
            Tokenizer::Bpe(v) => ids
                .iter()
                .map(|&id| v.id_to_token.get(id as usize).map(String::as_str).unwrap_or(""))
                .collect(),
        };
        let joined = tokens.join(" ");
        if trim {
            joined.trim_start().to_string()
        } else {
            joined
        }
    }
}

fn parse_bundled_json(json: &str) -> Result<BundledVocab, TokenizerError> {
    #[derive(serde::Deserialize)]
    struct Raw {
        vocab: HashMap<String, u32>,
        #[serde(default)]
        special_tokens: HashMap<String, u32>,
    }

    let raw: Raw = serde_json::from_str(json)
        .map_err(|e| TokenizerError::Unavailable(format!("invalid bundled tokenizer JSON: {e}")))?;

    let mut id_to_token = vec![String::new(); raw.vocab.len()];
    for (token, &id) in &raw.vocab {
        if let Some(slot) = id_to_token.get_mut(id as usize) {
            *slot = token.clone();
        }
    }

    Ok(BundledVocab {
        id_to_token,
        token_to_id: raw.vocab,
        special_tokens: raw.special_tokens,
    })
}
