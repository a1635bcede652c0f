//! Token sampling strategies.
//!
//! Temperature, top-k, top-p and repetition penalty compose in a fixed
//! order: repetition penalty first, then top-k, then top-p, with
//! temperature folded into the initial logit scaling. Ties always favor
//! the lower token id.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("all candidate logits were masked out")]
    Degenerate,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub repetition_penalty: f32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
        }
    }
}

/// A minimal splitmix-style PRNG so sampling is reproducible from a `u64`
/// seed without pulling in an external RNG crate for this single use site.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Uniform `f32` in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^= z >> 31;
        (z >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Apply a repetition penalty: already-emitted token logits are divided by
/// `penalty` (penalty >= 1) when positive, multiplied when negative, per the
/// standard formulation.
fn apply_repetition_penalty(logits: &mut [f32], emitted: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for &token in emitted {
        if let Some(logit) = logits.get_mut(token as usize) {
            *logit = if *logit > 0.0 { *logit / penalty } else { *logit * penalty };
        }
    }
}

/// Restrict to the top-k highest logits, setting the rest to `-inf`.
fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut indexed: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let cutoff = indexed[k - 1].1;
    for logit in logits.iter_mut() {
        if *logit < cutoff {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Nucleus sampling: keep the smallest prefix (by descending probability)
/// whose cumulative softmax mass is >= p, masking the rest.
fn apply_top_p(logits: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0;
    let mut keep = vec![false; logits.len()];
    for &(idx, prob) in &indexed {
        if cumulative >= p {
            break;
        }
        keep[idx] = true;
        cumulative += prob;
    }

    for (i, logit) in logits.iter_mut().enumerate() {
        if !keep[i] {
            *logit = f32::NEG_INFINITY;
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|&x| if x.is_finite() { (x - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        vec![0.0; logits.len()]
    } else {
        exps.into_iter().map(|e| e / sum).collect()
    }
}

/// Argmax with a lower-token-id tie-break.
fn argmax(logits: &[f32]) -> Option<usize> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, &v)| v.is_finite())
        .fold(None, |best, (idx, &v)| match best {
            None => Some((idx, v)),
            Some((best_idx, best_v)) if v > best_v => Some((idx, v)),
            Some((best_idx, best_v)) if v == best_v && idx < best_idx => Some((idx, v)),
            Some(b) => Some(b),
        })
        .map(|(idx, _)| idx)
}

/// Sample the next token id from raw logits given `options`, `emitted`
/// (tokens already produced this generation, for the repetition penalty)
/// and an RNG seeded per generation.
pub fn sample(
    logits: &[f32],
    options: &SamplingOptions,
    emitted: &[u32],
    rng: &mut Rng,
) -> Result<u32, SamplingError> {
    let mut logits = logits.to_vec();
    apply_repetition_penalty(&mut logits, emitted, options.repetition_penalty);

    if options.temperature == 0.0 {
        return argmax(&logits).map(|i| i as u32).ok_or(SamplingError::Degenerate);
    }

    for logit in logits.iter_mut() {
        *logit /= options.temperature;
    }

    if let Some(k) = options.top_k {
        apply_top_k(&mut logits, k);
    }
    if let Some(p) = options.top_p {
        apply_top_p(&mut logits, p);
    }

    let probs = softmax(&logits);
    if probs.iter().all(|&p| p == 0.0) {
        return Err(SamplingError::Degenerate);
    }

    let draw = rng.next_f32();
    let mut cumulative = 0.0;
    let mut chosen = None;
    for (idx, &p) in probs.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            chosen = Some(idx);
            break;
        }
    }
    chosen
        .or_else(|| argmax(&probs))
        .map(|i| i as u32)
        .ok_or(SamplingError::Degenerate)
}
