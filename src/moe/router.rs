//! Mixture-of-experts top-k router.
//!
//! Grounded on the Mixtral-style gating routine (softmax over router
//! logits, per-token top-k expert selection with optional renormalization,
//! grouped per-expert token batches) found in the example pack's
//! `mistralrs-core` Mixtral model code.

use thiserror::Error;

use crate::config::MoeConfig;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("router logits width {got} does not match configured expert count {expected}")]
    WidthMismatch { got: usize, expected: usize },
}

/// One token's chosen experts and their (renormalized) weights.
#[derive(Debug, Clone, Default)]
pub struct TokenRouting {
    pub experts: Vec<(usize, f32)>,
}

#[derive(Debug, Default, Clone)]
pub struct ExpertUtilization {
    pub counts: Vec<u64>,
    pub total_routed: u64,
}

impl ExpertUtilization {
    pub fn new(n_experts: usize) -> Self {
        Self {
            counts: vec![0; n_experts],
            total_routed: 0,
        }
    }

    /// Per-expert `(count, percentage)` pairs; percentage in `[0, 100]`.
    pub fn stats(&self) -> Vec<(usize, u64, f32)> {
        self.counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let pct = if self.total_routed == 0 {
                    0.0
                } else {
                    100.0 * count as f32 / self.total_routed as f32
                };
                (i, count, pct)
            })
            .collect()
    }
}

/// An expert's batch of assigned tokens: indices into the original token
/// axis plus each token's routing weight for this expert.
pub struct ExpertBatch {
    pub expert_idx: usize,
    pub token_indices: Vec<usize>,
    pub weights: Vec<f32>,
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        vec![1.0 / logits.len() as f32; logits.len()]
    } else {
        exps.into_iter().map(|e| e / sum).collect()
    }
}

/// Top-k gate over per-token router logits.
pub struct Router {
    config: MoeConfig,
    utilization: ExpertUtilization,
}

impl Router {
    pub fn new(config: MoeConfig) -> Self {
        let utilization = ExpertUtilization::new(config.n_experts);
        Self { config, utilization }
    }

    pub fn utilization(&self) -> &ExpertUtilization {
        &self.utilization
    }

    /// Route one token's logits, selecting the top `k` experts.
    ///
    /// `softmax_before_topk` selects between applying softmax across the
    /// full expert dimension before selecting top-k (the common path) or
    /// selecting top-k on raw logits and normalizing only the selected
    /// subset afterward.
    pub fn route_token(
        &mut self,
        logits: &[f32],
        softmax_before_topk: bool,
    ) -> Result<TokenRouting, RouterError> {
        if logits.len() != self.config.n_experts {
            return Err(RouterError::WidthMismatch {
                got: logits.len(),
                expected: self.config.n_experts,
            });
        }

        let probs = if softmax_before_topk {
            softmax(logits)
        } else {
            logits.to_vec()
        };

        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        indexed.truncate(self.config.top_k);

        let mut selected = if softmax_before_topk {
            indexed
        } else {
            let selected_logits: Vec<f32> = indexed.iter().map(|&(_, v)| v).collect();
            let selected_probs = softmax(&selected_logits);
            indexed
                .iter()
                .zip(selected_probs)
                .map(|(&(idx, _), p)| (idx, p))
                .collect()
        };

        if self.config.normalize_after_topk {
            let sum: f32 = selected.iter().map(|&(_, w)| w).sum();
            if sum > 0.0 {
                for (_, w) in selected.iter_mut() {
                    *w /= sum;
                }
            }
        }

        for &(idx, _) in &selected {
            self.utilization.counts[idx] += 1;
        }
        self.utilization.total_routed += 1;

        Ok(TokenRouting { experts: selected })
    }

    /// Route a full batch of `T` tokens, one row of `E` logits each.
    pub fn route_batch(
        &mut self,
        logits: &[Vec<f32>],
        softmax_before_topk: bool,
    ) -> Result<Vec<TokenRouting>, RouterError> {
        logits
            .iter()
            .map(|row| self.route_token(row, softmax_before_topk))
            .collect()
    }

    /// Group a batch's routings by expert, producing an execution plan of
    /// `expertIdx -> (tokenIndices, weights)`.
    pub fn build_execution_plan(routings: &[TokenRouting], n_experts: usize) -> Vec<ExpertBatch> {
        let mut batches: Vec<ExpertBatch> = (0..n_experts)
            .map(|expert_idx| ExpertBatch {
                expert_idx,
                token_indices: Vec::new(),
                weights: Vec::new(),
            })
            .collect();

        for (token_idx, routing) in routings.iter().enumerate() {
            for &(expert_idx, weight) in &routing.experts {
                batches[expert_idx].token_indices.push(token_idx);
                batches[expert_idx].weights.push(weight);
            }
        }

        batches.retain(|b| !b.token_indices.is_empty());
        batches
    }

    /// Combine per-expert outputs into one per-token output:
    /// `out[t] = sum_{e in top-k(t)} weight(t, e) * expertOut[e][t]`.
    pub fn combine(
        routings: &[TokenRouting],
        expert_outputs: &[(usize, Vec<(usize, Vec<f32>)>)],
        hidden_size: usize,
    ) -> Vec<Vec<f32>> {
        let mut out = vec![vec![0.0f32; hidden_size]; routings.len()];
        for (expert_idx, per_token) in expert_outputs {
            for (token_idx, output) in per_token {
                let weight = routings[*token_idx]
                    .experts
                    .iter()
                    .find(|&&(idx, _)| idx == *expert_idx)
                    .map(|&(_, w)| w)
                    .unwrap_or(0.0);
                for (o, v) in out[*token_idx].iter_mut().zip(output) {
                    *o += weight * v;
                }
            }
        }
        out
    }

    /// Diagnostic load-balance loss: `E * sum_e (f_e * P_e)`. Not used to
    /// gate routing decisions at inference time — training-time diagnostic
    /// only open-question resolution.
    pub fn load_balance_loss(&self, avg_router_prob_per_expert: &[f32]) -> f32 {
        let n_experts = self.config.n_experts as f32;
        let total = self.utilization.total_routed.max(1) as f32;
        self.utilization
            .counts
            .iter()
            .zip(avg_router_prob_per_expert)
            .map(|(&count, &p)| (count as f32 / total) * p)
            .sum::<f32>()
            * n_experts
    }
}
