//! Token sampling.
//!
//! The engine treats sampling as an external collaborator behind the
//! [`Sampler`] trait: given one logits row per running sequence, a sampler
//! appends next tokens, may fork sequences (beam search, parallel
//! sampling), and marks sequences finished. [`BasicSampler`] is the bundled
//! implementation covering greedy and temperature/top-k/top-p sampling for
//! single-hypothesis requests; beam fan-out is left to external samplers.

use candle_core::{DType, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingParams;
use crate::core::sequence::{FinishReason, SequenceGroup, SequenceId, TokenId};
use crate::error::{Error, Result};

/// Per-iteration sampling over one sequence group.
pub trait Sampler {
    /// Consume one logits row per running sequence (in sequence order) and
    /// update the group: append tokens, fork, finish.
    ///
    /// Forks must be recorded before the forked-off token is appended so
    /// the stream sees the child's prefix exactly as the parent's history.
    fn sample(&mut self, group: &mut SequenceGroup, logits: &[(SequenceId, Tensor)]) -> Result<()>;
}

/// Greedy / stochastic sampler for single-hypothesis requests.
///
/// Temperature 0 selects the arg-max token; otherwise the distribution is
/// temperature-scaled and optionally top-k/top-p filtered before sampling.
/// Log-probs accumulated on sequences always come from the unscaled
/// distribution.
pub struct BasicSampler {
    rng: StdRng,
}

impl BasicSampler {
    /// Create a sampler seeded from entropy.
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Create a sampler with a fixed seed for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Pick a token index from a logits row.
    fn choose(&mut self, logits: &[f32], params: &SamplingParams) -> Result<usize> {
        if logits.is_empty() {
            return Err(Error::InvariantViolation(
                "sampler received an empty logits row".to_string(),
            ));
        }
        if params.temperature <= 0.0 {
            return Ok(argmax(logits));
        }

        let mut indexed: Vec<(usize, f32)> = logits
            .iter()
            .map(|&v| v / params.temperature)
            .enumerate()
            .collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if params.top_k > 0 && params.top_k < indexed.len() {
            indexed.truncate(params.top_k);
        }

        // Softmax over the surviving candidates.
        let max = indexed[0].1;
        let exps: Vec<f32> = indexed.iter().map(|(_, v)| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        let mut probs: Vec<f32> = exps.iter().map(|e| e / sum).collect();

        // Nucleus cut: keep tokens until cumulative probability exceeds p.
        if params.top_p > 0.0 && params.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let mut cutoff = probs.len();
            for (i, p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative > params.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            probs.truncate(cutoff);
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| Error::InvariantViolation(format!("bad sampling weights: {e}")))?;
        Ok(indexed[dist.sample(&mut self.rng)].0)
    }
}

impl Default for BasicSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for BasicSampler {
    fn sample(&mut self, group: &mut SequenceGroup, logits: &[(SequenceId, Tensor)]) -> Result<()> {
        let params = group.sampling_params().clone();
        for (seq_id, row) in logits {
            let row = row.to_dtype(DType::F32)?;
            let raw: Vec<f32> = row.to_vec1()?;
            let log_probs: Vec<f32> = candle_nn::ops::log_softmax(&row, D::Minus1)?.to_vec1()?;

            let token_idx = self.choose(&raw, &params)?;
            let token_id = token_idx as TokenId;
            let log_prob = log_probs[token_idx];

            let seq = group
                .get_sequence_mut(*seq_id)
                .ok_or(Error::SequenceNotFound(*seq_id))?;
            seq.append_token(token_id, log_prob);

            if let Some(reason) = finish_reason(seq.generated_len(), token_id, &params) {
                seq.finish(reason);
            }
        }
        Ok(())
    }
}

/// Index of the largest logit; ties resolve to the first occurrence.
fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in logits.iter().enumerate() {
        if v > logits[best] {
            best = i;
        }
    }
    best
}

/// Stop condition for a sequence that just gained `token_id`.
fn finish_reason(
    generated_len: usize,
    token_id: TokenId,
    params: &SamplingParams,
) -> Option<FinishReason> {
    if !params.ignore_eos && params.eos_token_id == Some(token_id) {
        return Some(FinishReason::EndOfSequence);
    }
    if params.stop_token_ids.contains(&token_id) {
        return Some(FinishReason::StopToken);
    }
    if generated_len >= params.max_new_tokens {
        return Some(FinishReason::MaxTokens);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_first_tie_wins() {
        assert_eq!(argmax(&[0.0, 3.0, 3.0, 1.0]), 1);
    }

    #[test]
    fn test_sample_appends_and_finishes() {
        use crate::core::sequence::{SequenceGroup, SequenceIdGen};
        use candle_core::Device;

        let mut group = SequenceGroup::new(
            0,
            vec![1, 2],
            SamplingParams::default().temperature(0.0).max_new_tokens(1),
            16,
            SequenceIdGen::new(),
        );
        let seq_id = group.sequences()[0].seq_id();
        let mut row = vec![0f32; 8];
        row[5] = 10.0;
        let logits = vec![(seq_id, Tensor::from_vec(row, 8, &Device::Cpu).unwrap())];

        let mut sampler = BasicSampler::with_seed(0);
        sampler.sample(&mut group, &logits).unwrap();

        let seq = group.get_sequence(seq_id).unwrap();
        assert_eq!(seq.generated_ids(), &[5]);
        assert!(seq.cumulative_log_prob() < 0.0);
        assert_eq!(seq.finish_reason(), Some(FinishReason::MaxTokens));
    }

    #[test]
    fn test_greedy_choose_is_argmax() {
        let mut sampler = BasicSampler::with_seed(0);
        let params = SamplingParams::default().temperature(0.0);
        let idx = sampler.choose(&[0.1, 0.9, 0.5], &params).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn test_top_k_restricts_candidates() {
        let mut sampler = BasicSampler::with_seed(42);
        let mut params = SamplingParams::default();
        params.temperature = 1.0;
        params.top_k = 1;
        // With k = 1 only the arg-max survives, whatever the seed.
        for _ in 0..8 {
            let idx = sampler.choose(&[0.0, 5.0, 1.0], &params).unwrap();
            assert_eq!(idx, 1);
        }
    }

    #[test]
    fn test_finish_reasons() {
        let params = SamplingParams::default()
            .max_new_tokens(4)
            .eos_token_id(1000);
        assert_eq!(
            finish_reason(1, 1000, &params),
            Some(FinishReason::EndOfSequence)
        );
        assert_eq!(finish_reason(3, 5, &params), None);
        assert_eq!(finish_reason(4, 5, &params), Some(FinishReason::MaxTokens));

        let mut ignoring = params.clone();
        ignoring.ignore_eos = true;
        assert_eq!(finish_reason(1, 1000, &ignoring), None);

        let mut stopping = SamplingParams::default();
        stopping.stop_token_ids.insert(7);
        assert_eq!(finish_reason(1, 7, &stopping), Some(FinishReason::StopToken));
    }
}
