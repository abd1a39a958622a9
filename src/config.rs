//! Configuration types for microbatch.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::sequence::TokenId;
use crate::error::{Error, Result};

/// Default block size (tokens per KV cache block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Ordering of prompt versus generation work inside a scheduling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SchedulerPolicy {
    /// Prompt processing takes the token budget before decoding.
    ///
    /// Keeps the KV cache productive: partially prefilled groups finish
    /// their prompts before decoding groups consume the batch.
    #[default]
    PrefillFirst,
    /// Decoding groups take the token budget before prompt processing.
    DecodeFirst,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hard cap on scheduled tokens per tick.
    pub max_num_batched_tokens: usize,
    /// Hard cap on concurrently running sequences in a batch.
    pub max_num_seqs: usize,
    /// Total number of KV cache blocks in the pool.
    pub num_kv_blocks: usize,
    /// Tokens per KV cache block.
    pub block_size: usize,
    /// Prompt/decode ordering policy.
    pub policy: SchedulerPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 4096,
            max_num_seqs: 256,
            num_kv_blocks: 1024,
            block_size: DEFAULT_BLOCK_SIZE,
            policy: SchedulerPolicy::PrefillFirst,
        }
    }
}

impl SchedulerConfig {
    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any cap is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_num_batched_tokens == 0 {
            return Err(Error::Config(
                "max_num_batched_tokens must be positive".to_string(),
            ));
        }
        if self.max_num_seqs == 0 {
            return Err(Error::Config("max_num_seqs must be positive".to_string()));
        }
        if self.num_kv_blocks == 0 {
            return Err(Error::Config("num_kv_blocks must be positive".to_string()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Total token capacity of the block pool.
    pub fn total_token_slots(&self) -> usize {
        self.num_kv_blocks * self.block_size
    }
}

/// Sampling parameters for a single request.
///
/// The engine itself only interprets `max_new_tokens` and the stop
/// conditions; everything else is passed through opaquely to whatever
/// [`Sampler`](crate::engine::sampler::Sampler) the caller supplies.
/// `beam_width` and `n_samples` are hints for samplers that fan out
/// hypotheses via `fork_sequence`; the bundled
/// [`BasicSampler`](crate::engine::sampler::BasicSampler) ignores them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum tokens to generate per sequence.
    pub max_new_tokens: usize,
    /// Beam width (1 = greedy/sampling, no beam search).
    pub beam_width: usize,
    /// Number of parallel samples per request.
    pub n_samples: usize,
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Length penalty exponent for beam-search scoring.
    pub length_penalty: f32,
    /// End-of-sequence token ID.
    pub eos_token_id: Option<TokenId>,
    /// Keep generating past the EOS token.
    pub ignore_eos: bool,
    /// Additional token IDs that stop generation.
    pub stop_token_ids: HashSet<TokenId>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            beam_width: 1,
            n_samples: 1,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            length_penalty: 1.0,
            eos_token_id: None,
            ignore_eos: false,
            stop_token_ids: HashSet::new(),
        }
    }
}

impl SamplingParams {
    /// Set the maximum tokens to generate.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Set the temperature for sampling.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the end-of-sequence token.
    pub fn eos_token_id(mut self, eos_token_id: TokenId) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    /// Set the length penalty for beam-search scoring.
    pub fn length_penalty(mut self, length_penalty: f32) -> Self {
        self.length_penalty = length_penalty;
        self
    }
}
