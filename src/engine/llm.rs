//! LLM inference engine loop.
//!
//! The engine orchestrates one tick:
//!
//! ```text
//! schedule -> block copies -> model step -> sample -> commit -> notify -> reclaim
//! ```
//!
//! The model step and the sampler are external collaborators behind the
//! [`ModelStep`] and [`Sampler`] traits; the engine owns the scheduler, the
//! sequence groups, and the ordering guarantees between the phases. The
//! loop is single-threaded and cooperative: a tick is atomic with respect
//! to scheduler state, and the generation stream is the only boundary
//! shared with caller threads.

use std::collections::{HashSet, VecDeque};

use candle_core::{DType, IndexOp, Tensor};
use tracing::{debug, warn};

use super::sampler::Sampler;
use crate::config::{SamplingParams, SchedulerConfig};
use crate::core::block::{blocks_needed, BlockId};
use crate::core::block_manager::CopyOp;
use crate::core::sequence::{
    FinishReason, LogProb, RequestId, SequenceGroup, SequenceId, SequenceIdGen, TokenId,
};
use crate::core::stream::GenerationHandle;
use crate::error::{Error, Result};
use crate::scheduler::{ScheduleOutput, Scheduler};

/// One running sequence's slice of the model batch.
#[derive(Debug, Clone)]
pub struct SequenceInput {
    /// Owning request.
    pub request_id: RequestId,
    /// The sequence the tokens belong to.
    pub seq_id: SequenceId,
    /// New input tokens for this tick.
    pub token_ids: Vec<TokenId>,
    /// Absolute positions of the new tokens.
    pub positions: Vec<usize>,
    /// Physical block table covering the sequence's context.
    pub block_ids: Vec<BlockId>,
    /// Whether the model must emit a logits row for this sequence.
    pub sample: bool,
}

/// Flat batch handed to the model step, in scheduler emission order.
#[derive(Debug, Default)]
pub struct ModelInput {
    /// Per-sequence slices; rows with `sample` set map 1:1 onto logits rows.
    pub sequences: Vec<SequenceInput>,
}

impl ModelInput {
    /// Number of logits rows the model must produce.
    pub fn num_sampling_rows(&self) -> usize {
        self.sequences.iter().filter(|s| s.sample).count()
    }

    /// Total new tokens in the batch.
    pub fn num_tokens(&self) -> usize {
        self.sequences.iter().map(|s| s.token_ids.len()).sum()
    }
}

/// One forward pass of the served model.
///
/// The implementation owns the KV cache tensors; the engine only hands it
/// block IDs. `copy_blocks` is ordered before `forward` within a tick.
pub trait ModelStep {
    /// Perform the physical copies behind the tick's copy-on-write ops.
    fn copy_blocks(&mut self, copies: &[CopyOp]) -> Result<()>;

    /// Run one forward pass and return a logits tensor with one row per
    /// sampling sequence, ordered to match the batch.
    fn forward(&mut self, input: &ModelInput) -> Result<Tensor>;
}

/// Final output for a completed request.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// The request this result belongs to.
    pub request_id: RequestId,
    /// Generated token IDs per finished sequence, ordered by descending
    /// beam-search score.
    pub generated_ids: Vec<Vec<TokenId>>,
    /// Cumulative log-prob of the best sequence.
    pub cumulative_log_prob: LogProb,
}

/// Continuous-batching inference engine.
pub struct LLMEngine {
    model: Box<dyn ModelStep>,
    sampler: Box<dyn Sampler>,
    scheduler: Scheduler,
    /// Live groups, in admission order.
    groups: Vec<SequenceGroup>,
    /// Requests accepted but not yet drained into a tick.
    pending: VecDeque<SequenceGroup>,
    /// IDs of requests currently owned by the engine.
    live_requests: HashSet<RequestId>,
    seq_id_gen: SequenceIdGen,
    /// Set after a fatal error; only shutdown is valid from here.
    aborted: bool,
}

impl LLMEngine {
    /// Create an engine over a model step and a sampler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the scheduler configuration is
    /// inconsistent.
    pub fn new(
        model: Box<dyn ModelStep>,
        sampler: Box<dyn Sampler>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            sampler,
            scheduler: Scheduler::new(config),
            groups: Vec::new(),
            pending: VecDeque::new(),
            live_requests: HashSet::new(),
            seq_id_gen: SequenceIdGen::new(),
            aborted: false,
        })
    }

    /// Get the scheduler (read-only, for inspection).
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Queue a request; it joins scheduling at the start of the next tick.
    ///
    /// Returns the handle the caller reads iteration outputs from.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for an empty prompt or a request ID that
    /// is still live; [`Error::CapacityExhausted`] if the prompt can never
    /// fit the block pool.
    pub fn add_request(
        &mut self,
        request_id: RequestId,
        prompt_ids: Vec<TokenId>,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle> {
        if self.aborted {
            return Err(Error::EngineAborted);
        }
        if prompt_ids.is_empty() {
            return Err(Error::InvalidRequest {
                request_id,
                reason: "empty prompt".to_string(),
            });
        }
        if self.live_requests.contains(&request_id) {
            return Err(Error::InvalidRequest {
                request_id,
                reason: "request id already in use".to_string(),
            });
        }
        let config = self.scheduler.config();
        let required_blocks = blocks_needed(prompt_ids.len(), config.block_size);
        if required_blocks > config.num_kv_blocks {
            return Err(Error::CapacityExhausted {
                request_id,
                required_blocks,
                pool_blocks: config.num_kv_blocks,
            });
        }

        let group = SequenceGroup::new(
            request_id,
            prompt_ids,
            sampling_params,
            config.block_size,
            self.seq_id_gen.clone(),
        );
        let handle = group.handle();
        self.live_requests.insert(request_id);
        self.pending.push_back(group);
        debug!(request_id, "request queued");
        Ok(handle)
    }

    /// Queue a request whose prompt arrives as a rank-1 tensor.
    pub fn add_request_from_tensor(
        &mut self,
        request_id: RequestId,
        prompt: &Tensor,
        sampling_params: SamplingParams,
    ) -> Result<GenerationHandle> {
        let prompt_ids: Vec<TokenId> = prompt.to_dtype(DType::I64)?.to_vec1()?;
        self.add_request(request_id, prompt_ids, sampling_params)
    }

    /// Check whether any request is still queued or generating.
    pub fn has_unfinished_requests(&self) -> bool {
        !self.groups.is_empty() || !self.pending.is_empty()
    }

    /// Run one tick. Returns results for requests that completed in it.
    ///
    /// # Errors
    ///
    /// A model-step failure or invariant violation fails the tick and
    /// leaves the engine quiescent; every later call returns
    /// [`Error::EngineAborted`].
    pub fn step(&mut self) -> Result<Vec<GenerationResult>> {
        if self.aborted {
            return Err(Error::EngineAborted);
        }
        match self.step_inner() {
            Ok(results) => Ok(results),
            Err(e) => {
                self.aborted = true;
                warn!(error = %e, "engine step failed; entering quiescent state");
                Err(e)
            }
        }
    }

    fn step_inner(&mut self) -> Result<Vec<GenerationResult>> {
        // Admissions join at tick start.
        while let Some(group) = self.pending.pop_front() {
            self.groups.push(group);
        }

        // Cancellations are observed before scheduling: sequences finish,
        // blocks free, and the handle gets its final notification.
        for i in 0..self.groups.len() {
            if !self.groups[i].has_finished() && self.groups[i].is_cancelled() {
                debug!(request_id = self.groups[i].request_id(), "request cancelled");
                self.scheduler.free_group(&self.groups[i]);
                self.groups[i].finish_all(FinishReason::Cancelled);
                self.groups[i].notify_handle();
            }
        }

        let output = self.scheduler.schedule(&mut self.groups)?;

        if !output.is_empty() {
            self.model.copy_blocks(&output.block_copies)?;
            let input = Self::build_model_input(&self.groups, &output)?;
            let logits = self.model.forward(&input)?;

            let expected_rows = input.num_sampling_rows();
            if expected_rows > 0 {
                let produced = logits.dim(0)?;
                if produced != expected_rows {
                    return Err(Error::InvariantViolation(format!(
                        "model produced {produced} logits rows, scheduler expected {expected_rows}"
                    )));
                }
                self.sample_scheduled(&output, &logits)?;
            }

            // Commit the iteration and stream the new tokens.
            for scheduled in &output.scheduled {
                let idx = self.group_index(scheduled.request_id)?;
                self.groups[idx].finish_iteration();
                self.groups[idx].notify_handle();
            }
        }

        Ok(self.reclaim_finished())
    }

    /// Feed each sampling group its logits rows and mirror any forks into
    /// the block manager before the iteration commits.
    fn sample_scheduled(&mut self, output: &ScheduleOutput, logits: &Tensor) -> Result<()> {
        let mut row = 0usize;
        for scheduled in &output.scheduled {
            let idx = self.group_index(scheduled.request_id)?;
            if !self.groups[idx].requires_sampling() {
                continue;
            }
            let seq_ids: Vec<SequenceId> = self.groups[idx]
                .running_sequences()
                .map(|s| s.seq_id())
                .collect();
            let mut rows = Vec::with_capacity(seq_ids.len());
            for seq_id in seq_ids {
                rows.push((seq_id, logits.i(row)?));
                row += 1;
            }
            self.sampler.sample(&mut self.groups[idx], &rows)?;
            for (parent, child) in self.groups[idx].take_pending_forks() {
                self.scheduler.block_manager_mut().fork(parent, child)?;
            }
        }
        Ok(())
    }

    /// Collect results of finished groups, close their streams and release
    /// their blocks.
    fn reclaim_finished(&mut self) -> Vec<GenerationResult> {
        let mut results = Vec::new();
        let mut i = 0;
        while i < self.groups.len() {
            if self.groups[i].has_finished() {
                self.scheduler.free_group(&self.groups[i]);
                let group = self.groups.remove(i);
                group.finish_generation_stream();
                self.live_requests.remove(&group.request_id());
                debug!(request_id = group.request_id(), "request finished");
                results.push(Self::result_from_group(&group));
            } else {
                i += 1;
            }
        }
        results
    }

    /// Run ticks until every request completes; results come back sorted
    /// by request ID regardless of completion order.
    ///
    /// Request IDs are assigned from the prompt index.
    pub fn generate(
        &mut self,
        prompts: Vec<Vec<TokenId>>,
        sampling_params: Vec<SamplingParams>,
    ) -> Result<Vec<GenerationResult>> {
        if prompts.len() != sampling_params.len() {
            return Err(Error::Config(
                "generate requires one SamplingParams per prompt".to_string(),
            ));
        }
        for (request_id, (prompt, params)) in
            prompts.into_iter().zip(sampling_params).enumerate()
        {
            self.add_request(request_id as RequestId, prompt, params)?;
        }

        let mut results = Vec::new();
        while self.has_unfinished_requests() {
            results.extend(self.step()?);
        }
        results.sort_by_key(|r| r.request_id);
        Ok(results)
    }

    fn group_index(&self, request_id: RequestId) -> Result<usize> {
        self.groups
            .iter()
            .position(|g| g.request_id() == request_id)
            .ok_or_else(|| {
                Error::InvariantViolation(format!("scheduled request {request_id} not found"))
            })
    }

    /// Flatten a tick's plan into the batch layout the model consumes.
    fn build_model_input(
        groups: &[SequenceGroup],
        output: &ScheduleOutput,
    ) -> Result<ModelInput> {
        let mut sequences = Vec::new();
        for scheduled in &output.scheduled {
            let group = groups
                .iter()
                .find(|g| g.request_id() == scheduled.request_id)
                .ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "scheduled request {} not found",
                        scheduled.request_id
                    ))
                })?;
            let sample = group.requires_sampling();
            for table in &scheduled.block_tables {
                let seq = group
                    .get_sequence(table.seq_id)
                    .ok_or(Error::SequenceNotFound(table.seq_id))?;
                let mut token_ids = Vec::with_capacity(scheduled.positions.len());
                for &position in &scheduled.positions {
                    token_ids.push(group.token_at(seq, position).ok_or_else(|| {
                        Error::InvariantViolation(format!(
                            "sequence {} has no token at position {position}",
                            table.seq_id
                        ))
                    })?);
                }
                sequences.push(SequenceInput {
                    request_id: scheduled.request_id,
                    seq_id: table.seq_id,
                    token_ids,
                    positions: scheduled.positions.clone(),
                    block_ids: table.block_ids.clone(),
                    sample,
                });
            }
        }
        Ok(ModelInput { sequences })
    }

    fn result_from_group(group: &SequenceGroup) -> GenerationResult {
        let finished = group.get_finished_sequences();
        GenerationResult {
            request_id: group.request_id(),
            generated_ids: finished.iter().map(|s| s.generated_ids().to_vec()).collect(),
            cumulative_log_prob: finished
                .first()
                .map(|s| s.cumulative_log_prob())
                .unwrap_or(0.0),
        }
    }
}
