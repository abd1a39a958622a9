//! Sequence and sequence-group state for inference requests.
//!
//! A [`SequenceGroup`] holds everything the scheduler needs to know about a
//! single user request: the shared prompt, its sampling parameters, and one
//! or more [`Sequence`]s (more than one after a beam-search or
//! parallel-sampling fork). Sequences are owned exclusively by their group;
//! the generation stream only ever sees value snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::SamplingParams;
use crate::core::block::blocks_needed;
use crate::core::stream::{GenerationHandle, GenerationStream, IterationOutputs, SequenceOutput};
use crate::error::{Error, Result};

/// Token identifier.
pub type TokenId = i64;

/// Log-probability of a sampled token.
pub type LogProb = f32;

/// Request identifier, assigned by the caller.
pub type RequestId = u64;

/// Unique identifier for a sequence. Never 0.
pub type SequenceId = u64;

/// Per-engine monotonic sequence-ID counter.
///
/// IDs start at 1; 0 is reserved as the "no parent" sentinel on the wire.
/// Cloning shares the counter, so every group of one engine draws from the
/// same ID space.
#[derive(Debug, Clone)]
pub struct SequenceIdGen(Arc<AtomicU64>);

impl SequenceIdGen {
    /// Create a fresh counter starting at 1.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    /// Draw the next sequence ID.
    pub fn next_id(&self) -> SequenceId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Status of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    /// Participating in scheduling and generation.
    Running,
    /// Generation complete; tokens and log-prob are frozen.
    Finished,
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Maximum token limit reached.
    MaxTokens,
    /// A configured stop token was generated.
    StopToken,
    /// Cancelled through the request handle.
    Cancelled,
}

/// A single hypothesis within a request.
///
/// Tracks the tokens generated after the prompt, their cumulative
/// log-probability, and the fork lineage. The prompt itself is stored once
/// at the group level.
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Unique sequence identifier.
    seq_id: SequenceId,
    /// Sequence this one was forked from, if any.
    parent_id: Option<SequenceId>,
    /// Generated token IDs (after the prompt).
    generated_ids: Vec<TokenId>,
    /// Sum of log-probs of the generated tokens.
    cumulative_log_prob: LogProb,
    /// Current status.
    status: SequenceStatus,
    /// Reason for finishing (if finished).
    finish_reason: Option<FinishReason>,
    /// High-water mark of tokens already pushed to the stream.
    ///
    /// Never rewound, not even by [`Sequence::remove_tokens`]: recomputed
    /// tokens after a preemption are only streamed once they grow past it.
    num_streamed: usize,
}

impl Sequence {
    /// Create a primary sequence (no parent).
    pub fn new(seq_id: SequenceId) -> Self {
        Self {
            seq_id,
            parent_id: None,
            generated_ids: Vec::new(),
            cumulative_log_prob: 0.0,
            status: SequenceStatus::Running,
            finish_reason: None,
            num_streamed: 0,
        }
    }

    /// Fork a child from `parent`, sharing its generated prefix.
    pub fn fork(parent: &Sequence, seq_id: SequenceId) -> Self {
        assert_ne!(seq_id, parent.seq_id);
        Self {
            seq_id,
            parent_id: Some(parent.seq_id),
            generated_ids: parent.generated_ids.clone(),
            cumulative_log_prob: parent.cumulative_log_prob,
            status: parent.status,
            finish_reason: parent.finish_reason,
            num_streamed: parent.num_streamed,
        }
    }

    /// Get the sequence ID.
    pub fn seq_id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the parent sequence ID, if forked.
    pub fn parent_id(&self) -> Option<SequenceId> {
        self.parent_id
    }

    /// Get the generated token IDs.
    pub fn generated_ids(&self) -> &[TokenId] {
        &self.generated_ids
    }

    /// Number of generated tokens.
    pub fn generated_len(&self) -> usize {
        self.generated_ids.len()
    }

    /// Get the cumulative log-probability.
    pub fn cumulative_log_prob(&self) -> LogProb {
        self.cumulative_log_prob
    }

    /// Get the current status.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Check whether the sequence is still running.
    pub fn is_running(&self) -> bool {
        self.status == SequenceStatus::Running
    }

    /// Check whether the sequence has finished.
    pub fn has_finished(&self) -> bool {
        self.status == SequenceStatus::Finished
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Get the most recently generated token.
    pub fn last_token_id(&self) -> Option<TokenId> {
        self.generated_ids.last().copied()
    }

    /// Append a generated token and accumulate its log-prob.
    ///
    /// Only valid while the sequence is running; a finished sequence is
    /// frozen.
    pub fn append_token(&mut self, token_id: TokenId, log_prob: LogProb) {
        assert!(self.is_running(), "append to finished sequence {}", self.seq_id);
        self.cumulative_log_prob += log_prob;
        self.generated_ids.push(token_id);
    }

    /// Trim the last `count` generated tokens.
    ///
    /// Used on preemption so that recomputation does not re-emit tokens the
    /// stream has already carried.
    pub fn remove_tokens(&mut self, count: usize) {
        assert!(self.generated_ids.len() >= count);
        self.generated_ids.truncate(self.generated_ids.len() - count);
    }

    /// Mark the sequence as finished.
    pub fn finish(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }

    /// Beam-search score: `cumulative_log_prob / generated_len^length_penalty`.
    pub fn beam_search_score(&self, length_penalty: f32) -> f32 {
        let length = self.generated_ids.len().max(1) as f32;
        self.cumulative_log_prob / length.powf(length_penalty)
    }

    /// Number of tokens already pushed to the stream.
    pub fn num_streamed(&self) -> usize {
        self.num_streamed
    }

    /// Snapshot the newest token for the stream, if any grew past the
    /// streamed high-water mark since the last notify.
    fn next_stream_output(&mut self) -> Option<SequenceOutput> {
        if self.generated_ids.len() <= self.num_streamed {
            return None;
        }
        self.num_streamed = self.generated_ids.len();
        Some(SequenceOutput {
            parent_id: self.parent_id,
            token_id: *self.generated_ids.last()?,
            cumulative_log_prob: self.cumulative_log_prob,
        })
    }
}

/// One group per user request.
///
/// Holds the shared prompt, the sampling parameters, the sequence arena and
/// the three scheduling counters:
///
/// - `num_processed_tokens`: tokens whose KV has been materialized;
/// - `num_scheduled_tokens`: tokens planned for the current tick, 0 outside
///   a scheduling phase;
/// - `max_content_len`: high-water mark of processed length across
///   preemptions.
///
/// The group is *in prefill* while `max_content_len < prompt_len`,
/// otherwise *in decode*.
#[derive(Debug)]
pub struct SequenceGroup {
    request_id: RequestId,
    prompt_ids: Vec<TokenId>,
    sampling_params: SamplingParams,
    block_size: usize,
    sequences: Vec<Sequence>,
    stream: Arc<GenerationStream>,
    id_gen: SequenceIdGen,
    num_processed_tokens: usize,
    num_scheduled_tokens: usize,
    max_content_len: usize,
    /// Forks recorded by the sampler this tick; the engine mirrors them
    /// into the block manager before committing the iteration.
    pending_forks: Vec<(SequenceId, SequenceId)>,
}

impl SequenceGroup {
    /// Create a group with one primary running sequence.
    pub fn new(
        request_id: RequestId,
        prompt_ids: Vec<TokenId>,
        sampling_params: SamplingParams,
        block_size: usize,
        id_gen: SequenceIdGen,
    ) -> Self {
        let primary = Sequence::new(id_gen.next_id());
        Self {
            request_id,
            prompt_ids,
            sampling_params,
            block_size,
            sequences: vec![primary],
            stream: Arc::new(GenerationStream::new()),
            id_gen,
            num_processed_tokens: 0,
            num_scheduled_tokens: 0,
            max_content_len: 0,
            pending_forks: Vec::new(),
        }
    }

    // ========== Accessors ==========

    /// Get the request ID.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_ids(&self) -> &[TokenId] {
        &self.prompt_ids
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    /// Get the sampling parameters.
    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling_params
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// All sequences in the group, finished ones included.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// Get a sequence by ID.
    pub fn get_sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.seq_id() == seq_id)
    }

    /// Get a sequence by ID, mutably.
    pub fn get_sequence_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|s| s.seq_id() == seq_id)
    }

    /// Iterate over running sequences.
    pub fn running_sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(|s| s.is_running())
    }

    /// Number of sequences in the group.
    pub fn num_total_seqs(&self) -> usize {
        self.sequences.len()
    }

    /// Number of running sequences.
    pub fn num_running_seqs(&self) -> usize {
        self.running_sequences().count()
    }

    /// Check whether every sequence has finished.
    pub fn has_finished(&self) -> bool {
        self.sequences.iter().all(|s| s.has_finished())
    }

    /// Finished sequences ordered by descending beam-search score.
    pub fn get_finished_sequences(&self) -> Vec<&Sequence> {
        let length_penalty = self.sampling_params.length_penalty;
        let mut finished: Vec<&Sequence> =
            self.sequences.iter().filter(|s| s.has_finished()).collect();
        finished.sort_by(|a, b| {
            b.beam_search_score(length_penalty)
                .partial_cmp(&a.beam_search_score(length_penalty))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq_id().cmp(&b.seq_id()))
        });
        finished
    }

    // ========== Scheduling counters ==========

    /// Tokens whose KV has been materialized.
    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    /// Tokens planned for the current tick.
    pub fn num_scheduled_tokens(&self) -> usize {
        self.num_scheduled_tokens
    }

    /// High-water mark of processed length across preemptions.
    pub fn max_content_len(&self) -> usize {
        self.max_content_len
    }

    /// Context length including tokens scheduled this tick.
    pub fn context_len(&self) -> usize {
        self.num_processed_tokens + self.num_scheduled_tokens
    }

    /// Check whether the group is still processing its prompt.
    pub fn is_prefill(&self) -> bool {
        self.max_content_len < self.prompt_len()
    }

    /// Check whether the group has tokens scheduled this tick.
    pub fn is_scheduled(&self) -> bool {
        self.num_scheduled_tokens > 0
    }

    /// The current tick's positions reach past the prompt, so the model
    /// must produce logits rows for this group.
    pub fn requires_sampling(&self) -> bool {
        self.context_len() >= self.prompt_len()
    }

    /// Number of logical blocks covering the scheduled context.
    pub fn num_logical_blocks(&self) -> usize {
        blocks_needed(self.context_len(), self.block_size)
    }

    /// Tokens this group could consume from the batch budget.
    ///
    /// An unfinished group always has at least one token to process.
    pub fn num_available_tokens_for_batching(&self) -> usize {
        debug_assert!(!self.has_finished());
        debug_assert_eq!(self.num_scheduled_tokens, 0);
        let content = self.prompt_len().max(self.max_content_len);
        content.saturating_sub(self.num_processed_tokens).max(1)
    }

    /// Plan `num_tokens` for the current tick.
    pub fn schedule_tokens(&mut self, num_tokens: usize) {
        self.num_scheduled_tokens = num_tokens;
    }

    /// Drop the current tick's plan without committing it.
    pub fn clear_scheduled_tokens(&mut self) {
        self.num_scheduled_tokens = 0;
    }

    /// Commit the current tick: scheduled tokens become processed tokens
    /// and the content high-water mark rises monotonically.
    pub fn finish_iteration(&mut self) {
        self.num_processed_tokens += self.num_scheduled_tokens;
        self.max_content_len = self.max_content_len.max(self.num_processed_tokens);
        self.num_scheduled_tokens = 0;
    }

    /// Rewind `count` tokens for preemption.
    ///
    /// Rolls back both `num_processed_tokens` and `max_content_len`, and
    /// trims each sequence's generated tail by `min(count, generated_len)`.
    /// The streamed high-water marks are untouched: once re-admitted, the
    /// group recomputes from its prompt and only streams past what the
    /// handle has already observed.
    pub fn preempt_tokens(&mut self, count: usize) {
        assert!(count <= self.num_processed_tokens);
        assert!(count <= self.max_content_len);
        self.num_processed_tokens -= count;
        self.max_content_len -= count;
        for seq in &mut self.sequences {
            seq.remove_tokens(count.min(seq.generated_len()));
        }
    }

    // ========== Token addressing ==========

    /// Input token for `seq` at an absolute position.
    ///
    /// Positions below the prompt length address the shared prompt; later
    /// positions address the sequence's generated tail.
    pub fn token_at(&self, seq: &Sequence, position: usize) -> Option<TokenId> {
        if position < self.prompt_ids.len() {
            self.prompt_ids.get(position).copied()
        } else {
            seq.generated_ids().get(position - self.prompt_ids.len()).copied()
        }
    }

    // ========== Forking ==========

    /// Fork a child from the sequence `parent_id`.
    ///
    /// The child shares the parent's generated prefix; the block manager
    /// must be forked in lockstep, which the engine does by draining
    /// [`SequenceGroup::take_pending_forks`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::SequenceNotFound`] if `parent_id` is not in the
    /// group.
    pub fn fork_sequence(&mut self, parent_id: SequenceId) -> Result<SequenceId> {
        let child_id = self.id_gen.next_id();
        let parent = self
            .get_sequence(parent_id)
            .ok_or(Error::SequenceNotFound(parent_id))?;
        let child = Sequence::fork(parent, child_id);
        self.sequences.push(child);
        self.pending_forks.push((parent_id, child_id));
        Ok(child_id)
    }

    /// Drain the `(parent, child)` pairs forked since the last call.
    pub fn take_pending_forks(&mut self) -> Vec<(SequenceId, SequenceId)> {
        std::mem::take(&mut self.pending_forks)
    }

    // ========== Lifecycle ==========

    /// Finish every running sequence.
    pub fn finish_all(&mut self, reason: FinishReason) {
        for seq in &mut self.sequences {
            if seq.is_running() {
                seq.finish(reason);
            }
        }
    }

    /// Get a handle for the caller side of the generation stream.
    pub fn handle(&self) -> GenerationHandle {
        GenerationHandle::new(self.stream.clone())
    }

    /// Check whether the handle cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.stream.is_cancelled()
    }

    /// Push one iteration's snapshots for every sequence that grew past
    /// its streamed high-water mark since the last notify.
    pub fn notify_handle(&mut self) {
        let mut outputs = IterationOutputs::new();
        for seq in &mut self.sequences {
            let seq_id = seq.seq_id();
            if let Some(output) = seq.next_stream_output() {
                outputs.insert(seq_id, output);
            }
        }
        if !outputs.is_empty() {
            self.stream.push(outputs);
        }
    }

    /// Close the generation stream; the handle drains what is buffered and
    /// then observes `finished`.
    pub fn finish_generation_stream(&self) {
        self.stream.finish();
    }
}
