//! Per-request generation stream and its caller-side handle.
//!
//! One producer (the engine thread, during `notify_handle`) and one
//! consumer (the caller holding the [`GenerationHandle`]) exchange
//! per-iteration snapshots over a lock-free queue. Iterations arrive in
//! strict FIFO order and are never dropped; after `finish()` the handle can
//! still drain what is buffered before it observes the finished state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::core::sequence::{LogProb, SequenceId, TokenId};

/// Value snapshot of one sequence after one iteration.
///
/// No shared mutable sequence state crosses the thread boundary; the
/// handle reconstructs token lists from these snapshots alone.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOutput {
    /// Sequence this one was forked from, if any.
    pub parent_id: Option<SequenceId>,
    /// Newest generated token.
    pub token_id: TokenId,
    /// Cumulative log-probability after this token.
    pub cumulative_log_prob: LogProb,
}

/// Outputs of one iteration, keyed by sequence ID.
///
/// Ordered map so a forked child (larger ID) is replayed after its parent
/// within the same iteration.
pub type IterationOutputs = BTreeMap<SequenceId, SequenceOutput>;

/// Reconstructed result for one sequence, drained from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    /// Generated token IDs in emission order.
    pub generated_ids: Vec<TokenId>,
    /// Cumulative log-probability of the sequence.
    pub cumulative_log_prob: LogProb,
}

/// Single-producer/single-consumer handoff of per-iteration outputs.
#[derive(Debug)]
pub struct GenerationStream {
    queue: SegQueue<IterationOutputs>,
    finished: AtomicBool,
    cancelled: AtomicBool,
}

impl GenerationStream {
    /// Create an open, empty stream.
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Push one iteration's outputs.
    pub fn push(&self, outputs: IterationOutputs) {
        self.queue.push(outputs);
    }

    /// Mark the stream finished. Buffered iterations stay readable.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Request cancellation; the engine observes it at its next tick.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Check whether an iteration is ready to read.
    pub fn can_read(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Check whether the stream is finished and fully drained.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst) && self.queue.is_empty()
    }

    /// Read one iteration's outputs, oldest first. Non-blocking.
    pub fn read_one(&self) -> Option<IterationOutputs> {
        self.queue.pop()
    }

    /// Drain the stream and reconstruct per-sequence results.
    ///
    /// When a forked child first appears, it inherits a copy of its
    /// parent's tokens reconstructed so far, then diverges. Results come
    /// back in sequence-ID order.
    pub fn read_all(&self) -> Vec<RawResult> {
        let mut results: BTreeMap<SequenceId, RawResult> = BTreeMap::new();
        while let Some(iteration) = self.queue.pop() {
            // Seed new sequences from the parent's pre-iteration state; a
            // fork's prefix excludes the token the parent gains this
            // iteration.
            for (seq_id, output) in &iteration {
                if !results.contains_key(seq_id) {
                    let inherited = output
                        .parent_id
                        .and_then(|pid| results.get(&pid))
                        .map(|parent| parent.generated_ids.clone())
                        .unwrap_or_default();
                    results.insert(
                        *seq_id,
                        RawResult {
                            generated_ids: inherited,
                            cumulative_log_prob: 0.0,
                        },
                    );
                }
            }
            for (seq_id, output) in iteration {
                if let Some(entry) = results.get_mut(&seq_id) {
                    entry.generated_ids.push(output.token_id);
                    entry.cumulative_log_prob = output.cumulative_log_prob;
                }
            }
        }
        results.into_values().collect()
    }
}

impl Default for GenerationStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-side handle to one request's generation stream.
#[derive(Debug, Clone)]
pub struct GenerationHandle {
    stream: Arc<GenerationStream>,
}

impl GenerationHandle {
    /// Wrap a shared stream.
    pub fn new(stream: Arc<GenerationStream>) -> Self {
        Self { stream }
    }

    /// Check whether generation is finished and the stream drained.
    pub fn finished(&self) -> bool {
        self.stream.is_finished()
    }

    /// Check whether an iteration is ready to read.
    pub fn can_read(&self) -> bool {
        self.stream.can_read()
    }

    /// Read one iteration's outputs. Non-blocking.
    pub fn read(&self) -> Option<IterationOutputs> {
        self.stream.read_one()
    }

    /// Drain all buffered iterations into per-sequence results.
    pub fn read_all(&self) -> Vec<RawResult> {
        self.stream.read_all()
    }

    /// Cancel the request; the engine finishes it on its next tick.
    pub fn cancel(&self) {
        self.stream.cancel();
    }
}
