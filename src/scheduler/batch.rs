//! Continuous batching scheduler.
//!
//! On every tick the scheduler decides which requests make progress, by how
//! many tokens, and which KV cache blocks are allocated or copied. The
//! output must exactly match the tensor layout the model step consumes.
//!
//! The tick is a single deterministic pass:
//!
//! 1. Freeze the live groups in FIFO order (by request ID).
//! 2. Running pass: groups that already hold cache content get their next
//!    chunk, preempting the most recently admitted requests when blocks run
//!    short (LIFO, so the oldest requests preserve progress).
//! 3. Waiting pass: not-yet-started groups are admitted FIFO with chunked
//!    prefill, bounded by the token budget and pool capacity.
//! 4. Emit the token plan, per-sequence block tables and copy map.

use std::collections::HashSet;

use tracing::debug;

use crate::config::{SchedulerConfig, SchedulerPolicy};
use crate::core::block::BlockId;
use crate::core::block_manager::{BlockManager, CopyOp};
use crate::core::sequence::{RequestId, SequenceGroup, SequenceId};
use crate::error::Result;

/// Block table of one running sequence within a scheduled group.
#[derive(Debug, Clone)]
pub struct SeqBlockTable {
    /// The sequence the table belongs to.
    pub seq_id: SequenceId,
    /// Physical block IDs in logical order, covering the scheduled span.
    pub block_ids: Vec<BlockId>,
}

/// One group's share of the current tick.
#[derive(Debug, Clone)]
pub struct ScheduledGroup {
    /// The request being advanced.
    pub request_id: RequestId,
    /// Tokens planned for this tick.
    pub num_tokens: usize,
    /// Absolute positions `[processed, processed + num_tokens)`.
    pub positions: Vec<usize>,
    /// Block tables of the group's running sequences.
    pub block_tables: Vec<SeqBlockTable>,
}

/// Output of a scheduling tick.
#[derive(Debug, Default)]
pub struct ScheduleOutput {
    /// Scheduled groups in emission order; the model's batch layout.
    pub scheduled: Vec<ScheduledGroup>,
    /// Copy-on-write block copies to perform before the model step.
    pub block_copies: Vec<CopyOp>,
    /// Requests preempted this tick, for observability.
    pub preempted_request_ids: Vec<RequestId>,
}

impl ScheduleOutput {
    /// Check if any group was scheduled.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Total tokens scheduled this tick.
    pub fn num_batched_tokens(&self) -> usize {
        self.scheduled.iter().map(|g| g.num_tokens).sum()
    }
}

/// Bookkeeping for a group admitted during the current tick, so a later
/// preemption can revert it.
struct Admitted {
    idx: usize,
    copies: Vec<CopyOp>,
    num_tokens: usize,
    num_seqs: usize,
}

/// Per-tick admission and token-budget allocation across groups.
pub struct Scheduler {
    config: SchedulerConfig,
    block_manager: BlockManager,
}

impl Scheduler {
    /// Create a scheduler and its block manager from the configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        let block_manager = BlockManager::new(config.num_kv_blocks, config.block_size);
        Self {
            config,
            block_manager,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get the block manager.
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Get the block manager, mutably.
    pub fn block_manager_mut(&mut self) -> &mut BlockManager {
        &mut self.block_manager
    }

    /// Release every block held by a group's sequences.
    pub fn free_group(&mut self, group: &SequenceGroup) {
        for seq in group.sequences() {
            self.block_manager.free(seq.seq_id());
        }
    }

    /// Produce the token plan for one tick.
    ///
    /// Deterministic given a fixed input order. Every group that is not
    /// scheduled ends the tick with zero scheduled tokens.
    pub fn schedule(&mut self, groups: &mut [SequenceGroup]) -> Result<ScheduleOutput> {
        // Freeze the live groups in FIFO order.
        let mut order: Vec<usize> = (0..groups.len())
            .filter(|&i| !groups[i].has_finished())
            .collect();
        order.sort_by_key(|&i| groups[i].request_id());

        let mut running: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&i| groups[i].max_content_len() > 0)
            .collect();
        let waiting: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&i| groups[i].max_content_len() == 0)
            .collect();

        // Policy orders prompt work against decode work inside the running
        // pass; the sort is stable, so FIFO holds within each class.
        match self.config.policy {
            SchedulerPolicy::PrefillFirst => running.sort_by_key(|&i| !groups[i].is_prefill()),
            SchedulerPolicy::DecodeFirst => running.sort_by_key(|&i| groups[i].is_prefill()),
        }

        let mut admitted: Vec<Admitted> = Vec::new();
        let mut preempted: HashSet<usize> = HashSet::new();
        let mut preempted_request_ids: Vec<RequestId> = Vec::new();
        let mut used_tokens = 0usize;
        let mut used_seqs = 0usize;
        let mut tick_ended = false;

        // Running pass.
        for pos in 0..running.len() {
            let idx = running[pos];
            if preempted.contains(&idx) {
                continue;
            }
            let budget = self.config.max_num_batched_tokens - used_tokens;
            if budget == 0 {
                break;
            }
            let num_seqs = groups[idx].num_running_seqs();
            if used_seqs + num_seqs > self.config.max_num_seqs {
                continue;
            }
            let want = groups[idx].num_available_tokens_for_batching().min(budget);

            // Make room: evict the most recently arrived running requests,
            // never one older than the group being scheduled.
            while !self.block_manager.can_append(&groups[idx], want) {
                let current_id = groups[idx].request_id();
                let victim = running
                    .iter()
                    .copied()
                    .filter(|v| !preempted.contains(v))
                    .filter(|&v| groups[v].request_id() > current_id)
                    .max_by_key(|&v| groups[v].request_id());
                match victim {
                    Some(victim_idx) => {
                        if let Some(apos) = admitted.iter().position(|a| a.idx == victim_idx) {
                            let reverted = admitted.remove(apos);
                            used_tokens -= reverted.num_tokens;
                            used_seqs -= reverted.num_seqs;
                        }
                        preempted_request_ids.push(groups[victim_idx].request_id());
                        preempted.insert(victim_idx);
                        self.preempt_group(&mut groups[victim_idx]);
                    }
                    None => {
                        // Nothing younger left to evict: the group itself
                        // restarts from its prompt and the tick ends.
                        preempted_request_ids.push(current_id);
                        preempted.insert(idx);
                        self.preempt_group(&mut groups[idx]);
                        tick_ended = true;
                        break;
                    }
                }
            }
            if tick_ended {
                break;
            }

            let copies = self.admit_group(&mut groups[idx], want)?;
            used_tokens += want;
            used_seqs += num_seqs;
            admitted.push(Admitted {
                idx,
                copies,
                num_tokens: want,
                num_seqs,
            });
        }

        // Waiting pass: FIFO admission with chunked prefill, no preemption.
        if !tick_ended {
            for &idx in &waiting {
                let budget = self.config.max_num_batched_tokens - used_tokens;
                if budget == 0 {
                    break;
                }
                let num_seqs = groups[idx].num_running_seqs();
                if used_seqs + num_seqs > self.config.max_num_seqs {
                    break;
                }
                let want = groups[idx].num_available_tokens_for_batching().min(budget);
                if !self.block_manager.can_append(&groups[idx], want) {
                    break;
                }
                let copies = self.admit_group(&mut groups[idx], want)?;
                used_tokens += want;
                used_seqs += num_seqs;
                admitted.push(Admitted {
                    idx,
                    copies,
                    num_tokens: want,
                    num_seqs,
                });
            }
        }

        // Emit.
        let mut output = ScheduleOutput {
            preempted_request_ids,
            ..Default::default()
        };
        for entry in admitted {
            let group = &groups[entry.idx];
            let start = group.num_processed_tokens();
            let num_tokens = group.num_scheduled_tokens();
            let block_tables = group
                .running_sequences()
                .map(|seq| SeqBlockTable {
                    seq_id: seq.seq_id(),
                    block_ids: self
                        .block_manager
                        .table(seq.seq_id())
                        .unwrap_or(&[])
                        .to_vec(),
                })
                .collect();
            output.block_copies.extend(entry.copies);
            output.scheduled.push(ScheduledGroup {
                request_id: group.request_id(),
                num_tokens,
                positions: (start..start + num_tokens).collect(),
                block_tables,
            });
        }

        debug_assert_eq!(
            self.block_manager.total_ref_count(),
            self.block_manager.total_table_slots(),
        );
        debug!(
            scheduled = output.scheduled.len(),
            tokens = output.num_batched_tokens(),
            copies = output.block_copies.len(),
            preempted = output.preempted_request_ids.len(),
            "tick planned"
        );

        Ok(output)
    }

    /// Commit `num_tokens` for a group and grow every running sequence's
    /// block table, collecting copy-on-write ops.
    fn admit_group(&mut self, group: &mut SequenceGroup, num_tokens: usize) -> Result<Vec<CopyOp>> {
        group.schedule_tokens(num_tokens);
        let context_len = group.num_processed_tokens();
        let seq_ids: Vec<SequenceId> = group.running_sequences().map(|s| s.seq_id()).collect();
        let mut copies = Vec::new();
        for seq_id in seq_ids {
            if let Some(op) = self.block_manager.append_slot(seq_id, context_len, num_tokens)? {
                copies.push(op);
            }
        }
        Ok(copies)
    }

    /// Free a group's blocks and rewind it to its prompt.
    ///
    /// The group re-enters through the waiting pass on a later tick and
    /// recomputes; its stream high-water marks keep the already-emitted
    /// tokens from being pushed twice.
    fn preempt_group(&mut self, group: &mut SequenceGroup) {
        debug!(request_id = group.request_id(), "preempting request");
        self.free_group(group);
        group.clear_scheduled_tokens();
        let processed = group.num_processed_tokens();
        group.preempt_tokens(processed);
    }
}
