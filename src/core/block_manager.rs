//! Block manager for the paged KV cache.
//!
//! Maps each live sequence to an ordered list of physical block IDs and
//! implements copy-on-write fork, append-on-grow, release, and the
//! capacity check the scheduler gates admission on. The manager only
//! shuffles IDs; the tensors behind them belong to the model step.
//!
//! Two sequences of a forked group share a prefix of identical block IDs
//! (pool refcount > 1); the first block a sibling writes into is
//! copy-on-written and the resulting `CopyOp` is surfaced so the engine can
//! issue the physical copy before the model step.

use std::collections::HashMap;

use crate::core::block::{blocks_needed, BlockId, BlockPool};
use crate::core::sequence::{SequenceGroup, SequenceId};
use crate::error::Result;

/// A physical block copy the engine must perform before the model step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOp {
    /// Block to copy from (still owned by a sibling).
    pub src: BlockId,
    /// Freshly allocated block to copy into.
    pub dst: BlockId,
}

/// Manages per-sequence block tables over a fixed [`BlockPool`].
#[derive(Debug)]
pub struct BlockManager {
    pool: BlockPool,
    /// Ordered physical block IDs per live sequence.
    tables: HashMap<SequenceId, Vec<BlockId>>,
}

impl BlockManager {
    /// Create a manager over a fresh pool.
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            pool: BlockPool::new(num_blocks, block_size),
            tables: HashMap::new(),
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    /// Get the total number of blocks in the pool.
    pub fn num_blocks(&self) -> usize {
        self.pool.num_blocks()
    }

    /// Get the number of free blocks.
    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }

    /// Get a sequence's block table.
    pub fn table(&self, seq_id: SequenceId) -> Option<&[BlockId]> {
        self.tables.get(&seq_id).map(Vec::as_slice)
    }

    /// Sum of pool refcounts; equals the sum of table lengths when the
    /// manager is consistent.
    pub fn total_ref_count(&self) -> usize {
        self.pool.total_ref_count()
    }

    /// Sum of all table lengths.
    pub fn total_table_slots(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Grow a sequence's table to cover `n_new` tokens after `context_len`.
    ///
    /// Allocates whole blocks as needed. If the first written slot lands in
    /// a block shared with a sibling (refcount > 1), the block is
    /// copy-on-written: a fresh block replaces it in this sequence's table,
    /// the old ID is released, and the `CopyOp` is returned for the engine
    /// to apply before the model step. At most one copy per call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`](crate::Error::OutOfBlocks) if the
    /// pool runs dry; callers gate on [`BlockManager::can_append`], so
    /// this is an invariant violation rather than a recoverable state.
    pub fn append_slot(
        &mut self,
        seq_id: SequenceId,
        context_len: usize,
        n_new: usize,
    ) -> Result<Option<CopyOp>> {
        let block_size = self.pool.block_size();
        let table = self.tables.entry(seq_id).or_default();
        let mut copy = None;

        // First write lands inside the current tail block: copy-on-write
        // if a sibling still references it.
        if n_new > 0 && context_len % block_size != 0 {
            if let Some(tail_slot) = table.last_mut() {
                let tail = *tail_slot;
                if self.pool.ref_count(tail) > 1 {
                    let fresh = self.pool.allocate()?;
                    self.pool.release(tail);
                    *tail_slot = fresh;
                    copy = Some(CopyOp {
                        src: tail,
                        dst: fresh,
                    });
                }
            }
        }

        let target = blocks_needed(context_len + n_new, block_size);
        while table.len() < target {
            table.push(self.pool.allocate()?);
        }

        Ok(copy)
    }

    /// Duplicate `parent`'s table into `child`, retaining every block.
    ///
    /// No copy happens until one of the siblings writes.
    pub fn fork(&mut self, parent: SequenceId, child: SequenceId) -> Result<()> {
        let table = self
            .tables
            .get(&parent)
            .ok_or(crate::error::Error::SequenceNotFound(parent))?
            .clone();
        for &id in &table {
            self.pool.retain(id);
        }
        self.tables.insert(child, table);
        Ok(())
    }

    /// Release every block in a sequence's table and drop the entry.
    ///
    /// A no-op for sequences without a table, so freeing an already-freed
    /// or never-scheduled sequence is safe.
    pub fn free(&mut self, seq_id: SequenceId) {
        if let Some(table) = self.tables.remove(&seq_id) {
            for id in table {
                self.pool.release(id);
            }
        }
    }

    /// Check whether `n_new` tokens can be appended to every running
    /// sequence of `group` without exhausting the pool.
    ///
    /// Pessimistic: each running sibling about to write into a shared tail
    /// counts one fresh block for its copy-on-write split.
    pub fn can_append(&self, group: &SequenceGroup, n_new: usize) -> bool {
        let block_size = self.pool.block_size();
        let context_len = group.num_processed_tokens();
        let target = blocks_needed(context_len + n_new, block_size);

        let mut needed = 0usize;
        for seq in group.running_sequences() {
            let table = self.tables.get(&seq.seq_id());
            let table_len = table.map_or(0, |t| t.len());
            needed += target.saturating_sub(table_len);
            if n_new > 0 && context_len % block_size != 0 {
                if let Some(&tail) = table.and_then(|t| t.last()) {
                    if self.pool.ref_count(tail) > 1 {
                        needed += 1;
                    }
                }
            }
        }
        needed <= self.pool.free_count()
    }
}
