//! Builds `Loop` nodes out of a captured body.
//!
//! `LoopAssembler` is a modal builder: entering nested mode flags subsequent node
//! creation (driven externally, by whatever calls `Runtime::add_node` while nested) as
//! "inside a loop body"; the caller hands the captured head/feed-in/feed-out/cond/tail
//! node lists to [`LoopAssembler::assemble`], which synthesizes the `Loop` node itself.
//! Assembled sub-nodes are appended to the arena in order: cond, heads, feed-in, feed-out,
//! tails — the caller is responsible for creating them in that order since the arena's
//! node ids are its only ordering record.

use crate::error::{EngineError, Result};
use crate::ir::{Access, Ir, LoopBody, Meta, NodeId, NodeKind};

/// Tracks `NESTED_MODE` depth and the configured nesting limit.
pub struct LoopAssembler {
    nesting: usize,
    limit: usize,
}

impl LoopAssembler {
    /// Builds an assembler honoring `limit` (`Config::loop_nested_limit`).
    pub fn new(limit: usize) -> Self {
        LoopAssembler { nesting: 0, limit }
    }

    /// Enters nested mode one level deeper. Errors once `limit` would be exceeded.
    pub fn enter_nested(&mut self) -> Result<()> {
        if self.nesting >= self.limit {
            return Err(EngineError::Configuration(format!(
                "loop nesting limit {} exceeded",
                self.limit
            )));
        }
        self.nesting += 1;
        Ok(())
    }

    /// Leaves one level of nested mode. A no-op at depth zero.
    pub fn exit_nested(&mut self) {
        self.nesting = self.nesting.saturating_sub(1);
    }

    /// Whether any loop body is currently being captured.
    pub fn is_nested(&self) -> bool {
        self.nesting > 0
    }

    /// Current nesting depth.
    pub fn nesting_depth(&self) -> usize {
        self.nesting
    }

    /// Synthesizes the `Loop` node from a captured body. `initial` pairs one-to-one with
    /// `feed_out`: inputs arrive paired as (initial, back) — the loop reads
    /// `initial[i]` on iteration 0 and `feed_out[i]` (the previous iteration's write) on
    /// every iteration after.
    pub fn assemble(
        &self,
        ir: &mut Ir,
        cond: NodeId,
        heads: Vec<NodeId>,
        feed_in: Vec<NodeId>,
        feed_out: Vec<NodeId>,
        tails: Vec<NodeId>,
        initial: Vec<NodeId>,
        meta: Meta,
    ) -> Result<NodeId> {
        if initial.len() != feed_out.len() {
            return Err(EngineError::Invariant(format!(
                "loop assembly: {} initial inputs paired against {} back-edges",
                initial.len(),
                feed_out.len()
            )));
        }

        let mut prev = Vec::with_capacity(initial.len() * 2);
        for (init, back) in initial.iter().zip(feed_out.iter()) {
            prev.push((*init, Access::Read));
            prev.push((*back, Access::Write));
        }

        let node_list: Vec<NodeId> = heads
            .iter()
            .chain(feed_in.iter())
            .chain(feed_out.iter())
            .chain(tails.iter())
            .copied()
            .collect();

        let body = LoopBody { node_list, cond, heads, feed_in, feed_out, tails, nesting: self.nesting };
        ir.push(NodeKind::Loop(body), meta, prev)
    }
}
