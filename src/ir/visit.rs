//! Double-dispatch visitors over `Node`.
//!
//! `Node::accept` routes to the single `Visitor::visit` entry point, which matches on
//! `NodeKind` itself — the closed tagged-variant set stands in for the original
//! implementation's per-subtype `dynamic_cast` dispatch, so adding a visitor here never
//! requires touching `Node` itself.

use super::{DataSize, Node, NodeKind, NumDim};

/// A visitor over `Node`, producing some `Output` per node.
pub trait Visitor {
    /// The value produced per visited node.
    type Output;

    /// Inspects `node` and produces this visitor's result for it.
    fn visit(&mut self, node: &Node) -> Self::Output;
}

/// Estimates a node's output `DataSize` ahead of execution, so the `Program` can presize
/// `Version` buffer-allocation requests without waiting for a real compute pass.
///
/// Grounded on the original implementation's `Predictor` visitor, which walks the DAG
/// once per evaluation to presize device buffers before any kernel runs.
#[derive(Debug, Default)]
pub struct Predictor;

impl Predictor {
    /// A fresh predictor.
    pub fn new() -> Self {
        Predictor
    }

    /// Number of elements in one block, derived from `block_size` and `num_dim`.
    fn elements_per_block(node: &Node) -> u64 {
        let meta = node.meta();
        if matches!(meta.num_dim, NumDim::D0) {
            return 1;
        }
        meta.block_size
            .0
            .iter()
            .take(meta.num_dim.to_usize().max(1))
            .map(|d| (*d).max(1) as u64)
            .product()
    }
}

impl Visitor for Predictor {
    type Output = DataSize;

    fn visit(&mut self, node: &Node) -> DataSize {
        let elem_size = node.meta().data_type.size_of() as u64;
        match node.kind() {
            // Reductions always produce exactly one element's worth of output,
            // regardless of the input block footprint.
            NodeKind::Zonal { .. } | NodeKind::Stats { .. } => elem_size,
            NodeKind::FocalZonal { .. } => elem_size,
            _ => Self::elements_per_block(node) * elem_size,
        }
    }
}
