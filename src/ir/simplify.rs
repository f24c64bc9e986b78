//! Common-subexpression elimination on construction (hash-consing).
//!
//! Every node insertion goes through [`Simplifier::insert`], which keys on
//! `(concrete-type, inputs, operator-specific fields)` — in practice `Node::signature()`,
//! which already folds in all of those. If a structurally equal node exists, the new node
//! is discarded and the existing one is returned after merging `next` edges onto it. This
//! makes repeated construction of the same subexpression share both IR storage and,
//! later, cached blocks (two syntactically identical subgraphs hash to the same `Key`).

use std::collections::HashMap;

use super::{Access, Ir, Meta, Node, NodeId, NodeKind};
use crate::error::Result;

/// A hash-consing table over node signatures.
#[derive(Debug, Default)]
pub struct Simplifier {
    table: HashMap<String, NodeId>,
}

impl Simplifier {
    /// An empty table.
    pub fn new() -> Self {
        Simplifier { table: HashMap::new() }
    }

    /// Inserts a node into `ir`, returning the id actually stored: either the freshly
    /// created node, or a pre-existing structural duplicate with `next` edges merged in.
    pub fn insert(&mut self, ir: &mut Ir, kind: NodeKind, meta: Meta, prev: Vec<(NodeId, Access)>) -> Result<NodeId> {
        let probe = Node {
            id: NodeId(0),
            pattern: super::pattern_for(&kind),
            meta: meta.clone(),
            kind: kind.clone(),
            prev: prev.clone(),
            next: Vec::new(),
            ref_count: 0,
        };
        let sig = probe.signature();

        if let Some(&existing) = self.table.get(&sig) {
            // Structural duplicate: re-parent whatever `next` edges the caller's
            // predecessors would have gained onto the existing node instead.
            for (p, _) in &prev {
                let next = &mut ir.get_mut(*p).next;
                if !next.contains(&existing) {
                    next.push(existing);
                }
            }
            return Ok(existing);
        }

        let id = ir.push(kind, meta, prev)?;
        self.table.insert(sig, id);
        Ok(id)
    }

    /// Removes a node's signature from the hash-cons table, e.g. once it has been fully
    /// isolated (no edges, zero ref-count) and is eligible for GC. Future insertions with
    /// the same signature will create a fresh node rather than reusing the dropped one.
    pub fn drop(&mut self, ir: &Ir, id: NodeId) {
        let sig = ir.get(id).signature();
        if self.table.get(&sig) == Some(&id) {
            self.table.remove(&sig);
        }
    }

    /// Number of distinct signatures currently tracked.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Coord, DataType, LocalOp, MemOrder, NumDim};

    fn meta() -> Meta {
        Meta {
            data_size: 0,
            data_type: DataType::F32,
            mem_order: MemOrder::RowMajor,
            block_size: Coord::new(&[8, 8]),
            num_dim: NumDim::D2,
        }
    }

    #[test]
    fn structural_duplicates_share_one_node() {
        let mut ir = Ir::new();
        let mut simp = Simplifier::new();
        let a = simp.insert(&mut ir, NodeKind::Input, meta(), vec![]).unwrap();
        let b = simp.insert(&mut ir, NodeKind::Input, meta(), vec![]).unwrap();
        // Two distinct `Input` leaves both signature identically (no predecessors to
        // distinguish them), so the second insertion is folded onto the first.
        assert_eq!(a, b);
        assert_eq!(ir.len(), 1);
    }

    #[test]
    fn distinct_operators_are_not_merged() {
        let mut ir = Ir::new();
        let mut simp = Simplifier::new();
        let a = simp.insert(&mut ir, NodeKind::Input, meta(), vec![]).unwrap();
        let add = simp
            .insert(&mut ir, NodeKind::Local(LocalOp::Add), meta(), vec![(a, Access::Read)])
            .unwrap();
        let neg = simp
            .insert(&mut ir, NodeKind::Local(LocalOp::Neg), meta(), vec![(a, Access::Read)])
            .unwrap();
        assert_ne!(add, neg);
    }

    #[test]
    fn re_insertion_merges_next_edges() {
        let mut ir = Ir::new();
        let mut simp = Simplifier::new();
        let a = simp.insert(&mut ir, NodeKind::Input, meta(), vec![]).unwrap();
        let b = simp.insert(&mut ir, NodeKind::Input, meta(), vec![]).unwrap();
        assert_eq!(a, b);
        let add1 = simp
            .insert(&mut ir, NodeKind::Local(LocalOp::Add), meta(), vec![(a, Access::Read)])
            .unwrap();
        let add2 = simp
            .insert(&mut ir, NodeKind::Local(LocalOp::Add), meta(), vec![(a, Access::Read)])
            .unwrap();
        assert_eq!(add1, add2);
        assert_eq!(ir.get(a).next().iter().filter(|n| **n == add1).count(), 1);
    }
}
