//! The DAG intermediate representation.
//!
//! A user program is an expression graph of [`Node`]s. Each `Node` carries a stable,
//! monotonically assigned [`NodeId`], a [`Pattern`] bitmask describing its access/producer
//! shape, block metadata ([`Meta`]), an order-significant predecessor list and a next
//! (consumer) list forming the back-edge of each predecessor relationship, and a reference
//! count tracking external handles held by the user.
//!
//! # Invariants
//!
//! - `prev.next` contains `this` iff `this.prev` contains `prev` (bidirectional edge).
//! - Fused cluster membership respects pattern compatibility (`crate::fusion`).
//! - `BlockSize` is uniform across a fused cluster unless connected by `BARRIER`.
//! - Node ids are unique per evaluation.
//!
//! Nodes live in an [`Ir`] arena indexed by `NodeId`; a `Loop` node's body is simply a
//! sub-range of the same arena referenced by index, so cyclic back-edges never require
//! cycle-aware ownership (see DESIGN.md for the rationale).

pub mod simplify;
pub mod visit;

use std::fmt;

use smallvec::SmallVec;

use crate::error::{EngineError, Result};

/// A tiny macro generating a `u16` bitmask newtype with named flag constants, `+`
/// (union), `is`/`is_not` (membership test) and a minimal `Debug` impl listing set flags.
/// Replaces a `bitflags`-crate dependency the teacher does not carry for this shape of
/// value; the vocabulary is small and fixed.
macro_rules! bitmask {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $($flag:ident = $val:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name($repr);

        impl $name {
            $(
                #[allow(non_upper_case_globals)]
                pub const $flag: $name = $name($val);
            )*

            /// The empty mask.
            pub const NONE: $name = $name(0);

            /// True iff every bit of `other` is set in `self`.
            pub fn is(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// True iff `self` shares no bit with `other`.
            pub fn is_not(self, other: $name) -> bool {
                self.0 & other.0 == 0
            }

            /// Raw bit value, for hashing/signature purposes.
            pub fn bits(self) -> $repr {
                self.0
            }
        }

        impl std::ops::Add for $name {
            type Output = $name;
            fn add(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut first = true;
                write!(f, "{}(", stringify!($name))?;
                $(
                    if self.is($name::$flag) {
                        if !first { write!(f, "|")?; }
                        write!(f, stringify!($flag))?;
                        first = false;
                    }
                )*
                if first { write!(f, "NONE")?; }
                write!(f, ")")
            }
        }
    };
}

/// Stable per-evaluation identifier of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// An integer coordinate into a node's block grid, or a loop-back offset. Dimensionality
/// is bounded at 3 in practice (map-algebra rasters); stored inline to avoid heap traffic
/// on the hot `Key` hashing path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Coord(pub SmallVec<[i32; 3]>);

impl Coord {
    /// Builds a coordinate from components.
    pub fn new(components: &[i32]) -> Self {
        Coord(SmallVec::from_slice(components))
    }

    /// Number of dimensions carried by this coordinate.
    pub fn dims(&self) -> usize {
        self.0.len()
    }

    /// Component-wise sum of absolute values (Manhattan norm), used by `RADIAL` tasks to
    /// rank coordinates by distance from the scan origin.
    pub fn manhattan(&self) -> i64 {
        self.0.iter().map(|v| (*v as i64).abs()).sum()
    }

    /// Component-wise addition.
    pub fn add(&self, other: &Coord) -> Coord {
        Coord(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| a + b)
                .collect(),
        )
    }

    /// Component-wise subtraction.
    pub fn sub(&self, other: &Coord) -> Coord {
        Coord(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| a - b)
                .collect(),
        )
    }

    /// Whether every component lies within `[0, bound.0)` for the matching dimension.
    pub fn in_bounds(&self, bound: &Coord) -> bool {
        self.0.iter().zip(bound.0.iter()).all(|(c, b)| *c >= 0 && c < b)
    }

    /// True when every component is zero.
    pub fn is_origin(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, ")")
    }
}

/// The block edge length along each dimension, shared by every member of a fused cluster
/// unless two clusters are joined by a `BARRIER`.
pub type BlockSize = Coord;

/// Number of dimensions a node's blocks span: `D0` is a reduced scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumDim {
    /// Scalar (reduced) value, carries no spatial grid.
    D0,
    /// One-dimensional array.
    D1,
    /// Two-dimensional raster (the common case).
    D2,
    /// Three-dimensional volume.
    D3,
}

impl NumDim {
    /// Integer dimensionality, matching the original `numdim().toInt()` helper.
    pub fn to_usize(self) -> usize {
        match self {
            NumDim::D0 => 0,
            NumDim::D1 => 1,
            NumDim::D2 => 2,
            NumDim::D3 => 3,
        }
    }
}

/// Element scalar type carried by a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 32-bit IEEE float.
    F32,
    /// 64-bit IEEE float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// Single byte, used for masks.
    U8,
    /// Boolean mask element.
    Bool,
}

impl DataType {
    /// Size in bytes of one element, used to size device buffers and file spills.
    pub fn size_of(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::U8 | DataType::Bool => 1,
        }
    }
}

/// Memory layout of a block's element stream, also the spill-file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemOrder {
    /// Row-major (C order).
    RowMajor,
    /// Column-major (Fortran order).
    ColMajor,
    /// Blocked/tiled order, used by some focal skeletons to keep halo reads contiguous.
    Blocked,
}

/// Byte size of one block's data, as tracked by metadata and estimated by
/// [`visit::Predictor`] ahead of execution.
pub type DataSize = u64;

/// Static metadata carried by every `Node`.
#[derive(Debug, Clone)]
pub struct Meta {
    /// Estimated or exact size, in bytes, of one block of this node's output.
    pub data_size: DataSize,
    /// Element scalar type.
    pub data_type: DataType,
    /// Element layout.
    pub mem_order: MemOrder,
    /// Block edge length per dimension.
    pub block_size: BlockSize,
    /// Dimensionality of this node's output.
    pub num_dim: NumDim,
}

impl Meta {
    /// Number of blocks along each dimension needed to cover `extent`.
    pub fn numblock(&self, extent: &Coord) -> Coord {
        Coord(
            extent
                .0
                .iter()
                .zip(self.block_size.0.iter())
                .map(|(e, b)| (e + b - 1) / b.max(&1))
                .collect(),
        )
    }
}

bitmask! {
    /// Access/producer-shape bitmask of a `Node`, drawn from the fixed vocabulary named
    /// by the IR's operator vocabulary. Supports union via `+` (`BitOr`) and membership tests via
    /// [`Pattern::is`] / [`Pattern::is_not`].
    ///
    /// `MERGE`/`SWITCH` complete the named vocabulary but no `NodeKind` currently
    /// produces them: this engine drives `LOOP` iteration directly through
    /// `Task::cycling_input`/`cycling_output` rather than through merge/switch
    /// control-flow nodes.
    pub struct Pattern: u16 {
        FREE    = 0b0000_0000_0001;
        LOCAL   = 0b0000_0000_0010;
        FOCAL   = 0b0000_0000_0100;
        ZONAL   = 0b0000_0000_1000;
        RADIAL  = 0b0000_0001_0000;
        SPREAD  = 0b0000_0010_0000;
        STATS   = 0b0000_0100_0000;
        MERGE   = 0b0000_1000_0000;
        SWITCH  = 0b0001_0000_0000;
        HEAD    = 0b0010_0000_0000;
        TAIL    = 0b0100_0000_0000;
        LOOP    = 0b1000_0000_0000;
        BARRIER = 0b1_0000_0000_0000;
    }
}

/// Whether a predecessor edge is a plain value read or an in-place overwrite of the
/// predecessor's own carried state. A `Loop` node's second input of each paired
/// (initial, back) entry — the `feed_out` edge — is tagged `Write`: it is the value that
/// gets overwritten every iteration, as opposed to `initial`'s one-time `Read`. Nothing
/// else in this engine currently produces a `Write` edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Ordinary value read.
    Read,
    /// Assignment target / in-place write.
    Write,
}

/// A reduction operator used by `Zonal`, `FocalZonal`, and `Stats` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum of all elements.
    Sum,
    /// Arithmetic mean.
    Mean,
    /// Minimum element.
    Min,
    /// Maximum element.
    Max,
    /// Logical AND-reduce (used for mask "all true" queries).
    All,
    /// Logical OR-reduce.
    Any,
}

/// A halo offset set read by a `FOCAL` node beyond its core tile, e.g. a 3x3 stencil's
/// nine `Coord` offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Halo(pub Vec<Coord>);

impl Halo {
    /// A square stencil of `radius` cells in every direction (a `(2r+1)^dims` footprint).
    pub fn square(radius: i32, dims: usize) -> Self {
        let mut offsets = Vec::new();
        match dims {
            1 => {
                for dx in -radius..=radius {
                    offsets.push(Coord::new(&[dx]));
                }
            }
            2 => {
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        offsets.push(Coord::new(&[dx, dy]));
                    }
                }
            }
            _ => {
                for dz in -radius..=radius {
                    for dy in -radius..=radius {
                        for dx in -radius..=radius {
                            offsets.push(Coord::new(&[dx, dy, dz]));
                        }
                    }
                }
            }
        }
        Halo(offsets)
    }
}

/// A unary or binary elementwise operator carried by a `Local` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
    /// Unary negation.
    Neg,
    /// Elementwise `a < b` boolean mask.
    Less,
    /// Conditional select `cond ? a : b`.
    Select,
    /// Identity passthrough; `Cache::forward` uses this to swap buffers instead of copying.
    Identity,
}

/// The closed set of IR operator subtypes (tagged-variant style per the crate-level
/// design notes: dynamic-cast dispatch is replaced by a tagged enum plus visitor).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A leaf that reads externally supplied block data.
    Input,
    /// A compile-time scalar constant, bit-pattern encoded.
    Constant(u64),
    /// Elementwise map/zip over one or two inputs.
    Local(LocalOp),
    /// Stencil read over `halo` with elementwise `op` applied per output cell.
    Focal { halo: Halo, op: LocalOp },
    /// A `FOCAL` stage whose output additionally atomic-reduces into a `D0` scalar.
    FocalZonal { halo: Halo, reduce: ReduceOp },
    /// Whole-raster reduction to a `D0` scalar.
    Zonal { reduce: ReduceOp },
    /// Outward-propagating scan (e.g. viewshed/cost-distance) seeded at `start`.
    Radial { start: Coord },
    /// Single-offset neighbor read, distinct from `Focal` in reading one direction vector
    /// rather than a full stencil (`original_source/runtime/dag/SpreadNeighbor.cpp`).
    Spread { direction: Coord },
    /// Running summary statistic over a stream of blocks.
    Stats { reduce: ReduceOp },
    /// Loop body entry duplicate of an outer value.
    Head,
    /// Loop body live-out value.
    Tail,
    /// A loop body: owns its own node-id range, a condition node, and paired
    /// (initial, back) inputs.
    Loop(LoopBody),
    /// A fusion-cluster boundary that forces `BlockSize` to reset across it.
    Barrier,
    /// Reads a block produced by a previous, already-completed evaluation
    /// (`original_source/runtime/dag/Temporal.hpp`), keyed directly by `source_key`
    /// rather than by this job's own `(coord, iter)` — `Task::temporal_sources` is the
    /// table `blocks_to_load` consults to make that substitution.
    Temporal { source_key: Key },
}

/// The body captured by a `Loop` node: node ids belonging to the loop, the condition
/// node, and the paired head/tail lists built by [`crate::loop_assembler::LoopAssembler`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoopBody {
    /// Node ids that make up the loop body, in assembly order.
    pub node_list: Vec<NodeId>,
    /// The termination-predicate node.
    pub cond: NodeId,
    /// Input duplicates created at loop entry.
    pub heads: Vec<NodeId>,
    /// Back-edge feed-in nodes (iteration i+1 reads from these).
    pub feed_in: Vec<NodeId>,
    /// Back-edge feed-out nodes (iteration i writes to these).
    pub feed_out: Vec<NodeId>,
    /// Live-out nodes visible after the loop terminates.
    pub tails: Vec<NodeId>,
    /// Maximum nesting depth this loop was assembled at.
    pub nesting: usize,
}

/// An IR vertex. See the module documentation for the invariants every `Ir` mutation must
/// uphold.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    pattern: Pattern,
    meta: Meta,
    prev: Vec<(NodeId, Access)>,
    next: Vec<NodeId>,
    ref_count: u32,
}

impl Node {
    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// This node's operator.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// This node's pattern bitmask.
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// This node's static metadata.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Predecessor (input) edges, in order, with their read/write access kind.
    pub fn prev(&self) -> &[(NodeId, Access)] {
        &self.prev
    }

    /// Consumer (next) edges — the back-edge of every predecessor relationship.
    pub fn next(&self) -> &[NodeId] {
        &self.next
    }

    /// Count of external (user-held) references.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Number of blocks along each dimension needed to cover `extent` at this node's
    /// `block_size`.
    pub fn numblock(&self, extent: &Coord) -> Coord {
        self.meta.numblock(extent)
    }

    /// A canonical string over structural attributes (datatype, operator, halo, pattern)
    /// sufficient for CSE and code-cache keys (`Version` compilation is cached by this).
    pub fn signature(&self) -> String {
        use std::fmt::Write as _;
        let mut s = String::new();
        let _ = write!(
            s,
            "{:?}|{:?}|{:?}|{:?}|{}",
            self.kind, self.pattern, self.meta.data_type, self.meta.mem_order, self.meta.block_size
        );
        for (p, access) in &self.prev {
            let _ = write!(s, "|{p}:{access:?}");
        }
        s
    }

    /// Deep copy with re-pointed edges, used by `LoopAssembler` and by cluster-internal
    /// specialization. The returned node is *not* inserted into any `Ir`; the caller
    /// assigns a fresh id via `Ir::push`.
    pub fn clone_with_edges(&self, new_prev: Vec<(NodeId, Access)>, new_next: Vec<NodeId>) -> Node {
        Node {
            id: self.id,
            kind: self.kind.clone(),
            pattern: self.pattern,
            meta: self.meta.clone(),
            prev: new_prev,
            next: new_next,
            ref_count: 0,
        }
    }

    /// Double-dispatch entry point: routes to the matching `visit_*` method of `visitor`.
    pub fn accept<V: visit::Visitor>(&self, visitor: &mut V) -> V::Output {
        visitor.visit(self)
    }
}

pub(crate) fn pattern_for(kind: &NodeKind) -> Pattern {
    match kind {
        NodeKind::Input | NodeKind::Constant(_) => Pattern::FREE,
        NodeKind::Local(_) => Pattern::LOCAL,
        NodeKind::Focal { .. } => Pattern::FOCAL,
        NodeKind::FocalZonal { .. } => Pattern::FOCAL + Pattern::ZONAL,
        NodeKind::Zonal { .. } => Pattern::ZONAL,
        NodeKind::Radial { .. } => Pattern::RADIAL,
        NodeKind::Spread { .. } => Pattern::SPREAD,
        NodeKind::Stats { .. } => Pattern::STATS,
        NodeKind::Head => Pattern::HEAD,
        NodeKind::Tail => Pattern::TAIL,
        NodeKind::Loop(_) => Pattern::LOOP,
        NodeKind::Barrier => Pattern::BARRIER,
        NodeKind::Temporal { .. } => Pattern::FREE,
    }
}

/// Storage class of a `Block`, decided per `Key` by the owning `Task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldType {
    /// No storage: the block is never materialized (e.g. an out-of-range focal
    /// neighbor at a grid border, read as zero-padding).
    Hold0,
    /// A single scalar value, no device buffer needed (`D0` reductions, loop
    /// conditions).
    Hold1,
    /// A dense device buffer of `block_size` elements.
    HoldN,
}

/// The identity of a block: `(node, coord, iter)`.
///
/// `coord` ranges over the node's `numblock()` grid; `iter` is the loop iteration index
/// (always 0 outside a `LOOP` cluster).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Owning node.
    pub node: NodeId,
    /// Block-grid coordinate.
    pub coord: Coord,
    /// Loop iteration, 0 when the node is not inside a `LOOP`.
    pub iter: u32,
}

impl Key {
    /// Builds a key at iteration 0 (the common, non-loop case).
    pub fn new(node: NodeId, coord: Coord) -> Self {
        Key { node, coord, iter: 0 }
    }

    /// Builds a key at an explicit loop iteration.
    pub fn at_iter(node: NodeId, coord: Coord, iter: u32) -> Self {
        Key { node, coord, iter }
    }

    /// A canonical file-spill name: `node-id x coord x iter`.
    pub fn file_name(&self) -> String {
        format!("n{}-{}-i{}", self.node.0, self.coord, self.iter)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.node, self.coord, self.iter)
    }
}

/// The node arena owning every `Node` created in an evaluation. Node ids are simply
/// indices, so `Loop` back-edges are ordinary `NodeId` pairs with no special ownership.
#[derive(Debug, Clone, Default)]
pub struct Ir {
    nodes: Vec<Node>,
}

impl Ir {
    /// An empty arena.
    pub fn new() -> Self {
        Ir { nodes: Vec::new() }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts a freshly built node, assigning it the next monotonic id, and wires the
    /// bidirectional edge invariant by pushing `this` onto every predecessor's `next`
    /// list. Predecessor ids must already exist in the arena.
    pub fn push(&mut self, kind: NodeKind, meta: Meta, prev: Vec<(NodeId, Access)>) -> Result<NodeId> {
        let id = NodeId(self.nodes.len() as u32);
        for (p, _) in &prev {
            if p.0 as usize >= self.nodes.len() {
                return Err(EngineError::Invariant(format!(
                    "node {id} references unknown predecessor {p}"
                )));
            }
        }
        let pattern = pattern_for(&kind);
        let node = Node {
            id,
            pattern,
            meta,
            kind,
            prev: prev.clone(),
            next: Vec::new(),
            ref_count: 0,
        };
        self.nodes.push(node);
        for (p, _) in prev {
            self.nodes[p.0 as usize].next.push(id);
        }
        Ok(id)
    }

    /// Looks up a node by id.
    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Mutable lookup, used by the `Simplifier` to merge `next` edges on a hash-cons hit.
    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    /// Iterates nodes in id (creation/topological) order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Increments a node's external reference count (a user handle was cloned).
    pub fn retain(&mut self, id: NodeId) {
        self.nodes[id.0 as usize].ref_count += 1;
    }

    /// Decrements a node's external reference count (a user handle was dropped).
    pub fn release(&mut self, id: NodeId) {
        let n = &mut self.nodes[id.0 as usize];
        n.ref_count = n.ref_count.saturating_sub(1);
    }

    /// Re-parents every edge pointing at `from` onto `to` and removes `from`'s forward
    /// edge bookkeeping. Used by the `Simplifier` when a structural duplicate is merged.
    pub fn redirect(&mut self, from: NodeId, to: NodeId) {
        for n in self.nodes.iter_mut() {
            for (p, _) in n.prev.iter_mut() {
                if *p == from {
                    *p = to;
                }
            }
        }
        let from_next = std::mem::take(&mut self.nodes[from.0 as usize].next);
        let to_next = &mut self.nodes[to.0 as usize].next;
        for n in from_next {
            if !to_next.contains(&n) {
                to_next.push(n);
            }
        }
    }

    /// Checks the bidirectional-edge invariant `b ∈ a.next ⇔ a ∈ b.prev`, for every
    /// ordered pair of nodes. O(n·avg-degree); intended for tests and debug-mode checks,
    /// not the hot path.
    pub fn check_bidirectional(&self) -> Result<()> {
        for a in &self.nodes {
            for (p, _) in &a.prev {
                let pred = self.get(*p);
                if !pred.next.contains(&a.id) {
                    return Err(EngineError::Invariant(format!(
                        "{} lists {} as predecessor, but {} does not list {} as a consumer",
                        a.id, p, p, a.id
                    )));
                }
            }
            for n in &a.next {
                let succ = self.get(*n);
                if !succ.prev.iter().any(|(p, _)| *p == a.id) {
                    return Err(EngineError::Invariant(format!(
                        "{} lists {} as consumer, but {} does not list {} as a predecessor",
                        a.id, n, n, a.id
                    )));
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn meta(block: i32) -> Meta {
        Meta {
            data_size: 0,
            data_type: DataType::F32,
            mem_order: MemOrder::RowMajor,
            block_size: Coord::new(&[block, block]),
            num_dim: NumDim::D2,
        }
    }

    #[test]
    fn bidirectional_edges_hold_on_construction() {
        let mut ir = Ir::new();
        let a = ir.push(NodeKind::Input, meta(8), vec![]).unwrap();
        let b = ir.push(NodeKind::Input, meta(8), vec![]).unwrap();
        let c = ir
            .push(NodeKind::Local(LocalOp::Add), meta(8), vec![(a, Access::Read), (b, Access::Read)])
            .unwrap();
        assert!(ir.get(a).next().contains(&c));
        assert!(ir.get(b).next().contains(&c));
        ir.check_bidirectional().unwrap();
    }

    #[test]
    fn unknown_predecessor_is_rejected() {
        let mut ir = Ir::new();
        let bogus = NodeId(42);
        let err = ir.push(NodeKind::Local(LocalOp::Neg), meta(8), vec![(bogus, Access::Read)]);
        assert!(err.is_err());
    }

    #[test]
    fn pattern_union_and_membership() {
        let p = Pattern::FOCAL + Pattern::ZONAL;
        assert!(p.is(Pattern::FOCAL));
        assert!(p.is(Pattern::ZONAL));
        assert!(p.is_not(Pattern::RADIAL));
    }

    #[test]
    fn redirect_reparents_next_edges() {
        let mut ir = Ir::new();
        let a = ir.push(NodeKind::Input, meta(8), vec![]).unwrap();
        let b = ir.push(NodeKind::Input, meta(8), vec![]).unwrap();
        let c = ir
            .push(NodeKind::Local(LocalOp::Identity), meta(8), vec![(a, Access::Read)])
            .unwrap();
        ir.redirect(a, b);
        assert!(ir.get(b).next().contains(&c));
    }

    #[test]
    fn key_file_name_is_stable_for_same_inputs() {
        let k1 = Key::new(NodeId(3), Coord::new(&[1, 2]));
        let k2 = Key::new(NodeId(3), Coord::new(&[1, 2]));
        assert_eq!(k1.file_name(), k2.file_name());
    }
}
