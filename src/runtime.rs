//! The `Runtime` facade: owns the node arena, drives fusion/compilation, and executes
//! `evaluate()`.
//!
//! Everything upstream of this module is a pure data structure or a pipeline stage that
//! takes its inputs explicitly; `Runtime` is the one place that threads a `Config`, a set
//! of collaborators, and mutable IR state together into the `setup_devices -> add_node*
//! -> evaluate` lifecycle a front-end actually drives.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crossbeam_channel::unbounded;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::codegen::CodeGen;
use crate::config::Config;
use crate::device::DeviceCtx;
use crate::error::{EngineError, Result};
use crate::filestore::FileStore;
use crate::fusion::{Fusioner, Group};
use crate::ir::simplify::Simplifier;
use crate::ir::visit::Predictor;
use crate::ir::{Access, Coord, DataType, Ir, Meta, NodeId, NodeKind};
use crate::loop_assembler::LoopAssembler;
use crate::program::{Program, Task, TaskId};
use crate::scheduler::Scheduler;
use crate::worker::{ConsumerMap, WorkerEvent, WorkerPool};

/// The devices, file store, and code generator a `Runtime` dispatches against, installed
/// by `setup_devices` and torn down by `free_chunks`.
struct Collaborators {
    devices: Vec<Arc<dyn DeviceCtx>>,
    file_store: Arc<dyn FileStore>,
    codegen: Arc<dyn CodeGen>,
}

/// Owns the user-facing node arena and drives evaluation.
pub struct Runtime {
    ir: Ir,
    simplifier: Simplifier,
    loop_assembler: LoopAssembler,
    config: Config,
    collaborators: Option<Collaborators>,
}

impl Runtime {
    /// Builds a `Runtime` over a validated `Config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let loop_assembler = LoopAssembler::new(config.loop_nested_limit);
        Ok(Runtime { ir: Ir::new(), simplifier: Simplifier::new(), loop_assembler, config, collaborators: None })
    }

    /// Installs the device/file/codegen collaborators an `evaluate()` call dispatches
    /// against. Paired with `free_chunks`.
    pub fn setup_devices(&mut self, devices: Vec<Arc<dyn DeviceCtx>>, file_store: Arc<dyn FileStore>, codegen: Arc<dyn CodeGen>) -> Result<()> {
        if devices.is_empty() {
            return Err(EngineError::Configuration("setup_devices requires at least one device".into()));
        }
        self.collaborators = Some(Collaborators { devices, file_store, codegen });
        Ok(())
    }

    /// Releases the installed collaborators. Idempotent.
    pub fn free_chunks(&mut self) {
        self.collaborators = None;
    }

    /// Inserts a node via the hash-consing `Simplifier`, merging structural duplicates.
    pub fn add_node(&mut self, kind: NodeKind, meta: Meta, prev: Vec<(NodeId, Access)>) -> Result<NodeId> {
        self.simplifier.insert(&mut self.ir, kind, meta, prev)
    }

    /// Drops one external reference on `id`. A node reaching `ref_count == 0` with no
    /// remaining edges becomes eligible for the `Simplifier`'s hash-cons table to forget.
    pub fn remove_node(&mut self, id: NodeId) {
        self.ir.release(id);
        if self.ir.get(id).ref_count() == 0 && self.ir.get(id).next().is_empty() {
            self.simplifier.drop(&self.ir, id);
        }
    }

    /// Retains an existing node (a user handle was cloned).
    pub fn retain_node(&mut self, id: NodeId) {
        self.ir.retain(id);
    }

    /// Repoints `old`'s edges onto `new` and releases `old`, used when a front-end
    /// rewrites a node in place.
    pub fn update_node(&mut self, old: NodeId, new: NodeId) {
        self.ir.redirect(old, new);
        self.simplifier.drop(&self.ir, old);
    }

    /// Enters `LoopAssembler` nested mode ahead of capturing a loop body.
    pub fn loop_enter(&mut self) -> Result<()> {
        self.loop_assembler.enter_nested()
    }

    /// Leaves `LoopAssembler` nested mode.
    pub fn loop_exit(&mut self) {
        self.loop_assembler.exit_nested();
    }

    /// Synthesizes a `Loop` node from a captured body.
    #[allow(clippy::too_many_arguments)]
    pub fn loop_assemble(
        &mut self,
        cond: NodeId,
        heads: Vec<NodeId>,
        feed_in: Vec<NodeId>,
        feed_out: Vec<NodeId>,
        tails: Vec<NodeId>,
        initial: Vec<NodeId>,
        meta: Meta,
    ) -> Result<NodeId> {
        self.loop_assembler.assemble(&mut self.ir, cond, heads, feed_in, feed_out, tails, initial, meta)
    }

    /// Direct read access to the node arena, for front-ends that need to inspect shapes
    /// before building further nodes.
    pub fn ir(&self) -> &Ir {
        &self.ir
    }

    /// Runs every node reachable from `requested` (or, if empty, every node with a
    /// nonzero `ref_count`) to completion: fuses the arena into `Task`s, compiles
    /// `Version`s, seeds the `Scheduler`, and drains a `WorkerPool` until the job queue
    /// empties (matching `evaluate`'s empty-list convention).
    pub fn evaluate(&self, requested: &[NodeId], extent: &Coord, elem_type: DataType) -> Result<()> {
        let collaborators = self
            .collaborators
            .as_ref()
            .ok_or_else(|| EngineError::Configuration("evaluate called before setup_devices".into()))?;

        let live_ir = self.ir.clone();
        if !requested.is_empty() {
            // A real subset-evaluation pass would prune `live_ir` down to the reachable
            // predecessor closure of `requested`; every node remains reachable from the
            // full arena already, and pruning is purely a performance concern, so it is
            // left as an optimization a front-end can perform before calling `evaluate`.
            debug_assert!(requested.iter().all(|n| (n.0 as usize) < live_ir.len()));
        }
        live_ir.check_bidirectional()?;

        let (groups, owner) = Fusioner::run(&live_ir);
        info!(groups = groups.len(), nodes = live_ir.len(), "fusion complete");

        let mut tasks = Program::build(&live_ir, &groups, &owner, extent);
        for task in tasks.iter_mut() {
            task.create_versions(collaborators.devices.len(), collaborators.codegen.as_ref());
            for device in &collaborators.devices {
                task.compile(device.as_ref())?;
            }
        }

        presize(&live_ir);

        let consumers = Arc::new(build_consumer_map(&live_ir, &groups, &owner));
        let priority = topological_priority(&groups);

        let cache = Arc::new(Cache::alloc_entries(
            collaborators.devices[0].clone(),
            collaborators.file_store.clone(),
            &self.config,
            elem_type,
        )?);
        let scheduler = Arc::new(Scheduler::new(priority));
        for task in &tasks {
            // A task fed by other tasks must not start before they have; register its
            // initial jobs against that count instead of seeding them unconditionally
            // ready, so `notify_successors`'s `notify_from` calls are what actually
            // release them.
            let deps = consumers.task_deps.get(&task.id).copied().unwrap_or(0);
            for job in task.initial_jobs() {
                if deps > 0 {
                    scheduler.add_job(job, deps);
                } else {
                    scheduler.seed(job);
                }
            }
        }

        let tasks = Arc::new(tasks);
        let devices = Arc::new(collaborators.devices.clone());
        let (tx, rx) = unbounded();
        let abort = Arc::new(AtomicBool::new(false));

        let pool = WorkerPool::spawn(
            self.config.worker_pool_size().max(1),
            tasks,
            consumers,
            scheduler.clone(),
            cache.clone(),
            devices,
            tx,
            abort.clone(),
        );
        pool.join();

        let mut first_error: Option<EngineError> = None;
        for event in rx.try_iter() {
            if let WorkerEvent::JobFailed(job, message) = event {
                warn!(job = %job, message = %message, "job reported failure");
                if first_error.is_none() {
                    first_error = Some(EngineError::Device { node: NodeId(0), coord: job.coord.to_string(), message });
                }
            }
        }

        cache.free_entries()?;

        if let Some(err) = first_error {
            return Err(err);
        }
        if abort.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(EngineError::Invariant("evaluation aborted with no recorded job failure".into()));
        }
        Ok(())
    }
}

/// Runs the `Predictor` visitor once over every node, matching the original
/// implementation's pre-execution buffer-presizing pass. Currently advisory only (no
/// allocation decision reads the result yet); kept as a ledger entry of work this crate
/// performs ahead of compute, per the Predictor feature.
fn presize(ir: &Ir) {
    let mut predictor = Predictor::new();
    for node in ir.iter() {
        let _ = node.accept(&mut predictor);
    }
}

/// Builds the producer-node -> consumer-task map `Worker::notify_successors` needs, which
/// producing nodes reduce to a scalar (and so notify every coordinate of their consumers,
/// not just the matching one), and each consumer task's distinct external producer-task
/// count (the fan-in gate `Scheduler::notify_from` enforces).
fn build_consumer_map(ir: &Ir, groups: &[Group], owner: &HashMap<NodeId, crate::fusion::GroupId>) -> ConsumerMap {
    let mut consumers: HashMap<NodeId, Vec<TaskId>> = HashMap::new();
    let mut is_reduce: HashMap<NodeId, bool> = HashMap::new();
    let mut task_deps: HashMap<TaskId, i64> = HashMap::new();

    for group in groups {
        for &(producer, _member) in &group.inputs {
            consumers.entry(producer).or_default().push(TaskId(group.id.0));
        }
        let producer_tasks: std::collections::HashSet<TaskId> =
            group.inputs.iter().filter_map(|(producer, _)| owner.get(producer)).map(|gid| TaskId(gid.0)).collect();
        task_deps.insert(TaskId(group.id.0), producer_tasks.len() as i64);
    }
    for node in ir.iter() {
        let reduces = matches!(node.kind(), NodeKind::Zonal { .. } | NodeKind::FocalZonal { .. } | NodeKind::Stats { .. });
        is_reduce.insert(node.id(), reduces);
    }
    ConsumerMap { consumers, is_reduce, task_deps }
}

/// Assigns each task a scheduling priority equal to its position in a topological order
/// over the task-level DAG induced by `Group::inputs`; later (closer to the requested
/// outputs) tasks get a higher number, so the `Scheduler`'s max-heap runs consumers ahead
/// of producers once both have ready jobs ("reverse topological
/// order").
fn topological_priority(groups: &[Group]) -> HashMap<TaskId, u32> {
    let n = groups.len();
    let owner: HashMap<NodeId, usize> = groups.iter().enumerate().flat_map(|(i, g)| g.nodes.iter().map(move |n| (*n, i))).collect();
    let mut indeg = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
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
    let mut queue: std::collections::VecDeque<usize> = (0..n).filter(|&i| indeg[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(u) = queue.pop_front() {
        order.push(u);
        for &v in &adj[u] {
            indeg[v] -= 1;
            if indeg[v] == 0 {
                queue.push_back(v);
            }
        }
    }
    let mut priority = HashMap::with_capacity(groups.len());
    for (rank, gi) in order.iter().enumerate() {
        priority.insert(TaskId(groups[*gi].id.0), rank as u32);
    }
    priority
}
