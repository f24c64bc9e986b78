//! The worker pool: drains ready jobs from the `Scheduler`, drives them through the
//! `Cache`, and dispatches compiled kernels on a `DeviceCtx`.
//!
//! Each thread keeps a stable `(task, device, rank)` identity for the life of one
//! evaluation via its closed-over `rank`/`device_index`; nothing about
//! a job carries that identity, so a worker never needs to hand a job off mid-compute. A
//! device failure is never retried: the worker flips the shared `abort` flag, calls
//! `Scheduler::abort` to unblock every other worker's `next_job`, and reports itself over
//! `events` for the `Runtime` to surface to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{error, trace};

use crate::cache::Cache;
use crate::device::{DeviceCtx, KernelArg};
use crate::error::{EngineError, Result};
use crate::ir::{HoldType, Key, NodeId};
use crate::program::{Job, Task, TaskId, TaskKind, radial_dependency};
use crate::scheduler::Scheduler;

/// One worker-visible outcome, reported over a `WorkerPool`'s event channel.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A job completed without error.
    JobDone(Job),
    /// A job failed; the pool is aborting the whole evaluation.
    JobFailed(Job, String),
}

/// Maps each node's output to the tasks that consume it across cluster boundaries, and
/// whether that producer is itself a `D0`-reducing node (in which case every coordinate of
/// the consumer is notified, not just the matching one). Built once by the `Runtime` from
/// `Fusioner` output; shared read-only by every worker.
#[derive(Debug, Default)]
pub struct ConsumerMap {
    /// Producing node id -> consuming task ids.
    pub consumers: HashMap<NodeId, Vec<TaskId>>,
    /// Producing node id -> whether it reduces to a scalar.
    pub is_reduce: HashMap<NodeId, bool>,
    /// Consuming task id -> number of distinct other tasks that feed it an input. A
    /// consumer job is only dispatched once every one of those producers has notified it
    /// (`Scheduler::notify_from` dedupes repeat notifications from the same producer task,
    /// so a reduce producer calling `notify_successors` once per internal block still only
    /// counts once here).
    pub task_deps: HashMap<TaskId, i64>,
}

/// A running pool of OS threads draining one `Scheduler`.
pub struct WorkerPool {
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` worker threads against a shared `Scheduler`/`Cache`/task list.
    /// `devices` is indexed by `rank % devices.len()`, matching the single-machine slice
    /// of the `(node, device, rank)` identity space.
    pub fn spawn(
        count: usize,
        tasks: Arc<Vec<Task>>,
        consumers: Arc<ConsumerMap>,
        scheduler: Arc<Scheduler>,
        cache: Arc<Cache>,
        devices: Arc<Vec<Arc<dyn DeviceCtx>>>,
        events: Sender<WorkerEvent>,
        abort: Arc<AtomicBool>,
    ) -> Self {
        let mut handles = Vec::with_capacity(count);
        for rank in 0..count {
            let tasks = tasks.clone();
            let consumers = consumers.clone();
            let scheduler = scheduler.clone();
            let cache = cache.clone();
            let devices = devices.clone();
            let events = events.clone();
            let abort = abort.clone();
            let handle = std::thread::Builder::new()
                .name(format!("blockjit-worker-{rank}"))
                .spawn(move || {
                    let device_index = rank % devices.len().max(1);
                    let device = devices[device_index].clone();
                    worker_loop(rank, device_index, &tasks, &consumers, &scheduler, &cache, device.as_ref(), &events, &abort);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        WorkerPool { handles }
    }

    /// Blocks until every worker thread has drained the scheduler and exited.
    pub fn join(self) {
        for h in self.handles {
            let _ = h.join();
        }
    }
}

fn worker_loop(
    rank: usize,
    device_index: usize,
    tasks: &[Task],
    consumers: &ConsumerMap,
    scheduler: &Scheduler,
    cache: &Cache,
    device: &dyn DeviceCtx,
    events: &Sender<WorkerEvent>,
    abort: &AtomicBool,
) {
    loop {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        let Some(job) = scheduler.next_job() else { break };
        match run_job(&job, device_index, tasks, consumers, scheduler, cache, device) {
            Ok(()) => {
                let _ = events.send(WorkerEvent::JobDone(job));
                scheduler.finish_job();
            }
            Err(e) => {
                error!(rank, job = %job, error = %e, "worker job failed, aborting evaluation");
                abort.store(true, Ordering::Relaxed);
                scheduler.abort();
                let _ = events.send(WorkerEvent::JobFailed(job, e.to_string()));
                break;
            }
        }
    }
    trace!(rank, "worker exiting");
}

/// Runs the full per-job pipeline: load -> compute -> store -> notify -> release.
fn run_job(
    job: &Job,
    device_index: usize,
    tasks: &[Task],
    consumers: &ConsumerMap,
    scheduler: &Scheduler,
    cache: &Cache,
    device: &dyn DeviceCtx,
) -> Result<()> {
    let task = &tasks[job.task.0 as usize];

    let in_keys = cache.request_blocks(&task.blocks_to_load(job));
    let out_keys = cache.request_blocks(&task.blocks_to_store(job));

    cache.retain_entries(&in_keys)?;
    cache.retain_entries(&out_keys)?;
    cache.load_input_blocks(&in_keys)?;
    cache.init_output_blocks(&out_keys)?;

    // The loop condition is an internal Hold1 scalar, not necessarily in the task's
    // declared output list; request and zero it like any other reduction target so the
    // kernel's atomic write has somewhere to land.
    let cond_key = match &task.kind {
        TaskKind::Loop { body, .. } => {
            let key = Key::at_iter(body.cond, job.coord.clone(), job.iter);
            cache.request_blocks(&[(key.clone(), HoldType::Hold1, 1)]);
            cache.init_output_blocks(std::slice::from_ref(&key))?;
            Some(key)
        }
        _ => None,
    };

    dispatch(task, job, device_index, &in_keys, &out_keys, cache, device)?;

    cache.reduce_output_blocks(&out_keys)?;
    cache.write_output_blocks(&out_keys);

    let still_cycling = if let Some(cond_key) = &cond_key {
        cache.reduce_output_blocks(std::slice::from_ref(cond_key))?;
        let cycling = cache.inspect(cond_key).value.map(|v| v != 0.0).unwrap_or(false);
        task.set_loop_cycling(job, cycling);
        task.mark_cycling_input(&job.coord, job.iter + 1, cycling);
        if cycling {
            let next = Job::at_iter(task.id, job.coord.clone(), job.iter + 1);
            scheduler.add_job(next.clone(), 0);
            scheduler.notify(&next);
        }
        Some(cycling)
    } else {
        None
    };

    if still_cycling != Some(true) {
        notify_successors(task, job, tasks, consumers, scheduler);
    }

    for key in in_keys.iter().chain(out_keys.iter()).chain(cond_key.iter()) {
        cache.release_block(key);
    }
    cache.return_blocks(&in_keys);
    cache.return_blocks(&out_keys);

    Ok(())
}

/// Pushes (or bumps the readiness of) every job `job`'s completion unblocks: RADIAL's
/// in-task neighbor propagation, plus any cross-task consumer jobs.
fn notify_successors(task: &Task, job: &Job, tasks: &[Task], consumers: &ConsumerMap, scheduler: &Scheduler) {
    if let TaskKind::Radial { start } = &task.kind {
        for nj in task.self_jobs(job) {
            let deps = radial_dependency(&nj.coord, start) as i64;
            scheduler.add_job(nj.clone(), deps);
            scheduler.notify(&nj);
        }
    }

    for out_node in &task.output_list {
        let Some(consumer_ids) = consumers.consumers.get(out_node) else { continue };
        let is_reduce = consumers.is_reduce.get(out_node).copied().unwrap_or(false);
        for cid in consumer_ids {
            let consumer = &tasks[cid.0 as usize];
            let needed = consumers.task_deps.get(cid).copied().unwrap_or(1).max(1);
            for nj in consumer.next_jobs(job, is_reduce) {
                scheduler.notify_from(&nj, task.id, needed);
            }
        }
    }
}

/// Selects this job's `Version`, binds its arguments from the `Cache`'s current block
/// state, and dispatches it.
fn dispatch(
    task: &Task,
    job: &Job,
    device_index: usize,
    in_keys: &[Key],
    out_keys: &[Key],
    cache: &Cache,
    device: &dyn DeviceCtx,
) -> Result<()> {
    let detail = detail_for(task, job);
    let version = task.version_for(device_index, &detail).ok_or_else(|| {
        EngineError::Invariant(format!("no compiled version for task {:?} at detail {detail:?}", task.id))
    })?;

    let in_handles = bind_handles(&task.input_list, in_keys, &job.coord, cache);
    let out_handles = bind_handles(&task.output_list, out_keys, &job.coord, cache);
    let args = version.bind_args(&job.coord, &task.block_size, &in_handles, &out_handles);

    device
        .enqueue_kernel(&version.source, &args, version.work_group_size, version.work_group_size)
        .map_err(|e| EngineError::Device { node: task.node_list[0], coord: job.coord.to_string(), message: e.to_string() })?;
    device.finish()?;
    Ok(())
}

/// Binds one `KernelArg` per node in `nodes`, preferring the key at `coord` (the job's own
/// block) and falling back to the first key found for that node — a FOCAL task's halo
/// neighbors are loaded as separate `Key`s but a kernel only ever takes one buffer per
/// input node, computing neighbor offsets against `ArgSlot::Coord`/`ArgSlot::BlockSize`.
fn bind_handles(nodes: &[NodeId], keys: &[Key], coord: &crate::ir::Coord, cache: &Cache) -> HashMap<NodeId, KernelArg> {
    let mut out = HashMap::with_capacity(nodes.len());
    for node in nodes {
        let key = keys
            .iter()
            .find(|k| k.node == *node && k.coord == *coord)
            .or_else(|| keys.iter().find(|k| k.node == *node));
        let Some(key) = key else { continue };
        let block = cache.inspect(key);
        let arg = match block.hold {
            HoldType::HoldN => KernelArg::Buffer(cache.buffer_handle(key)),
            HoldType::Hold1 => KernelArg::Scalar(block.value.unwrap_or(0.0).to_le_bytes().to_vec()),
            HoldType::Hold0 => KernelArg::Buffer(None),
        };
        out.insert(*node, arg);
    }
    out
}

/// `Version` specialization detail for `job`: a compass sector for RADIAL tasks, empty for
/// everything else.
fn detail_for(task: &Task, job: &Job) -> String {
    match &task.kind {
        TaskKind::Radial { start } => radial_sector(&job.coord, start).to_string(),
        _ => String::new(),
    }
}

/// Eight-way compass sector of `coord` relative to `start`, matching `Task::detail_strings`'s
/// `["N","NE","E","SE","S","SW","W","NW"]` ordering. Ties default to `"N"`, which is
/// harmless: the scan origin itself dispatches no RADIAL version at all.
fn radial_sector(coord: &crate::ir::Coord, start: &crate::ir::Coord) -> &'static str {
    let dx = coord.0.first().copied().unwrap_or(0) - start.0.first().copied().unwrap_or(0);
    let dy = coord.0.get(1).copied().unwrap_or(0) - start.0.get(1).copied().unwrap_or(0);
    match (dx.signum(), dy.signum()) {
        (0, -1) => "N",
        (1, -1) => "NE",
        (1, 0) => "E",
        (1, 1) => "SE",
        (0, 1) => "S",
        (-1, 1) => "SW",
        (-1, 0) => "W",
        (-1, -1) => "NW",
        _ => "N",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::{BufferHandle, WorkSize};
    use crate::filestore::FileStore;
    use crate::fusion::Fusioner;
    use crate::ir::{Access, Coord, DataType, Ir, LocalOp, MemOrder, Meta, NodeKind, NumDim};
    use crate::program::Program;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64;

    struct CountingDevice {
        next: AtomicU64,
        bufs: Mutex<HashMap<BufferHandle, Vec<u8>>>,
        dispatches: AtomicU64,
    }

    impl CountingDevice {
        fn new() -> Self {
            CountingDevice { next: AtomicU64::new(1), bufs: Mutex::new(HashMap::new()), dispatches: AtomicU64::new(0) }
        }
    }

    impl DeviceCtx for CountingDevice {
        fn alloc_buffer(&self, size: usize) -> Result<BufferHandle> {
            let h = self.next.fetch_add(1, Ordering::SeqCst);
            self.bufs.lock().insert(h, vec![0u8; size]);
            Ok(h)
        }
        fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
            self.bufs.lock().remove(&handle);
            Ok(())
        }
        fn enqueue_kernel(&self, _s: &str, _a: &[KernelArg], _g: WorkSize, _l: WorkSize) -> Result<()> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn enqueue_read(&self, buffer: BufferHandle, offset: usize, data: &mut [u8]) -> Result<()> {
            let bufs = self.bufs.lock();
            let b = &bufs[&buffer];
            data.copy_from_slice(&b[offset..offset + data.len()]);
            Ok(())
        }
        fn enqueue_write(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
            let mut bufs = self.bufs.lock();
            let b = bufs.get_mut(&buffer).unwrap();
            b[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }
        fn enqueue_fill(&self, buffer: BufferHandle, offset: usize, len: usize, pattern: &[u8]) -> Result<()> {
            let mut bufs = self.bufs.lock();
            let b = bufs.get_mut(&buffer).unwrap();
            for i in 0..len {
                b[offset + i] = pattern[i % pattern.len()];
            }
            Ok(())
        }
        fn finish(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NullCodeGen;
    impl crate::codegen::CodeGen for NullCodeGen {
        fn emit(&self, _version: &crate::program::Version) -> String {
            String::new()
        }
    }

    struct NullFileStore;
    impl FileStore for NullFileStore {
        fn open(&self, _key: &Key) -> Result<crate::filestore::FileHandle> {
            Ok(0)
        }
        fn read_block(&self, _h: crate::filestore::FileHandle, _d: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn write_block(&self, _h: crate::filestore::FileHandle, _d: &[u8]) -> Result<()> {
            Ok(())
        }
        fn close(&self, _h: crate::filestore::FileHandle) -> Result<()> {
            Ok(())
        }
    }

    fn meta(block: i32) -> Meta {
        Meta { data_size: 0, data_type: DataType::F32, mem_order: MemOrder::RowMajor, block_size: Coord::new(&[block, block]), num_dim: NumDim::D2 }
    }

    /// Scenario S1: a single fused LOCAL task over a 4x4 block grid dispatches exactly
    /// once per block coordinate.
    #[test]
    fn local_pipeline_dispatches_once_per_block() {
        let mut ir = Ir::new();
        let a = ir.push(NodeKind::Input, meta(2), vec![]).unwrap();
        let b = ir.push(NodeKind::Input, meta(2), vec![]).unwrap();
        let c = ir.push(NodeKind::Local(LocalOp::Add), meta(2), vec![(a, Access::Read), (b, Access::Read)]).unwrap();
        ir.retain(c);

        let (groups, owner) = Fusioner::run(&ir);
        let mut tasks = Program::build(&ir, &groups, &owner, &Coord::new(&[4, 4]));
        let device = Arc::new(CountingDevice::new());
        for t in tasks.iter_mut() {
            t.create_versions(1, &NullCodeGen);
        }

        let conf = Config { cache_entry_count: 16, ..Config::default() };
        let cache = Arc::new(Cache::alloc_entries(device.clone(), Arc::new(NullFileStore), &conf, DataType::F32).unwrap());
        let scheduler = Arc::new(Scheduler::new(HashMap::new()));
        for t in &tasks {
            for job in t.initial_jobs() {
                scheduler.seed(job);
            }
        }

        let tasks = Arc::new(tasks);
        let consumers = Arc::new(ConsumerMap::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        let abort = Arc::new(AtomicBool::new(false));
        worker_loop(0, 0, &tasks, &consumers, &scheduler, &cache, device.as_ref(), &tx, &abort);

        assert_eq!(device.dispatches.load(Ordering::SeqCst), 4);
        assert_eq!(rx.try_iter().filter(|e| matches!(e, WorkerEvent::JobDone(_))).count(), 4);
        assert_eq!(scheduler.progress(), 1.0);
    }

    /// A consumer task fed by two independently-scheduled producer tasks must wait for
    /// both of them: the `ConsumerMap::task_deps` count gates it, and
    /// `Scheduler::notify_from` dedupes per-producer-task notifications rather than
    /// readying it off the first one to arrive.
    #[test]
    fn consumer_task_waits_for_every_distinct_producer_task() {
        let mut ir = Ir::new();
        let p1 = ir.push(NodeKind::Barrier, meta(4), vec![]).unwrap();
        let p2 = ir.push(NodeKind::Barrier, meta(4), vec![]).unwrap();
        let c = ir.push(NodeKind::Local(LocalOp::Add), meta(4), vec![(p1, Access::Read), (p2, Access::Read)]).unwrap();
        ir.retain(c);

        let (groups, owner) = Fusioner::run(&ir);
        assert_eq!(groups.len(), 3, "two Barrier producers must not fuse with the consumer or each other");
        let mut tasks = Program::build(&ir, &groups, &owner, &Coord::new(&[4, 4]));
        let device = Arc::new(CountingDevice::new());
        for t in tasks.iter_mut() {
            t.create_versions(1, &NullCodeGen);
        }

        let conf = Config { cache_entry_count: 16, ..Config::default() };
        let cache = Arc::new(Cache::alloc_entries(device.clone(), Arc::new(NullFileStore), &conf, DataType::F32).unwrap());

        let consumer_id = tasks.iter().find(|t| matches!(t.kind, TaskKind::Local)).unwrap().id;
        let mut consumer_map = ConsumerMap { task_deps: HashMap::from([(consumer_id, 2)]), ..ConsumerMap::default() };
        for t in &tasks {
            if t.id != consumer_id {
                for &out in &t.output_list {
                    consumer_map.consumers.entry(out).or_default().push(consumer_id);
                }
            }
        }

        let scheduler = Arc::new(Scheduler::new(HashMap::new()));
        for t in &tasks {
            let deps = consumer_map.task_deps.get(&t.id).copied().unwrap_or(0);
            for job in t.initial_jobs() {
                if deps > 0 {
                    scheduler.add_job(job, deps);
                } else {
                    scheduler.seed(job);
                }
            }
        }

        let tasks = Arc::new(tasks);
        let consumers = Arc::new(consumer_map);
        let (tx, rx) = crossbeam_channel::unbounded();
        let abort = Arc::new(AtomicBool::new(false));
        worker_loop(0, 0, &tasks, &consumers, &scheduler, &cache, device.as_ref(), &tx, &abort);

        assert_eq!(device.dispatches.load(Ordering::SeqCst), 3, "both producers and the consumer must each dispatch exactly once");
        assert_eq!(rx.try_iter().filter(|e| matches!(e, WorkerEvent::JobDone(_))).count(), 3);
        assert_eq!(scheduler.progress(), 1.0);
    }
}
