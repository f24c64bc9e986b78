//! The ready-queue of block-level jobs.
//!
//! A centralized priority queue plus per-job dependency counters. Ordering is FIFO with a
//! task-priority override (consumer tasks run before their producers re-fill the cache,
//! preventing thrash); priority is the reverse topological order of `Task`s, supplied by
//! the `Runtime` at construction. Termination is observed when the job queue empties with
//! no outstanding (seeded-but-unfinished) job left — `next_job` then returns `None` and
//! every blocked worker wakes up to exit its loop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::program::{Job, TaskId};

#[derive(Debug, Clone)]
struct Ready {
    priority: u32,
    seq: u64,
    job: Job,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority pops first; within equal priority,
        // the lower sequence number (earlier arrival) pops first (FIFO tie-break).
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    heap: BinaryHeap<Ready>,
    pending: HashMap<Job, i64>,
    /// Producer `TaskId`s that have already notified each still-pending job, so a single
    /// producer task calling `notify_from` more than once for the same job (a reduce task
    /// completing many internal blocks) only ever counts as one dependency satisfied.
    seen_by: HashMap<Job, HashSet<TaskId>>,
    outstanding: i64,
    closed: bool,
}

/// Running completion percentage for long evaluations
/// (`original_source/util/PercentType.hpp`'s role, reimplemented as a plain atomic
/// counter pair rather than a ported enum/class).
#[derive(Debug, Default)]
pub struct Progress {
    completed: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    fn add_total(&self, n: u64) {
        self.total.fetch_add(n, AtomicOrdering::Relaxed);
    }

    fn complete(&self, n: u64) {
        self.completed.fetch_add(n, AtomicOrdering::Relaxed);
    }

    /// Fraction of seeded jobs that have finished, in `[0.0, 1.0]`. `1.0` before any job
    /// is seeded.
    pub fn fraction(&self) -> f32 {
        let total = self.total.load(AtomicOrdering::Relaxed);
        if total == 0 {
            1.0
        } else {
            self.completed.load(AtomicOrdering::Relaxed) as f32 / total as f32
        }
    }
}

/// The centralized job-ready queue.
pub struct Scheduler {
    state: Mutex<State>,
    cv: Condvar,
    seq: AtomicU64,
    priority: HashMap<TaskId, u32>,
    progress: Progress,
}

impl Scheduler {
    /// Builds a scheduler. `priority` maps each task to its position in reverse
    /// topological order (higher = closer to the evaluation's requested outputs = runs
    /// first); tasks absent from the map get priority 0.
    pub fn new(priority: HashMap<TaskId, u32>) -> Self {
        Scheduler {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                pending: HashMap::new(),
                seen_by: HashMap::new(),
                outstanding: 0,
                closed: false,
            }),
            cv: Condvar::new(),
            seq: AtomicU64::new(0),
            priority,
            progress: Progress::default(),
        }
    }

    /// Seeds a job directly onto the ready queue, bypassing dependency counting (used for
    /// a `Task::initial_jobs()` seed).
    pub fn seed(&self, job: Job) {
        self.register_outstanding();
        self.push_ready(job);
    }

    /// Registers `job` with `deps` remaining notifications; pushes immediately if already
    /// zero. A job already pending keeps the smaller of the two counts — the task decides
    /// by merging dependency counts.
    pub fn add_job(&self, job: Job, deps: i64) {
        {
            let mut state = self.state.lock();
            if let Some(existing) = state.pending.get_mut(&job) {
                if deps < *existing {
                    *existing = deps;
                }
                return;
            }
        }
        self.register_outstanding();
        if deps <= 0 {
            self.push_ready(job);
        } else {
            self.state.lock().pending.insert(job, deps);
        }
    }

    /// Decrements `job`'s pending count; pushes it to the ready queue at zero.
    pub fn notify(&self, job: &Job) {
        let mut state = self.state.lock();
        if let Some(count) = state.pending.get_mut(job) {
            *count -= 1;
            if *count <= 0 {
                state.pending.remove(job);
                drop(state);
                self.push_ready(job.clone());
            }
        }
    }

    /// Notifies `job` on behalf of producer task `source`, registering it with `needed`
    /// total dependencies the first time any producer reaches it. A second (or
    /// hundredth) call from the same `source` for the same `job` is a no-op: only a
    /// genuinely distinct producer task advances `job` toward readiness, so a reduce task
    /// that calls this once per internal block still contributes exactly one dependency.
    pub fn notify_from(&self, job: &Job, source: TaskId, needed: i64) {
        let first_from_source = {
            let mut state = self.state.lock();
            state.seen_by.entry(job.clone()).or_default().insert(source)
        };
        if !first_from_source {
            return;
        }
        self.add_job(job.clone(), needed.max(1));
        self.notify(job);
        let mut state = self.state.lock();
        if !state.pending.contains_key(job) {
            state.seen_by.remove(job);
        }
    }

    fn register_outstanding(&self) {
        self.state.lock().outstanding += 1;
        self.progress.add_total(1);
    }

    fn push_ready(&self, job: Job) {
        let priority = self.priority.get(&job.task).copied().unwrap_or(0);
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut state = self.state.lock();
        state.heap.push(Ready { priority, seq, job });
        self.cv.notify_one();
    }

    /// Blocks until a job is ready or global termination is observed, returning `None` in
    /// the latter case.
    pub fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if let Some(ready) = state.heap.pop() {
                return Some(ready.job);
            }
            if state.closed {
                return None;
            }
            self.cv.wait(&mut state);
        }
    }

    /// Marks `job` finished. When the last outstanding job drains, closes the queue so
    /// every blocked `next_job` wakes with `None`.
    pub fn finish_job(&self) {
        self.progress.complete(1);
        let mut state = self.state.lock();
        state.outstanding -= 1;
        trace!(outstanding = state.outstanding, "job finished");
        if state.outstanding <= 0 {
            state.closed = true;
            self.cv.notify_all();
        }
    }

    /// Immediately closes the queue, waking every blocked worker with `None`. Used by the
    /// worker pool's global-abort path: a device error unblocks the
    /// scheduler so all workers drain without completing remaining jobs.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.heap.clear();
        self.cv.notify_all();
    }

    /// Current completion fraction, `[0.0, 1.0]`.
    pub fn progress(&self) -> f32 {
        self.progress.fraction()
    }
}
