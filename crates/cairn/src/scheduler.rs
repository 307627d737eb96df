//! The task scheduler: a worker pool with a shared queue and
//! help-while-waiting.
//!
//! Tasks are grouped by an atomic counter shared by the submitter.
//! `spawn` increments the counter and enqueues; the counter is
//! decremented when the task finishes. `wait` blocks until a counter
//! drains, but a waiting thread participates in executing queued tasks —
//! this is what makes recursive fan-out (a recipe waiting on its
//! prerequisites' recipes) deadlock-free on a bounded pool.
//!
//! In serial mode (`--serial` or a single job) tasks run inline at the
//! spawn point and `wait` never blocks.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

/// Counter shared by a group of tasks; `wait` drains it to zero.
pub type TaskCount = Arc<AtomicUsize>;

pub fn new_count() -> TaskCount {
    Arc::new(AtomicUsize::new(0))
}

type Task = Box<dyn FnOnce() + Send>;

struct Shared {
    queue: std::collections::VecDeque<Task>,
    shutdown: bool,
}

struct Inner {
    shared: Mutex<Shared>,
    /// Signaled when a task is queued or a task group may have drained.
    work: Condvar,
    /// Tasks queued but not yet finished; used by the idle check.
    pending: AtomicUsize,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    serial: bool,
}

impl Scheduler {
    /// Create with `jobs` worker threads. Zero or one means serial.
    pub fn new(jobs: usize) -> Self {
        let serial = jobs <= 1;
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared { queue: std::collections::VecDeque::new(), shutdown: false }),
            work: Condvar::new(),
            pending: AtomicUsize::new(0),
        });
        let sched = Self { inner: inner.clone(), workers: Mutex::new(Vec::new()), serial };
        if !serial {
            let mut workers = sched.workers.lock();
            for i in 0..jobs {
                let inner = inner.clone();
                workers.push(
                    std::thread::Builder::new()
                        .name(format!("cairn-worker-{i}"))
                        .spawn(move || worker_loop(&inner))
                        .expect("failed to spawn worker thread"),
                );
            }
        }
        sched
    }

    pub fn serial(&self) -> bool {
        self.serial
    }

    /// Enqueue a task tied to `count`. The count is incremented here and
    /// decremented when the task completes. In serial mode the task runs
    /// inline.
    pub fn spawn<F>(&self, count: &TaskCount, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        count.fetch_add(1, Ordering::AcqRel);
        if self.serial {
            f();
            count.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let inner = self.inner.clone();
        let count = count.clone();
        let task: Task = Box::new(move || {
            f();
            count.fetch_sub(1, Ordering::AcqRel);
            inner.work.notify_all();
        });
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        self.inner.shared.lock().queue.push_back(task);
        self.inner.work.notify_one();
    }

    /// Block until `count` reaches zero, executing queued tasks while
    /// waiting.
    pub fn wait(&self, count: &TaskCount) {
        while count.load(Ordering::Acquire) != 0 {
            if !self.try_run_one() {
                // Nothing runnable; park until some task completes.
                let mut shared = self.inner.shared.lock();
                if count.load(Ordering::Acquire) == 0 || !shared.queue.is_empty() {
                    continue;
                }
                self.inner.work.wait_for(&mut shared, Duration::from_millis(10));
            }
        }
    }

    /// Pop and run one queued task; false if the queue was empty.
    fn try_run_one(&self) -> bool {
        let task = self.inner.shared.lock().queue.pop_front();
        match task {
            Some(t) => {
                t();
                self.inner.pending.fetch_sub(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// True when no tasks are queued or running.
    pub fn idle(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire) == 0
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let task = {
            let mut shared = inner.shared.lock();
            loop {
                if shared.shutdown {
                    return;
                }
                if let Some(t) = shared.queue.pop_front() {
                    break t;
                }
                inner.work.wait(&mut shared);
            }
        };
        task();
        inner.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        {
            let mut shared = self.inner.shared.lock();
            shared.shutdown = true;
        }
        self.inner.work.notify_all();
        for w in self.workers.lock().drain(..) {
            let _ = w.join();
        }
    }
}

/// The three context phases. Load is exclusive and single-threaded; match
/// and execute are shared among workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunPhase {
    Load,
    Match,
    Execute,
}

struct PhaseState {
    phase: RunPhase,
    users: usize,
}

/// The phase arbiter: grants phase locks, switching phases only when all
/// users of the previous phase have unlocked.
pub struct PhaseMutex {
    state: Mutex<PhaseState>,
    cv: Condvar,
}

impl PhaseMutex {
    pub fn new() -> Self {
        Self { state: Mutex::new(PhaseState { phase: RunPhase::Load, users: 0 }), cv: Condvar::new() }
    }

    pub fn current(&self) -> RunPhase {
        self.state.lock().phase
    }

    /// Acquire the given phase, waiting for a conflicting phase to drain.
    /// Load is exclusive (single user); match and execute are shared.
    pub fn lock(&self, phase: RunPhase) -> PhaseGuard<'_> {
        let mut st = self.state.lock();
        loop {
            if st.users == 0 {
                st.phase = phase;
                st.users = 1;
                break;
            }
            if st.phase == phase && phase != RunPhase::Load {
                st.users += 1;
                break;
            }
            self.cv.wait(&mut st);
        }
        PhaseGuard { arbiter: self }
    }

    fn unlock(&self) {
        let mut st = self.state.lock();
        st.users -= 1;
        if st.users == 0 {
            self.cv.notify_all();
        }
    }
}

impl Default for PhaseMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII phase occupancy.
pub struct PhaseGuard<'a> {
    arbiter: &'a PhaseMutex,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.arbiter.unlock();
    }
}

/// Context-wide failure flag: once set, drivers stop scheduling new tasks
/// (already-running tasks complete).
#[derive(Default)]
pub struct FailFlag(AtomicBool);

impl FailFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
