//! Worker pool for tree-block allocations made while splitting a tree.
//!
//! A split deep inside a tree descent must not grow the caller's stack any
//! further, so the allocation runs on a pool thread while the submitter
//! blocks on a completion. The submitter's memory-reclaim restrictions travel
//! with the request as an explicit [`ReclaimFlags`] argument.

use fxt_error::{FxtError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

/// Memory-reclaim restrictions in force for the submitting context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReclaimFlags(pub u32);

impl ReclaimFlags {
    pub const NONE: Self = Self(0);
    /// Reclaim must not recurse into the filesystem.
    pub const NOFS: Self = Self(1);
    /// Reclaim must not issue I/O.
    pub const NOIO: Self = Self(1 << 1);
    /// The context may dip into emergency reserves.
    pub const MEMALLOC: Self = Self(1 << 2);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Display for ReclaimFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::NOFS) {
            names.push("nofs");
        }
        if self.contains(Self::NOIO) {
            names.push("noio");
        }
        if self.contains(Self::MEMALLOC) {
            names.push("memalloc");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

// ── Completion ──────────────────────────────────────────────────────────────

struct Completion<T> {
    slot: Mutex<Option<Result<T>>>,
    done: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn fill(&self, value: Result<T>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(value);
        }
        drop(slot);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.done.wait(&mut slot);
        }
    }
}

/// Completes with `Cancelled` if the job is dropped without running to the
/// end, so a submitter never waits forever.
struct CompletionGuard<T>(Arc<Completion<T>>);

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        self.0.fill(Err(FxtError::Cancelled));
    }
}

// ── Pool ────────────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce(ReclaimFlags) + Send + 'static>;

#[derive(Default)]
struct Queue {
    jobs: VecDeque<(ReclaimFlags, Job)>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

pub struct SplitAllocPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for SplitAllocPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.shared.queue.lock().jobs.len();
        f.debug_struct("SplitAllocPool")
            .field("workers", &self.workers.len())
            .field("pending", &pending)
            .finish()
    }
}

impl SplitAllocPool {
    /// Start `workers` threads (at least one).
    pub fn new(workers: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
        });
        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("fxt-split-alloc-{index}"))
                .spawn(move || worker_loop(index, &shared))?;
            handles.push(handle);
        }
        debug!(workers = handles.len(), "split allocation pool started");
        Ok(Self {
            shared,
            workers: handles,
        })
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Run `job` on a pool thread and wait for its result.
    ///
    /// `job` receives `flags` as the reclaim context it must honour.
    pub fn run<T, F>(&self, flags: ReclaimFlags, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(ReclaimFlags) -> Result<T> + Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let guard = CompletionGuard(Arc::clone(&completion));
        let boxed: Job = Box::new(move |flags| {
            let value = job(flags);
            guard.0.fill(value);
        });
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(FxtError::Cancelled);
            }
            queue.jobs.push_back((flags, boxed));
        }
        self.shared.ready.notify_one();
        completion.wait()
    }
}

fn worker_loop(index: usize, shared: &Shared) {
    loop {
        let (flags, job) = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(next) = queue.jobs.pop_front() {
                    break next;
                }
                if queue.shutdown {
                    return;
                }
                shared.ready.wait(&mut queue);
            }
        };
        trace!(worker = index, %flags, "running split allocation");
        if catch_unwind(AssertUnwindSafe(|| job(flags))).is_err() {
            error!(worker = index, "split allocation job panicked");
        }
    }
}

impl Drop for SplitAllocPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
        }
        self.shared.ready.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
