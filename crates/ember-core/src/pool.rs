//! Persistent worker pool for row-parallel kernels.
//!
//! Workers park on a condition variable until a dispatch pushes row ranges
//! onto the queue. The dispatching thread runs the first range itself, then
//! blocks on a per-dispatch latch until every pushed range has finished.
//! A panic in any range is re-raised on the dispatching thread after all
//! ranges are done.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::capability;

type Task<'a> = dyn Fn(Range<usize>) + Sync + 'a;

struct Job {
    task: &'static Task<'static>,
    range: Range<usize>,
    latch: Arc<Latch>,
}

impl Job {
    fn execute(self) {
        let task = self.task;
        let range = self.range;
        if panic::catch_unwind(AssertUnwindSafe(|| task(range))).is_err() {
            self.latch.panicked.store(true, Ordering::Release);
        }
        self.latch.count_down();
    }
}

struct Latch {
    remaining: Mutex<usize>,
    done: Condvar,
    panicked: AtomicBool,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            done: Condvar::new(),
            panicked: AtomicBool::new(false),
        }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.done.wait(&mut remaining);
        }
    }
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Fixed set of parked worker threads plus the calling thread.
pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Pool running on `threads` threads in total, the caller included.
    pub(crate) fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::new();
        for index in 1..threads.max(1) {
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("ember-worker-{}", index))
                .spawn(move || worker_loop(&shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    warn!(error = %e, spawned = workers.len(), "worker spawn failed, pool shrunk");
                    break;
                }
            }
        }
        debug!(threads = workers.len() + 1, "worker pool started");
        Self { shared, workers }
    }

    /// Threads available to a dispatch, the caller included.
    pub(crate) fn threads(&self) -> usize {
        self.workers.len() + 1
    }

    /// Run `task` over `0..len` split into at most `max_parts` contiguous
    /// ranges of at least `min_chunk` items each.
    pub(crate) fn run(&self, len: usize, min_chunk: usize, max_parts: usize, task: &Task<'_>) {
        if len == 0 {
            return;
        }
        let parts = (len / min_chunk.max(1))
            .min(max_parts)
            .min(self.threads())
            .max(1);
        if parts == 1 {
            task(0..len);
            return;
        }
        let chunk = len.div_ceil(parts);
        let ranges: Vec<Range<usize>> = (0..len)
            .step_by(chunk)
            .map(|start| start..(start + chunk).min(len))
            .collect();

        // SAFETY: the reference only outlives this call inside queued jobs,
        // and this call does not return (or unwind) until the latch reports
        // that every queued job has finished.
        let task_static: &'static Task<'static> =
            unsafe { std::mem::transmute::<&Task<'_>, &'static Task<'static>>(task) };
        let latch = Arc::new(Latch::new(ranges.len() - 1));
        {
            let mut queue = self.shared.queue.lock();
            for range in &ranges[1..] {
                queue.jobs.push_back(Job {
                    task: task_static,
                    range: range.clone(),
                    latch: Arc::clone(&latch),
                });
            }
        }
        self.shared.available.notify_all();

        let local = panic::catch_unwind(AssertUnwindSafe(|| task(ranges[0].clone())));
        latch.wait();

        if let Err(payload) = local {
            panic::resume_unwind(payload);
        }
        if latch.panicked.load(Ordering::Acquire) {
            panic!("worker pool task panicked");
        }
    }

    /// Call `f(row_index, row)` for every `row_len`-sized row of `data`,
    /// rows split across the pool.
    pub(crate) fn for_each_row(
        &self,
        data: &mut [f32],
        row_len: usize,
        min_rows: usize,
        max_parts: usize,
        f: &(dyn Fn(usize, &mut [f32]) + Sync),
    ) {
        if row_len == 0 {
            return;
        }
        let rows = data.len() / row_len;
        let base = RowPtr(data.as_mut_ptr());
        self.run(rows, min_rows, max_parts, &|range: Range<usize>| {
            for r in range {
                // SAFETY: ranges handed out by `run` are disjoint and lie
                // within `0..rows`, so each row slice is unique and in bounds.
                let row =
                    unsafe { std::slice::from_raw_parts_mut(base.get().add(r * row_len), row_len) };
                f(r, row);
            }
        });
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[derive(Clone, Copy)]
struct RowPtr(*mut f32);

// SAFETY: only used to hand out disjoint rows of one slice.
unsafe impl Send for RowPtr {}
unsafe impl Sync for RowPtr {}

impl RowPtr {
    fn get(self) -> *mut f32 {
        self.0
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        job.execute();
    }
}

static GLOBAL: OnceLock<WorkerPool> = OnceLock::new();

/// Process-wide pool, sized from [`capability::recommended_threads`] on
/// first use and never torn down.
pub(crate) fn global() -> &'static WorkerPool {
    GLOBAL.get_or_init(|| WorkerPool::new(capability::recommended_threads()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn covers_every_index_once() {
        let pool = WorkerPool::new(4);
        let hits: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        pool.run(hits.len(), 10, usize::MAX, &|range| {
            for i in range {
                hits[i].fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn small_inputs_run_inline() {
        let pool = WorkerPool::new(4);
        let caller = thread::current().id();
        pool.run(3, 8, usize::MAX, &|_| assert_eq!(thread::current().id(), caller));
    }

    #[test]
    fn rows_are_disjoint() {
        let pool = WorkerPool::new(3);
        let mut data = vec![0.0f32; 64 * 5];
        pool.for_each_row(&mut data, 5, 1, usize::MAX, &|r, row| {
            for v in row.iter_mut() {
                *v += r as f32;
            }
        });
        for (r, row) in data.chunks(5).enumerate() {
            assert!(row.iter().all(|&v| v == r as f32));
        }
    }

    #[test]
    fn worker_panic_reaches_caller() {
        let pool = WorkerPool::new(2);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.run(100, 1, usize::MAX, &|range| {
                if range.start > 0 {
                    panic!("boom");
                }
            });
        }));
        assert!(result.is_err());
        // Pool stays usable.
        let count = AtomicUsize::new(0);
        pool.run(100, 1, usize::MAX, &|range| {
            count.fetch_add(range.len(), Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn single_thread_pool() {
        let pool = WorkerPool::new(1);
        assert_eq!(pool.threads(), 1);
        let count = AtomicUsize::new(0);
        pool.run(50, 1, usize::MAX, &|range| {
            count.fetch_add(range.len(), Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 50);
    }
}
