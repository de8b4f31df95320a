//! Work-stealing pool that runs lazy code generation.
//!
//! Every worker owns a deque. Submissions go to the least loaded worker;
//! an idle worker steals from the back of its siblings' deques before
//! parking on its condition variable.

use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    io,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Number of worker threads, at least one.
    pub workers: usize,
    /// How long an idle worker parks before polling its siblings again.
    pub idle_wait: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            idle_wait: Duration::from_millis(10),
        }
    }
}

struct Worker {
    id: WorkerId,
    local: Mutex<VecDeque<Job>>,
    has_work: Condvar,
    should_stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(id: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            local: Mutex::new(VecDeque::new()),
            has_work: Condvar::new(),
            should_stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    fn push(&self, job: Job) {
        self.local.lock().push_back(job);
        self.has_work.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        self.local.lock().pop_front()
    }

    fn steal_back(&self) -> Option<Job> {
        self.local.lock().pop_back()
    }
}

struct PoolShared {
    workers: Vec<Arc<Worker>>,
    idle_wait: Duration,
}

impl PoolShared {
    fn worker_loop(&self, me: &Worker) {
        loop {
            if me.should_stop.load(Ordering::Relaxed) {
                break;
            }

            if let Some(job) = me.pop().or_else(|| self.try_steal(me)) {
                // a panicking job must not take the worker down with it
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!("compile job panicked on worker {}", me.id.0);
                }
                continue;
            }

            let mut guard = me.local.lock();
            if guard.is_empty() && !me.should_stop.load(Ordering::Relaxed) {
                let _ = me.has_work.wait_for(&mut guard, self.idle_wait);
            }
        }
    }

    fn try_steal(&self, me: &Worker) -> Option<Job> {
        self.workers
            .iter()
            .filter(|w| w.id != me.id)
            .find_map(|w| w.steal_back())
    }

    fn least_loaded(&self) -> &Arc<Worker> {
        self.workers
            .iter()
            .min_by_key(|w| w.local.lock().len())
            .unwrap_or(&self.workers[0])
    }
}

/// Completion state of one `run_batch` call.
struct Batch<T> {
    results: Mutex<Vec<Option<T>>>,
    remaining: Mutex<usize>,
    done: Condvar,
}

/// Counts a job as finished even when it unwinds.
struct Finished<T>(Arc<Batch<T>>);

impl<T> Drop for Finished<T> {
    fn drop(&mut self) {
        let mut remaining = self.0.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.0.done.notify_all();
        }
    }
}

pub struct CompilePool {
    shared: Arc<PoolShared>,
}

impl CompilePool {
    pub fn new(settings: PoolSettings) -> io::Result<Self> {
        let count = settings.workers.max(1);
        let shared = Arc::new(PoolShared {
            workers: (0..count).map(|i| Worker::new(WorkerId(i))).collect(),
            idle_wait: settings.idle_wait,
        });
        let pool = Self { shared };
        for worker in &pool.shared.workers {
            let me = Arc::clone(&pool.shared);
            let w = Arc::clone(worker);
            let handle = thread::Builder::new()
                .name(format!("hostjit-compile-{}", worker.id.0))
                .spawn(move || me.worker_loop(&w))?;
            *worker.handle.lock() = Some(handle);
        }
        log::debug!("started {count} compile workers");
        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.least_loaded().push(Box::new(job));
    }

    /// Runs every job on the pool and blocks until all of them finished.
    /// Results keep the order of `jobs`; a job that panicked yields `None`.
    pub fn run_batch<T, F>(&self, jobs: Vec<F>) -> Vec<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if jobs.is_empty() {
            return Vec::new();
        }
        let batch = Arc::new(Batch {
            results: Mutex::new((0..jobs.len()).map(|_| None).collect()),
            remaining: Mutex::new(jobs.len()),
            done: Condvar::new(),
        });
        for (slot, job) in jobs.into_iter().enumerate() {
            let finished = Finished(Arc::clone(&batch));
            self.submit(move || {
                let value = job();
                finished.0.results.lock()[slot] = Some(value);
                drop(finished);
            });
        }

        let mut remaining = batch.remaining.lock();
        while *remaining > 0 {
            batch.done.wait(&mut remaining);
        }
        drop(remaining);
        std::mem::take(&mut *batch.results.lock())
    }

    pub fn shutdown(&self) {
        for w in &self.shared.workers {
            w.should_stop.store(true, Ordering::Relaxed);
            w.has_work.notify_all();
        }
        for w in &self.shared.workers {
            if let Some(h) = w.handle.lock().take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for CompilePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool(workers: usize) -> CompilePool {
        CompilePool::new(PoolSettings {
            workers,
            idle_wait: Duration::from_millis(5),
        })
        .unwrap()
    }

    #[test]
    fn batch_results_keep_submission_order() {
        let pool = pool(3);
        let jobs: Vec<_> = (0..20).map(|i| move || i * i).collect();
        let results = pool.run_batch(jobs);
        let expected: Vec<_> = (0..20).map(|i| Some(i * i)).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn jobs_run_on_named_workers() {
        let pool = pool(2);
        let names = pool.run_batch(
            (0..4)
                .map(|_| || thread::current().name().map(str::to_string))
                .collect(),
        );
        for name in names {
            let name = name.flatten().unwrap();
            assert!(name.starts_with("hostjit-compile-"), "{name}");
        }
    }

    #[test]
    fn panicking_job_does_not_wedge_the_batch() {
        let pool = pool(1);
        let jobs: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
            Box::new(|| 1),
            Box::new(|| panic!("boom")),
            Box::new(|| 3),
        ];
        let results = pool.run_batch(jobs.into_iter().map(|j| move || j()).collect());
        assert_eq!(results, vec![Some(1), None, Some(3)]);
    }

    #[test]
    fn idle_workers_steal() {
        let pool = pool(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let busy = Arc::clone(&pool.shared.workers[0]);
        for _ in 0..16 {
            let ran = Arc::clone(&ran);
            busy.push(Box::new(move || {
                thread::sleep(Duration::from_millis(2));
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let done = pool.run_batch(vec![|| ()]);
        assert_eq!(done.len(), 1);
        while ran.load(Ordering::SeqCst) < 16 {
            thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 16);
    }
}
