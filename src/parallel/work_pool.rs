//! Fixed size worker pool fed from a shared LIFO stack
//!
//! Work items are borrowed from the caller of [`WorkPool::queue_items_and_wait`].
//! That call does not return before the latch shared by its items reaches zero,
//! and every item counts the latch down only after it finished running, so no
//! worker touches an item once the caller's borrow ends.

use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use super::latch::Latch;
use super::semaphore::Semaphore;
use crate::Result;

/// Unit of work executed on a pool thread.
///
/// Implementations run concurrently with their siblings and must not panic;
/// a panicking item is logged and counted as finished.
pub trait WorkItem: Sync {
    fn do_one(&self);
}

struct Job {
    item: *const (dyn WorkItem + 'static),
    latch: Arc<Latch>,
}

// SAFETY: the pointee is `Sync` and outlives the job, see the module docs
unsafe impl Send for Job {}

impl Job {
    fn new(item: &dyn WorkItem, latch: &Arc<Latch>) -> Self {
        let item: *const (dyn WorkItem + '_) = item;
        // SAFETY: only the lifetime is erased. The owning `queue_items_and_wait`
        // call blocks until this job's latch count has been consumed.
        let item: *const (dyn WorkItem + 'static) = unsafe { std::mem::transmute(item) };
        Self {
            item,
            latch: latch.clone(),
        }
    }

    fn run(self) {
        // SAFETY: see `Job::new`
        let item = unsafe { &*self.item };
        run_item(item);
        self.latch.count_down();
    }
}

fn run_item(item: &dyn WorkItem) {
    if panic::catch_unwind(AssertUnwindSafe(|| item.do_one())).is_err() {
        error!("Work item panicked, its output is incomplete");
    }
}

struct Shared {
    stack: Mutex<Vec<Job>>,
    semaphore: Semaphore,
    ended: AtomicBool,
}

impl Shared {
    fn stack(&self) -> MutexGuard<'_, Vec<Job>> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Job> {
        self.stack().pop()
    }
}

pub struct WorkPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
    pin_workers: bool,
}

/// Logical CPUs available to this process
pub fn get_logical_cpu_count() -> usize {
    core_affinity::get_core_ids()
        .map(|ids| ids.len())
        .filter(|count| *count > 0)
        .or_else(|| thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
}

impl WorkPool {
    pub fn new(thread_count: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                stack: Mutex::new(Vec::new()),
                semaphore: Semaphore::new(0),
                ended: AtomicBool::new(false),
            }),
            threads: Mutex::new(Vec::new()),
            thread_count,
            pin_workers: false,
        }
    }

    /// One worker per logical CPU, minus the CPU of the submitting thread
    pub fn with_default_thread_count() -> Self {
        Self::new(get_logical_cpu_count().saturating_sub(1))
    }

    pub fn with_pinned_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    fn threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_started(&self) -> bool {
        !self.threads().is_empty()
    }

    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads();
        if !threads.is_empty() {
            warn!("Work pool already started");
            return Ok(());
        }

        self.shared.ended.store(false, Ordering::Release);
        self.shared.stack().reserve(super::split::MAX_WORK_ITEM_COUNT);

        let core_ids = if self.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        for index in 0..self.thread_count {
            let shared = self.shared.clone();
            // Leave the first core to the submitting thread
            let core = (!core_ids.is_empty()).then(|| core_ids[(index + 1) % core_ids.len()]);

            let handle = thread::Builder::new()
                .name(format!("tcam-work-{index}"))
                .spawn(move || {
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            debug!("Unable to pin worker {} to core {:?}", index, core);
                        }
                    }
                    worker_loop(&shared);
                })?;
            threads.push(handle);
        }

        info!("Work pool started with {} threads", self.thread_count);
        Ok(())
    }

    pub fn stop(&self) {
        let handles: Vec<_> = self.threads().drain(..).collect();
        if handles.is_empty() {
            return;
        }

        self.shared.ended.store(true, Ordering::Release);
        // One wakeup per thread, each observes `ended` and leaves
        self.shared.semaphore.unlock(handles.len());

        for handle in handles {
            if handle.join().is_err() {
                error!("Work pool thread terminated abnormally");
            }
        }
        self.shared.semaphore.reset();
        debug!("Work pool stopped");
    }

    /// Runs every item exactly once and returns after all of them finished.
    ///
    /// All but the last item are pushed to the pool; the calling thread runs the
    /// last one itself and then helps with whatever is still queued.
    pub fn queue_items_and_wait<W: WorkItem>(&self, latch: &Arc<Latch>, items: &[W]) {
        let Some((last, queued)) = items.split_last() else {
            return;
        };

        latch.reset(items.len());

        if !queued.is_empty() {
            self.shared
                .stack()
                .extend(queued.iter().map(|item| Job::new(item, latch)));
            self.shared.semaphore.unlock(queued.len());
        }

        let own = panic::catch_unwind(AssertUnwindSafe(|| last.do_one()));

        while let Some(job) = self.shared.pop() {
            job.run();
        }

        latch.count_down_and_wait();

        if let Err(payload) = own {
            panic::resume_unwind(payload);
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        shared.semaphore.lock();
        if shared.ended.load(Ordering::Acquire) {
            break;
        }
        if let Some(job) = shared.pop() {
            job.run();
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DefaultPool {
    pool: Arc<WorkPool>,
    refs: usize,
}

static DEFAULT_POOL: Mutex<Option<DefaultPool>> = Mutex::new(None);

fn default_pool() -> MutexGuard<'static, Option<DefaultPool>> {
    DEFAULT_POOL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reference to the process wide work pool.
///
/// The pool is built and started by the first acquire and stopped when the
/// last handle is released or dropped.
pub struct WorkPoolHandle {
    pool: Arc<WorkPool>,
}

impl Deref for WorkPoolHandle {
    type Target = WorkPool;

    fn deref(&self) -> &WorkPool {
        &self.pool
    }
}

impl Drop for WorkPoolHandle {
    fn drop(&mut self) {
        let retired = {
            let mut slot = default_pool();
            match slot.as_mut() {
                Some(entry) if Arc::ptr_eq(&entry.pool, &self.pool) => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        slot.take()
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(entry) = retired {
            entry.pool.stop();
            debug!("Default work pool released");
        }
    }
}

pub fn acquire_default_work_pool() -> Result<WorkPoolHandle> {
    let mut slot = default_pool();

    if let Some(entry) = slot.as_mut() {
        entry.refs += 1;
        return Ok(WorkPoolHandle {
            pool: entry.pool.clone(),
        });
    }

    let config = crate::CONFIG.load();
    let pool = Arc::new(
        WorkPool::with_default_thread_count().with_pinned_workers(config.parallel.pin_workers),
    );
    pool.start()?;

    *slot = Some(DefaultPool {
        pool: pool.clone(),
        refs: 1,
    });
    Ok(WorkPoolHandle { pool })
}

pub fn release_default_work_pool(handle: WorkPoolHandle) {
    drop(handle);
}

/// Number of outstanding handles on the default pool, 0 when it is torn down
pub fn default_work_pool_refs() -> usize {
    default_pool().as_ref().map_or(0, |entry| entry.refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter<'a>(&'a AtomicUsize);

    impl WorkItem for Counter<'_> {
        fn do_one(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pool_without_workers_runs_everything_inline() {
        let pool = WorkPool::new(0);
        pool.start().unwrap();

        let hits = AtomicUsize::new(0);
        let items: Vec<_> = (0..5).map(|_| Counter(&hits)).collect();
        let latch = Arc::new(Latch::default());
        pool.queue_items_and_wait(&latch, &items);

        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn stop_is_idempotent() {
        let pool = WorkPool::new(2);
        pool.start().unwrap();
        assert!(pool.is_started());
        pool.stop();
        pool.stop();
        assert!(!pool.is_started());
    }
}
