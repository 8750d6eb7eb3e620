use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A unit of work dispatched to a scheduler. May borrow from the caller.
pub type Job<'a> = Box<dyn FnOnce() + Send + 'a>;

/// Errors from building a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Outcome of one fork-join dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkJoinReport {
    pub dispatched: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for ForkJoinReport {
    fn add_assign(&mut self, rhs: Self) {
        self.dispatched += rhs.dispatched;
        self.failed += rhs.failed;
    }
}

/// Fork-join executor for the load and batch phases.
///
/// `fork_join` returns only after every job has finished. A panicking job is
/// caught at the job boundary and counted in the report; it never prevents
/// the join from completing.
pub trait WorkScheduler: Send + Sync {
    /// Number of jobs that can run at the same time.
    fn worker_count(&self) -> usize;

    fn fork_join<'a>(&self, jobs: Vec<Job<'a>>) -> ForkJoinReport;
}

/// Fixed-size pool of OS threads backed by rayon.
pub struct RayonScheduler {
    pool: rayon::ThreadPool,
}

impl RayonScheduler {
    pub fn new(threads: usize) -> Result<Self, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("canopy-worker-{i}"))
            .build()?;
        tracing::debug!(threads = pool.current_num_threads(), "worker pool started");
        Ok(Self { pool })
    }
}

impl WorkScheduler for RayonScheduler {
    fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn fork_join<'a>(&self, jobs: Vec<Job<'a>>) -> ForkJoinReport {
        let dispatched = jobs.len();
        let failed = AtomicUsize::new(0);
        self.pool.scope(|s| {
            for job in jobs {
                let failed = &failed;
                s.spawn(move |_| {
                    if !run_guarded(job) {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        ForkJoinReport {
            dispatched,
            failed: failed.into_inner(),
        }
    }
}

/// Runs every job on the calling thread, in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineScheduler;

impl WorkScheduler for InlineScheduler {
    fn worker_count(&self) -> usize {
        1
    }

    fn fork_join<'a>(&self, jobs: Vec<Job<'a>>) -> ForkJoinReport {
        let dispatched = jobs.len();
        let failed = jobs.into_iter().map(run_guarded).filter(|ok| !ok).count();
        ForkJoinReport { dispatched, failed }
    }
}

/// Run a job, converting a panic into a logged failure.
pub fn run_guarded(job: Job<'_>) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(reason = panic_message(payload.as_ref()), "vegetation worker panicked");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
