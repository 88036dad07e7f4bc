use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crossbeam_channel::Sender;
use tracing::debug;

use crate::error::{DocvaultError, Result};

type Job<'env> = Box<dyn FnOnce() -> Result<()> + Send + 'env>;

/// Completion tracking shared between the submitter and the workers.
struct Pending {
    state: Mutex<PendingState>,
    idle: Condvar,
}

#[derive(Default)]
struct PendingState {
    running: usize,
    errors: Vec<DocvaultError>,
}

impl Pending {
    fn new() -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn started(&self) {
        self.lock().running += 1;
    }

    fn finished(&self, result: Result<()>) {
        let mut st = self.lock();
        st.running -= 1;
        if let Err(e) = result {
            st.errors.push(e);
        }
        if st.running == 0 {
            self.idle.notify_all();
        }
    }
}

/// Fixed-size pool of scoped workers.
///
/// Jobs are handed over a rendezvous channel, so [`submit`](Self::submit)
/// blocks while every worker is busy. Jobs may borrow from the enclosing
/// scope. Job errors are collected, not propagated.
pub struct RateLimiter<'env> {
    jobs: Sender<Job<'env>>,
    pending: Arc<Pending>,
    workers: usize,
}

impl<'env> RateLimiter<'env> {
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` on the next free worker.
    pub fn submit(&self, job: impl FnOnce() -> Result<()> + Send + 'env) {
        self.pending.started();
        if let Err(e) = self.jobs.send(Box::new(job)) {
            // Only reachable when every worker has panicked.
            drop(e.into_inner());
            self.pending
                .finished(Err(DocvaultError::Other("no worker available".into())));
        }
    }

    /// Block until every submitted job has finished.
    pub fn wait_idle(&self) {
        let mut st = self.pending.lock();
        while st.running > 0 {
            st = self
                .pending
                .idle
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait for outstanding jobs, then drain the errors collected so far.
    pub fn take_errors(&self) -> Vec<DocvaultError> {
        self.wait_idle();
        std::mem::take(&mut self.pending.lock().errors)
    }
}

/// Run `f` with a [`RateLimiter`] of `workers` threads. All jobs have finished
/// when this returns.
pub fn scoped<'env, T>(workers: usize, f: impl FnOnce(&RateLimiter<'env>) -> T) -> T {
    let workers = workers.max(1);
    let (tx, rx) = crossbeam_channel::bounded::<Job<'env>>(0);
    let pending = Arc::new(Pending::new());

    std::thread::scope(|s| {
        for _ in 0..workers {
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            s.spawn(move || {
                for job in rx.iter() {
                    pending.finished(job());
                }
            });
        }
        drop(rx);

        let limiter = RateLimiter {
            jobs: tx,
            pending: Arc::clone(&pending),
            workers,
        };
        let out = f(&limiter);
        limiter.wait_idle();
        debug!(workers, "rate limiter drained");
        out
    })
}
