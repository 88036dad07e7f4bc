use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tracing::warn;

use crate::error::{DocvaultError, Result};

/// Per-run state shared by every component of a backup, restore or
/// compaction: cooperative cancellation and a progress counter.
#[derive(Debug, Default)]
pub struct RunContext {
    canceled: AtomicBool,
    ops: AtomicU64,
    shutdown: Option<Arc<AtomicBool>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that also observes an external shutdown flag, such as the
    /// one set by the CLI's signal handler.
    pub fn with_shutdown(flag: Arc<AtomicBool>) -> Self {
        Self {
            shutdown: Some(flag),
            ..Self::default()
        }
    }

    /// Record forward progress.
    pub fn tick(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
            || self
                .shutdown
                .as_ref()
                .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Return `Err(DocvaultError::Interrupted)` once the run is canceled.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(DocvaultError::Interrupted);
        }
        Ok(())
    }
}

/// Cancels a run whose operation counter stops advancing for `timeout`.
///
/// Stops when dropped.
pub struct Watchdog {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn start(ctx: Arc<RunContext>, timeout: Duration) -> Result<Self> {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("docvault-watchdog".into())
            .spawn(move || {
                let mut last = ctx.ops();
                loop {
                    match stopped.recv_timeout(timeout) {
                        Err(RecvTimeoutError::Timeout) => {
                            let now = ctx.ops();
                            if now == last {
                                warn!(
                                    timeout_secs = timeout.as_secs(),
                                    "no progress within timeout, canceling run"
                                );
                                ctx.cancel();
                                return;
                            }
                            last = now;
                        }
                        _ => return,
                    }
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
