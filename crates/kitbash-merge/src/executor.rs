//! Bounded worker pool for per-key evaluation.
//!
//! Jobs are queued up front on one channel and results come back on another.
//! The first failing job raises an abort flag; workers check it before taking
//! their next job, so nothing new starts while in-flight jobs run to
//! completion. [`Executor::run`] returns only after every worker has been
//! joined.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::unbounded;
use tracing::{debug, warn};

use crate::{MergeError, Result};

/// Fixed-size pool of scoped worker threads.
#[derive(Debug, Clone, Copy)]
pub struct Executor {
    threads: usize,
}

impl Executor {
    /// Create a pool of `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Configured worker count.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run `work` over every job.
    ///
    /// Results come back in completion order. On failure the first error is
    /// returned and the results of jobs that did finish are dropped. A
    /// panicking worker is reported as [`MergeError::Internal`].
    pub fn run<J, R, F>(&self, jobs: Vec<J>, work: F) -> Result<Vec<R>>
    where
        J: Send,
        R: Send,
        F: Fn(J) -> Result<R> + Sync,
    {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let total = jobs.len();
        let workers = self.threads.min(total);
        debug!("Running {} jobs on {} workers", total, workers);

        let (job_tx, job_rx) = unbounded();
        for job in jobs {
            // The receiver is alive, so the queue cannot be disconnected.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let (result_tx, result_rx) = unbounded::<Result<R>>();
        let abort = AtomicBool::new(false);
        let (abort, work) = (&abort, &work);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let job_rx = job_rx.clone();
                    let result_tx = result_tx.clone();
                    scope.spawn(move || {
                        while !abort.load(Ordering::Acquire) {
                            let Ok(job) = job_rx.recv() else {
                                break;
                            };
                            let result = work(job);
                            if result.is_err() {
                                abort.store(true, Ordering::Release);
                            }
                            if result_tx.send(result).is_err() {
                                break;
                            }
                        }
                    })
                })
                .collect();
            drop(result_tx);

            let mut results = Vec::with_capacity(total);
            let mut first_error = None;
            for result in result_rx.iter() {
                match result {
                    Ok(value) => results.push(value),
                    Err(e) if first_error.is_none() => first_error = Some(e),
                    Err(e) => debug!("Suppressed follow-up failure: {}", e),
                }
            }

            let mut panicked = 0usize;
            for handle in handles {
                if handle.join().is_err() {
                    panicked += 1;
                }
            }

            if let Some(e) = first_error {
                return Err(e);
            }
            if panicked > 0 {
                warn!("{} worker(s) panicked", panicked);
                return Err(MergeError::Internal(format!(
                    "{panicked} worker thread(s) panicked"
                )));
            }
            if results.len() != total {
                return Err(MergeError::Internal(format!(
                    "{} of {} jobs produced no result",
                    total - results.len(),
                    total
                )));
            }
            Ok(results)
        })
    }
}

impl Default for Executor {
    fn default() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(2);
        Self::new(threads)
    }
}
