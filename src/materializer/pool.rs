//! Bounded worker fan-out
//!
//! Each realization stage hands its items to a fixed number of scoped worker
//! threads through a crossbeam channel and waits for all of them before
//! returning. Workers stop picking up items once the stage has failed or the
//! shared [`CancelToken`] fires.

use crate::error::Result;
use crossbeam::channel::unbounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one fan-out stage
#[derive(Debug)]
pub struct Batch<R> {
    /// Per-item outcomes in input order; `None` for items never started
    pub results: Vec<Option<Result<R>>>,
    /// A worker thread panicked
    pub panicked: bool,
}

impl<R> Batch<R> {
    /// First failure in input order
    pub fn first_error(&mut self) -> Option<crate::error::Error> {
        let index = self.results.iter().position(|r| matches!(r, Some(Err(_))))?;
        match self.results[index].take() {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// Every item ran and succeeded
    pub fn is_complete(&self) -> bool {
        !self.panicked && self.results.iter().all(|r| matches!(r, Some(Ok(_))))
    }

    /// Successful results, keeping their input index
    pub fn succeeded(self) -> impl Iterator<Item = (usize, R)> {
        self.results
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| match r {
                Some(Ok(value)) => Some((i, value)),
                _ => None,
            })
    }
}

/// Run `job` over `items` on at most `workers` threads
pub fn fan_out<T, R, F>(items: &[T], workers: usize, cancel: &CancelToken, job: F) -> Batch<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    let workers = workers.clamp(1, items.len().max(1));
    let (job_tx, job_rx) = unbounded::<usize>();
    let (result_tx, result_rx) = unbounded::<(usize, Result<R>)>();
    let failed = AtomicBool::new(false);

    for index in 0..items.len() {
        // Receiver is alive until the scope below ends
        let _ = job_tx.send(index);
    }
    drop(job_tx);

    let scope = crossbeam::thread::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let (job, failed) = (&job, &failed);

            s.spawn(move |_| {
                for index in job_rx.iter() {
                    if cancel.is_cancelled() || failed.load(Ordering::SeqCst) {
                        break;
                    }
                    let outcome = job(&items[index]);
                    if outcome.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    let _ = result_tx.send((index, outcome));
                }
            });
        }
    });
    drop(result_tx);

    let mut results: Vec<Option<Result<R>>> = (0..items.len()).map(|_| None).collect();
    for (index, outcome) in result_rx.try_iter() {
        results[index] = Some(outcome);
    }

    Batch {
        results,
        panicked: scope.is_err(),
    }
}
