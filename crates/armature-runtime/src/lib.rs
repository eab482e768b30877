//! Background worker plumbing: cancellable single-flight tasks.
#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use log::warn;

/// Cooperative cancellation flag shared with a running task.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A unit of work run repeatedly on a dedicated worker thread. The task
/// should poll the token between natural chunks and bail out early when
/// it trips; whatever it returns is delivered either way.
pub trait BackgroundTask: Send + Sync + 'static {
    type Output: Send + 'static;

    fn run(&self, cancel: &CancelToken) -> Self::Output;
}

/// Owns a worker thread running one task at a time. Starting while a
/// run is in flight is refused, so at most one result is ever pending.
pub struct UpdateWork<T: BackgroundTask> {
    jobs: Option<Sender<()>>,
    results: Receiver<T::Output>,
    cancel: CancelToken,
    in_flight: bool,
    worker: Option<JoinHandle<()>>,
}

impl<T: BackgroundTask> UpdateWork<T> {
    pub fn new(task: T) -> Self {
        let (job_tx, job_rx) = unbounded::<()>();
        let (result_tx, result_rx) = unbounded::<T::Output>();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let worker = std::thread::Builder::new()
            .name("update-work".into())
            .spawn(move || {
                while job_rx.recv().is_ok() {
                    let output = task.run(&worker_cancel);
                    if result_tx.send(output).is_err() {
                        return;
                    }
                }
            })
            .expect("failed to spawn worker thread");
        Self {
            jobs: Some(job_tx),
            results: result_rx,
            cancel,
            in_flight: false,
            worker: Some(worker),
        }
    }

    /// Queues one run. Returns false if a run is already in flight.
    pub fn start(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        let Some(jobs) = &self.jobs else {
            return false;
        };
        if jobs.send(()).is_err() {
            warn!("background worker is gone; dropping job");
            return false;
        }
        self.in_flight = true;
        true
    }

    #[inline]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Collects the finished result, if the current run has completed.
    pub fn try_complete(&mut self) -> Option<T::Output> {
        if !self.in_flight {
            return None;
        }
        match self.results.try_recv() {
            Ok(output) => {
                self.in_flight = false;
                Some(output)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                warn!("background worker is gone; no result will arrive");
                self.in_flight = false;
                None
            }
        }
    }

    /// Blocks until the current run finishes. Test and shutdown helper.
    pub fn wait_complete(&mut self) -> Option<T::Output> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        self.results.recv().ok()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl<T: BackgroundTask> Drop for UpdateWork<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("background worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counter(Arc<AtomicUsize>);

    impl BackgroundTask for Counter {
        type Output = usize;

        fn run(&self, _cancel: &CancelToken) -> usize {
            self.0.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    struct Sleeper;

    impl BackgroundTask for Sleeper {
        type Output = bool;

        fn run(&self, cancel: &CancelToken) -> bool {
            for _ in 0..100 {
                if cancel.is_cancelled() {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            true
        }
    }

    #[test]
    fn runs_are_single_flight() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut work = UpdateWork::new(Counter(runs.clone()));
        assert!(work.start());
        assert!(!work.start());
        assert_eq!(work.wait_complete(), Some(1));
        assert!(work.start());
        assert_eq!(work.wait_complete(), Some(2));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn try_complete_delivers_exactly_once() {
        let mut work = UpdateWork::new(Counter(Arc::new(AtomicUsize::new(0))));
        work.start();
        let result = loop {
            if let Some(r) = work.try_complete() {
                break r;
            }
            std::thread::yield_now();
        };
        assert_eq!(result, 1);
        assert_eq!(work.try_complete(), None);
        assert!(!work.is_in_flight());
    }

    #[test]
    fn drop_cancels_the_running_task() {
        let mut work = UpdateWork::new(Sleeper);
        work.start();
        // Dropping must cancel and join without waiting out the sleep.
        drop(work);
    }
}
