//! Bounded worker pool for batch dispatch.
//!
//! Exactly `concurrency` tasks run at once; further submissions queue on
//! the semaphore. Submission fails only after shutdown has begun; the
//! caller logs that and moves on, it is never propagated to the notify
//! entrypoint.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};

use latch_core::LatchError;

/// Fixed-size pool of concurrent batch slots.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Submit a task; it runs once a slot frees up.
    pub fn submit<F>(&self, task: F) -> Result<(), LatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(LatchError::ShutDown);
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();
        let drained = self.drained.clone();
        tokio::spawn(async move {
            // The semaphore is never closed, so acquisition only fails if
            // the pool itself was dropped mid-flight.
            if let Ok(_permit) = semaphore.acquire_owned().await {
                task.await;
            }
            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_waiters();
            }
        });
        Ok(())
    }

    /// Tasks submitted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Refuse new work and wait for everything in flight to finish.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }
}
