//! Bounded pool for clip jobs.
//!
//! Jobs go through a fixed-depth channel; a full queue is reported to the
//! caller instead of blocking the ingestion loop. `shutdown` closes the queue
//! and joins every worker after the remaining jobs have run.

use anyhow::{anyhow, Result};
use log::{debug, error};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::ClipError;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    sender: Option<SyncSender<Job>>,
    pending: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `pending` counts jobs queued or running; callers may share it for status.
    pub(crate) fn new(
        name: &str,
        workers: usize,
        depth: usize,
        pending: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Job>(depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || work(&receiver, &pending))
                .map_err(|e| anyhow!("failed to spawn clip worker: {}", e))?;
            handles.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            pending,
            workers: handles,
        })
    }

    /// Queue a job without blocking.
    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("clip worker pool is shut down"))?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let pending = self.pending.fetch_sub(1, Ordering::SeqCst) - 1;
                Err(ClipError::QueueFull(pending).into())
            }
            Err(TrySendError::Disconnected(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Err(anyhow!("clip workers have exited"))
            }
        }
    }

    /// Jobs queued or running.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Close the queue, let the workers finish what is queued, and join them.
    pub(crate) fn shutdown(mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("clip worker exited by panic");
            }
        }
    }
}

fn work(receiver: &Mutex<Receiver<Job>>, pending: &AtomicUsize) {
    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = next else {
            debug!("clip queue closed; worker exiting");
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("clip job panicked");
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn runs_every_job_before_shutdown_returns() {
        let pool = WorkerPool::new("test-worker", 2, 16, Arc::default()).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn full_queue_is_reported() {
        let pool = WorkerPool::new("test-worker", 1, 1, Arc::default()).unwrap();
        let (release_tx, release_rx) = channel::<()>();
        let (started_tx, started_rx) = channel::<()>();
        pool.submit(Box::new(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        }))
        .unwrap();
        started_rx.recv().unwrap();

        // One slot in the channel, then full.
        pool.submit(Box::new(|| {})).unwrap();
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ClipError>(),
            Some(&ClipError::QueueFull(2))
        );
        assert_eq!(pool.pending(), 2);

        release_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pending = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new("test-worker", 1, 4, Arc::clone(&pending)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        pool.submit(Box::new(|| panic!("boom"))).unwrap();
        let counter = Arc::clone(&done);
        pool.submit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pending.load(Ordering::SeqCst), 0);
    }
}
