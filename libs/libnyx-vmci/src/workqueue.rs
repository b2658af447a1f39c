//! Deferred work
//!
//! "Run later" callbacks are pushed onto a channel drained by one dedicated
//! worker thread. Jobs run in submission order.

use crossbeam_channel::{unbounded, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded deferred work executor.
pub struct WorkQueue {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl WorkQueue {
    /// Spawn the worker thread.
    pub fn start(thread_name: &str) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let worker = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                for job in receiver {
                    job();
                }
                tracing::trace!("work queue drained");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a job; returns false if the queue has been shut down.
    ///
    /// A rejected job is dropped immediately, releasing anything it captured.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting work, run what is queued, and join the worker.
    ///
    /// Must not be called from a job.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if self.is_worker_thread() {
                tracing::warn!("work queue shut down from its own worker");
                return;
            }
            if worker.join().is_err() {
                tracing::error!("deferred job panicked");
            }
        }
    }

    /// Whether the caller is running inside a job.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
