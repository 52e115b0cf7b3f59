//! Shared worker pool.
//!
//! Every callback in the networking stack runs on one of these workers: there
//! is no central event loop, just tasks draining a channel. The pool is cheap
//! to clone and hand to every service that needs to schedule work.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

pub const DEFAULT_WORKERS: usize = 8;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = channel::unbounded::<Job>();

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("spawn pool worker");
            handles.push(handle);
        }

        Self {
            inner: Arc::new(PoolInner {
                tx: Mutex::new(Some(tx)),
                workers: Mutex::new(handles),
            }),
        }
    }

    /// Schedules a task. Tasks submitted after `shutdown` are dropped.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        let guard = self.inner.tx.lock().expect("pool lock poisoned");
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(Box::new(job));
            }
            None => tracing::debug!("task scheduled after pool shutdown, dropping"),
        }
    }

    /// Closes the queue and joins every worker. Queued tasks still run.
    ///
    /// Must not be called from a pool worker.
    pub fn shutdown(&self) {
        let tx = self.inner.tx.lock().expect("pool lock poisoned").take();
        drop(tx);
        let handles = std::mem::take(&mut *self.inner.workers.lock().expect("pool lock poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }
}
